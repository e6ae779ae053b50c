//! Read-only inputs of a scan.

use xpu_compute::KernContext;
use xpu_expr::ExprProgram;
use xpu_kds::{Kds, KdsFormat};
use xpu_result::{Error, Result};
use xpu_types::Datum;

use crate::config::EngineConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinKind {
    Inner,
    /// Outer rows without a match continue with the inner columns NULL.
    Left,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMethod {
    /// Every inner row is tested against the join qualifier.
    NestLoop,
    /// Only the chain of the outer row's hash is visited. Needs a HASH inner chunk and a
    /// hash-key entry at the depth.
    Hash,
}

/// Inner relation of one join depth.
#[derive(Debug, Clone, Copy)]
pub struct InnerRel<'a> {
    pub kds: &'a Kds,
    pub kind: JoinKind,
    pub method: JoinMethod,
}

/// Inner relations, in depth order.
#[derive(Debug, Clone, Default)]
pub struct MultiRels<'a> {
    rels: Vec<InnerRel<'a>>,
}

impl<'a> MultiRels<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(mut self, kds: &'a Kds, kind: JoinKind, method: JoinMethod) -> Self {
        self.rels.push(InnerRel { kds, kind, method });
        self
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.rels.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.rels.is_empty()
    }

    /// Inner relation of join depth `depth` (1-based).
    #[inline]
    pub fn at(&self, depth: usize) -> Option<&InnerRel<'a>> {
        depth.checked_sub(1).and_then(|d| self.rels.get(d))
    }
}

/// Everything a launch reads: configuration, program, parameters, the outer source and the
/// inner relations. Validated once when built.
#[derive(Debug, Clone)]
pub struct KernSession<'a> {
    config: &'a EngineConfig,
    program: &'a ExprProgram,
    params: &'a [Datum],
    source: &'a Kds,
    rels: MultiRels<'a>,
}

impl<'a> KernSession<'a> {
    /// A plain scan.
    pub fn scan(
        config: &'a EngineConfig,
        program: &'a ExprProgram,
        params: &'a [Datum],
        source: &'a Kds,
    ) -> Result<Self> {
        Self::join(config, program, params, source, MultiRels::new())
    }

    /// A scan joined with `rels`.
    pub fn join(
        config: &'a EngineConfig,
        program: &'a ExprProgram,
        params: &'a [Datum],
        source: &'a Kds,
        rels: MultiRels<'a>,
    ) -> Result<Self> {
        config.validate()?;
        program.validate(&config.build_options())?;
        KernContext::check_params(program, params)?;
        if program.n_rels() as usize != rels.len() {
            return Err(Error::InvalidArgumentError(format!(
                "program joins {} relations, {} supplied",
                program.n_rels(),
                rels.len()
            )));
        }
        if source.format() == KdsFormat::Hash {
            return Err(Error::InvalidArgumentError(
                "a HASH chunk cannot be the outer source".into(),
            ));
        }
        for depth in 1..=rels.len() {
            let Some(rel) = rels.at(depth) else { continue };
            let has_hash_keys = program.entries().hash_keys[depth - 1].is_some();
            match rel.method {
                JoinMethod::Hash if rel.kds.format() != KdsFormat::Hash => {
                    return Err(Error::InvalidArgumentError(format!(
                        "hash join at depth {depth} needs a HASH inner chunk"
                    )));
                }
                JoinMethod::Hash if !has_hash_keys => {
                    return Err(Error::InvalidArgumentError(format!(
                        "hash join at depth {depth} has no hash keys"
                    )));
                }
                JoinMethod::NestLoop if has_hash_keys => {
                    return Err(Error::InvalidArgumentError(format!(
                        "nested loop at depth {depth} has hash keys"
                    )));
                }
                _ => {}
            }
            if rel.kds.format() == KdsFormat::Block {
                return Err(Error::InvalidArgumentError(format!(
                    "BLOCK chunk at depth {depth} cannot be an inner relation"
                )));
            }
        }
        Ok(Self {
            config,
            program,
            params,
            source,
            rels,
        })
    }

    #[inline]
    pub fn config(&self) -> &'a EngineConfig {
        self.config
    }

    #[inline]
    pub fn program(&self) -> &'a ExprProgram {
        self.program
    }

    #[inline]
    pub fn params(&self) -> &'a [Datum] {
        self.params
    }

    #[inline]
    pub fn source(&self) -> &'a Kds {
        self.source
    }

    #[inline]
    pub fn rels(&self) -> &MultiRels<'a> {
        &self.rels
    }

    #[inline]
    pub fn n_rels(&self) -> usize {
        self.rels.len()
    }

    /// Evaluation context with the configured device limits.
    pub fn device_context(&self) -> KernContext<'a> {
        KernContext::new(
            self.program,
            self.params,
            self.config.device_kind,
            self.config.kvars_nbytes,
        )
    }

    /// Unlimited evaluation context for host-side work.
    pub fn host_context(&self) -> KernContext<'a> {
        KernContext::host(self.program, self.params)
    }
}
