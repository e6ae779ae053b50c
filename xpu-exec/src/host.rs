//! Host-side evaluation of a session.
//!
//! Used three ways: to finish the rows a launch deferred with an [`FallbackEntry`], to run
//! a whole scan when device execution is disabled, and as the reference result tests
//! compare device output against. The host context has no kvars quota and every function
//! is available, so only genuine data errors surface here.

use xpu_compute::{KVars, KernContext};
use xpu_kds::{KdsFormat, TupleLoc};
use xpu_result::Result;
use xpu_types::Datum;

use crate::context::source_loc;
use crate::preagg::{PreAggLayout, finalize_preagg};
use crate::session::{JoinKind, JoinMethod, KernSession};
use crate::task::FallbackEntry;

struct HostPipeline<'s, 'a> {
    session: &'s KernSession<'a>,
    ctx: KernContext<'a>,
    preagg: Option<PreAggLayout>,
    out: Vec<Vec<Datum>>,
}

impl<'s, 'a> HostPipeline<'s, 'a> {
    fn new(session: &'s KernSession<'a>) -> Self {
        Self {
            session,
            ctx: session.host_context(),
            preagg: PreAggLayout::from_program(session.program()),
            out: Vec::new(),
        }
    }

    /// Load source tuple `src`, apply the scan qualifiers and run the rest of the pipeline.
    fn scan_one(&mut self, src: u32) -> Result<()> {
        let source = self.session.source();
        let loc = source_loc(source.format() == KdsFormat::Block, src);
        let mut kvars = self.ctx.new_kvars();
        self.ctx.load_vars(0, source, Some(loc), &mut kvars)?;
        if self
            .ctx
            .eval_qual(self.session.program().entries().scan_quals, &mut kvars)?
        {
            self.run_from(1, kvars)?;
        }
        Ok(())
    }

    /// Test one (outer, inner) combination of join `depth` and continue if it matches.
    fn join_one(&mut self, depth: usize, kvars: &KVars, inner: TupleLoc) -> Result<bool> {
        let Some(&rel) = self.session.rels().at(depth) else {
            return Ok(false);
        };
        let quals = self.session.program().entries().join_quals[depth - 1];
        let mut kvars = kvars.clone();
        self.ctx.load_vars(depth, rel.kds, Some(inner), &mut kvars)?;
        if !self.ctx.eval_qual(quals, &mut kvars)? {
            return Ok(false);
        }
        self.run_from(depth + 1, kvars)?;
        Ok(true)
    }

    fn run_from(&mut self, depth: usize, mut kvars: KVars) -> Result<()> {
        let n = self.session.n_rels();
        if depth > n {
            return self.emit(kvars);
        }
        let Some(&rel) = self.session.rels().at(depth) else {
            return Ok(());
        };
        let candidates: Vec<u32> = match rel.method {
            JoinMethod::NestLoop => (0..rel.kds.nitems()).collect(),
            JoinMethod::Hash => match self.ctx.hash_value(depth, &mut kvars.clone())? {
                Some(h) => rel.kds.hash_matches(h)?,
                None => Vec::new(),
            },
        };
        let mut matched = false;
        for row in candidates {
            matched |= self.join_one(depth, &kvars, TupleLoc::Row(row))?;
        }
        if rel.kind == JoinKind::Left && !matched {
            self.ctx.load_vars(depth, rel.kds, None, &mut kvars)?;
            self.run_from(depth + 1, kvars)?;
        }
        Ok(())
    }

    /// Projected row, or a single-row partial aggregate.
    fn emit(&mut self, mut kvars: KVars) -> Result<()> {
        let row = match &self.preagg {
            None => self.ctx.projection(&mut kvars)?,
            Some(layout) => {
                let input = self.ctx.preagg_input(&mut kvars)?;
                let mut partials = layout.empty_partials();
                layout.accumulate(&mut partials, &input.args)?;
                input.keys.into_iter().chain(partials).collect()
            }
        };
        self.out.push(row);
        Ok(())
    }

    fn redo(&mut self, entry: &FallbackEntry) -> Result<()> {
        let depth = entry.depth as usize;
        match (depth, entry.inner) {
            (0, _) => self.scan_one(entry.src),
            (d, Some(inner)) if d <= self.session.n_rels() => {
                self.join_one(d, &entry.kvars, inner).map(|_| ())
            }
            (d, _) => self.run_from(d, entry.kvars.clone()),
        }
    }
}

/// Source tuple ids in scan order: row numbers, or tuple offsets block by block.
fn source_tuples(session: &KernSession<'_>) -> Result<Vec<u32>> {
    let source = session.source();
    if source.format() != KdsFormat::Block {
        return Ok((0..source.nitems()).collect());
    }
    let mut out = Vec::new();
    for block in 0..source.nblocks() {
        out.extend(source.block_tuples(block)?);
    }
    Ok(out)
}

/// Run the whole session on the host. Rows follow the output layout of a launch: projected
/// rows, or one partial-aggregate row per surviving combination.
pub fn evaluate_source(session: &KernSession<'_>) -> Result<Vec<Vec<Datum>>> {
    let mut host = HostPipeline::new(session);
    for src in source_tuples(session)? {
        host.scan_one(src)?;
    }
    Ok(host.out)
}

/// Final result of the session computed entirely on the host: projected rows, or one
/// finished row per group.
pub fn reference_rows(session: &KernSession<'_>) -> Result<Vec<Vec<Datum>>> {
    let rows = evaluate_source(session)?;
    if session.program().is_preagg() {
        return finalize_preagg(session.program(), &[], &rows);
    }
    Ok(rows)
}

/// Finish the combinations a launch deferred. Each entry restarts at the depth that failed.
pub fn reevaluate_fallback(
    session: &KernSession<'_>,
    entries: &[FallbackEntry],
) -> Result<Vec<Vec<Datum>>> {
    if entries.is_empty() {
        return Ok(Vec::new());
    }
    tracing::debug!("[FALLBACK] re-evaluating {} deferred combinations", entries.len());
    let mut host = HostPipeline::new(session);
    for entry in entries {
        host.redo(entry)?;
    }
    tracing::debug!("[FALLBACK] produced {} rows", host.out.len());
    Ok(host.out)
}
