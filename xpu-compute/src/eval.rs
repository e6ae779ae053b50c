//! Expression program interpreter.
//!
//! [`KernContext`] binds a program to its parameters and the device it runs on. Every
//! routine returns `Result<Datum, DeviceError>`: `Ok(Datum::Null)` is SQL NULL, an `Err`
//! carries the code, function and source location the pipeline reports into the launch's
//! error record.

use xpu_expr::{DevKind, ExprProgram, FuncKind, FuncOpcode, KexpNode, NodeId, OpCode};
use xpu_kds::{Kds, TupleLoc};
use xpu_result::{DeviceError, Error, Result};
use xpu_types::{Datum, hash_datums};

use crate::kvars::KVars;
use crate::{compare, numeric, text};

/// Outcome of a device routine.
pub type DevResult<T> = std::result::Result<T, DeviceError>;

/// Inputs of one pre-aggregation step: the grouping key and one argument per aggregate
/// (`None` for `COUNT(*)`).
#[derive(Debug, Clone, PartialEq)]
pub struct PreAggInput {
    pub keys: Vec<Datum>,
    pub args: Vec<Option<Datum>>,
}

#[derive(Debug, Clone, Copy)]
pub struct KernContext<'a> {
    program: &'a ExprProgram,
    params: &'a [Datum],
    device: DevKind,
    /// Per-row cap on variable-length bytes held in kvars; `None` on the host.
    kvars_nbytes: Option<usize>,
}

impl<'a> KernContext<'a> {
    pub fn new(
        program: &'a ExprProgram,
        params: &'a [Datum],
        device: DevKind,
        kvars_nbytes: usize,
    ) -> Self {
        Self {
            program,
            params,
            device,
            kvars_nbytes: Some(kvars_nbytes),
        }
    }

    /// Context for host-side evaluation: every function is available and kvars are
    /// unbounded.
    pub fn host(program: &'a ExprProgram, params: &'a [Datum]) -> Self {
        Self {
            program,
            params,
            device: DevKind::HOST,
            kvars_nbytes: None,
        }
    }

    /// Check that `params` match the program's declared parameter types.
    pub fn check_params(program: &ExprProgram, params: &[Datum]) -> Result<()> {
        let declared = program.param_types();
        if declared.len() != params.len() {
            return Err(Error::InvalidArgumentError(format!(
                "program declares {} parameters, {} supplied",
                declared.len(),
                params.len()
            )));
        }
        for (i, (p, &ty)) in params.iter().zip(declared).enumerate() {
            p.check_type(ty)
                .map_err(|e| Error::InvalidArgumentError(format!("parameter {i}: {e}")))?;
        }
        Ok(())
    }

    #[inline]
    pub fn program(&self) -> &'a ExprProgram {
        self.program
    }

    #[inline]
    pub fn device(&self) -> DevKind {
        self.device
    }

    pub fn new_kvars(&self) -> KVars {
        KVars::new(self.program.nslots() as usize)
    }

    fn node(&self, id: NodeId) -> DevResult<&'a KexpNode> {
        self.program
            .node(id)
            .ok_or_else(|| DeviceError::fatal("kexp", format!("node {} out of range", id.0)))
    }

    fn store(&self, kvars: &mut KVars, slot: u16, datum: Datum) -> DevResult<()> {
        if let Some(limit) = self.kvars_nbytes {
            let needed = kvars.bytes_after(slot, &datum);
            if needed > limit {
                return Err(DeviceError::eval(
                    "kvars",
                    format!("kvars buffer exhausted: {needed} of {limit} bytes"),
                ));
            }
        }
        kvars.set(slot, datum);
        Ok(())
    }

    /// Evaluate a scalar node. Memoised nodes are computed once per row combination.
    pub fn eval(&self, id: NodeId, kvars: &mut KVars) -> DevResult<Datum> {
        let node = self.node(id)?;
        match node.kvar_slot {
            Some(slot) => {
                if let Some(v) = kvars.get(slot) {
                    return Ok(v.clone());
                }
                let v = self.eval_node(node, kvars)?;
                self.store(kvars, slot, v.clone())?;
                Ok(v)
            }
            None => self.eval_node(node, kvars),
        }
    }

    fn eval_node(&self, node: &KexpNode, kvars: &mut KVars) -> DevResult<Datum> {
        let args = self.program.args(node);
        match &node.opcode {
            OpCode::Var { slot } => {
                if let Some(v) = kvars.get(*slot) {
                    return Ok(v.clone());
                }
                // a memoised slot read before its producer ran
                let producer = self
                    .program
                    .nodes()
                    .iter()
                    .position(|n| n.kvar_slot == Some(*slot) && !matches!(n.opcode, OpCode::Var { .. }));
                match producer {
                    Some(idx) => self.eval(NodeId(idx as u32), kvars),
                    None => Ok(Datum::Null),
                }
            }
            OpCode::Const(d) => Ok(d.clone()),
            OpCode::Param { id } => self.params.get(*id as usize).cloned().ok_or_else(|| {
                DeviceError::fatal("kexp_param", format!("parameter {id} was not supplied"))
            }),
            OpCode::Func(f) => self.eval_func(node, *f, args, kvars),
            OpCode::BoolAnd => self.eval_connective(args, kvars, false),
            OpCode::BoolOr => self.eval_connective(args, kvars, true),
            OpCode::BoolNot => match self.eval(args[0], kvars)? {
                Datum::Null => Ok(Datum::Null),
                Datum::Bool(v) => Ok(Datum::Bool(!v)),
                other => Err(DeviceError::fatal("bool_not", format!("non-boolean {other:?}"))),
            },
            OpCode::NullTest { is_null } => {
                let v = self.eval(args[0], kvars)?;
                Ok(Datum::Bool(v.is_null() == *is_null))
            }
            OpCode::HashValue => {
                let keys = self.eval_all(args, kvars)?;
                Ok(Datum::Int4(hash_datums(&keys) as i32))
            }
            OpCode::LoadVars { .. } | OpCode::Projection | OpCode::PreAgg { .. } => {
                Err(DeviceError::unsupported("kexp_eval", node.opcode.id()))
            }
        }
    }

    fn eval_all(&self, args: &[NodeId], kvars: &mut KVars) -> DevResult<Vec<Datum>> {
        args.iter().map(|&a| self.eval(a, kvars)).collect()
    }

    /// AND (`stop_on = false`) or OR (`stop_on = true`) under three-valued logic, stopping
    /// at the first argument equal to `stop_on`.
    fn eval_connective(
        &self,
        args: &[NodeId],
        kvars: &mut KVars,
        stop_on: bool,
    ) -> DevResult<Datum> {
        let mut saw_null = false;
        for &a in args {
            match self.eval(a, kvars)? {
                Datum::Null => saw_null = true,
                Datum::Bool(v) if v == stop_on => return Ok(Datum::Bool(stop_on)),
                Datum::Bool(_) => {}
                other => {
                    return Err(DeviceError::fatal("bool_expr", format!("non-boolean {other:?}")));
                }
            }
        }
        Ok(if saw_null { Datum::Null } else { Datum::Bool(!stop_on) })
    }

    fn eval_func(
        &self,
        node: &KexpNode,
        f: FuncOpcode,
        args: &[NodeId],
        kvars: &mut KVars,
    ) -> DevResult<Datum> {
        let info = f.info();
        if !node.devkind.contains(self.device) {
            tracing::warn!(
                "[KEXP] {} is not available on the {} device",
                info.name,
                self.device.name()
            );
            return Err(DeviceError::unsupported(info.name, u32::from(u16::from(f))));
        }
        let values = self.eval_all(args, kvars)?;
        if info.is_strict() && values.iter().any(Datum::is_null) {
            return Ok(Datum::Null);
        }
        match info.kind {
            FuncKind::Cast => numeric::cast(info, &values[0]),
            FuncKind::Eq
            | FuncKind::Ne
            | FuncKind::Lt
            | FuncKind::Le
            | FuncKind::Gt
            | FuncKind::Ge => compare::compare(info, &values[0], &values[1]),
            FuncKind::Like | FuncKind::NotLike | FuncKind::ILike | FuncKind::NotILike => {
                text::like(info, &values[0], &values[1])
            }
            FuncKind::TextCat => text::cat(info, &values[0], &values[1]),
            FuncKind::Concat => text::concat(info, &values),
            FuncKind::CharLength | FuncKind::OctetLength => text::length(info, &values[0]),
            _ if info.result.is_integer() => numeric::int_op(info, &values),
            _ => numeric::float_op(info, &values),
        }
    }

    /// Evaluate a qualifier; NULL counts as false and an absent qualifier as true.
    pub fn eval_qual(
        &self,
        id: Option<NodeId>,
        kvars: &mut KVars,
    ) -> DevResult<bool> {
        match id {
            None => Ok(true),
            Some(id) => Ok(self.eval(id, kvars)? == Datum::Bool(true)),
        }
    }

    /// Move the columns `depth` loads from `kds` into kvars. `loc = None` loads NULLs, as
    /// for the inner side of an unmatched outer-join row.
    pub fn load_vars(
        &self,
        depth: usize,
        kds: &Kds,
        loc: Option<TupleLoc>,
        kvars: &mut KVars,
    ) -> DevResult<()> {
        for l in self.program.loads_at(depth) {
            let datum = match loc {
                None => Datum::Null,
                Some(loc) => kds
                    .datum_at(loc, l.column as usize)
                    .map_err(|e| DeviceError::fatal("load_vars", e.to_string()))?,
            };
            self.store(kvars, l.slot, datum)?;
        }
        Ok(())
    }

    /// The target list of the projection entry.
    pub fn projection(&self, kvars: &mut KVars) -> DevResult<Vec<Datum>> {
        let id = self
            .program
            .entries()
            .projection
            .ok_or_else(|| DeviceError::fatal("projection", "program has no projection"))?;
        let node = self.node(id)?;
        self.eval_all(self.program.args(node), kvars)
    }

    /// Probe hash for the hash join at `depth`, or `None` if that depth is a nested loop.
    pub fn hash_value(
        &self,
        depth: usize,
        kvars: &mut KVars,
    ) -> DevResult<Option<u32>> {
        let entry = depth
            .checked_sub(1)
            .and_then(|d| self.program.entries().hash_keys.get(d).copied().flatten());
        match entry {
            None => Ok(None),
            Some(id) => match self.eval(id, kvars)? {
                Datum::Int4(h) => Ok(Some(h as u32)),
                other => Err(DeviceError::fatal("hash_value", format!("non-int4 hash {other:?}"))),
            },
        }
    }

    /// Grouping keys and aggregate arguments of the pre-aggregation entry.
    pub fn preagg_input(&self, kvars: &mut KVars) -> DevResult<PreAggInput> {
        let id = self
            .program
            .entries()
            .preagg
            .ok_or_else(|| DeviceError::fatal("preagg", "program has no pre-aggregation"))?;
        let node = self.node(id)?;
        let OpCode::PreAgg { nkeys, aggs } = &node.opcode else {
            return Err(DeviceError::unsupported("preagg", node.opcode.id()));
        };
        let args = self.program.args(node);
        let nkeys = *nkeys as usize;
        let keys = self.eval_all(&args[..nkeys], kvars)?;
        let mut rest = args[nkeys..].iter();
        let mut values = Vec::with_capacity(aggs.len());
        for agg in aggs {
            if agg.takes_argument() {
                let &a = rest
                    .next()
                    .ok_or_else(|| DeviceError::fatal("preagg", "missing aggregate argument"))?;
                values.push(Some(self.eval(a, kvars)?));
            } else {
                values.push(None);
            }
        }
        Ok(PreAggInput { keys, args: values })
    }
}
