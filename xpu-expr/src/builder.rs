use rustc_hash::FxHashMap;
use xpu_result::{Error, Result};
use xpu_types::{Datum, TypeOpcode};

use crate::catalog::{DevKind, FuncOpcode};
use crate::program::{
    AggKind, BuildOptions, ExprProgram, KexpNode, NodeId, OpCode, ProgramEntries, VarLoad,
};

/// Host-side constructor of an [`ExprProgram`].
///
/// Nodes are appended bottom-up, so every operand is created before the node that uses it.
/// Result types are inferred from the catalog where possible; mismatches are collected
/// and reported by [`ProgramBuilder::build`], which runs the full validation.
///
/// ```
/// use xpu_expr::{BuildOptions, FuncOpcode, ProgramBuilder};
/// use xpu_types::{Datum, TypeOpcode};
///
/// let mut b = ProgramBuilder::new(0);
/// b.load_vars(0, &[(0, 0, TypeOpcode::Int4)]);
/// let x = b.var(0);
/// let ten = b.constant(Datum::Int4(10));
/// let qual = b.func(FuncOpcode::Int4Gt, &[x, ten]);
/// b.scan_quals(qual);
/// b.projection(&[("x", x)]);
/// let prog = b.build(&BuildOptions::default()).unwrap();
/// assert_eq!(prog.output_columns()[0].name, "x");
/// ```
#[derive(Debug)]
pub struct ProgramBuilder {
    nodes: Vec<KexpNode>,
    args: Vec<NodeId>,
    entries: ProgramEntries,
    params: Vec<TypeOpcode>,
    output_names: Vec<String>,
    slot_types: FxHashMap<u16, TypeOpcode>,
    n_rels: u16,
    nslots: u16,
    error: Option<Error>,
}

impl ProgramBuilder {
    /// A program over one outer source and `n_rels` inner relations.
    pub fn new(n_rels: u16) -> Self {
        let n = n_rels as usize;
        Self {
            nodes: Vec::new(),
            args: Vec::new(),
            entries: ProgramEntries {
                load_vars: vec![None; n + 1],
                join_quals: vec![None; n],
                hash_keys: vec![None; n],
                ..ProgramEntries::default()
            },
            params: Vec::new(),
            output_names: Vec::new(),
            slot_types: FxHashMap::default(),
            n_rels,
            nslots: 0,
            error: None,
        }
    }

    fn fail(&mut self, msg: String) {
        if self.error.is_none() {
            tracing::debug!("[KEXP] builder: {}", msg);
            self.error = Some(Error::InvalidProgram(msg));
        }
    }

    fn use_slot(&mut self, slot: u16, ty: Option<TypeOpcode>) {
        self.nslots = self.nslots.max(slot + 1);
        if let Some(ty) = ty {
            self.slot_types.entry(slot).or_insert(ty);
        }
    }

    fn push(&mut self, opcode: OpCode, exptype: Option<TypeOpcode>, args: &[NodeId]) -> NodeId {
        let (devkind, locale_aware) = match &opcode {
            OpCode::Func(f) => (f.info().devkind, f.info().locale_aware),
            _ => (DevKind::ANY, false),
        };
        let id = NodeId(self.nodes.len() as u32);
        self.nodes.push(KexpNode {
            opcode,
            exptype,
            devkind,
            locale_aware,
            kvar_slot: None,
            args_start: self.args.len() as u32,
            nargs: args.len() as u16,
        });
        self.args.extend_from_slice(args);
        id
    }

    fn exptype(&self, id: NodeId) -> Option<TypeOpcode> {
        self.nodes.get(id.index()).and_then(|n| n.exptype)
    }

    /// Declare the next host parameter; returns its id.
    pub fn declare_param(&mut self, ty: TypeOpcode) -> u16 {
        self.params.push(ty);
        (self.params.len() - 1) as u16
    }

    /// Load `(column, slot, type)` triples from the tuple of `depth`.
    pub fn load_vars(&mut self, depth: u16, loads: &[(u16, u16, TypeOpcode)]) -> NodeId {
        let loads: Vec<VarLoad> = loads
            .iter()
            .map(|&(column, slot, type_op)| VarLoad {
                column,
                slot,
                type_op,
            })
            .collect();
        for l in &loads {
            self.use_slot(l.slot, Some(l.type_op));
        }
        let id = self.push(OpCode::LoadVars { depth, loads }, None, &[]);
        match self.entries.load_vars.get_mut(depth as usize) {
            Some(entry) => *entry = Some(id),
            None => self.fail(format!("depth {depth} exceeds {} relations", self.n_rels)),
        }
        id
    }

    /// Read a kvars slot written by a load or a memoised node.
    pub fn var(&mut self, slot: u16) -> NodeId {
        let ty = self.slot_types.get(&slot).copied();
        if ty.is_none() {
            self.fail(format!("slot {slot} read before anything writes it"));
        }
        self.push(OpCode::Var { slot }, ty, &[])
    }

    pub fn constant(&mut self, datum: Datum) -> NodeId {
        let ty = datum.type_opcode();
        if ty.is_none() {
            self.fail("untyped NULL constant, use const_null".into());
        }
        self.push(OpCode::Const(datum), ty, &[])
    }

    pub fn const_null(&mut self, ty: TypeOpcode) -> NodeId {
        self.push(OpCode::Const(Datum::Null), Some(ty), &[])
    }

    pub fn param(&mut self, id: u16) -> NodeId {
        let ty = self.params.get(id as usize).copied();
        if ty.is_none() {
            self.fail(format!("parameter {id} is not declared"));
        }
        self.push(OpCode::Param { id }, ty, &[])
    }

    pub fn func(&mut self, f: FuncOpcode, args: &[NodeId]) -> NodeId {
        self.push(OpCode::Func(f), Some(f.info().result), args)
    }

    /// [`ProgramBuilder::func`] by catalog name.
    pub fn func_by_name(&mut self, name: &str, args: &[NodeId]) -> Result<NodeId> {
        let f = FuncOpcode::by_name(name)
            .ok_or_else(|| Error::InvalidProgram(format!("no device function named {name}")))?;
        Ok(self.func(f, args))
    }

    /// Insert the catalog cast from the argument's type to `to`, or return the argument
    /// unchanged if it already has that type.
    pub fn cast(&mut self, arg: NodeId, to: TypeOpcode) -> NodeId {
        match self.exptype(arg) {
            Some(from) if from == to => arg,
            Some(from) => match FuncOpcode::cast(from, to) {
                Some(f) => self.func(f, &[arg]),
                None => {
                    self.fail(format!("no cast from {} to {}", from.name(), to.name()));
                    arg
                }
            },
            None => {
                self.fail("cast of an untyped node".into());
                arg
            }
        }
    }

    pub fn and(&mut self, args: &[NodeId]) -> NodeId {
        self.push(OpCode::BoolAnd, Some(TypeOpcode::Bool), args)
    }

    pub fn or(&mut self, args: &[NodeId]) -> NodeId {
        self.push(OpCode::BoolOr, Some(TypeOpcode::Bool), args)
    }

    pub fn not(&mut self, arg: NodeId) -> NodeId {
        self.push(OpCode::BoolNot, Some(TypeOpcode::Bool), &[arg])
    }

    pub fn null_test(&mut self, arg: NodeId, is_null: bool) -> NodeId {
        self.push(OpCode::NullTest { is_null }, Some(TypeOpcode::Bool), &[arg])
    }

    pub fn hash_value(&mut self, keys: &[NodeId]) -> NodeId {
        self.push(OpCode::HashValue, Some(TypeOpcode::Int4), keys)
    }

    /// Memoise the result of `node` in `slot` so later references read it back instead of
    /// re-evaluating.
    pub fn memoize(&mut self, node: NodeId, slot: u16) -> NodeId {
        let ty = self.exptype(node);
        self.use_slot(slot, ty);
        if let Some(n) = self.nodes.get_mut(node.index()) {
            n.kvar_slot = Some(slot);
        }
        node
    }

    pub fn scan_quals(&mut self, node: NodeId) {
        self.entries.scan_quals = Some(node);
    }

    /// Join qualifier evaluated at `depth` (1-based).
    pub fn join_quals(&mut self, depth: u16, node: NodeId) {
        match depth
            .checked_sub(1)
            .and_then(|d| self.entries.join_quals.get_mut(d as usize))
        {
            Some(entry) => *entry = Some(node),
            None => self.fail(format!("no join at depth {depth}")),
        }
    }

    /// Probe hash of the outer row at `depth` (1-based); marks that depth as a hash join.
    pub fn hash_keys(&mut self, depth: u16, node: NodeId) {
        match depth
            .checked_sub(1)
            .and_then(|d| self.entries.hash_keys.get_mut(d as usize))
        {
            Some(entry) => *entry = Some(node),
            None => self.fail(format!("no join at depth {depth}")),
        }
    }

    pub fn projection(&mut self, targets: &[(&str, NodeId)]) -> NodeId {
        let args: Vec<NodeId> = targets.iter().map(|&(_, n)| n).collect();
        self.output_names = targets.iter().map(|(name, _)| name.to_string()).collect();
        let id = self.push(OpCode::Projection, None, &args);
        self.entries.projection = Some(id);
        id
    }

    /// Grouping `keys` followed by aggregates. `COUNT(*)` takes no argument node.
    pub fn preagg(
        &mut self,
        keys: &[(&str, NodeId)],
        aggs: &[(&str, AggKind, Option<NodeId>)],
    ) -> NodeId {
        let mut args: Vec<NodeId> = keys.iter().map(|&(_, n)| n).collect();
        let mut kinds = Vec::with_capacity(aggs.len());
        for &(name, kind, arg) in aggs {
            match (kind.takes_argument(), arg) {
                (true, Some(a)) => args.push(a),
                (false, None) => {}
                _ => self.fail(format!("aggregate {name} has the wrong number of arguments")),
            }
            kinds.push(kind);
        }
        self.output_names = keys
            .iter()
            .map(|(n, _)| n.to_string())
            .chain(aggs.iter().map(|(n, _, _)| n.to_string()))
            .collect();
        let id = self.push(
            OpCode::PreAgg {
                nkeys: keys.len() as u16,
                aggs: kinds,
            },
            None,
            &args,
        );
        self.entries.preagg = Some(id);
        id
    }

    /// Finish and validate the program.
    pub fn build(self, opts: &BuildOptions) -> Result<ExprProgram> {
        if let Some(err) = self.error {
            return Err(err);
        }
        let prog = ExprProgram {
            nodes: self.nodes,
            args: self.args,
            entries: self.entries,
            params: self.params,
            output_names: self.output_names,
            n_rels: self.n_rels,
            nslots: self.nslots,
        };
        prog.validate(opts)?;
        tracing::trace!(
            "[KEXP] built program: {} nodes, {} slots, {} relations",
            prog.nodes.len(),
            prog.nslots,
            prog.n_rels
        );
        Ok(prog)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scan_prog() -> ProgramBuilder {
        let mut b = ProgramBuilder::new(0);
        b.load_vars(0, &[(0, 0, TypeOpcode::Int4), (1, 1, TypeOpcode::Text)]);
        b
    }

    #[test]
    fn type_mismatch_is_rejected() {
        let mut b = scan_prog();
        let x = b.var(0);
        let s = b.var(1);
        let bad = b.func(FuncOpcode::Int4Pl, &[x, s]);
        b.projection(&[("bad", bad)]);
        let err = b.build(&BuildOptions::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidProgram(msg) if msg.contains("int4pl")));
    }

    #[test]
    fn locale_aware_needs_permission() {
        let mut b = scan_prog();
        let s = b.var(1);
        let lit = b.constant(Datum::Text("m".into()));
        let lt = b.func(FuncOpcode::TextLt, &[s, lit]);
        b.scan_quals(lt);
        b.projection(&[("s", s)]);
        let opts = BuildOptions::default();
        let prog = {
            let mut b2 = scan_prog();
            let s = b2.var(1);
            let lit = b2.constant(Datum::Text("m".into()));
            let lt = b2.func(FuncOpcode::TextLt, &[s, lit]);
            b2.scan_quals(lt);
            b2.projection(&[("s", s)]);
            b2.build(&BuildOptions {
                allow_locale_aware: true,
                ..opts
            })
        };
        assert!(prog.is_ok());
        assert!(b.build(&opts).is_err());
    }

    #[test]
    fn device_kind_mismatch_is_rejected() {
        let mut b = ProgramBuilder::new(0);
        b.load_vars(0, &[(0, 0, TypeOpcode::Float2)]);
        let h = b.var(0);
        let sum = b.func(FuncOpcode::Float2Pl, &[h, h]);
        b.projection(&[("h", sum)]);
        let dpu = BuildOptions {
            device: DevKind::DPU,
            allow_locale_aware: false,
        };
        assert!(b.build(&dpu).is_err());
    }

    #[test]
    fn undeclared_slot_and_param() {
        let mut b = ProgramBuilder::new(0);
        let v = b.var(3);
        b.projection(&[("v", v)]);
        assert!(b.build(&BuildOptions::default()).is_err());

        let mut b = ProgramBuilder::new(0);
        let p = b.param(0);
        b.projection(&[("p", p)]);
        assert!(b.build(&BuildOptions::default()).is_err());
    }

    #[test]
    fn projection_and_preagg_are_exclusive() {
        let mut b = scan_prog();
        let x = b.var(0);
        b.projection(&[("x", x)]);
        b.preagg(&[("x", x)], &[("n", AggKind::CountStar, None)]);
        assert!(b.build(&BuildOptions::default()).is_err());
    }

    #[test]
    fn preagg_output_schema() {
        let mut b = scan_prog();
        let x = b.var(0);
        let s = b.var(1);
        let xf = b.cast(x, TypeOpcode::Float8);
        b.preagg(
            &[("s", s)],
            &[
                ("n", AggKind::CountStar, None),
                ("total", AggKind::Sum, Some(x)),
                ("mean", AggKind::Avg, Some(xf)),
                ("hi", AggKind::Max, Some(x)),
            ],
        );
        let prog = b.build(&BuildOptions::default()).unwrap();
        let cols: Vec<(String, TypeOpcode)> = prog
            .output_columns()
            .into_iter()
            .map(|c| (c.name, c.type_op))
            .collect();
        assert_eq!(
            cols,
            vec![
                ("s".to_string(), TypeOpcode::Text),
                ("n".to_string(), TypeOpcode::Int8),
                ("total".to_string(), TypeOpcode::Int8),
                ("mean.count".to_string(), TypeOpcode::Int8),
                ("mean.sum".to_string(), TypeOpcode::Float8),
                ("hi".to_string(), TypeOpcode::Int4),
            ]
        );
    }

    #[test]
    fn memoised_slot_is_readable() {
        let mut b = scan_prog();
        let x = b.var(0);
        let one = b.constant(Datum::Int4(1));
        let y = b.func(FuncOpcode::Int4Pl, &[x, one]);
        b.memoize(y, 2);
        let again = b.var(2);
        b.projection(&[("y", y), ("y2", again)]);
        let prog = b.build(&BuildOptions::default()).unwrap();
        assert_eq!(prog.nslots(), 3);
    }

    #[test]
    fn join_entries_are_bounds_checked() {
        let mut b = ProgramBuilder::new(1);
        b.load_vars(0, &[(0, 0, TypeOpcode::Int4)]);
        b.load_vars(1, &[(0, 1, TypeOpcode::Int4)]);
        let a = b.var(0);
        let c = b.var(1);
        let eq = b.func(FuncOpcode::Int4Eq, &[a, c]);
        b.join_quals(2, eq);
        b.projection(&[("a", a)]);
        assert!(b.build(&BuildOptions::default()).is_err());
    }
}
