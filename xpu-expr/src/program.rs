//! Expression program representation.
//!
//! A program is a flat arena of [`KexpNode`]s. Operands are referenced by [`NodeId`] (an
//! index into the arena) and always precede the node that uses them, so a program can be
//! relocated or shipped across address spaces unmodified.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use xpu_result::{Error, Result};
use xpu_types::{ColumnDef, Datum, TypeOpcode};

use crate::catalog::{DevKind, FuncOpcode};

/// Index of a node inside its program.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
    pub const NONE: u32 = u32::MAX;

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// One column moved from a chunk into a kvars slot by a `LoadVars` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarLoad {
    pub column: u16,
    pub slot: u16,
    pub type_op: TypeOpcode,
}

/// Partial aggregate computed by a `PreAgg` node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum AggKind {
    CountStar = 1,
    Count = 2,
    Sum = 3,
    Min = 4,
    Max = 5,
    Avg = 6,
}

impl AggKind {
    #[inline]
    pub fn takes_argument(self) -> bool {
        self != AggKind::CountStar
    }

    pub fn name(self) -> &'static str {
        match self {
            AggKind::CountStar => "count(*)",
            AggKind::Count => "count",
            AggKind::Sum => "sum",
            AggKind::Min => "min",
            AggKind::Max => "max",
            AggKind::Avg => "avg",
        }
    }

    /// Columns of the partial state as written to the destination chunk.
    pub fn partial_types(self, arg: Option<TypeOpcode>) -> Vec<TypeOpcode> {
        match self {
            AggKind::CountStar | AggKind::Count => vec![TypeOpcode::Int8],
            AggKind::Sum => match arg {
                Some(t) if t.is_float() => vec![TypeOpcode::Float8],
                _ => vec![TypeOpcode::Int8],
            },
            AggKind::Min | AggKind::Max => vec![arg.unwrap_or(TypeOpcode::Int8)],
            AggKind::Avg => vec![TypeOpcode::Int8, TypeOpcode::Float8],
        }
    }
}

/// Node operation. A closed set: the evaluator matches on it exhaustively.
#[derive(Debug, Clone, PartialEq)]
pub enum OpCode {
    /// Read a kvars slot.
    Var { slot: u16 },
    Const(Datum),
    /// Read a host-supplied parameter.
    Param { id: u16 },
    Func(FuncOpcode),
    BoolAnd,
    BoolOr,
    BoolNot,
    /// `IS NULL` (`is_null`) or `IS NOT NULL`.
    NullTest { is_null: bool },
    /// Load columns of the current depth's tuple into kvars slots.
    LoadVars { depth: u16, loads: Vec<VarLoad> },
    /// 32-bit hash of the argument values.
    HashValue,
    /// Target list; each argument produces one output column.
    Projection,
    /// Grouping keys (`nkeys` leading arguments) followed by one argument per aggregate that
    /// takes one.
    PreAgg { nkeys: u16, aggs: Vec<AggKind> },
}

/// Wire discriminant of [`OpCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum OpKind {
    Var = 1,
    Const = 2,
    Param = 3,
    Func = 4,
    BoolAnd = 5,
    BoolOr = 6,
    BoolNot = 7,
    NullTest = 8,
    LoadVars = 9,
    HashValue = 10,
    Projection = 11,
    PreAgg = 12,
}

impl OpCode {
    pub fn kind(&self) -> OpKind {
        match self {
            OpCode::Var { .. } => OpKind::Var,
            OpCode::Const(_) => OpKind::Const,
            OpCode::Param { .. } => OpKind::Param,
            OpCode::Func(_) => OpKind::Func,
            OpCode::BoolAnd => OpKind::BoolAnd,
            OpCode::BoolOr => OpKind::BoolOr,
            OpCode::BoolNot => OpKind::BoolNot,
            OpCode::NullTest { .. } => OpKind::NullTest,
            OpCode::LoadVars { .. } => OpKind::LoadVars,
            OpCode::HashValue => OpKind::HashValue,
            OpCode::Projection => OpKind::Projection,
            OpCode::PreAgg { .. } => OpKind::PreAgg,
        }
    }

    /// Numeric opcode id as seen by the device dispatcher.
    pub fn id(&self) -> u32 {
        match self {
            OpCode::Func(f) => u32::from(u16::from(*f)),
            other => u32::from(u16::from(other.kind())),
        }
    }
}

/// A program node.
#[derive(Debug, Clone, PartialEq)]
pub struct KexpNode {
    pub opcode: OpCode,
    /// Declared result type. `None` for structural nodes (load, projection, pre-agg).
    pub exptype: Option<TypeOpcode>,
    pub devkind: DevKind,
    pub locale_aware: bool,
    /// kvars slot the result is memoised in.
    pub kvar_slot: Option<u16>,
    pub(crate) args_start: u32,
    pub(crate) nargs: u16,
}

/// Which node serves each pipeline role.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgramEntries {
    /// Per depth `0..=n_rels`.
    pub load_vars: Vec<Option<NodeId>>,
    pub scan_quals: Option<NodeId>,
    /// Per join depth `1..=n_rels`, stored at `depth - 1`.
    pub join_quals: Vec<Option<NodeId>>,
    /// Per join depth `1..=n_rels`, stored at `depth - 1`.
    pub hash_keys: Vec<Option<NodeId>>,
    pub projection: Option<NodeId>,
    pub preagg: Option<NodeId>,
}

/// Options a program is validated against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildOptions {
    pub device: DevKind,
    pub allow_locale_aware: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            device: DevKind::GPU,
            allow_locale_aware: false,
        }
    }
}

/// An immutable, validated expression program.
#[derive(Debug, Clone, PartialEq)]
pub struct ExprProgram {
    pub(crate) nodes: Vec<KexpNode>,
    pub(crate) args: Vec<NodeId>,
    pub(crate) entries: ProgramEntries,
    pub(crate) params: Vec<TypeOpcode>,
    pub(crate) output_names: Vec<String>,
    pub(crate) n_rels: u16,
    pub(crate) nslots: u16,
}

impl ExprProgram {
    #[inline]
    pub fn node(&self, id: NodeId) -> Option<&KexpNode> {
        self.nodes.get(id.index())
    }

    #[inline]
    pub fn nodes(&self) -> &[KexpNode] {
        &self.nodes
    }

    #[inline]
    pub fn args(&self, node: &KexpNode) -> &[NodeId] {
        let start = node.args_start as usize;
        &self.args[start..start + node.nargs as usize]
    }

    #[inline]
    pub fn entries(&self) -> &ProgramEntries {
        &self.entries
    }

    #[inline]
    pub fn n_rels(&self) -> u16 {
        self.n_rels
    }

    /// Number of kvars slots a row combination needs.
    #[inline]
    pub fn nslots(&self) -> u16 {
        self.nslots
    }

    #[inline]
    pub fn param_types(&self) -> &[TypeOpcode] {
        &self.params
    }

    /// Loads performed at `depth`, empty if the depth loads nothing.
    pub fn loads_at(&self, depth: usize) -> &[VarLoad] {
        self.entries
            .load_vars
            .get(depth)
            .copied()
            .flatten()
            .and_then(|id| self.node(id))
            .map(|n| match &n.opcode {
                OpCode::LoadVars { loads, .. } => loads.as_slice(),
                _ => &[],
            })
            .unwrap_or(&[])
    }

    #[inline]
    pub fn is_preagg(&self) -> bool {
        self.entries.preagg.is_some()
    }

    /// Schema of the rows the final depth writes: the target list, or the pre-aggregation
    /// keys followed by the partial aggregate states.
    pub fn output_columns(&self) -> Vec<ColumnDef> {
        let mut cols = Vec::new();
        if let Some(node) = self.entries.projection.and_then(|id| self.node(id)) {
            for (i, &arg) in self.args(node).iter().enumerate() {
                let ty = self
                    .node(arg)
                    .and_then(|n| n.exptype)
                    .unwrap_or(TypeOpcode::Int4);
                cols.push(ColumnDef::new(self.output_name(i), ty));
            }
        } else if let Some(node) = self.entries.preagg.and_then(|id| self.node(id)) {
            if let OpCode::PreAgg { nkeys, aggs } = &node.opcode {
                let args = self.args(node);
                let nkeys = *nkeys as usize;
                for (i, &arg) in args[..nkeys].iter().enumerate() {
                    let ty = self
                        .node(arg)
                        .and_then(|n| n.exptype)
                        .unwrap_or(TypeOpcode::Int4);
                    cols.push(ColumnDef::new(self.output_name(i), ty));
                }
                let mut next_arg = nkeys;
                for (j, agg) in aggs.iter().enumerate() {
                    let arg_ty = if agg.takes_argument() {
                        let ty = args
                            .get(next_arg)
                            .and_then(|&a| self.node(a))
                            .and_then(|n| n.exptype);
                        next_arg += 1;
                        ty
                    } else {
                        None
                    };
                    let name = self.output_name(nkeys + j);
                    let types = agg.partial_types(arg_ty);
                    if types.len() == 1 {
                        cols.push(ColumnDef::new(name, types[0]));
                    } else {
                        for (k, ty) in types.into_iter().enumerate() {
                            let suffix = if k == 0 { "count" } else { "sum" };
                            cols.push(ColumnDef::new(format!("{name}.{suffix}"), ty));
                        }
                    }
                }
            }
        }
        cols
    }

    fn output_name(&self, i: usize) -> String {
        self.output_names
            .get(i)
            .cloned()
            .unwrap_or_else(|| format!("col{i}"))
    }

    /// Structural and capability validation. Run by the builder and after decoding.
    pub fn validate(&self, opts: &BuildOptions) -> Result<()> {
        crate::validate::validate(self, opts)
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Error {
        Error::InvalidProgram(msg.into())
    }
}
