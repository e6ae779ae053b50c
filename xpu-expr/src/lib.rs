//! Expression programs for the xPU engine.
//!
//! An [`ExprProgram`] is an immutable arena of typed opcode nodes built on the host by a
//! [`ProgramBuilder`], validated against the target device's capabilities and shipped to
//! the device as an opaque buffer ([`ExprProgram::encode`]). Operands refer to other nodes
//! by [`NodeId`], never by address.
//!
//! The function vocabulary is the static [`catalog`]: each [`FuncOpcode`] maps to exactly
//! one [`FuncInfo`] describing its operand and result types and where it may run.

#![forbid(unsafe_code)]

mod builder;
pub mod catalog;
mod program;
mod validate;
pub mod wire;

pub use builder::ProgramBuilder;
pub use catalog::{DevKind, FuncInfo, FuncKind, FuncOpcode};
pub use program::{
    AggKind, BuildOptions, ExprProgram, KexpNode, NodeId, OpCode, OpKind, ProgramEntries, VarLoad,
};
pub use wire::{KEXP_MAGIC, KEXP_VERSION};
