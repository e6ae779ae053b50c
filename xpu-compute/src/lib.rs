//! Device-side evaluation of expression programs.
//!
//! - [`KernContext`]: binds a program, its parameters and the executing device; evaluates
//!   nodes, qualifiers, loads, projections, hash keys and pre-aggregation inputs.
//! - [`KVars`]: the per-row variable slot array.
//!
//! Numeric routines reproduce the host evaluator exactly: checked integer arithmetic with
//! per-type overflow messages, float overflow/underflow detection, NaN-aware ordering and
//! half-to-even rounding on float-to-integer casts. Boolean connectives follow SQL
//! three-valued logic.

#![forbid(unsafe_code)]

pub mod compare;
pub mod eval;
pub mod kvars;
mod numeric;
pub mod text;

pub use compare::{datum_cmp, float_cmp};
pub use eval::{DevResult, KernContext, PreAggInput};
pub use kvars::KVars;
