//! Shared type vocabulary of the xPU engine.
//!
//! - [`TypeOpcode`]: the closed set of device types with their width and alignment.
//! - [`Datum`]: a typed, nullable value as produced by the expression evaluator.
//! - [`ColumnDef`]: a named, typed column of a target schema.
//! - [`DatumKey`]: a hashable, equality-comparable wrapper used for grouping.

#![forbid(unsafe_code)]

pub mod codec;
pub mod datum;
pub mod key;
pub mod type_op;

pub use datum::{ColumnDef, Datum};
pub use key::{DatumKey, hash_datums};
pub use type_op::TypeOpcode;

/// Lanes per warp.
pub const WARP_SIZE: usize = 32;

/// Round `len` up to a multiple of `align` (a power of two).
#[inline]
pub const fn align_up(len: usize, align: usize) -> usize {
    (len + align - 1) & !(align - 1)
}

/// Maximum alignment of any on-chunk value.
pub const MAXALIGN: usize = 8;

#[inline]
pub const fn maxalign(len: usize) -> usize {
    align_up(len, MAXALIGN)
}
