//! Kernel data store (KDS): the binary chunk format every component of the engine reads
//! or writes.
//!
//! A chunk is created by the host (or sized by a prior pipeline stage), populated by
//! parallel appends through a [`KdsAppender`], and is read-only once handed on. Its wire
//! image ([`Kds::to_bytes`]) is identical on host and device and in a persisted cache.
//!
//! Four layouts are supported, see [`KdsFormat`].

#![forbid(unsafe_code)]

mod append;
mod block;
mod buffer;
pub mod export;
mod kds;
pub mod tuple;
pub mod wire;

pub use append::{KdsAppender, Reservation};
pub use kds::{ColumnMeta, DEFAULT_BLOCK_SIZE, HASH_ITEM_PREFIX, Kds, KdsFormat, TupleLoc};
pub use wire::{KDS_HEADER_SZ, KDS_MAGIC};
