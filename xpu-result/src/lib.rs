//! Error types and result definitions for the xPU engine.
//!
//! Two layers of error reporting live here:
//!
//! - **Host errors** ([`Error`], [`Result<T>`]): the unified error enum returned by every
//!   host-facing API in the workspace. Failures propagate with `?` across crate boundaries.
//! - **Device errors** ([`ErrorCode`], [`DeviceError`], [`ErrorRecord`]): the wire-stable
//!   codes raised by kernel code, and the shared first-failure-wins slot that all threads of
//!   a launch report into.
//!
//! After every kernel launch the host inspects the [`ErrorRecord`], classifies the winning
//! code with [`ErrorCode::class`] and decides whether to resume, fall back to the host, reload
//! or abort.

#![forbid(unsafe_code)]

pub mod code;
pub mod error;
pub mod record;
pub mod result;

pub use code::{ErrorClass, ErrorCode, Recovery};
pub use error::Error;
pub use record::{DeviceError, ErrorDetails, ErrorRecord, MESSAGE_LIMIT};
pub use result::Result;
