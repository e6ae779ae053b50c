use std::{fmt, io};
use thiserror::Error;

use crate::code::ErrorCode;
use crate::record::ErrorDetails;

/// Unified error type for all host-side xPU operations.
///
/// Device failures are first captured in an [`ErrorRecord`](crate::ErrorRecord) and are
/// converted into one of the variants below once the host has read the record back, so a
/// caller sees a single error type regardless of where the failure originated.
///
/// # Thread Safety
///
/// `Error` is `Send + Sync` and can be moved out of worker threads.
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error while reading or writing a cache transaction log file.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Arrow error while exporting a chunk as a `RecordBatch`.
    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// The destination chunk has no room left for the requested rows or bytes.
    ///
    /// Inside a kernel this suspends the warp. It only reaches the host when no forward
    /// progress is possible, e.g. a single row is larger than an empty destination chunk.
    #[error("data store out of space: {0}")]
    DataStoreNoSpace(String),

    /// Runtime fault while evaluating an expression (overflow, division by zero, ...).
    ///
    /// `location` is `file:line` of the device routine that raised it.
    #[error("{message} (at {location}, in {function})")]
    ExpressionEval {
        message: String,
        function: String,
        location: String,
    },

    /// Opcode id that has no device routine.
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(u32),

    /// Cache log identity does not match the cached chunk.
    #[error("cache signature mismatch: expected {expected:#018x}, found {found:#018x}")]
    CacheSignatureMismatch { expected: u64, found: u64 },

    /// Unrecoverable kernel failure.
    #[error("fatal device error: {message} (at {location}, in {function})")]
    SystemFatal {
        message: String,
        function: String,
        location: String,
    },

    /// Invalid argument passed to a host API.
    #[error("Invalid argument: {0}")]
    InvalidArgumentError(String),

    /// Expression program rejected at build time.
    #[error("invalid expression program: {0}")]
    InvalidProgram(String),

    /// Malformed wire image (chunk, program, warp context or cache log).
    #[error("corrupt {what}: {detail}")]
    Corrupt { what: &'static str, detail: String },

    /// The host cancelled the scan.
    #[error("scan cancelled")]
    Cancelled,

    /// Bug or unexpected state.
    #[error("An internal operation failed: {0}")]
    Internal(String),
}

impl Error {
    #[inline]
    pub fn corrupt<E: fmt::Display>(what: &'static str, detail: E) -> Self {
        Error::Corrupt {
            what,
            detail: detail.to_string(),
        }
    }

    #[inline]
    pub fn invalid_program<E: fmt::Display>(err: E) -> Self {
        Error::InvalidProgram(err.to_string())
    }

    /// Device error code equivalent of this error, if it has one.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Error::DataStoreNoSpace(_) => Some(ErrorCode::DataStoreNoSpace),
            Error::ExpressionEval { .. } => Some(ErrorCode::ExpressionEval),
            Error::UnsupportedOpcode(_) => Some(ErrorCode::UnsupportedOpcode),
            Error::CacheSignatureMismatch { .. } => Some(ErrorCode::CacheSignatureMismatch),
            Error::SystemFatal { .. } => Some(ErrorCode::SystemFatal),
            _ => None,
        }
    }
}

impl From<&ErrorDetails> for Error {
    fn from(details: &ErrorDetails) -> Self {
        let location = format!("{}:{}", details.file, details.line);
        let function = details.function.to_string();
        let message = details.message.clone();
        match details.code {
            ErrorCode::DataStoreNoSpace => Error::DataStoreNoSpace(message),
            ErrorCode::ExpressionEval => Error::ExpressionEval {
                message,
                function,
                location,
            },
            ErrorCode::UnsupportedOpcode => Error::UnsupportedOpcode(details.aux as u32),
            ErrorCode::CacheSignatureMismatch => Error::CacheSignatureMismatch {
                expected: 0,
                found: details.aux,
            },
            ErrorCode::SystemFatal | ErrorCode::Success => Error::SystemFatal {
                message,
                function,
                location,
            },
        }
    }
}
