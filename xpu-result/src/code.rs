//! Wire-stable device error codes.
//!
//! Codes are stored in a `u32` slot of the task descriptor, so the discriminants below are
//! part of the device ABI and must never be renumbered.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Error code raised by kernel code and stored in the shared [`ErrorRecord`].
///
/// `Success` is the sentinel that the record holds until the first failure claims it.
///
/// [`ErrorRecord`]: crate::ErrorRecord
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u32)]
pub enum ErrorCode {
    Success = 0,
    /// Destination chunk ran out of rooms or bytes.
    DataStoreNoSpace = 1,
    /// Runtime numeric or string fault while evaluating an expression.
    ExpressionEval = 2,
    /// Opcode id with no device routine. Rejected at program build time, fatal if seen.
    UnsupportedOpcode = 3,
    /// Cache log does not belong to the cached chunk.
    CacheSignatureMismatch = 4,
    /// Anything the kernel cannot recover from.
    SystemFatal = 5,
}

/// Whether the scan can continue after a code has been reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    None,
    Recoverable,
    Fatal,
}

/// Host reaction chosen after inspecting the error record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// No error; proceed or resume.
    Proceed,
    /// Relaunch with the saved task descriptor.
    Relaunch,
    /// Re-evaluate the failing rows on the host.
    CpuFallback,
    /// Throw the cached chunk away and load it again.
    Reload,
    /// Stop the scan and surface the error.
    Abort,
}

impl ErrorCode {
    pub fn class(self) -> ErrorClass {
        match self {
            ErrorCode::Success => ErrorClass::None,
            ErrorCode::DataStoreNoSpace
            | ErrorCode::ExpressionEval
            | ErrorCode::CacheSignatureMismatch => ErrorClass::Recoverable,
            ErrorCode::UnsupportedOpcode | ErrorCode::SystemFatal => ErrorClass::Fatal,
        }
    }

    pub fn recovery(self) -> Recovery {
        match self {
            ErrorCode::Success => Recovery::Proceed,
            ErrorCode::DataStoreNoSpace => Recovery::Relaunch,
            ErrorCode::ExpressionEval => Recovery::CpuFallback,
            ErrorCode::CacheSignatureMismatch => Recovery::Reload,
            ErrorCode::UnsupportedOpcode | ErrorCode::SystemFatal => Recovery::Abort,
        }
    }

    #[inline]
    pub fn is_fatal(self) -> bool {
        self.class() == ErrorClass::Fatal
    }

    /// Decode a raw code read back from device memory. Unknown values are treated as
    /// [`ErrorCode::SystemFatal`] so that a corrupted slot never reads as success.
    pub fn from_raw(raw: u32) -> ErrorCode {
        ErrorCode::try_from(raw).unwrap_or(ErrorCode::SystemFatal)
    }

    pub fn name(self) -> &'static str {
        match self {
            ErrorCode::Success => "Success",
            ErrorCode::DataStoreNoSpace => "DataStoreNoSpace",
            ErrorCode::ExpressionEval => "ExpressionEvalError",
            ErrorCode::UnsupportedOpcode => "UnsupportedOpcode",
            ErrorCode::CacheSignatureMismatch => "CacheSignatureMismatch",
            ErrorCode::SystemFatal => "SystemFatal",
        }
    }
}
