//! First-failure-wins error arbitration.
//!
//! Every thread of a launch reports into one [`ErrorRecord`]. The code slot starts at
//! [`ErrorCode::Success`]; the first thread whose compare-and-swap moves it away from that
//! sentinel owns the record and is the only one allowed to publish its location and
//! message. Losers are dropped, never merged, so the record always describes exactly one
//! of the raised errors.

use std::fmt;
use std::panic::Location;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::code::ErrorCode;
use crate::error::Error;

/// Maximum message length kept in the record, in bytes.
pub const MESSAGE_LIMIT: usize = 128;

/// An error raised by device code, with the source location that raised it.
#[derive(Clone, PartialEq, Eq)]
pub struct DeviceError {
    pub code: ErrorCode,
    pub function: &'static str,
    pub location: &'static Location<'static>,
    pub message: String,
    /// Extra code-specific word (unsupported opcode id, cache signature).
    pub aux: u64,
}

impl DeviceError {
    #[track_caller]
    pub fn new(code: ErrorCode, function: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            function,
            location: Location::caller(),
            message: message.into(),
            aux: 0,
        }
    }

    #[track_caller]
    pub fn eval(function: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExpressionEval, function, message)
    }

    #[track_caller]
    pub fn no_space(function: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::DataStoreNoSpace, function, message)
    }

    #[track_caller]
    pub fn fatal(function: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorCode::SystemFatal, function, message)
    }

    #[track_caller]
    pub fn unsupported(function: &'static str, opcode: u32) -> Self {
        Self {
            aux: u64::from(opcode),
            ..Self::new(
                ErrorCode::UnsupportedOpcode,
                function,
                format!("unsupported device opcode {opcode}"),
            )
        }
    }

    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.code.is_fatal()
    }
}

impl fmt::Debug for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({}:{}, {})",
            self.code.name(),
            self.message,
            self.location.file(),
            self.location.line(),
            self.function
        )
    }
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl From<DeviceError> for Error {
    fn from(err: DeviceError) -> Self {
        Error::from(&ErrorDetails::from_device(&err))
    }
}

/// Snapshot of the winning error, as published by the CAS winner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetails {
    pub code: ErrorCode,
    pub file: &'static str,
    pub line: u32,
    pub function: &'static str,
    pub message: String,
    pub aux: u64,
}

impl ErrorDetails {
    fn from_device(err: &DeviceError) -> Self {
        Self {
            code: err.code,
            file: err.location.file(),
            line: err.location.line(),
            function: err.function,
            message: truncate_message(&err.message),
            aux: err.aux,
        }
    }
}

fn truncate_message(message: &str) -> String {
    if message.len() <= MESSAGE_LIMIT {
        return message.to_string();
    }
    let mut end = MESSAGE_LIMIT;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message[..end].to_string()
}

/// Shared first-failure slot of a task.
#[derive(Debug, Default)]
pub struct ErrorRecord {
    code: AtomicU32,
    details: OnceLock<ErrorDetails>,
}

impl ErrorRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to claim the record for `err`. Returns `true` if this call won.
    ///
    /// Only the winner writes the location and message; every other caller returns
    /// without touching the record.
    pub fn report(&self, err: &DeviceError) -> bool {
        let code = u32::from(err.code);
        if code == u32::from(ErrorCode::Success) {
            return false;
        }
        match self.code.compare_exchange(
            u32::from(ErrorCode::Success),
            code,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                let _ = self.details.set(ErrorDetails::from_device(err));
                tracing::debug!(
                    "[ERROR] {} claimed error record: {}",
                    err.code.name(),
                    err.message
                );
                true
            }
            Err(_) => false,
        }
    }

    /// Current code. [`ErrorCode::Success`] if nothing has been reported.
    #[inline]
    pub fn code(&self) -> ErrorCode {
        ErrorCode::from_raw(self.code.load(Ordering::Acquire))
    }

    #[inline]
    pub fn has_error(&self) -> bool {
        self.code() != ErrorCode::Success
    }

    /// Cheap poll used by warps at chunk boundaries.
    #[inline]
    pub fn is_fatal(&self) -> bool {
        self.code().is_fatal()
    }

    /// Published details. Only meaningful after the launch has returned; while threads
    /// are still running the winner may not have finished publishing.
    pub fn details(&self) -> Option<&ErrorDetails> {
        if self.has_error() {
            self.details.get()
        } else {
            None
        }
    }

    /// Host error for the recorded failure, if any.
    pub fn to_error(&self) -> Option<Error> {
        match self.details() {
            Some(details) => Some(Error::from(details)),
            None if self.has_error() => Some(Error::Internal(format!(
                "error record holds {} without details",
                self.code().name()
            ))),
            None => None,
        }
    }

    /// Clear the record between scans. Requires exclusive access, so no launch can be
    /// running.
    pub fn reset(&mut self) {
        *self.code.get_mut() = u32::from(ErrorCode::Success);
        self.details = OnceLock::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn first_report_wins() {
        let record = ErrorRecord::new();
        assert!(!record.has_error());
        assert!(record.report(&DeviceError::eval("int4pl", "integer out of range")));
        assert!(!record.report(&DeviceError::fatal("kern_main", "boom")));
        let details = record.details().unwrap();
        assert_eq!(details.code, ErrorCode::ExpressionEval);
        assert_eq!(details.function, "int4pl");
        assert_eq!(details.message, "integer out of range");
        assert!(details.file.ends_with("record.rs"));
        assert!(!record.is_fatal());
    }

    #[test]
    fn success_is_never_reported() {
        let record = ErrorRecord::new();
        assert!(!record.report(&DeviceError::new(ErrorCode::Success, "noop", "")));
        assert!(record.details().is_none());
        assert!(record.to_error().is_none());
    }

    #[test]
    fn message_is_truncated_on_char_boundary() {
        let record = ErrorRecord::new();
        let long = "é".repeat(MESSAGE_LIMIT);
        record.report(&DeviceError::eval("textcat", long));
        let details = record.details().unwrap();
        assert!(details.message.len() <= MESSAGE_LIMIT);
        assert!(details.message.chars().all(|c| c == 'é'));
    }

    #[test]
    fn concurrent_reports_yield_one_consistent_winner() {
        const CODES: [ErrorCode; 4] = [
            ErrorCode::DataStoreNoSpace,
            ErrorCode::ExpressionEval,
            ErrorCode::UnsupportedOpcode,
            ErrorCode::SystemFatal,
        ];
        for _ in 0..50 {
            let record = ErrorRecord::new();
            let wins: usize = (0..256usize)
                .into_par_iter()
                .map(|i| {
                    let code = CODES[i % CODES.len()];
                    let err = DeviceError::new(code, "worker", format!("thread-{i}-{}", code.name()));
                    usize::from(record.report(&err))
                })
                .sum();
            assert_eq!(wins, 1);
            let details = record.details().unwrap();
            assert!(CODES.contains(&details.code));
            assert_eq!(record.code(), details.code);
            // message was written by the same thread that set the code
            assert!(details.message.ends_with(details.code.name()));
        }
    }

    #[test]
    fn reset_clears_the_record() {
        let mut record = ErrorRecord::new();
        record.report(&DeviceError::fatal("kern_main", "boom"));
        assert!(record.is_fatal());
        record.reset();
        assert!(!record.has_error());
        assert!(record.report(&DeviceError::eval("int8mul", "bigint out of range")));
        assert_eq!(record.code(), ErrorCode::ExpressionEval);
    }

    #[test]
    fn converts_to_host_error() {
        let record = ErrorRecord::new();
        record.report(&DeviceError::unsupported("kern_eval", 999));
        match record.to_error() {
            Some(Error::UnsupportedOpcode(999)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }
}
