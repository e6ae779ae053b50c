use crate::error::Error;

/// Result type alias used throughout the xPU workspace.
///
/// Shorthand for `std::result::Result<T, Error>`. Every host-side operation that can fail
/// returns this type.
pub type Result<T> = std::result::Result<T, Error>;
