/*!
Common error types for the OBI shared protocol library.
*/

use thiserror::Error;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Comprehensive error type for all shared protocol operations
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Numeric value outside its type's bound
    #[error("range error: {0}")]
    Range(#[from] crate::value::RangeError),

    /// ROI or resolution cannot be mapped to a valid DAC code range
    #[error("transform error: {0}")]
    Transform(#[from] crate::transform::TransformError),

    /// Command stream encoding/decoding errors
    #[error("command error: {0}")]
    Command(#[from] crate::command::CommandError),
}
