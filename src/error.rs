//! Contains the main error type for the library.
use thiserror::Error;

/// The main error type for the library.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Transport Unavailable")]
    TransportUnavailable,
    #[error("Timeout")]
    Timeout,
    #[error("Malformed Frame")]
    MalformedFrame,
    #[error("Decode Mismatch")]
    DecodeMismatch,
    #[error("Capacity Exceeded: {available} codes present, capacity {capacity}")]
    CapacityExceeded { capacity: usize, available: usize },
    #[error("Unsupported By Transport")]
    Unsupported,
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Error {
        Error::Timeout
    }
}
