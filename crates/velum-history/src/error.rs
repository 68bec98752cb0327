//! Error types for velum-history.

use thiserror::Error;

/// Result type for history operations.
pub type Result<T> = std::result::Result<T, HistoryError>;

/// Errors from loading persisted history.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HistoryError {
    /// A bandwidth state section held a value that is not a number.
    #[error("could not parse bandwidth state value {0:?}")]
    BadStateValue(String),

    /// The stability file does not start with a known format line.
    #[error("unrecognized stability file format")]
    UnrecognizedFormat,

    /// The stability file has no stored-at header, so run times cannot be
    /// rebased against the current clock.
    #[error("stability file has no stored-at time")]
    MissingStoredAt,

    /// The persistent store failed.
    #[error("store operation failed: {0}")]
    Store(String),
}
