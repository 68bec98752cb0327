//! Error types for velum-cache.

use thiserror::Error;
use velum_types::ServiceId;

/// Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;

/// Errors that can occur while storing or querying descriptors.
///
/// None of these leave the cache partially mutated: a rejected store is a
/// no-op against both the descriptor cache and the failure cache.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CacheError {
    /// The query string is not a well-formed service id.
    #[error("invalid service id")]
    InvalidServiceId,

    /// No entry exists for the key.
    #[error("no matching entry in the cache")]
    NotFound,

    /// The parser collaborator rejected the descriptor bytes.
    #[error("could not parse descriptor: {0}")]
    Parse(String),

    /// The descriptor timestamp is older than the retention window or too
    /// far in the future, beyond clock-skew tolerance.
    #[error("descriptor timestamp is outside the accepted freshness window")]
    StaleOrSkewed,

    /// The descriptor names a different service than the one queried.
    #[error("descriptor is for service {got}, expected {want}")]
    WrongServiceId {
        /// The service the caller asked for.
        want: ServiceId,
        /// The service the descriptor actually names.
        got: ServiceId,
    },

    /// The descriptor's id does not match the id it was fetched under.
    #[error("descriptor id does not match the id it was requested under")]
    WrongDescriptorId,

    /// Every introduction point in the descriptor is in the failure
    /// cache; the descriptor has no usable entry points.
    #[error("every introduction point in the descriptor has recently failed")]
    AllIntroPointsFailed,

    /// A directory batch upload contained nothing parseable.
    #[error("could not parse any descriptor from the upload")]
    NoDescriptorsParsed,
}
