//! Parsed descriptor model and the parser seam.
//!
//! The cache does not parse descriptor bytes itself. Callers supply a
//! [`Parser`] implementation, and the cache consumes the structured
//! [`ParsedDescriptor`] values it produces. This keeps the wire format out
//! of the cache's concern and lets tests drive the cache with synthetic
//! descriptors.

use std::net::SocketAddr;

use thiserror::Error;
use velum_types::{DescriptorId, RelayId, ServiceId, Timestamp};

use crate::error::CacheError;

/// A single introduction point listed in a descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntroPoint {
    /// Identity of the relay acting as the introduction point.
    pub identity: RelayId,
    /// Network address, when the descriptor carries one.
    pub address: Option<SocketAddr>,
}

/// The structured form of a descriptor, as produced by a [`Parser`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedDescriptor {
    /// Identifier the descriptor is published under.
    pub desc_id: DescriptorId,
    /// The service this descriptor belongs to.
    pub service_id: ServiceId,
    /// Publication time claimed by the descriptor.
    pub timestamp: Timestamp,
    /// Introduction points offered by the service. May be empty after
    /// failure reconciliation.
    pub intro_points: Vec<IntroPoint>,
    /// Number of input bytes this descriptor occupied. Batch uploads use
    /// this to advance past each descriptor in the buffer.
    pub encoded_len: usize,
}

/// Error reported by a [`Parser`] when descriptor bytes are malformed.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct ParseError(pub String);

impl From<ParseError> for CacheError {
    fn from(err: ParseError) -> Self {
        CacheError::Parse(err.0)
    }
}

/// Seam between the cache and the descriptor wire format.
///
/// `parse` must consume exactly one descriptor from the front of `input`
/// and report its length in [`ParsedDescriptor::encoded_len`].
pub trait Parser {
    fn parse(&self, input: &str) -> std::result::Result<ParsedDescriptor, ParseError>;
}
