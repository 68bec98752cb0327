//! Shared identity and time types for the Velum relay caches.
//!
//! Everything here is deliberately small: fixed-width identity digests,
//! a validated service-id string, and an injectable clock so the caching
//! and history crates can be driven deterministically in tests.

mod id;
mod time;

pub use id::{DescriptorId, IdError, RelayId, ServiceId, DIGEST_LEN, SERVICE_ID_LEN};
pub use time::{
    format_iso, parse_iso, parse_possibly_bad_iso, Clock, ManualClock, SystemClock, Timestamp,
};
