//! Service descriptor cache with failure tracking.
//!
//! Three partitions share one store: the client-side cache (descriptors we
//! fetched, keyed by versioned service id), the directory-side cache
//! (descriptors uploaded to us, keyed by descriptor id) and the
//! local-service cache (descriptors we publish ourselves).  A secondary
//! failure cache remembers which introduction points recently failed per
//! service, and is consulted on every client-side store to strip unusable
//! entry points before a descriptor is accepted.
//!
//! The two caches move together: evicting, replacing, or purging a
//! descriptor always removes its failure-cache counterpart in the same
//! operation, so they can never drift apart.

mod alloc;
mod cache;
mod descriptor;
mod error;
mod failure;

pub use cache::{
    BatchOutcome, CacheEntry, DescriptorCache, StoreOutcome, FAILURE_MAX_AGE, MAX_AGE, MAX_SKEW,
};
pub use descriptor::{IntroPoint, ParseError, ParsedDescriptor, Parser};
pub use error::{CacheError, Result};
pub use failure::{FailureTracker, IntroFailure, IntroFailureKind};
