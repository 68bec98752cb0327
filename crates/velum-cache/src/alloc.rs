//! Saturating byte accounting for cache contents.

use tracing::warn;

/// Tracks the approximate number of bytes held by cache entries.
///
/// Increments and decrements saturate instead of wrapping. The first time
/// either bound is hit a warning is logged; later hits in the same
/// direction stay quiet so a counting bug does not flood the log.
#[derive(Debug, Default)]
pub(crate) struct AllocationCounter {
    total: u64,
    underflowed: bool,
    overflowed: bool,
}

impl AllocationCounter {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Current total, in bytes.
    pub(crate) fn total(&self) -> u64 {
        self.total
    }

    pub(crate) fn add(&mut self, n: u64) {
        match self.total.checked_add(n) {
            Some(v) => self.total = v,
            None => {
                if !self.overflowed {
                    warn!("cache allocation counter overflowed; clamping at u64::MAX");
                    self.overflowed = true;
                }
                self.total = u64::MAX;
            }
        }
    }

    pub(crate) fn sub(&mut self, n: u64) {
        match self.total.checked_sub(n) {
            Some(v) => self.total = v,
            None => {
                if !self.underflowed {
                    warn!(
                        have = self.total,
                        release = n,
                        "cache allocation counter underflowed; clamping at zero"
                    );
                    self.underflowed = true;
                }
                self.total = 0;
            }
        }
    }
}
