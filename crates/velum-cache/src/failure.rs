//! Short-lived record of failed introduction points.
//!
//! Failures are kept per service, per relay, with the time of first
//! failure. The tracker is reconciled against freshly fetched descriptors
//! so a client does not retry an introduction point it just saw fail, and
//! entries age out quickly so transient failures do not blacklist a relay
//! for long.

use std::collections::HashMap;

use tracing::debug;
use velum_types::{RelayId, ServiceId, Timestamp};

use crate::descriptor::ParsedDescriptor;

/// Why an introduction point was recorded as failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntroFailureKind {
    /// Unspecified failure.
    Generic,
    /// The introduction timed out.
    Timeout,
    /// The introduction point could not be reached.
    Unreachable,
}

/// A recorded failure for one introduction point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntroFailure {
    /// Most recent failure kind observed.
    pub kind: IntroFailureKind,
    /// When the relay was first noted as failing. Repeat failures update
    /// the kind but keep this time, so the entry still ages out.
    pub created_at: Timestamp,
}

/// Per-service map of failing introduction points.
#[derive(Debug, Default)]
pub struct FailureTracker {
    services: HashMap<ServiceId, HashMap<RelayId, IntroFailure>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure for `relay` when introducing to `service`.
    ///
    /// A repeat failure overwrites the kind but keeps the original
    /// creation time.
    pub fn note(&mut self, service: &ServiceId, relay: RelayId, kind: IntroFailureKind, now: Timestamp) {
        let per_service = self.services.entry(service.clone()).or_default();
        per_service
            .entry(relay)
            .and_modify(|f| f.kind = kind)
            .or_insert(IntroFailure {
                kind,
                created_at: now,
            });
    }

    /// Look up the recorded failure for a relay, if any.
    pub fn lookup(&self, service: &ServiceId, relay: &RelayId) -> Option<&IntroFailure> {
        self.services.get(service)?.get(relay)
    }

    /// Whether a failure is recorded for this service and relay.
    pub fn contains(&self, service: &ServiceId, relay: &RelayId) -> bool {
        self.lookup(service, relay).is_some()
    }

    /// Reconcile a freshly parsed descriptor against recorded failures.
    ///
    /// Introduction points that appear in the failure record are removed
    /// from the descriptor, and their failure entries are carried into a
    /// replacement record that becomes the service's whole failure state.
    /// Failures for relays the new descriptor no longer lists are dropped
    /// with it. The replacement is installed even when empty, so a store
    /// that later releases the service entry removes exactly this state.
    pub fn reconcile(&mut self, desc: &mut ParsedDescriptor) {
        let Some(existing) = self.services.get(&desc.service_id) else {
            return;
        };
        let mut replacement = HashMap::new();
        desc.intro_points.retain(|ip| {
            if let Some(failure) = existing.get(&ip.identity) {
                debug!(
                    service = %desc.service_id,
                    relay = %ip.identity,
                    "dropping recently failed introduction point from descriptor"
                );
                replacement.insert(ip.identity, *failure);
                false
            } else {
                true
            }
        });
        self.services.insert(desc.service_id.clone(), replacement);
    }

    /// Drop failure entries created before `cutoff`; an entry created
    /// exactly at the cutoff is kept. Services left with no entries are
    /// removed entirely.
    pub fn sweep(&mut self, cutoff: Timestamp) {
        self.services.retain(|_, per_service| {
            per_service.retain(|_, f| f.created_at >= cutoff);
            !per_service.is_empty()
        });
    }

    /// Forget all failure state for one service.
    pub fn remove_service(&mut self, service: &ServiceId) {
        self.services.remove(service);
    }

    /// Forget everything.
    pub fn purge(&mut self) {
        self.services.clear();
    }

    #[cfg(test)]
    pub(crate) fn service_count(&self) -> usize {
        self.services.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::IntroPoint;
    use velum_types::DescriptorId;

    fn service(s: &str) -> ServiceId {
        ServiceId::new(s).unwrap()
    }

    fn relay(b: u8) -> RelayId {
        RelayId::from_bytes([b; 20])
    }

    fn desc_with_intros(sid: &ServiceId, relays: &[RelayId]) -> ParsedDescriptor {
        ParsedDescriptor {
            desc_id: DescriptorId::from_bytes([9; 20]),
            service_id: sid.clone(),
            timestamp: 1000,
            intro_points: relays
                .iter()
                .map(|r| IntroPoint {
                    identity: *r,
                    address: None,
                })
                .collect(),
            encoded_len: 64,
        }
    }

    #[test]
    fn first_failure_sets_creation_time_repeats_keep_it() {
        let mut t = FailureTracker::new();
        let sid = service("abcdefghijklmnop");
        t.note(&sid, relay(1), IntroFailureKind::Timeout, 100);
        t.note(&sid, relay(1), IntroFailureKind::Unreachable, 250);

        let f = t.lookup(&sid, &relay(1)).unwrap();
        assert_eq!(f.kind, IntroFailureKind::Unreachable);
        assert_eq!(f.created_at, 100);
    }

    #[test]
    fn reconcile_strips_failed_points_and_rebuilds_record() {
        let mut t = FailureTracker::new();
        let sid = service("abcdefghijklmnop");
        t.note(&sid, relay(1), IntroFailureKind::Generic, 10);
        t.note(&sid, relay(2), IntroFailureKind::Timeout, 20);

        // New descriptor lists relay 1 (still failing) and relay 3 (clean);
        // relay 2 is no longer offered.
        let mut d = desc_with_intros(&sid, &[relay(1), relay(3)]);
        t.reconcile(&mut d);

        assert_eq!(d.intro_points.len(), 1);
        assert_eq!(d.intro_points[0].identity, relay(3));
        assert!(t.contains(&sid, &relay(1)));
        assert!(!t.contains(&sid, &relay(2)));
    }

    #[test]
    fn reconcile_installs_empty_record_when_no_failures_match() {
        let mut t = FailureTracker::new();
        let sid = service("abcdefghijklmnop");
        t.note(&sid, relay(5), IntroFailureKind::Generic, 10);

        let mut d = desc_with_intros(&sid, &[relay(7)]);
        t.reconcile(&mut d);

        assert_eq!(d.intro_points.len(), 1);
        assert!(!t.contains(&sid, &relay(5)));
        // The service record survives, empty, until swept or removed.
        assert_eq!(t.service_count(), 1);
    }

    #[test]
    fn reconcile_without_prior_failures_is_a_no_op() {
        let mut t = FailureTracker::new();
        let sid = service("abcdefghijklmnop");
        let mut d = desc_with_intros(&sid, &[relay(1), relay(2)]);
        t.reconcile(&mut d);
        assert_eq!(d.intro_points.len(), 2);
        assert_eq!(t.service_count(), 0);
    }

    #[test]
    fn sweep_drops_old_entries_and_empty_services() {
        let mut t = FailureTracker::new();
        let a = service("abcdefghijklmnop");
        let b = service("ponmlkjihgfedcba");
        t.note(&a, relay(1), IntroFailureKind::Generic, 100);
        t.note(&a, relay(2), IntroFailureKind::Generic, 500);
        t.note(&a, relay(4), IntroFailureKind::Generic, 300);
        t.note(&b, relay(3), IntroFailureKind::Generic, 100);

        t.sweep(300);

        assert!(!t.contains(&a, &relay(1)));
        assert!(t.contains(&a, &relay(2)));
        // Created exactly at the cutoff: not yet expired.
        assert!(t.contains(&a, &relay(4)));
        assert_eq!(t.service_count(), 1);
    }

    #[test]
    fn remove_service_only_touches_that_service() {
        let mut t = FailureTracker::new();
        let a = service("abcdefghijklmnop");
        let b = service("ponmlkjihgfedcba");
        t.note(&a, relay(1), IntroFailureKind::Generic, 1);
        t.note(&b, relay(2), IntroFailureKind::Generic, 1);

        t.remove_service(&a);
        assert!(!t.contains(&a, &relay(1)));
        assert!(t.contains(&b, &relay(2)));
    }
}
