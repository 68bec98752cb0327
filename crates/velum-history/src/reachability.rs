//! Per-identity uptime and stability tracking.
//!
//! Each tracked relay is either in a run (reachable since some time) or
//! in downtime, never both. Closing a run folds its length into weighted
//! accumulators, and every twelve hours all accumulators are discounted
//! by a fixed factor so an interval that just ended counts twice as much
//! as one from a week ago and relays silent for half a year are forgotten.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use velum_types::{Clock, RelayId, Timestamp};

/// If the total run weight for a relay falls below this, its MTBF is
/// treated as zero.
pub const STABILITY_EPSILON: f64 = 0.0001;

/// Discount applied to all accumulators, compounded per interval.
pub const STABILITY_ALPHA: f64 = 0.95;

/// How often accumulated history is discounted, in seconds.
pub const STABILITY_INTERVAL: i64 = 12 * 60 * 60;

/// How long we must have been tracking before stability judgments mean
/// anything.
const MEASUREMENT_SETTLE_SECS: i64 = 4 * 60 * 60;

/// Fallback downtime penalty for an address change, in seconds.
const ADDR_CHANGE_PENALTY: i64 = 3600;
const ADDR_CHANGE_PENALTY_TESTING: i64 = 240;

/// Tuning knobs for reachability tracking.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReachabilityConfig {
    /// Use the short address-change penalty suited to test networks.
    pub testing_network: bool,
    /// How long unchanged entries are kept before `dump_stats` cleans
    /// them, in seconds.
    pub track_secs: i64,
}

impl Default for ReachabilityConfig {
    fn default() -> Self {
        Self {
            testing_network: false,
            track_secs: 10 * 24 * 60 * 60,
        }
    }
}

/// Validity window of the latest network consensus.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsensusTimes {
    pub valid_after: Timestamp,
    pub fresh_until: Timestamp,
    pub valid_until: Timestamp,
}

/// Source of consensus timing, used to size address-change penalties.
pub trait ConsensusView {
    fn latest(&self) -> Option<ConsensusTimes>;
}

/// A consensus view with no consensus, for callers without one.
pub struct NoConsensus;

impl ConsensusView for NoConsensus {
    fn latest(&self) -> Option<ConsensusTimes> {
        None
    }
}

/// History of one relay identity.
#[derive(Debug, Default, Clone)]
pub(crate) struct OrHistory {
    /// When we started tracking this relay.
    pub(crate) since: Timestamp,
    /// When we last noted a change.
    pub(crate) changed: Timestamp,
    /// Address we most recently reached it at.
    pub(crate) last_reached_addr: Option<SocketAddr>,
    /// Weighted sum of finished run lengths.
    pub(crate) weighted_run_length: u64,
    /// Set while the relay is in a run.
    pub(crate) start_of_run: Option<Timestamp>,
    /// Sum of weights for the runs in `weighted_run_length`.
    pub(crate) total_run_weights: f64,
    /// Set while the relay is in downtime.
    pub(crate) start_of_downtime: Option<Timestamp>,
    pub(crate) weighted_uptime: u64,
    pub(crate) total_weighted_time: u64,
}

impl OrHistory {
    fn new(now: Timestamp) -> Self {
        Self {
            since: now,
            changed: now,
            ..Self::default()
        }
    }
}

/// Reachability run tracking for all observed relays.
pub struct ReachabilityHistory {
    pub(crate) clock: Arc<dyn Clock>,
    config: ReachabilityConfig,
    pub(crate) entries: HashMap<RelayId, OrHistory>,
    pub(crate) started_tracking: Option<Timestamp>,
    pub(crate) last_downrated: Option<Timestamp>,
}

impl ReachabilityHistory {
    pub fn new(clock: Arc<dyn Clock>, config: ReachabilityConfig) -> Self {
        Self {
            clock,
            config,
            entries: HashMap::new(),
            started_tracking: None,
            last_downrated: None,
        }
    }

    /// Number of tracked identities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn entry_mut(&mut self, id: &RelayId) -> Option<&mut OrHistory> {
        if id.is_zero() {
            return None;
        }
        let now = self.clock.now();
        Some(self.entries.entry(*id).or_insert_with(|| OrHistory::new(now)))
    }

    /// The relay was just confirmed reachable at `when`, optionally at a
    /// known address.
    ///
    /// A reachable relay whose address has changed is treated as having
    /// been down for a penalty interval first: the old run is closed at
    /// `when - penalty` and a fresh one opened at `when`, so uninterrupted
    /// uptime is never credited across an address migration.
    pub fn note_reachable(
        &mut self,
        id: &RelayId,
        at_addr: Option<SocketAddr>,
        when: Timestamp,
        consensus: &dyn ConsensusView,
    ) {
        if self.started_tracking.is_none() {
            self.started_tracking = Some(self.clock.now());
        }
        let Some(hist) = self.entry_mut(id) else {
            return;
        };
        let addr_changed = matches!(
            (at_addr, hist.last_reached_addr),
            (Some(a), Some(b)) if a != b
        );
        if hist.start_of_run.is_some() && hist.start_of_downtime.is_none() && addr_changed {
            let penalty = Self::address_change_penalty(consensus, self.config.testing_network);
            info!(
                relay = %id,
                penalty,
                "reachable relay changed address; counting it as downtime"
            );
            self.note_unreachable(id, when - penalty);
        }

        let Some(hist) = self.entry_mut(id) else {
            return;
        };
        let was_in_run = hist.start_of_run.is_some();
        if !was_in_run {
            hist.start_of_run = Some(when);
        }
        if let Some(down_since) = hist.start_of_downtime.take() {
            let down_length = when - down_since;
            hist.total_weighted_time = add_clamped(hist.total_weighted_time, down_length);
            hist.changed = when;
            info!(relay = %id, down_since, "relay is reachable again");
        } else if was_in_run {
            debug!(relay = %id, "relay is still reachable");
        } else {
            hist.changed = when;
            info!(relay = %id, "relay is reachable; it was previously untracked");
        }
        if at_addr.is_some() {
            hist.last_reached_addr = at_addr;
        }
    }

    /// The relay was just confirmed unreachable at `when`.
    pub fn note_unreachable(&mut self, id: &RelayId, when: Timestamp) {
        if self.started_tracking.is_none() {
            self.started_tracking = Some(self.clock.now());
        }
        let Some(hist) = self.entry_mut(id) else {
            return;
        };
        if let Some(run_start) = hist.start_of_run.take() {
            let run_length = when - run_start;
            hist.total_run_weights += 1.0;
            if run_length < 0 {
                // Clock anomaly. Charge the absolute length as a penalty
                // instead of letting accumulators go backwards past zero.
                let penalty = run_length.unsigned_abs();
                hist.weighted_run_length = hist.weighted_run_length.saturating_sub(penalty);
                hist.weighted_uptime = hist.weighted_uptime.saturating_sub(penalty);
            } else {
                hist.weighted_run_length += run_length as u64;
                hist.weighted_uptime += run_length as u64;
                hist.total_weighted_time += run_length as u64;
            }
            hist.changed = when;
            info!(
                relay = %id,
                run_start,
                uptime = hist.weighted_uptime,
                total = hist.total_weighted_time,
                "relay is no longer reachable"
            );
        }
        if hist.start_of_downtime.is_none() {
            hist.start_of_downtime = Some(when);
            hist.changed = when;
        }
    }

    /// Mark the relay down and retroactively erase all credit it ever
    /// earned.
    pub fn make_pessimal(&mut self, id: &RelayId, when: Timestamp) {
        self.note_unreachable(id, when);
        if let Some(hist) = self.entry_mut(id) {
            hist.weighted_run_length = 0;
            hist.weighted_uptime = 0;
        }
    }

    fn address_change_penalty(consensus: &dyn ConsensusView, testing: bool) -> i64 {
        if let Some(times) = consensus.latest() {
            // An address change takes about half a fresh interval to reach
            // a consensus and half a liveness period to reach clients.
            let fresh_interval = times.fresh_until - times.valid_after;
            let live_interval = times.valid_until - times.valid_after;
            (fresh_interval + live_interval) / 2
        } else if testing {
            ADDR_CHANGE_PENALTY_TESTING
        } else {
            ADDR_CHANGE_PENALTY
        }
    }

    /// Discount all accumulated history if an interval has passed.
    /// Returns when the next discount is due.
    pub fn downrate_old_runs(&mut self, now: Timestamp) -> Timestamp {
        let last = *self.last_downrated.get_or_insert(now);
        if last + STABILITY_INTERVAL > now {
            return last + STABILITY_INTERVAL;
        }
        let mut alpha = 1.0;
        let mut last = last;
        while last + STABILITY_INTERVAL < now {
            last += STABILITY_INTERVAL;
            alpha *= STABILITY_ALPHA;
        }
        self.last_downrated = Some(last);
        info!(alpha, "discounting all old stability history");
        for hist in self.entries.values_mut() {
            hist.weighted_run_length = (hist.weighted_run_length as f64 * alpha) as u64;
            hist.total_run_weights *= alpha;
            hist.weighted_uptime = (hist.weighted_uptime as f64 * alpha) as u64;
            hist.total_weighted_time = (hist.total_weighted_time as f64 * alpha) as u64;
        }
        last + STABILITY_INTERVAL
    }

    /// Weighted mean time between failures, extrapolated to include an
    /// in-progress run. Zero for unknown relays or negligible weight.
    pub fn stability(&self, id: &RelayId, when: Timestamp) -> f64 {
        let Some(hist) = self.entries.get(id) else {
            return 0.0;
        };
        let mut total = hist.weighted_run_length as f64;
        let mut weights = hist.total_run_weights;
        if let Some(run_start) = hist.start_of_run {
            total += (when - run_start) as f64;
            weights += 1.0;
        }
        if weights < STABILITY_EPSILON {
            return 0.0;
        }
        total / weights
    }

    /// Weighted fraction of observed time the relay has been up,
    /// extrapolated to include the current run or downtime.
    pub fn weighted_fractional_uptime(&self, id: &RelayId, when: Timestamp) -> f64 {
        let Some(hist) = self.entries.get(id) else {
            return 0.0;
        };
        let mut total = hist.total_weighted_time as i64;
        let mut up = hist.weighted_uptime as i64;
        if let Some(run_start) = hist.start_of_run {
            up += when - run_start;
            total += when - run_start;
        } else if let Some(down_start) = hist.start_of_downtime {
            total += when - down_start;
        }
        if total <= 0 {
            return 0.0;
        }
        up as f64 / total as f64
    }

    /// Length of the current run, or zero if the relay is down or unknown.
    pub fn uptime(&self, id: &RelayId, when: Timestamp) -> i64 {
        let Some(hist) = self.entries.get(id) else {
            return 0;
        };
        match hist.start_of_run {
            Some(start) if when >= start => when - start,
            _ => 0,
        }
    }

    /// Total weighted observation time for the relay, including the
    /// current run or downtime.
    pub fn weighted_time_known(&self, id: &RelayId, when: Timestamp) -> i64 {
        let Some(hist) = self.entries.get(id) else {
            return 0;
        };
        let mut total = hist.total_weighted_time as i64;
        if let Some(start) = hist.start_of_run {
            total += when - start;
        } else if let Some(start) = hist.start_of_downtime {
            total += when - start;
        }
        total
    }

    /// Whether tracking has run long enough for stability judgments to be
    /// meaningful.
    pub fn have_measured_enough_stability(&self) -> bool {
        match self.started_tracking {
            Some(since) => since < self.clock.now() - MEASUREMENT_SETTLE_SECS,
            None => false,
        }
    }

    /// Drop entries that stopped being interesting.
    ///
    /// In authority mode, idle zero-weight entries go regardless of age;
    /// otherwise, entries that have not changed since `before`.
    pub fn clean(&mut self, before: Timestamp, authority_mode: bool) {
        self.entries.retain(|_, hist| {
            let should_remove = if authority_mode {
                hist.total_run_weights < STABILITY_EPSILON && hist.start_of_run.is_none()
            } else {
                hist.changed < before
            };
            !should_remove
        });
    }

    /// Log a stability summary for every tracked relay, after cleaning
    /// entries past the configured tracking window.
    pub fn dump_stats(&mut self, now: Timestamp) {
        self.clean(now - self.config.track_secs, false);
        info!("dumping reachability history for {} relays", self.entries.len());
        let ids: Vec<RelayId> = self.entries.keys().copied().collect();
        for id in ids {
            let mtbf = self.stability(&id, now) as i64;
            info!(
                relay = %id.to_hex(),
                wmtbf = format!("{}:{:02}:{:02}", mtbf / 3600, (mtbf / 60) % 60, mtbf % 60),
            );
        }
    }
}

fn add_clamped(total: u64, delta: i64) -> u64 {
    if delta < 0 {
        total.saturating_sub(delta.unsigned_abs())
    } else {
        total + delta as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velum_types::ManualClock;

    const NOW: Timestamp = 1_700_000_000;

    fn relay(b: u8) -> RelayId {
        RelayId::from_bytes([b; 20])
    }

    fn history() -> ReachabilityHistory {
        ReachabilityHistory::new(
            Arc::new(ManualClock::at(NOW)),
            ReachabilityConfig::default(),
        )
    }

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:9001").parse().unwrap()
    }

    struct FixedConsensus(ConsensusTimes);
    impl ConsensusView for FixedConsensus {
        fn latest(&self) -> Option<ConsensusTimes> {
            Some(self.0)
        }
    }

    /// Exactly one of run/downtime start is set for a tracked relay.
    fn assert_state_invariant(h: &ReachabilityHistory, id: &RelayId) {
        let hist = h.entries.get(id).unwrap();
        assert_ne!(
            hist.start_of_run.is_some(),
            hist.start_of_downtime.is_some(),
            "relay must be either in a run or in downtime"
        );
    }

    #[test]
    fn run_and_downtime_are_mutually_exclusive() {
        let mut h = history();
        let id = relay(1);
        let events: &[(bool, i64)] = &[
            (true, 0),
            (true, 100),
            (false, 200),
            (false, 250),
            (true, 300),
            (false, 301),
            (true, 400),
        ];
        for (up, offset) in events {
            if *up {
                h.note_reachable(&id, None, NOW + offset, &NoConsensus);
            } else {
                h.note_unreachable(&id, NOW + offset);
            }
            assert_state_invariant(&h, &id);
        }
    }

    proptest::proptest! {
        #[test]
        fn random_event_sequences_keep_run_and_downtime_exclusive(
            events in proptest::collection::vec(
                (0u8..3, 0i64..200_000, proptest::option::of(1u8..4)),
                1..50,
            ),
        ) {
            let mut h = history();
            let id = relay(1);
            for (kind, offset, addr_last) in events {
                let when = NOW + offset;
                match kind {
                    0 => h.note_reachable(&id, addr_last.map(addr), when, &NoConsensus),
                    1 => h.note_unreachable(&id, when),
                    _ => h.make_pessimal(&id, when),
                }
                let hist = h.entries.get(&id).unwrap();
                proptest::prop_assert_ne!(
                    hist.start_of_run.is_some(),
                    hist.start_of_downtime.is_some()
                );
            }
        }
    }

    #[test]
    fn closing_a_run_folds_accumulators() {
        let mut h = history();
        let id = relay(1);
        h.note_reachable(&id, None, NOW, &NoConsensus);
        h.note_unreachable(&id, NOW + 100);

        let hist = h.entries.get(&id).unwrap();
        assert_eq!(hist.weighted_run_length, 100);
        assert_eq!(hist.weighted_uptime, 100);
        assert_eq!(hist.total_weighted_time, 100);
        assert!((hist.total_run_weights - 1.0).abs() < f64::EPSILON);
        assert_eq!(h.stability(&id, NOW + 100), 100.0);
    }

    #[test]
    fn downtime_counts_into_total_time_only() {
        let mut h = history();
        let id = relay(1);
        h.note_reachable(&id, None, NOW, &NoConsensus);
        h.note_unreachable(&id, NOW + 100);
        h.note_reachable(&id, None, NOW + 300, &NoConsensus);

        let hist = h.entries.get(&id).unwrap();
        assert_eq!(hist.weighted_uptime, 100);
        assert_eq!(hist.total_weighted_time, 300);
        let wfu = h.weighted_fractional_uptime(&id, NOW + 300);
        assert!((wfu - 100.0 / 300.0).abs() < 1e-9);
    }

    #[test]
    fn in_progress_run_extrapolates() {
        let mut h = history();
        let id = relay(1);
        h.note_reachable(&id, None, NOW, &NoConsensus);
        assert_eq!(h.stability(&id, NOW + 500), 500.0);
        assert_eq!(h.uptime(&id, NOW + 500), 500);
        assert_eq!(h.weighted_time_known(&id, NOW + 500), 500);
        assert!((h.weighted_fractional_uptime(&id, NOW + 500) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn negative_run_length_clamps_instead_of_underflowing() {
        let mut h = history();
        let id = relay(1);
        h.note_reachable(&id, None, NOW, &NoConsensus);
        h.note_unreachable(&id, NOW + 100);
        h.note_reachable(&id, None, NOW + 200, &NoConsensus);
        // The clock went backwards: run closes before it started.
        h.note_unreachable(&id, NOW + 150);

        let hist = h.entries.get(&id).unwrap();
        assert_eq!(hist.weighted_run_length, 50);
        assert_eq!(hist.weighted_uptime, 50);
        assert_state_invariant(&h, &id);
    }

    #[test]
    fn address_change_counts_as_downtime() {
        let mut h = history();
        let id = relay(1);
        let consensus = FixedConsensus(ConsensusTimes {
            valid_after: NOW,
            fresh_until: NOW + 3600,
            valid_until: NOW + 3 * 3600,
        });
        h.note_reachable(&id, Some(addr(1)), NOW, &consensus);
        h.note_reachable(&id, Some(addr(2)), NOW + 10_000, &consensus);

        // Penalty is (3600 + 10800) / 2 = 7200: the run is closed at
        // when - 7200 and a new one starts at when.
        let hist = h.entries.get(&id).unwrap();
        assert_eq!(hist.weighted_run_length, 2800);
        assert_eq!(hist.start_of_run, Some(NOW + 10_000));
        assert_eq!(hist.last_reached_addr, Some(addr(2)));
        // The penalty window itself counts as observed downtime.
        assert_eq!(hist.total_weighted_time, 10_000);
        assert_state_invariant(&h, &id);
    }

    #[test]
    fn address_change_uses_fallback_penalty_without_consensus() {
        let mut h = history();
        let id = relay(1);
        h.note_reachable(&id, Some(addr(1)), NOW, &NoConsensus);
        h.note_reachable(&id, Some(addr(2)), NOW + 10_000, &NoConsensus);
        let hist = h.entries.get(&id).unwrap();
        assert_eq!(hist.weighted_run_length, 10_000 - 3600);
    }

    #[test]
    fn same_address_does_not_interrupt_a_run() {
        let mut h = history();
        let id = relay(1);
        h.note_reachable(&id, Some(addr(1)), NOW, &NoConsensus);
        h.note_reachable(&id, Some(addr(1)), NOW + 10_000, &NoConsensus);
        let hist = h.entries.get(&id).unwrap();
        assert_eq!(hist.start_of_run, Some(NOW));
        assert_eq!(hist.weighted_run_length, 0);
    }

    #[test]
    fn make_pessimal_erases_all_credit() {
        let mut h = history();
        let id = relay(1);
        h.note_reachable(&id, None, NOW, &NoConsensus);
        h.make_pessimal(&id, NOW + 5000);

        let hist = h.entries.get(&id).unwrap();
        assert_eq!(hist.weighted_run_length, 0);
        assert_eq!(hist.weighted_uptime, 0);
        assert_eq!(hist.start_of_downtime, Some(NOW + 5000));
        assert_eq!(h.stability(&id, NOW + 5000), 0.0);
    }

    #[test]
    fn downrating_discounts_by_alpha_per_interval() {
        let mut h = history();
        let id = relay(1);
        h.note_reachable(&id, None, NOW, &NoConsensus);
        h.note_unreachable(&id, NOW + 10_000);

        let next = h.downrate_old_runs(NOW);
        assert_eq!(next, NOW + STABILITY_INTERVAL);
        // Not due yet: nothing changes.
        assert_eq!(h.entries.get(&id).unwrap().weighted_run_length, 10_000);

        h.downrate_old_runs(NOW + 2 * STABILITY_INTERVAL + 1);
        let hist = h.entries.get(&id).unwrap();
        let expected = (10_000.0 * STABILITY_ALPHA * STABILITY_ALPHA) as u64;
        assert_eq!(hist.weighted_run_length, expected);
        assert!((hist.total_run_weights - STABILITY_ALPHA * STABILITY_ALPHA).abs() < 1e-9);
    }

    #[test]
    fn zero_identity_is_never_tracked() {
        let mut h = history();
        let id = RelayId::from_bytes([0; 20]);
        h.note_reachable(&id, None, NOW, &NoConsensus);
        assert!(h.is_empty());
    }

    #[test]
    fn clean_by_age_and_by_authority_mode() {
        let mut h = history();
        let stale = relay(1);
        let active = relay(2);
        h.note_reachable(&stale, None, NOW - 10_000, &NoConsensus);
        h.note_unreachable(&stale, NOW - 9000);
        h.note_reachable(&active, None, NOW, &NoConsensus);

        // Age-based: only the stale entry goes.
        let mut by_age = history();
        by_age.entries = h.entries.clone();
        by_age.clean(NOW - 5000, false);
        assert!(by_age.entries.contains_key(&active));
        assert!(!by_age.entries.contains_key(&stale));

        // Authority mode keeps anything with weight or an open run.
        h.clean(NOW, true);
        assert!(h.entries.contains_key(&stale));
        assert!(h.entries.contains_key(&active));
    }

    #[test]
    fn measurement_settling_period() {
        let clock = Arc::new(ManualClock::at(NOW));
        let mut h = ReachabilityHistory::new(clock.clone(), ReachabilityConfig::default());
        assert!(!h.have_measured_enough_stability());
        h.note_reachable(&relay(1), None, NOW, &NoConsensus);
        assert!(!h.have_measured_enough_stability());
        clock.advance(4 * 60 * 60 + 1);
        assert!(h.have_measured_enough_stability());
    }
}
