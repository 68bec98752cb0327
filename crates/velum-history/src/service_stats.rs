//! Daily hidden-service observation statistics.
//!
//! A directory counts how many distinct service identities it stored
//! descriptors for and how many rendezvous cells it relayed. Both numbers
//! are published once per day, rounded up to a bin and perturbed with
//! Laplace noise so a single service cannot be picked out of the report.

use std::collections::HashSet;

use tracing::debug;
use velum_types::{format_iso, ServiceId, Timestamp};

use crate::error::Result;
use crate::persist::PersistentStore;

/// How often the statistics are flushed, in seconds.
pub const WRITE_STATS_INTERVAL: i64 = 24 * 60 * 60;

/// Name of the published statistics file within the store.
pub const SERVICE_STATS_FILE: &str = "hidserv-stats";

// Obfuscation parameters for the relayed-cell count.
const REND_CELLS_DELTA_F: f64 = 2048.0;
const REND_CELLS_EPSILON: f64 = 0.3;
const REND_CELLS_BIN_SIZE: u64 = 1024;

// Obfuscation parameters for the distinct-services count.
const ONIONS_SEEN_DELTA_F: f64 = 8.0;
const ONIONS_SEEN_EPSILON: f64 = 0.3;
const ONIONS_SEEN_BIN_SIZE: u64 = 8;

/// Counters for the current statistics period.
#[derive(Debug)]
pub struct ServiceStats {
    interval_start: Timestamp,
    relayed_cells: u64,
    services_seen: HashSet<ServiceId>,
}

impl ServiceStats {
    pub fn new(now: Timestamp) -> Self {
        Self {
            interval_start: now,
            relayed_cells: 0,
            services_seen: HashSet::new(),
        }
    }

    /// Count one relayed rendezvous cell.
    pub fn note_relayed_cell(&mut self) {
        self.relayed_cells += 1;
    }

    /// Count a service we stored a descriptor for. Repeat sightings in
    /// the same period are not double counted.
    pub fn note_service_seen(&mut self, service: &ServiceId) {
        if self.services_seen.insert(service.clone()) {
            debug!(service = %service, "first sighting of service this period");
        }
    }

    /// Number of distinct services seen this period.
    pub fn services_seen(&self) -> usize {
        self.services_seen.len()
    }

    /// Discard all counters and start a fresh period at `now`.
    pub fn reset(&mut self, now: Timestamp) {
        self.relayed_cells = 0;
        self.services_seen.clear();
        self.interval_start = now;
    }

    /// Render the published statistics lines for a period ending at `now`.
    pub fn format(&self, now: Timestamp) -> String {
        let cells = obfuscate(self.relayed_cells, REND_CELLS_BIN_SIZE, REND_CELLS_DELTA_F,
            REND_CELLS_EPSILON);
        let onions = obfuscate(
            self.services_seen.len() as u64,
            ONIONS_SEEN_BIN_SIZE,
            ONIONS_SEEN_DELTA_F,
            ONIONS_SEEN_EPSILON,
        );
        format!(
            "hidserv-stats-end {} ({} s)\n\
             hidserv-rend-relayed-cells {} delta_f={} epsilon={:.2} bin_size={}\n\
             hidserv-dir-onions-seen {} delta_f={} epsilon={:.2} bin_size={}\n",
            format_iso(now),
            now - self.interval_start,
            cells,
            REND_CELLS_DELTA_F as u64,
            REND_CELLS_EPSILON,
            REND_CELLS_BIN_SIZE,
            onions,
            ONIONS_SEEN_DELTA_F as u64,
            ONIONS_SEEN_EPSILON,
            ONIONS_SEEN_BIN_SIZE,
        )
    }

    /// Flush the statistics if a full period has passed, resetting the
    /// counters. Returns when the next flush is due.
    pub fn write(&mut self, now: Timestamp, store: &mut dyn PersistentStore) -> Result<Timestamp> {
        if self.interval_start + WRITE_STATS_INTERVAL > now {
            return Ok(self.interval_start + WRITE_STATS_INTERVAL);
        }
        let formatted = self.format(now);
        self.reset(now);
        store.replace(SERVICE_STATS_FILE, &formatted)?;
        Ok(self.interval_start + WRITE_STATS_INTERVAL)
    }
}

/// Round up to the bin, then add Laplace noise sized by `delta_f` and
/// `epsilon`.
fn obfuscate(value: u64, bin_size: u64, delta_f: f64, epsilon: f64) -> i64 {
    let binned = round_up_to_multiple(value, bin_size).min(i64::MAX as u64) as i64;
    add_laplace_noise(binned, rand::random::<f64>(), delta_f, epsilon)
}

fn round_up_to_multiple(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple).saturating_mul(multiple)
}

/// Sample from a Laplace distribution with location 0 and scale
/// `delta_f / epsilon` via inverse transform sampling of `p` in [0, 1),
/// and add it to `signal`.
fn add_laplace_noise(signal: i64, p: f64, delta_f: f64, epsilon: f64) -> i64 {
    let b = delta_f / epsilon;
    let centered = p - 0.5;
    let noise = -b * centered.signum() * (1.0 - 2.0 * centered.abs()).ln();
    signal.saturating_add(noise as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persist::MemStore;

    const NOW: Timestamp = 1_700_000_000;

    fn service(s: &str) -> ServiceId {
        ServiceId::new(s).unwrap()
    }

    #[test]
    fn services_are_counted_once_per_period() {
        let mut stats = ServiceStats::new(NOW);
        stats.note_service_seen(&service("abcdefghijklmnop"));
        stats.note_service_seen(&service("abcdefghijklmnop"));
        stats.note_service_seen(&service("ponmlkjihgfedcba"));
        assert_eq!(stats.services_seen(), 2);
    }

    #[test]
    fn rounding_goes_up_to_the_next_bin() {
        assert_eq!(round_up_to_multiple(0, 8), 0);
        assert_eq!(round_up_to_multiple(1, 8), 8);
        assert_eq!(round_up_to_multiple(8, 8), 8);
        assert_eq!(round_up_to_multiple(9, 1024), 1024);
    }

    #[test]
    fn median_noise_sample_is_zero() {
        assert_eq!(add_laplace_noise(4096, 0.5, 2048.0, 0.3), 4096);
    }

    #[test]
    fn noise_is_symmetric_around_the_signal() {
        let lo = add_laplace_noise(0, 0.25, 8.0, 0.3);
        let hi = add_laplace_noise(0, 0.75, 8.0, 0.3);
        assert_eq!(lo, -hi);
        assert!(lo < 0);
    }

    #[test]
    fn format_carries_the_obfuscation_parameters() {
        let stats = ServiceStats::new(NOW - WRITE_STATS_INTERVAL);
        let s = stats.format(NOW);
        let mut lines = s.lines();
        assert_eq!(
            lines.next().unwrap(),
            format!("hidserv-stats-end {} (86400 s)", format_iso(NOW))
        );
        let cells = lines.next().unwrap();
        assert!(cells.starts_with("hidserv-rend-relayed-cells "));
        assert!(cells.ends_with("delta_f=2048 epsilon=0.30 bin_size=1024"));
        let onions = lines.next().unwrap();
        assert!(onions.starts_with("hidserv-dir-onions-seen "));
        assert!(onions.ends_with("delta_f=8 epsilon=0.30 bin_size=8"));
    }

    #[test]
    fn write_waits_for_a_full_period_then_resets() {
        let mut stats = ServiceStats::new(NOW);
        stats.note_relayed_cell();
        stats.note_service_seen(&service("abcdefghijklmnop"));
        let mut store = MemStore::new();

        // Too early: nothing written.
        let next = stats.write(NOW + 100, &mut store).unwrap();
        assert_eq!(next, NOW + WRITE_STATS_INTERVAL);
        assert!(store.get(SERVICE_STATS_FILE).is_none());
        assert_eq!(stats.services_seen(), 1);

        // A period later: flushed and reset.
        let flush_at = NOW + WRITE_STATS_INTERVAL;
        let next = stats.write(flush_at, &mut store).unwrap();
        assert_eq!(next, flush_at + WRITE_STATS_INTERVAL);
        assert!(store
            .get(SERVICE_STATS_FILE)
            .unwrap()
            .starts_with("hidserv-stats-end "));
        assert_eq!(stats.services_seen(), 0);
    }
}
