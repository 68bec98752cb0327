//! Bandwidth history snapshots for the caller's state file.
//!
//! The snapshot carries totals and maxima as decimal strings, one pair of
//! lists per observation stream, plus the in-progress period. Restoring
//! replays each period as an averaged per-second stream, which is the best
//! that can be reconstructed from period-level resolution.

use serde::{Deserialize, Serialize};
use tracing::warn;
use velum_types::Timestamp;

use crate::bandwidth::{
    round_down, BandwidthHistory, BwArray, Channel, Direction, PERIOD_SECS, RETAINED_PERIODS,
    ROLLING_WINDOW_SECS,
};
use crate::error::{HistoryError, Result};

/// Persisted history for one observation stream.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthSection {
    /// When the in-progress period ends.
    pub ends: Timestamp,
    /// Period length the values were recorded under.
    pub interval: i64,
    /// Period totals, oldest first, in-progress period last.
    pub values: Vec<String>,
    /// Peak window throughput per period, divided by the window length.
    pub maxima: Vec<String>,
}

/// Persisted history for all four streams.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandwidthState {
    pub write: BandwidthSection,
    pub read: BandwidthSection,
    pub dir_write: BandwidthSection,
    pub dir_read: BandwidthSection,
}

fn snapshot_array(b: &BwArray) -> BandwidthSection {
    let mut values = Vec::new();
    let mut maxima = Vec::new();
    for p in b.periods.iter() {
        values.push(round_down(p.total).to_string());
        maxima.push(round_down(p.max / ROLLING_WINDOW_SECS as u64).to_string());
    }
    values.push(round_down(b.total_in_period).to_string());
    maxima.push(round_down(b.max_total / ROLLING_WINDOW_SECS as u64).to_string());
    BandwidthSection {
        ends: b.next_period,
        interval: PERIOD_SECS,
        values,
        maxima,
    }
}

/// Replay one section into a fresh array. Returns false if any value
/// failed to parse (the replay continues with zero for that period).
fn restore_array(b: &mut BwArray, section: &BandwidthSection, now: Timestamp) -> bool {
    let mut all_ok = true;
    if section.values.is_empty()
        || section.ends < now - PERIOD_SECS * RETAINED_PERIODS as i64
        || section.interval <= 0
    {
        return true;
    }
    let mut start = section.ends - section.interval * section.values.len() as i64;
    if start > now {
        return true;
    }
    *b = BwArray::new(start);

    let have_maxima = section.maxima.len() == section.values.len();
    for (i, raw) in section.values.iter().enumerate() {
        let v: u64 = match raw.parse() {
            Ok(v) => v,
            Err(_) => {
                warn!(value = %raw, "could not parse bandwidth state value");
                all_ok = false;
                0
            }
        };
        let mv: u64 = if have_maxima {
            match section.maxima[i].parse::<u64>() {
                Ok(m) => m * ROLLING_WINDOW_SECS as u64,
                Err(_) => {
                    warn!(value = %section.maxima[i], "could not parse bandwidth state maximum");
                    all_ok = false;
                    0
                }
            }
        } else {
            // No maxima known; assume the average rate to stay conservative.
            (v / section.interval as u64) * ROLLING_WINDOW_SECS as u64
        };
        if start < now {
            let replay_len = section.interval.min(now - start);
            let per_second = v / replay_len as u64;
            for s in start..start + replay_len {
                b.add(s, per_second);
            }
            b.max_total = mv;
            start += replay_len;
        }
    }
    b.clear_window();
    all_ok
}

impl BandwidthHistory {
    /// Capture all four streams for the state file.
    pub fn snapshot(&self) -> BandwidthState {
        BandwidthState {
            write: snapshot_array(self.array(Direction::Write, Channel::All)),
            read: snapshot_array(self.array(Direction::Read, Channel::All)),
            dir_write: snapshot_array(self.array(Direction::Write, Channel::Directory)),
            dir_read: snapshot_array(self.array(Direction::Read, Channel::Directory)),
        }
    }

    /// Replace current observations with a loaded snapshot.
    ///
    /// A section older than the retention horizon is ignored. If any
    /// stored number fails to parse, the history is reinitialized empty
    /// and an error is returned; a partially trusted history is worse
    /// than none.
    pub fn restore(&mut self, state: &BandwidthState, now: Timestamp) -> Result<()> {
        let sections = [
            (Direction::Write, Channel::All, &state.write),
            (Direction::Read, Channel::All, &state.read),
            (Direction::Write, Channel::Directory, &state.dir_write),
            (Direction::Read, Channel::Directory, &state.dir_read),
        ];
        let mut all_ok = true;
        for (dir, chan, section) in sections {
            if !restore_array(self.array_mut(dir, chan), section, now) {
                all_ok = false;
            }
        }
        if !all_ok {
            self.reset(now);
            return Err(HistoryError::BadStateValue(
                "bandwidth history values failed to parse".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use velum_types::format_iso;

    const T0: Timestamp = 1_700_000_000;

    #[test]
    fn snapshot_restore_round_trip() {
        let mut h = BandwidthHistory::new(T0, None);
        // 691200 is divisible by both the period length and the rounding
        // granularity, so averaging and rounding are exact.
        h.note_bytes(Direction::Write, Channel::All, 691_200, T0);
        h.note_bytes(Direction::Write, Channel::All, 0, T0 + PERIOD_SECS);
        let state = h.snapshot();
        assert_eq!(state.write.values, vec!["691200", "0"]);
        assert_eq!(state.write.ends, T0 + 2 * PERIOD_SECS);

        let now = T0 + PERIOD_SECS;
        let mut restored = BandwidthHistory::new(now, None);
        restored.restore(&state, now).unwrap();
        // The replayed period commits on the next observation.
        restored.note_bytes(Direction::Write, Channel::All, 0, now);
        assert_eq!(
            restored.history_line(Direction::Write, Channel::All).unwrap(),
            format!("write-history {} (86400 s) 691200", format_iso(now))
        );
    }

    #[test]
    fn restore_rejects_unparseable_values_and_reinitializes() {
        let mut state = BandwidthState::default();
        state.read = BandwidthSection {
            ends: T0,
            interval: PERIOD_SECS,
            values: vec!["12noise".into()],
            maxima: vec!["0".into()],
        };
        let mut h = BandwidthHistory::new(T0, None);
        h.note_bytes(Direction::Read, Channel::All, 1000, T0);
        assert_eq!(
            h.restore(&state, T0).unwrap_err(),
            HistoryError::BadStateValue("bandwidth history values failed to parse".into())
        );
        // Reinitialized: no observations survive.
        assert_eq!(h.snapshot().read.values, vec!["0"]);
    }

    #[test]
    fn restore_ignores_sections_past_the_horizon() {
        let mut state = BandwidthState::default();
        state.write = BandwidthSection {
            ends: T0 - PERIOD_SECS * RETAINED_PERIODS as i64 - 1,
            interval: PERIOD_SECS,
            values: vec!["1024".into()],
            maxima: vec!["1024".into()],
        };
        let mut h = BandwidthHistory::new(T0, None);
        h.restore(&state, T0).unwrap();
        assert!(h.history_line(Direction::Write, Channel::All).is_none());
        assert_eq!(h.snapshot().write.values, vec!["0"]);
    }

    #[test]
    fn state_serializes_for_embedding() {
        let h = BandwidthHistory::new(T0, None);
        let state = h.snapshot();
        let json = serde_json::to_string(&state).unwrap();
        let back: BandwidthState = serde_json::from_str(&json).unwrap();
        assert_eq!(state, back);
    }
}
