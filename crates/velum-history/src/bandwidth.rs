//! Rolling byte-count observation arrays and their period summaries.

use velum_types::{format_iso, Timestamp};
use velum_utils::RingBuf;

/// Seconds of per-second byte totals kept in the rolling window.
pub const ROLLING_WINDOW_SECS: usize = 10;

/// Length of one reporting period, in seconds.
pub const PERIOD_SECS: i64 = 24 * 60 * 60;

/// How many finished periods are retained and published.
pub const RETAINED_PERIODS: usize = 5;

/// Published totals are rounded down to this granularity.
const TOTAL_GRANULARITY: u64 = 1024;

/// Direction of traffic being observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

/// Which traffic an observation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// All bytes on the wire.
    All,
    /// Bytes spent answering directory requests only.
    Directory,
}

/// Total and peak usage for one finished period.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct PeriodSummary {
    pub(crate) total: u64,
    pub(crate) max: u64,
}

/// One observation array: a rolling window of per-second byte counts plus
/// the retained per-period summaries.
#[derive(Debug)]
pub(crate) struct BwArray {
    /// Per-second byte totals, used circularly.
    obs: [u64; ROLLING_WINDOW_SECS],
    cur_obs_idx: usize,
    /// The second represented by `obs[cur_obs_idx]`.
    pub(crate) cur_obs_time: Timestamp,
    /// Sum of all window slots except the current one.
    total_obs: u64,
    /// Largest window sum seen in the current period.
    pub(crate) max_total: u64,
    /// Bytes recorded in the current period so far.
    pub(crate) total_in_period: u64,
    /// When the current period ends.
    pub(crate) next_period: Timestamp,
    pub(crate) periods: RingBuf<PeriodSummary>,
}

impl BwArray {
    pub(crate) fn new(now: Timestamp) -> Self {
        Self {
            obs: [0; ROLLING_WINDOW_SECS],
            cur_obs_idx: 0,
            cur_obs_time: now,
            total_obs: 0,
            max_total: 0,
            total_in_period: 0,
            next_period: now + PERIOD_SECS,
            periods: RingBuf::new(RETAINED_PERIODS),
        }
    }

    /// Fold the finished period into the retained summaries.
    fn commit_period(&mut self) {
        self.periods.push(PeriodSummary {
            total: self.total_in_period,
            max: self.max_total,
        });
        self.next_period += PERIOD_SECS;
        self.max_total = 0;
        self.total_in_period = 0;
    }

    /// Move the observation window forward one second.
    fn advance(&mut self) {
        let total = self.total_obs + self.obs[self.cur_obs_idx];
        if total > self.max_total {
            self.max_total = total;
        }
        let next = (self.cur_obs_idx + 1) % ROLLING_WINDOW_SECS;
        self.total_obs = total - self.obs[next];
        self.obs[next] = 0;
        self.cur_obs_idx = next;
        self.cur_obs_time += 1;
        if self.cur_obs_time >= self.next_period {
            self.commit_period();
        }
    }

    /// Record `n` bytes for second `when`. Observations behind the current
    /// second are dropped; history is never retrofitted.
    pub(crate) fn add(&mut self, when: Timestamp, n: u64) {
        if when < self.cur_obs_time {
            return;
        }
        while when > self.cur_obs_time {
            self.advance();
        }
        self.obs[self.cur_obs_idx] += n;
        self.total_in_period += n;
    }

    /// Largest window sum committed in any retained period.
    fn largest_max(&self) -> u64 {
        self.periods.iter().map(|p| p.max).max().unwrap_or(0)
    }

    /// Zero the rolling window, keeping period state. Used after a restore
    /// replays averaged observations that should not linger in the window.
    pub(crate) fn clear_window(&mut self) {
        self.obs = [0; ROLLING_WINDOW_SECS];
        self.total_obs = 0;
    }
}

/// Bandwidth use tracker for all four observation streams.
#[derive(Debug)]
pub struct BandwidthHistory {
    read: BwArray,
    write: BwArray,
    dir_read: BwArray,
    dir_write: BwArray,
    /// Configured relay rate limit, bytes per second. Published totals are
    /// capped at `cap * PERIOD_SECS` so history lines never reveal that we
    /// carried more than we admit to.
    rate_cap: Option<u64>,
}

impl BandwidthHistory {
    pub fn new(now: Timestamp, rate_cap: Option<u64>) -> Self {
        Self {
            read: BwArray::new(now),
            write: BwArray::new(now),
            dir_read: BwArray::new(now),
            dir_write: BwArray::new(now),
            rate_cap,
        }
    }

    pub(crate) fn array(&self, dir: Direction, chan: Channel) -> &BwArray {
        match (dir, chan) {
            (Direction::Read, Channel::All) => &self.read,
            (Direction::Write, Channel::All) => &self.write,
            (Direction::Read, Channel::Directory) => &self.dir_read,
            (Direction::Write, Channel::Directory) => &self.dir_write,
        }
    }

    pub(crate) fn array_mut(&mut self, dir: Direction, chan: Channel) -> &mut BwArray {
        match (dir, chan) {
            (Direction::Read, Channel::All) => &mut self.read,
            (Direction::Write, Channel::All) => &mut self.write,
            (Direction::Read, Channel::Directory) => &mut self.dir_read,
            (Direction::Write, Channel::Directory) => &mut self.dir_write,
        }
    }

    /// Throw away all observations and restart the clock at `now`.
    pub fn reset(&mut self, now: Timestamp) {
        self.read = BwArray::new(now);
        self.write = BwArray::new(now);
        self.dir_read = BwArray::new(now);
        self.dir_write = BwArray::new(now);
    }

    /// Record bytes moved during second `when`.
    pub fn note_bytes(&mut self, dir: Direction, chan: Channel, n: u64, when: Timestamp) {
        self.array_mut(dir, chan).add(when, n);
    }

    /// Conservative sustained-throughput estimate, bytes per second.
    ///
    /// Takes the largest committed window maximum independently for reads
    /// and writes on the main channel, and returns the smaller of the two
    /// spread over the window length. A relay that can only push what it
    /// can both read and write should not advertise more.
    pub fn assess(&self) -> u64 {
        let r = self.read.largest_max();
        let w = self.write.largest_max();
        r.min(w) / ROLLING_WINDOW_SECS as u64
    }

    /// One published history line for the given stream, or `None` if no
    /// period has finished yet.
    ///
    /// Format: `<label> <ISO time> (<period> s) <total>,<total>,...` with
    /// totals oldest to newest, rounded down to 1 KiB, capped at the
    /// configured rate limit.
    pub fn history_line(&self, dir: Direction, chan: Channel) -> Option<String> {
        let label = match (dir, chan) {
            (Direction::Write, Channel::All) => "write-history",
            (Direction::Read, Channel::All) => "read-history",
            (Direction::Write, Channel::Directory) => "dirreq-write-history",
            (Direction::Read, Channel::Directory) => "dirreq-read-history",
        };
        let b = self.array(dir, chan);
        if b.periods.is_empty() {
            return None;
        }
        let cutoff = self
            .rate_cap
            .map(|cap| cap.saturating_mul(PERIOD_SECS as u64))
            .unwrap_or(u64::MAX);
        let totals: Vec<String> = b
            .periods
            .iter()
            .map(|p| {
                let total = p.total & !(TOTAL_GRANULARITY - 1);
                total.min(cutoff).to_string()
            })
            .collect();
        Some(format!(
            "{} {} ({} s) {}",
            label,
            format_iso(b.next_period - PERIOD_SECS),
            PERIOD_SECS,
            totals.join(",")
        ))
    }

    /// All four history lines, in publication order, skipping streams with
    /// no finished period.
    pub fn history_lines(&self) -> Vec<String> {
        [
            (Direction::Write, Channel::All),
            (Direction::Read, Channel::All),
            (Direction::Write, Channel::Directory),
            (Direction::Read, Channel::Directory),
        ]
        .into_iter()
        .filter_map(|(d, c)| self.history_line(d, c))
        .collect()
    }
}

/// Round a published value down to the reporting granularity.
pub(crate) fn round_down(v: u64) -> u64 {
    v & !(TOTAL_GRANULARITY - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Timestamp = 1_700_000_000;

    #[test]
    fn window_sums_ten_seconds() {
        let mut b = BwArray::new(T0);
        for s in 0..20 {
            b.add(T0 + s, 100);
        }
        // After the window has filled, every advance sees a full ten
        // seconds of traffic.
        assert_eq!(b.max_total, 100 * ROLLING_WINDOW_SECS as u64);
        assert_eq!(b.total_in_period, 2000);
    }

    #[test]
    fn out_of_order_observations_are_dropped() {
        let mut b = BwArray::new(T0);
        b.add(T0 + 5, 100);
        b.add(T0 + 2, 500);
        assert_eq!(b.total_in_period, 100);
    }

    #[test]
    fn crossing_a_period_boundary_commits_a_summary() {
        let mut h = BandwidthHistory::new(T0, None);
        h.note_bytes(Direction::Write, Channel::All, 3000, T0);
        assert!(h.history_line(Direction::Write, Channel::All).is_none());

        h.note_bytes(Direction::Write, Channel::All, 1, T0 + PERIOD_SECS);
        let line = h.history_line(Direction::Write, Channel::All).unwrap();
        // 3000 rounds down to 2048; the trailing byte is in the new period,
        // and the line is stamped with the current period's start.
        assert_eq!(
            line,
            format!(
                "write-history {} (86400 s) 2048",
                format_iso(T0 + PERIOD_SECS)
            )
        );
    }

    #[test]
    fn retains_only_the_last_periods() {
        let mut h = BandwidthHistory::new(T0, None);
        for p in 0..(RETAINED_PERIODS as i64 + 2) {
            h.note_bytes(
                Direction::Read,
                Channel::All,
                (p as u64 + 1) * 10240,
                T0 + p * PERIOD_SECS,
            );
        }
        let line = h.history_line(Direction::Read, Channel::All).unwrap();
        let totals: Vec<&str> = line.rsplit(' ').next().unwrap().split(',').collect();
        assert_eq!(totals.len(), RETAINED_PERIODS);
        // Six periods finished; the first one has aged out.
        assert_eq!(totals[0], "20480");
        assert_eq!(totals[RETAINED_PERIODS - 1], "61440");
    }

    #[test]
    fn rate_cap_hides_excess_usage() {
        let mut h = BandwidthHistory::new(T0, Some(1));
        h.note_bytes(Direction::Write, Channel::All, 10_000_000, T0);
        h.note_bytes(Direction::Write, Channel::All, 0, T0 + PERIOD_SECS);
        let line = h.history_line(Direction::Write, Channel::All).unwrap();
        assert!(line.ends_with(&format!(" {}", PERIOD_SECS)));
    }

    #[test]
    fn assess_takes_the_smaller_direction() {
        let mut h = BandwidthHistory::new(T0, None);
        h.note_bytes(Direction::Read, Channel::All, 5000, T0);
        h.note_bytes(Direction::Write, Channel::All, 8000, T0);
        // Nothing committed yet: no estimate.
        assert_eq!(h.assess(), 0);

        h.note_bytes(Direction::Read, Channel::All, 0, T0 + PERIOD_SECS);
        h.note_bytes(Direction::Write, Channel::All, 0, T0 + PERIOD_SECS);
        assert_eq!(h.assess(), 5000 / ROLLING_WINDOW_SECS as u64);
    }

    #[test]
    fn directory_channel_is_tracked_separately() {
        let mut h = BandwidthHistory::new(T0, None);
        h.note_bytes(Direction::Read, Channel::Directory, 4096, T0);
        h.note_bytes(Direction::Read, Channel::Directory, 0, T0 + PERIOD_SECS);
        h.note_bytes(Direction::Read, Channel::All, 0, T0 + PERIOD_SECS);

        let dir_line = h.history_line(Direction::Read, Channel::Directory).unwrap();
        assert!(dir_line.starts_with("dirreq-read-history "));
        assert!(dir_line.ends_with(" 4096"));
        let all_line = h.history_line(Direction::Read, Channel::All).unwrap();
        assert!(all_line.ends_with(" 0"));
        assert_eq!(h.history_lines().len(), 2);
    }
}
