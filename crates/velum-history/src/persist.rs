//! Versioned text persistence for reachability history.
//!
//! The stability file format:
//!
//! ```text
//! format 2
//! stored-at 2026-08-30 12:00:00
//! tracked-since 2026-08-01 00:00:00
//! last-downrated 2026-08-30 00:00:00
//! data
//! R <40-char hex identity>
//! +MTBF <weighted_run_length> <total_run_weights> [S=<run start>]
//! +WFU <weighted_uptime> <total_weighted_time> [S=<downtime start>]
//! .
//! ```
//!
//! On load, absolute run-start times are rebased: a run that was N seconds
//! old when the file was stored is treated as N seconds old now, since the
//! process was not observing anything in between.

use std::collections::HashMap;

use tracing::{debug, warn};
use velum_types::{format_iso, parse_iso, parse_possibly_bad_iso, RelayId, Timestamp};

use crate::error::{HistoryError, Result};
use crate::reachability::ReachabilityHistory;

/// Name of the stability file within the store.
pub const STABILITY_FILE: &str = "router-stability";

/// Minimal storage the history needs: whole-file replace, append, and
/// load. File I/O itself lives with the caller.
pub trait PersistentStore {
    fn replace(&mut self, name: &str, contents: &str) -> Result<()>;
    fn append(&mut self, name: &str, contents: &str) -> Result<()>;
    fn load(&self, name: &str) -> Result<Option<String>>;
}

/// In-memory store for tests and embedders without a disk layout.
#[derive(Debug, Default)]
pub struct MemStore {
    files: HashMap<String, String>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.files.get(name).map(String::as_str)
    }
}

impl PersistentStore for MemStore {
    fn replace(&mut self, name: &str, contents: &str) -> Result<()> {
        self.files.insert(name.to_string(), contents.to_string());
        Ok(())
    }

    fn append(&mut self, name: &str, contents: &str) -> Result<()> {
        self.files.entry(name.to_string()).or_default().push_str(contents);
        Ok(())
    }

    fn load(&self, name: &str) -> Result<Option<String>> {
        Ok(self.files.get(name).cloned())
    }
}

/// Rebase a stored time against the current clock.
///
/// Returns how far before `now` the time should sit, given that it was
/// `stored_at - t` before the file was written. Ancient or future values
/// are discarded; anything before tracking began clamps to its start.
fn correct_time(
    t: Option<Timestamp>,
    now: Timestamp,
    stored_at: Timestamp,
    started: Timestamp,
) -> Option<Timestamp> {
    let t = t?;
    if t < started - 365 * 24 * 60 * 60 {
        None
    } else if t < started {
        Some(started)
    } else if t > stored_at {
        None
    } else {
        let run_length = stored_at - t;
        Some((now - run_length).max(started))
    }
}

/// Split a `+MTBF`/`+WFU` record into its two numbers and optional
/// `S=<iso>` start time.
fn split_record_line<'a>(line: &'a str, tag: &str) -> Option<(&'a str, &'a str, Option<String>)> {
    let rest = line.strip_prefix(tag)?;
    let mut fields = rest.split_whitespace();
    let a = fields.next()?;
    let b = fields.next()?;
    let start = match fields.next() {
        Some(tok) => {
            let date = tok.strip_prefix("S=")?;
            let time = fields.next()?;
            Some(format!("{date} {time}"))
        }
        None => None,
    };
    Some((a, b, start))
}

/// Find the next line with `prefix` at or after `from`, stopping at the
/// next `R ` record boundary.
fn find_next_with<'a>(lines: &[&'a str], from: usize, prefix: &str) -> Option<(usize, &'a str)> {
    for (idx, line) in lines.iter().enumerate().skip(from) {
        if let Some(rest) = line.strip_prefix(prefix) {
            return Some((idx, rest.trim_start()));
        }
        if line.starts_with("R ") {
            return None;
        }
    }
    None
}

impl ReachabilityHistory {
    /// Write all reachability state to the store.
    ///
    /// When `known` is given, a relay we believe is still running but that
    /// the predicate no longer recognizes is first marked unreachable: it
    /// fell out of the network without telling us.
    pub fn save_mtbf(
        &mut self,
        store: &mut dyn PersistentStore,
        known: Option<&dyn Fn(&RelayId) -> bool>,
    ) -> Result<()> {
        let now = self.clock.now();
        if let Some(known) = known {
            let missing: Vec<RelayId> = self
                .entries
                .iter()
                .filter(|(id, hist)| hist.start_of_run.is_some() && !known(id))
                .map(|(id, _)| *id)
                .collect();
            for id in missing {
                warn!(
                    relay = %id,
                    "relay is recorded as running but is no longer known; marking it down"
                );
                self.note_unreachable(&id, now);
            }
        }

        let mut out = String::from("format 2\n");
        out.push_str(&format!("stored-at {}\n", format_iso(now)));
        if let Some(since) = self.started_tracking {
            out.push_str(&format!("tracked-since {}\n", format_iso(since)));
        }
        if let Some(at) = self.last_downrated {
            out.push_str(&format!("last-downrated {}\n", format_iso(at)));
        }
        out.push_str("data\n");

        let mut ids: Vec<&RelayId> = self.entries.keys().collect();
        ids.sort();
        for id in ids {
            let hist = &self.entries[id];
            out.push_str(&format!("R {}\n", id.to_hex()));
            out.push_str(&format!(
                "+MTBF {} {:.5}",
                hist.weighted_run_length, hist.total_run_weights
            ));
            if let Some(start) = hist.start_of_run {
                out.push_str(&format!(" S={}", format_iso(start)));
            }
            out.push('\n');
            out.push_str(&format!(
                "+WFU {} {}",
                hist.weighted_uptime, hist.total_weighted_time
            ));
            if let Some(start) = hist.start_of_downtime {
                out.push_str(&format!(" S={}", format_iso(start)));
            }
            out.push('\n');
        }
        out.push_str(".\n");
        store.replace(STABILITY_FILE, &out)
    }

    /// Load reachability state from the store, replacing nothing if no
    /// file exists.
    ///
    /// Malformed records are skipped with a warning; the rest of the file
    /// still loads. A file without the format header or a stored-at time
    /// is rejected whole.
    pub fn load_mtbf(&mut self, store: &dyn PersistentStore, now: Timestamp) -> Result<()> {
        let Some(contents) = store.load(STABILITY_FILE)? else {
            return Ok(());
        };
        let lines: Vec<&str> = contents
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();

        match lines.first().and_then(|l| l.strip_prefix("format ")) {
            Some("2") => {}
            _ => return Err(HistoryError::UnrecognizedFormat),
        }

        let mut stored_at: Option<Timestamp> = None;
        let mut tracked_since: Timestamp = 0;
        let mut last_downrated: Option<Timestamp> = None;
        let mut i = 1;
        while i < lines.len() && lines[i] != "data" {
            let line = lines[i];
            if let Some(rest) = line.strip_prefix("stored-at ") {
                stored_at = parse_iso(rest);
                if stored_at.is_none() {
                    warn!(line, "could not parse stored-at time in stability file");
                }
            } else if let Some(rest) = line.strip_prefix("tracked-since ") {
                match parse_iso(rest) {
                    Some(ts) => tracked_since = ts,
                    None => warn!(line, "could not parse tracked-since time in stability file"),
                }
            } else if let Some(rest) = line.strip_prefix("last-downrated ") {
                last_downrated = parse_iso(rest);
                if last_downrated.is_none() {
                    warn!(line, "could not parse last-downrated time in stability file");
                }
            }
            i += 1;
        }
        let Some(stored_at) = stored_at else {
            return Err(HistoryError::MissingStoredAt);
        };
        let last_downrated = last_downrated.map(|t| t.min(now));
        let mut tracked_since = tracked_since.min(now);

        if i < lines.len() {
            i += 1; // skip the "data" line
        }
        let mut terminated = false;
        let mut n_bogus_times = 0usize;
        let mut latest_possible_start = now;

        while i < lines.len() {
            let line = lines[i];
            if line == "." {
                terminated = true;
                break;
            }
            let Some(id) = line
                .strip_prefix("R ")
                .and_then(|hex| RelayId::from_hex(hex.trim()).ok())
            else {
                warn!(line, "skipping unparseable stability record");
                i += 1;
                continue;
            };

            let mut wrl: u64 = 0;
            let mut trw: f64 = 0.0;
            let mut start_of_run: Option<Timestamp> = None;
            let mut have_mtbf = false;
            if let Some((idx, rest)) = find_next_with(&lines, i + 1, "+MTBF") {
                match split_record_line(lines[idx], "+MTBF ").and_then(|(a, b, s)| {
                    Some((a.parse::<u64>().ok()?, b.parse::<f64>().ok()?, s))
                }) {
                    Some((a, b, start)) => {
                        wrl = a;
                        trw = b;
                        if let Some(iso) = start {
                            match parse_possibly_bad_iso(&iso) {
                                Some((ts, bogus)) => {
                                    if bogus {
                                        n_bogus_times += 1;
                                    }
                                    start_of_run = Some(ts);
                                }
                                None => warn!(time = %iso, "could not parse run start time"),
                            }
                        }
                        have_mtbf = true;
                    }
                    None => warn!(line = rest, "could not scan +MTBF record"),
                }
                if idx > i {
                    i = idx;
                }
            }

            let mut weighted_uptime: u64 = 0;
            let mut total_weighted_time: u64 = 0;
            let mut start_of_downtime: Option<Timestamp> = None;
            if let Some((idx, rest)) = find_next_with(&lines, i + 1, "+WFU") {
                match split_record_line(lines[idx], "+WFU ").and_then(|(a, b, s)| {
                    Some((a.parse::<u64>().ok()?, b.parse::<u64>().ok()?, s))
                }) {
                    Some((a, b, start)) => {
                        weighted_uptime = a;
                        total_weighted_time = b;
                        if let Some(iso) = start {
                            match parse_possibly_bad_iso(&iso) {
                                Some((ts, bogus)) => {
                                    if bogus {
                                        n_bogus_times += 1;
                                    }
                                    start_of_downtime = Some(ts);
                                }
                                None => warn!(time = %iso, "could not parse downtime start time"),
                            }
                        }
                    }
                    None => warn!(line = rest, "could not scan +WFU record"),
                }
                if idx > i {
                    i = idx;
                }
            }
            i += 1;

            let Some(hist) = self.entry_mut(&id) else {
                continue;
            };
            if have_mtbf {
                hist.start_of_run = correct_time(start_of_run, now, stored_at, tracked_since);
                let rebased_start = hist.start_of_run.unwrap_or(0);
                if rebased_start < latest_possible_start + wrl as i64 {
                    latest_possible_start = rebased_start - wrl as i64;
                }
                hist.weighted_run_length = wrl;
                hist.total_run_weights = trw;
            }
            hist.start_of_downtime = correct_time(start_of_downtime, now, stored_at, tracked_since);
            hist.weighted_uptime = weighted_uptime;
            hist.total_weighted_time = total_weighted_time;
        }

        if !terminated {
            warn!("stability file is truncated");
        }
        if n_bogus_times > 0 {
            debug!(n_bogus_times, "rounded pre-1970 times up to the epoch");
        }
        // An absent or absurdly early tracked-since is recovered from the
        // earliest run the records could imply.
        if tracked_since < 365 * 24 * 60 * 60 {
            tracked_since = latest_possible_start;
        }
        self.last_downrated = last_downrated;
        self.started_tracking = Some(tracked_since);
        Ok(())
    }
}
