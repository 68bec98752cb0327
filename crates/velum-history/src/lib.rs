//! Bandwidth and reachability history for a Velum relay.
//!
//! Three trackers live here. [`BandwidthHistory`] keeps per-second byte
//! observations in a short rolling window and folds them into daily
//! totals and maxima, enough to publish history lines and a conservative
//! throughput self-estimate without unbounded memory. [`ReachabilityHistory`]
//! records up/down runs per relay identity and derives weighted MTBF and
//! fractional-uptime estimates, with periodic exponential downrating so
//! ancient behavior stops mattering. [`ServiceStats`] counts service
//! descriptors seen and rendezvous cells relayed, published daily with
//! binning and Laplace noise.
//!
//! Reachability state and bandwidth history both survive restarts: the
//! former through a line-oriented versioned text format, the latter
//! through [`BandwidthState`] snapshots a caller embeds in its own state
//! file.

mod bandwidth;
mod error;
mod persist;
mod reachability;
mod service_stats;
mod state;

pub use bandwidth::{
    BandwidthHistory, Channel, Direction, PERIOD_SECS, RETAINED_PERIODS, ROLLING_WINDOW_SECS,
};
pub use error::{HistoryError, Result};
pub use persist::{MemStore, PersistentStore, STABILITY_FILE};
pub use reachability::{
    ConsensusTimes, ConsensusView, NoConsensus, ReachabilityConfig, ReachabilityHistory,
    STABILITY_ALPHA, STABILITY_EPSILON, STABILITY_INTERVAL,
};
pub use service_stats::{ServiceStats, SERVICE_STATS_FILE, WRITE_STATS_INTERVAL};
pub use state::{BandwidthSection, BandwidthState};
