//! The descriptor cache proper: three keyed partitions over one byte
//! budget, joined to the failure tracker.

use std::collections::HashMap;
use std::mem;
use std::sync::Arc;

use tracing::{debug, info};
use velum_types::{Clock, DescriptorId, RelayId, ServiceId, Timestamp};

use crate::alloc::AllocationCounter;
use crate::descriptor::{ParsedDescriptor, Parser};
use crate::error::{CacheError, Result};
use crate::failure::{FailureTracker, IntroFailureKind};

/// Oldest acceptable descriptor age, in seconds.
pub const MAX_AGE: i64 = 48 * 60 * 60;

/// Tolerated clock skew on descriptor timestamps, in seconds.
pub const MAX_SKEW: i64 = 24 * 60 * 60;

/// Lifetime of an introduction-point failure record, in seconds.
pub const FAILURE_MAX_AGE: i64 = 5 * 60;

/// How far a directory-side insert backdates `last_served`, so a freshly
/// uploaded descriptor is not immediately counted as popular.
const SERVED_BACKDATE: i64 = 60 * 60;

/// Version prefix for client-partition keys.
const DESC_VERSION: &str = "2";

/// One cached descriptor plus its serving metadata.
#[derive(Debug)]
pub struct CacheEntry {
    raw: String,
    parsed: ParsedDescriptor,
    last_served: Timestamp,
}

impl CacheEntry {
    /// The descriptor exactly as received.
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// The parsed form.
    pub fn parsed(&self) -> &ParsedDescriptor {
        &self.parsed
    }

    /// When this entry was last served to a client, Unix seconds.
    pub fn last_served(&self) -> Timestamp {
        self.last_served
    }

    /// Approximate bytes this entry pins in memory.
    fn allocation(&self) -> u64 {
        (mem::size_of::<CacheEntry>() + self.raw.len() + mem::size_of::<ParsedDescriptor>()) as u64
    }
}

/// Result of a single-descriptor store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    /// The descriptor was installed, replacing any prior entry.
    Stored,
    /// The cache already held this content or something at least as new.
    Unchanged,
}

/// Result of a directory-side batch store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOutcome {
    /// Descriptors successfully parsed out of the upload.
    pub parsed: usize,
    /// Descriptors actually installed.
    pub stored: usize,
}

/// Descriptor cache with client, directory, and local-service partitions.
///
/// The failure tracker lives inside the cache so that every store, evict,
/// or purge that touches a service's descriptor can adjust its failure
/// state in the same call.
pub struct DescriptorCache {
    clock: Arc<dyn Clock>,
    /// Client-side partition, keyed by version-prefixed service id.
    client: HashMap<String, CacheEntry>,
    /// Directory-side partition, keyed by descriptor id.
    directory: HashMap<DescriptorId, CacheEntry>,
    /// Descriptors for services this process runs itself.
    local: HashMap<ServiceId, CacheEntry>,
    failures: FailureTracker,
    allocation: AllocationCounter,
}

impl DescriptorCache {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            client: HashMap::new(),
            directory: HashMap::new(),
            local: HashMap::new(),
            failures: FailureTracker::new(),
            allocation: AllocationCounter::new(),
        }
    }

    /// Approximate bytes pinned by all cached descriptors.
    pub fn total_allocation(&self) -> u64 {
        self.allocation.total()
    }

    fn client_key(service: &ServiceId) -> String {
        format!("{DESC_VERSION}{service}")
    }

    /// True when `ts` falls outside the accepted freshness window at `now`.
    fn outside_window(now: Timestamp, ts: Timestamp) -> bool {
        ts < now - MAX_AGE - MAX_SKEW || ts > now + MAX_SKEW
    }

    /// Store a descriptor fetched on behalf of a client.
    ///
    /// `want_desc_id` is the id the descriptor was requested under and
    /// `want_service` the service the caller was resolving; mismatches are
    /// rejected before anything else. Known-failing introduction points
    /// are stripped before the descriptor is accepted, and a descriptor
    /// left without usable introduction points is rejected whole.
    pub fn store_as_client(
        &mut self,
        input: &str,
        parser: &dyn Parser,
        want_service: Option<&ServiceId>,
        want_desc_id: Option<&DescriptorId>,
    ) -> Result<StoreOutcome> {
        let now = self.clock.now();
        let mut parsed = parser.parse(input)?;
        let raw = &input[..parsed.encoded_len.min(input.len())];

        if let Some(want) = want_desc_id {
            if parsed.desc_id != *want {
                return Err(CacheError::WrongDescriptorId);
            }
        }
        if let Some(want) = want_service {
            if parsed.service_id != *want {
                return Err(CacheError::WrongServiceId {
                    want: want.clone(),
                    got: parsed.service_id.clone(),
                });
            }
        }
        if Self::outside_window(now, parsed.timestamp) {
            debug!(
                service = %parsed.service_id,
                timestamp = parsed.timestamp,
                "rejecting descriptor outside the freshness window"
            );
            return Err(CacheError::StaleOrSkewed);
        }

        let key = Self::client_key(&parsed.service_id);
        if let Some(existing) = self.client.get(&key) {
            if existing.raw == raw {
                return Ok(StoreOutcome::Unchanged);
            }
            if existing.parsed.timestamp >= parsed.timestamp {
                debug!(service = %parsed.service_id, "already have a descriptor at least as new");
                return Ok(StoreOutcome::Unchanged);
            }
        }

        self.failures.reconcile(&mut parsed);
        if parsed.intro_points.is_empty() {
            info!(
                service = %parsed.service_id,
                "descriptor rejected: every introduction point recently failed"
            );
            return Err(CacheError::AllIntroPointsFailed);
        }

        if let Some(old) = self.client.remove(&key) {
            self.release_client_entry(old);
        }
        let entry = CacheEntry {
            raw: raw.to_string(),
            parsed,
            last_served: now,
        };
        self.allocation.add(entry.allocation());
        self.client.insert(key, entry);
        Ok(StoreOutcome::Stored)
    }

    /// Store a batch of uploaded descriptors in the directory partition.
    ///
    /// Descriptors are processed independently; a stale or superseded one
    /// is skipped without affecting the rest. `observer` is invoked once
    /// per descriptor actually installed. Fails only when nothing in the
    /// upload parses at all.
    pub fn store_as_directory(
        &mut self,
        input: &str,
        parser: &dyn Parser,
        mut observer: Option<&mut dyn FnMut(&ServiceId)>,
    ) -> Result<BatchOutcome> {
        let now = self.clock.now();
        let mut outcome = BatchOutcome {
            parsed: 0,
            stored: 0,
        };
        let mut rest = input;
        while !rest.trim_start().is_empty() {
            let parsed = match parser.parse(rest) {
                Ok(p) => p,
                Err(err) => {
                    debug!(%err, "stopping batch at unparseable descriptor");
                    break;
                }
            };
            if parsed.encoded_len == 0 || parsed.encoded_len > rest.len() {
                break;
            }
            let raw = &rest[..parsed.encoded_len];
            rest = &rest[parsed.encoded_len..];
            outcome.parsed += 1;

            if Self::outside_window(now, parsed.timestamp) {
                debug!(desc = %parsed.desc_id, "skipping descriptor outside the freshness window");
                continue;
            }
            match self.directory.get(&parsed.desc_id) {
                Some(existing) if existing.raw == raw => {
                    debug!(desc = %parsed.desc_id, "skipping byte-identical upload");
                    continue;
                }
                Some(existing) if existing.parsed.timestamp >= parsed.timestamp => {
                    debug!(desc = %parsed.desc_id, "already have a newer upload");
                    continue;
                }
                _ => {}
            }
            let desc_id = parsed.desc_id;
            let service_id = parsed.service_id.clone();
            // Replacement keeps the slot's serving history; a fresh insert
            // is backdated so it does not look recently popular.
            let last_served = match self.directory.remove(&desc_id) {
                Some(old) => {
                    self.allocation.sub(old.allocation());
                    old.last_served
                }
                None => now - SERVED_BACKDATE,
            };
            let entry = CacheEntry {
                raw: raw.to_string(),
                parsed,
                last_served,
            };
            self.allocation.add(entry.allocation());
            self.directory.insert(desc_id, entry);
            outcome.stored += 1;
            if let Some(obs) = observer.as_deref_mut() {
                obs(&service_id);
            }
        }
        if outcome.parsed == 0 {
            return Err(CacheError::NoDescriptorsParsed);
        }
        info!(
            parsed = outcome.parsed,
            stored = outcome.stored,
            "processed descriptor upload"
        );
        Ok(outcome)
    }

    /// Store a descriptor for a service this process runs itself.
    ///
    /// Local descriptors skip the freshness window; the only guard is that
    /// a strictly newer cached copy wins.
    pub fn store_as_service(&mut self, input: &str, parser: &dyn Parser) -> Result<StoreOutcome> {
        let now = self.clock.now();
        let parsed = parser.parse(input)?;
        let raw = &input[..parsed.encoded_len.min(input.len())];

        if let Some(existing) = self.local.get(&parsed.service_id) {
            if existing.parsed.timestamp > parsed.timestamp {
                return Ok(StoreOutcome::Unchanged);
            }
        }
        if let Some(old) = self.local.remove(&parsed.service_id) {
            self.allocation.sub(old.allocation());
        }
        let entry = CacheEntry {
            raw: raw.to_string(),
            parsed,
            last_served: now,
        };
        self.allocation.add(entry.allocation());
        self.local.insert(entry.parsed.service_id.clone(), entry);
        Ok(StoreOutcome::Stored)
    }

    /// Look up a client-side descriptor by service address string.
    pub fn lookup_as_client(&self, query: &str) -> Result<&CacheEntry> {
        let service = ServiceId::new(query).map_err(|_| CacheError::InvalidServiceId)?;
        self.client
            .get(&Self::client_key(&service))
            .ok_or(CacheError::NotFound)
    }

    /// Look up a local-service descriptor.
    pub fn lookup_as_service(&self, service: &ServiceId) -> Result<&CacheEntry> {
        self.local.get(service).ok_or(CacheError::NotFound)
    }

    /// Look up a directory-side descriptor by id, returning its raw text.
    ///
    /// Serving a descriptor refreshes its `last_served` time, which is
    /// what directory eviction keys on.
    pub fn lookup_as_directory(&mut self, desc_id: &DescriptorId) -> Result<&str> {
        let now = self.clock.now();
        let entry = self.directory.get_mut(desc_id).ok_or(CacheError::NotFound)?;
        entry.last_served = now;
        Ok(&entry.raw)
    }

    /// Record an introduction failure against a service's relay.
    pub fn note_intro_failure(&mut self, service: &ServiceId, relay: RelayId, kind: IntroFailureKind) {
        let now = self.clock.now();
        self.failures.note(service, relay, kind, now);
    }

    /// Whether an introduction failure is on record.
    pub fn intro_failure_exists(&self, service: &ServiceId, relay: &RelayId) -> bool {
        self.failures.contains(service, relay)
    }

    /// Peek at a directory-side entry without touching its serving
    /// history. Callers rationing uploads read `last_served` through this.
    pub fn directory_entry(&self, desc_id: &DescriptorId) -> Option<&CacheEntry> {
        self.directory.get(desc_id)
    }

    /// Evict client-side entries older than the retention window.
    pub fn clean_client(&mut self, now: Timestamp) {
        let cutoff = now - MAX_AGE - MAX_SKEW;
        let expired: Vec<String> = self
            .client
            .iter()
            .filter(|(_, e)| e.parsed.timestamp < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = self.client.remove(&key) {
                self.release_client_entry(entry);
            }
        }
    }

    /// Evict local-service entries older than the retention window.
    pub fn clean_service(&mut self, now: Timestamp) {
        let cutoff = now - MAX_AGE - MAX_SKEW;
        let expired: Vec<ServiceId> = self
            .local
            .iter()
            .filter(|(_, e)| e.parsed.timestamp < cutoff)
            .map(|(k, _)| k.clone())
            .collect();
        for key in expired {
            if let Some(entry) = self.local.remove(&key) {
                self.allocation.sub(entry.allocation());
            }
        }
    }

    /// Evict directory-side entries whose descriptor timestamp predates
    /// `cutoff`. Returns the number of bytes reclaimed, for the caller's
    /// quota accounting.
    pub fn clean_directory(&mut self, cutoff: Timestamp) -> u64 {
        let expired: Vec<DescriptorId> = self
            .directory
            .iter()
            .filter(|(_, e)| e.parsed.timestamp < cutoff)
            .map(|(k, _)| *k)
            .collect();
        let mut reclaimed = 0u64;
        for key in expired {
            if let Some(entry) = self.directory.remove(&key) {
                let bytes = entry.allocation();
                self.allocation.sub(bytes);
                reclaimed += bytes;
            }
        }
        reclaimed
    }

    /// Expire introduction-failure records past their lifetime.
    pub fn clean_failures(&mut self, now: Timestamp) {
        self.failures.sweep(now - FAILURE_MAX_AGE);
    }

    /// Drop every client-side descriptor and its failure state.
    pub fn purge_client(&mut self) {
        let entries: Vec<CacheEntry> = self.client.drain().map(|(_, e)| e).collect();
        for entry in entries {
            self.release_client_entry(entry);
        }
    }

    /// Drop all failure state without touching descriptors.
    pub fn purge_failures(&mut self) {
        self.failures.purge();
    }

    /// Releasing a client entry takes its failure state with it, so the
    /// two caches cannot drift apart.
    fn release_client_entry(&mut self, entry: CacheEntry) {
        self.allocation.sub(entry.allocation());
        self.failures.remove_service(&entry.parsed.service_id);
    }
}
