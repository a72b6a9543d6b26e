use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use super::{CacheEntry, LogSignature, estimate_entry_bytes};
use crate::telemetry::SharedTelemetry;
use crate::types::{Message, ProjectStatistics};
use crate::utils::format_bytes;

const COMPONENT: &str = "memory_cache";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryCacheLimits {
    pub max_projects: usize,
    pub max_bytes_per_project: u64,
}

impl Default for MemoryCacheLimits {
    fn default() -> Self {
        Self::from_mb(5, 500)
    }
}

impl MemoryCacheLimits {
    pub fn from_mb(max_projects: usize, max_mb_per_project: u64) -> Self {
        Self {
            max_projects,
            max_bytes_per_project: max_mb_per_project.saturating_mul(1024 * 1024),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored { evicted: Vec<PathBuf> },
    Rejected { estimated_bytes: u64 },
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    tick: u64,
    bytes: u64,
}

/// Recency order plus byte ledger. Every mutation bumps a monotonic tick;
/// the smallest tick in `order` is the least recently used key.
#[derive(Debug, Default)]
pub(crate) struct RecencyIndex {
    tick: u64,
    order: BTreeMap<u64, PathBuf>,
    slots: HashMap<PathBuf, Slot>,
    total_bytes: u64,
}

impl RecencyIndex {
    fn next_tick(&mut self) -> u64 {
        self.tick += 1;
        self.tick
    }

    pub(crate) fn touch(&mut self, key: &Path) -> bool {
        let tick = self.next_tick();
        let Some(slot) = self.slots.get_mut(key) else {
            return false;
        };
        self.order.remove(&slot.tick);
        slot.tick = tick;
        self.order.insert(tick, key.to_path_buf());
        true
    }

    pub(crate) fn upsert(&mut self, key: &Path, bytes: u64) {
        self.remove(key);
        let tick = self.next_tick();
        self.order.insert(tick, key.to_path_buf());
        self.slots.insert(key.to_path_buf(), Slot { tick, bytes });
        self.total_bytes += bytes;
    }

    pub(crate) fn remove(&mut self, key: &Path) -> bool {
        match self.slots.remove(key) {
            Some(slot) => {
                self.order.remove(&slot.tick);
                self.total_bytes -= slot.bytes;
                true
            }
            None => false,
        }
    }

    pub(crate) fn pop_least_recent(&mut self) -> Option<PathBuf> {
        let (_, key) = self.order.pop_first()?;
        if let Some(slot) = self.slots.remove(&key) {
            self.total_bytes -= slot.bytes;
        }
        Some(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.len()
    }

    pub(crate) fn keys_oldest_first(&self) -> Vec<PathBuf> {
        self.order.values().cloned().collect()
    }

    fn clear(&mut self) {
        self.order.clear();
        self.slots.clear();
        self.total_bytes = 0;
    }
}

/// Bounded in-process cache keyed by log directory.
///
/// Entries live in a `DashMap` so lookups on different keys never contend.
/// The recency index sits behind one mutex that is only held while the index
/// itself changes; inserts hold it across the map write so that two puts on
/// the same key cannot interleave. Lock order is always index, then map.
pub struct MemoryCache {
    entries: DashMap<PathBuf, CacheEntry>,
    index: Mutex<RecencyIndex>,
    limits: MemoryCacheLimits,
    telemetry: SharedTelemetry,
}

impl MemoryCache {
    pub fn new(limits: MemoryCacheLimits, telemetry: SharedTelemetry) -> Self {
        Self {
            entries: DashMap::new(),
            index: Mutex::new(RecencyIndex::default()),
            limits,
            telemetry,
        }
    }

    pub fn limits(&self) -> MemoryCacheLimits {
        self.limits
    }

    /// Returns the entry if its logs are unchanged, refreshing its recency.
    pub fn get(&self, key: &Path) -> Option<CacheEntry> {
        let entry = self.entries.get(key).map(|e| e.value().clone())?;

        let current = LogSignature::compute(key);
        if entry.signature != current {
            self.telemetry.debug(
                COMPONENT,
                &format!("Dropping stale entry for {}", key.display()),
            );
            let mut index = self.index.lock();
            // A fresher put may have landed since the lookup
            if self
                .entries
                .remove_if(key, |_, e| e.signature == entry.signature)
                .is_some()
            {
                index.remove(key);
            }
            return None;
        }

        self.index.lock().touch(key);
        Some(entry)
    }

    pub fn put(&self, key: &Path, messages: Vec<Message>, stats: ProjectStatistics) -> PutOutcome {
        let signature = LogSignature::compute(key);
        self.put_with_signature(key, messages, stats, signature)
    }

    /// Stores an entry validated against a signature captured by the caller,
    /// typically before the logs were read.
    pub fn put_with_signature(
        &self,
        key: &Path,
        messages: Vec<Message>,
        stats: ProjectStatistics,
        signature: LogSignature,
    ) -> PutOutcome {
        let estimated_bytes = estimate_entry_bytes(&messages, &stats);
        if estimated_bytes > self.limits.max_bytes_per_project || self.limits.max_projects == 0 {
            self.telemetry.warn(
                COMPONENT,
                &format!(
                    "Not caching {}: estimated {} exceeds the {} per-project limit",
                    key.display(),
                    format_bytes(estimated_bytes),
                    format_bytes(self.limits.max_bytes_per_project)
                ),
            );
            return PutOutcome::Rejected { estimated_bytes };
        }

        let entry = CacheEntry {
            messages: Arc::new(messages),
            stats: Arc::new(stats),
            signature,
        };

        let mut evicted = Vec::new();
        {
            let mut index = self.index.lock();
            index.upsert(key, estimated_bytes);
            while index.len() > self.limits.max_projects {
                let Some(victim) = index.pop_least_recent() else {
                    break;
                };
                self.entries.remove(&victim);
                evicted.push(victim);
            }
            self.entries.insert(key.to_path_buf(), entry);
        }

        for victim in &evicted {
            self.telemetry.info(
                COMPONENT,
                &format!("Evicted least recently used project {}", victim.display()),
            );
        }

        PutOutcome::Stored { evicted }
    }

    pub fn remove(&self, key: &Path) -> bool {
        let mut index = self.index.lock();
        let removed = index.remove(key);
        self.entries.remove(key);
        removed
    }

    pub fn clear(&self) {
        let mut index = self.index.lock();
        index.clear();
        self.entries.clear();
    }

    /// Presence only; does not validate or touch.
    pub fn contains(&self, key: &Path) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.index.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn total_bytes(&self) -> u64 {
        self.index.lock().total_bytes
    }

    /// Keys from least to most recently used.
    pub fn keys_by_recency(&self) -> Vec<PathBuf> {
        self.index.lock().keys_oldest_first()
    }
}
