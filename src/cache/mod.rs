//! Two-tier statistics cache.
//!
//! - [`MemoryCache`]: bounded in-process map of log path to messages and
//!   statistics, with LRU eviction and a per-entry byte ceiling.
//! - [`FileCache`]: bincode snapshots on disk, surviving restarts.
//!
//! Both tiers validate entries against a [`LogSignature`] of the project's
//! log directory, so an entry whose logs changed is reported as a miss.

mod file;
mod memory;

use std::mem::size_of;
use std::path::Path;
use std::sync::Arc;
use std::time::UNIX_EPOCH;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::Xxh3;

use crate::processor::list_log_files;
use crate::types::{Message, ProjectStatistics};

pub use file::{FileCache, default_cache_root};
pub use memory::{MemoryCache, MemoryCacheLimits, PutOutcome};

/// Content signature of a log directory: the sorted file names with their
/// modification time and size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogSignature(pub u64);

impl LogSignature {
    /// Signature of a directory that cannot be listed.
    pub const MISSING: LogSignature = LogSignature(0);

    pub fn compute(log_dir: &Path) -> Self {
        let Ok(files) = list_log_files(log_dir) else {
            return Self::MISSING;
        };

        let mut hasher = Xxh3::new();
        for path in &files {
            if let Some(name) = path.file_name() {
                hasher.update(name.as_encoded_bytes());
            }
            hasher.update(&[0]);
            if let Ok(meta) = std::fs::metadata(path) {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_nanos())
                    .unwrap_or(0);
                hasher.update(&mtime.to_le_bytes());
                hasher.update(&meta.len().to_le_bytes());
            }
        }

        // Keep 0 reserved for missing directories
        Self(hasher.digest().max(1))
    }
}

/// One cached project. Clones share the underlying data.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub messages: Arc<Vec<Message>>,
    pub stats: Arc<ProjectStatistics>,
    pub signature: LogSignature,
}

/// Rough heap footprint of an entry, for the per-project byte limit.
pub fn estimate_entry_bytes(messages: &[Message], stats: &ProjectStatistics) -> u64 {
    let messages_bytes: usize = messages
        .iter()
        .map(|m| {
            size_of::<Message>()
                + m.content.len()
                + m.session_id.len()
                + m.timestamp.as_ref().map_or(0, String::len)
                + m.model.as_ref().map_or(0, String::len)
                + m.uuid.as_ref().map_or(0, String::len)
                + m.tools.iter().chain(&m.failed_tools).map(|t| t.len() + 24).sum::<usize>()
        })
        .sum();

    let ui = &stats.user_interactions;
    let sequences_bytes: usize = ui
        .step_sequences
        .iter()
        .map(|s| 64 + s.tools.iter().map(|t| t.len() + 24).sum::<usize>())
        .sum();
    let details_bytes: usize = stats
        .errors
        .assistant_details
        .iter()
        .map(|d| 96 + d.preview.len() + d.session_id.len())
        .sum();
    let map_entries = stats.daily_stats.len() * 4
        + stats.models.len()
        + stats.tools.usage_counts.len() * 3
        + ui.step_length_by_tool.len()
        + ui.step_length_distribution.len()
        + ui.tool_count_distribution.len()
        + ui.model_distribution.len();

    (messages_bytes
        + size_of::<ProjectStatistics>()
        + sequences_bytes
        + details_bytes
        + map_entries * 96) as u64
}

#[cfg(test)]
mod tests;
