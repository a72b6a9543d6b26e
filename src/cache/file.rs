use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use super::LogSignature;
use crate::telemetry::SharedTelemetry;
use crate::types::{Message, ProjectStatistics};
use crate::utils::fast_hash;

const COMPONENT: &str = "file_cache";
const FORMAT_VERSION: u32 = 1;
const STATS_FILE: &str = "stats.bin";
const MESSAGES_FILE: &str = "messages.bin";

static TMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// On-disk wrapper around every cached payload.
#[derive(Serialize, Deserialize)]
struct Envelope<T> {
    format_version: u32,
    log_path: String,
    signature: LogSignature,
    payload: T,
}

/// `~/.session-stats/cache`
pub fn default_cache_root() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".session-stats").join("cache"))
}

/// Persistent cache, one directory per project named after the hash of its
/// log path.
pub struct FileCache {
    root: PathBuf,
    telemetry: SharedTelemetry,
}

impl FileCache {
    pub fn new(root: impl Into<PathBuf>, telemetry: SharedTelemetry) -> Self {
        Self {
            root: root.into(),
            telemetry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_dir(&self, log_path: &Path) -> PathBuf {
        self.root.join(fast_hash(&log_path.to_string_lossy()))
    }

    pub fn get_cached_stats(&self, log_path: &Path) -> Option<ProjectStatistics> {
        self.read(log_path, STATS_FILE)
    }

    pub fn save_cached_stats(&self, log_path: &Path, stats: &ProjectStatistics) -> Result<()> {
        self.save_cached_stats_with_signature(log_path, stats, LogSignature::compute(log_path))
    }

    pub fn save_cached_stats_with_signature(
        &self,
        log_path: &Path,
        stats: &ProjectStatistics,
        signature: LogSignature,
    ) -> Result<()> {
        self.write(log_path, STATS_FILE, signature, stats)
    }

    pub fn get_cached_messages(&self, log_path: &Path) -> Option<Vec<Message>> {
        self.read(log_path, MESSAGES_FILE)
    }

    pub fn save_cached_messages(&self, log_path: &Path, messages: &[Message]) -> Result<()> {
        self.save_cached_messages_with_signature(
            log_path,
            messages,
            LogSignature::compute(log_path),
        )
    }

    pub fn save_cached_messages_with_signature(
        &self,
        log_path: &Path,
        messages: &[Message],
        signature: LogSignature,
    ) -> Result<()> {
        self.write(log_path, MESSAGES_FILE, signature, messages)
    }

    /// Drops both payloads for one project.
    pub fn invalidate(&self, log_path: &Path) -> Result<()> {
        let dir = self.entry_dir(log_path);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to remove cache entry {}", dir.display()))
            }
        }
    }

    pub fn clear(&self) -> Result<()> {
        match fs::remove_dir_all(&self.root) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e)
                .with_context(|| format!("Failed to clear cache at {}", self.root.display())),
        }
    }

    /// Total bytes of all cache files.
    pub fn disk_usage(&self) -> u64 {
        WalkDir::new(&self.root)
            .into_iter()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_type().is_file())
            .filter_map(|entry| entry.metadata().ok())
            .map(|meta| meta.len())
            .sum()
    }

    fn read<T: DeserializeOwned>(&self, log_path: &Path, file_name: &str) -> Option<T> {
        let path = self.entry_dir(log_path).join(file_name);
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return None,
            Err(e) => {
                self.telemetry.warn(
                    COMPONENT,
                    &format!("Failed to read {}: {e}", path.display()),
                );
                return None;
            }
        };

        let envelope: Envelope<T> =
            match bincode::serde::decode_from_slice(&bytes, bincode::config::standard()) {
                Ok((envelope, _)) => envelope,
                Err(e) => {
                    self.telemetry.warn(
                        COMPONENT,
                        &format!("Ignoring corrupt cache file {}: {e}", path.display()),
                    );
                    return None;
                }
            };

        let expected_path = log_path.to_string_lossy();
        if envelope.format_version != FORMAT_VERSION || envelope.log_path != expected_path {
            self.telemetry.debug(
                COMPONENT,
                &format!("Cache file {} belongs to another layout or path", path.display()),
            );
            return None;
        }

        if envelope.signature != LogSignature::compute(log_path) {
            self.telemetry.debug(
                COMPONENT,
                &format!("Stale cache for {}", log_path.display()),
            );
            return None;
        }

        Some(envelope.payload)
    }

    fn write<T: Serialize + ?Sized>(
        &self,
        log_path: &Path,
        file_name: &str,
        signature: LogSignature,
        payload: &T,
    ) -> Result<()> {
        let dir = self.entry_dir(log_path);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create cache directory {}", dir.display()))?;

        let envelope = Envelope {
            format_version: FORMAT_VERSION,
            log_path: log_path.to_string_lossy().into_owned(),
            signature,
            payload,
        };
        let bytes = bincode::serde::encode_to_vec(&envelope, bincode::config::standard())
            .context("Failed to encode cache entry")?;

        // Write then rename so readers never see a partial file
        let target = dir.join(file_name);
        let tmp = dir.join(format!(
            "{file_name}.tmp-{}-{}",
            std::process::id(),
            TMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        fs::write(&tmp, &bytes)
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &target)
            .with_context(|| format!("Failed to move cache file into {}", target.display()))?;

        Ok(())
    }
}
