//! Bake-cache directory management
//!
//! The cache directory holds one `.ml` file per baked mission. A sweep
//! runs after every bake, successful or not:
//!
//! 1. Any file whose leading version tag cannot be read or does not match
//!    the current format is deleted unconditionally.
//! 2. When a quota is configured and the directory exceeds it, files are
//!    removed one at a time under the configured policy until the total
//!    size is back under the quota.
//!
//! The file belonging to the in-progress bake is exempt from removal, but
//! its size still counts toward the directory total.
//!
//! Author: Moroya Sakamoto

use crate::persist::{self, FILE_EXTENSION, FILE_VERSION};
use log::{info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use thiserror::Error;

/// Cache sweep errors. Per-file failures are logged and skipped; only the
/// directory enumeration itself can fail the sweep.
#[derive(Error, Debug)]
pub enum CacheError {
    /// I/O error listing the cache directory.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which files go first when the cache exceeds its quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvictionPolicy {
    /// Remove the largest files first.
    MinSize,
    /// Remove the smallest files first.
    MaxSize,
    /// Remove the most recently created files first.
    LastCreated,
    /// Remove the most recently modified files first.
    #[default]
    LastModified,
}

/// Cache directory configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Directory holding `.ml` files.
    pub directory: PathBuf,
    /// Quota in kilobytes; `-1` means unlimited.
    pub quota_kb: i64,
    /// Eviction policy applied when over quota.
    pub policy: EvictionPolicy,
}

impl CacheConfig {
    /// Unlimited cache in `directory` with the default policy.
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        CacheConfig {
            directory: directory.into(),
            quota_kb: -1,
            policy: EvictionPolicy::default(),
        }
    }
}

struct CacheEntry {
    path: PathBuf,
    size: u64,
    created: SystemTime,
    modified: SystemTime,
}

/// Sweep the cache directory: purge stale versions, then enforce the
/// quota. Returns the number of files removed.
pub fn sweep(config: &CacheConfig, exempt: Option<&Path>) -> Result<usize, CacheError> {
    if !config.directory.is_dir() {
        return Ok(0);
    }

    let mut removed = 0;
    let mut entries: Vec<CacheEntry> = Vec::new();
    for dir_entry in fs::read_dir(&config.directory)? {
        let Ok(dir_entry) = dir_entry else { continue };
        let path = dir_entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some(FILE_EXTENSION) {
            continue;
        }

        // Stale or unreadable versions go regardless of quota.
        let valid = matches!(persist::read_version(&path), Ok(v) if v == FILE_VERSION);
        if !valid {
            warn!("removing stale cache file {}", path.display());
            if remove(&path) {
                removed += 1;
            }
            continue;
        }

        let Ok(meta) = dir_entry.metadata() else { continue };
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        entries.push(CacheEntry {
            path,
            size: meta.len(),
            created: meta.created().unwrap_or(modified),
            modified,
        });
    }

    if config.quota_kb < 0 {
        return Ok(removed);
    }
    let quota_bytes = config.quota_kb as u64 * 1024;
    let mut total: u64 = entries.iter().map(|e| e.size).sum();
    if total <= quota_bytes {
        return Ok(removed);
    }

    // Victim-first ordering per policy.
    match config.policy {
        EvictionPolicy::MinSize => entries.sort_by(|a, b| b.size.cmp(&a.size)),
        EvictionPolicy::MaxSize => entries.sort_by(|a, b| a.size.cmp(&b.size)),
        EvictionPolicy::LastCreated => entries.sort_by(|a, b| b.created.cmp(&a.created)),
        EvictionPolicy::LastModified => entries.sort_by(|a, b| b.modified.cmp(&a.modified)),
    }

    for entry in &entries {
        if total <= quota_bytes {
            break;
        }
        if is_exempt(&entry.path, exempt) {
            continue;
        }
        info!(
            "cache over quota, evicting {} ({} bytes)",
            entry.path.display(),
            entry.size
        );
        if remove(&entry.path) {
            removed += 1;
            total = total.saturating_sub(entry.size);
        }
    }
    Ok(removed)
}

fn is_exempt(path: &Path, exempt: Option<&Path>) -> bool {
    match exempt {
        Some(exempt) => path == exempt || path.file_name() == exempt.file_name(),
        None => false,
    }
}

fn remove(path: &Path) -> bool {
    match fs::remove_file(path) {
        Ok(()) => true,
        Err(e) => {
            warn!("failed to remove cache file {}: {e}", path.display());
            false
        }
    }
}
