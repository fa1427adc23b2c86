/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Persisted fastest-mirror measurements.

use crate::error::{RepoError, RepoResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// One measurement of a mirror
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Probe latency in seconds, `None` when the probe failed
    pub latency_secs: Option<f64>,
    /// Unix timestamp of the measurement
    pub timestamp: i64,
}

impl CacheEntry {
    pub fn now(latency: Option<Duration>) -> Self {
        Self {
            latency_secs: latency.map(|d| d.as_secs_f64()),
            timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn latency(&self) -> Option<Duration> {
        self.latency_secs.map(Duration::from_secs_f64)
    }
}

/// Mirror URL → last measurement, stored as JSON
#[derive(Debug, Clone, Default)]
pub struct FastestMirrorCache {
    path: Option<PathBuf>,
    entries: HashMap<String, CacheEntry>,
}

impl FastestMirrorCache {
    /// Cache that is never persisted
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load `path`, dropping entries older than `max_age`.
    ///
    /// A missing or unreadable file yields an empty cache.
    pub fn load(path: &Path, max_age: Duration) -> Self {
        let mut entries: HashMap<String, CacheEntry> = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %path.display(), error = %e, "ignoring corrupt fastest mirror cache");
                HashMap::new()
            }),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no fastest mirror cache");
                HashMap::new()
            }
        };

        let max_age = i64::try_from(max_age.as_secs()).unwrap_or(i64::MAX);
        let cutoff = chrono::Utc::now().timestamp().saturating_sub(max_age);
        let before = entries.len();
        entries.retain(|_, entry| entry.timestamp >= cutoff);
        if entries.len() < before {
            debug!(dropped = before - entries.len(), "dropped stale cache entries");
        }

        Self {
            path: Some(path.to_path_buf()),
            entries,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, url: &str) -> Option<&CacheEntry> {
        self.entries.get(url)
    }

    pub fn insert(&mut self, url: impl Into<String>, entry: CacheEntry) {
        self.entries.insert(url.into(), entry);
    }

    /// Write the cache back to its file, if it has one
    pub fn save(&self) -> RepoResult<()> {
        let path = match &self.path {
            Some(path) => path,
            None => return Ok(()),
        };

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| RepoError::CannotCreateDir {
                path: parent.display().to_string(),
                message: e.to_string(),
            })?;
        }

        let content = serde_json::to_string_pretty(&self.entries).map_err(|e| RepoError::Io {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;

        let tmp = path.with_extension("tmp");
        fs::write(&tmp, content).map_err(|e| RepoError::io(&tmp, e))?;
        fs::rename(&tmp, path).map_err(|e| RepoError::io(path, e))?;
        debug!(path = %path.display(), entries = self.entries.len(), "saved fastest mirror cache");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_missing_file_is_empty() {
        let dir = tempdir().unwrap();
        let cache = FastestMirrorCache::load(&dir.path().join("none.json"), Duration::from_secs(60));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("fastestmirror.json");

        let mut cache = FastestMirrorCache::load(&path, Duration::from_secs(3600));
        cache.insert("http://a", CacheEntry::now(Some(Duration::from_millis(250))));
        cache.insert("http://b", CacheEntry::now(None));
        cache.save().unwrap();

        let loaded = FastestMirrorCache::load(&path, Duration::from_secs(3600));
        assert_eq!(loaded.len(), 2);
        assert_eq!(
            loaded.get("http://a").and_then(|e| e.latency()),
            Some(Duration::from_millis(250))
        );
        assert_eq!(loaded.get("http://b").and_then(|e| e.latency()), None);
    }

    #[test]
    fn test_stale_entries_dropped() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fastestmirror.json");

        let mut cache = FastestMirrorCache::load(&path, Duration::from_secs(3600));
        cache.insert(
            "http://old",
            CacheEntry {
                latency_secs: Some(0.1),
                timestamp: chrono::Utc::now().timestamp() - 7200,
            },
        );
        cache.insert("http://new", CacheEntry::now(Some(Duration::from_millis(100))));
        cache.save().unwrap();

        let loaded = FastestMirrorCache::load(&path, Duration::from_secs(3600));
        assert!(loaded.get("http://old").is_none());
        assert!(loaded.get("http://new").is_some());
    }

    #[test]
    fn test_huge_max_age_keeps_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fastestmirror.json");

        let mut cache = FastestMirrorCache::load(&path, Duration::MAX);
        cache.insert(
            "http://ancient",
            CacheEntry {
                latency_secs: Some(0.1),
                timestamp: 0,
            },
        );
        cache.save().unwrap();

        let loaded = FastestMirrorCache::load(&path, Duration::MAX);
        assert!(loaded.get("http://ancient").is_some());
    }

    #[test]
    fn test_corrupt_file_is_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("fastestmirror.json");
        fs::write(&path, "{not json").unwrap();
        assert!(FastestMirrorCache::load(&path, Duration::from_secs(60)).is_empty());
    }

    #[test]
    fn test_in_memory_save_is_noop() {
        let mut cache = FastestMirrorCache::in_memory();
        cache.insert("http://a", CacheEntry::now(None));
        cache.save().unwrap();
        assert!(cache.path().is_none());
    }
}
