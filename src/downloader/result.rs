/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Outcome of a download run.

use super::mirror::MirrorList;
use super::target::TargetOutcome;
use crate::error::RepoError;
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;
use std::time::Duration;

/// Terminal state of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Every target is done, or failed but optional
    Complete,
    /// A required target could not be downloaded
    Failed,
    /// Stopped by the caller, a signal or a callback
    Aborted,
}

/// Repository data derived from downloaded files
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoMetadata {
    /// Newest `<timestamp>` of the downloaded repomd.xml
    pub timestamp: Option<i64>,
    /// Timestamp announced by the metalink for repomd.xml
    pub metalink_timestamp: Option<i64>,
}

impl RepoMetadata {
    /// Time since the repository metadata was generated
    pub fn age(&self) -> Option<Duration> {
        let timestamp = self.timestamp.or(self.metalink_timestamp)?;
        let age = chrono::Utc::now().timestamp() - timestamp;
        Some(Duration::from_secs(age.max(0) as u64))
    }
}

/// Extracts derived data from a completed repository index
pub trait MetadataExtractor: Send + Sync {
    fn repomd_timestamp(&self, path: &Path) -> Option<i64>;
}

/// Scans repomd.xml for its `<timestamp>` elements and keeps the newest
#[derive(Debug, Clone, Copy, Default)]
pub struct RepomdTimestamp;

impl MetadataExtractor for RepomdTimestamp {
    fn repomd_timestamp(&self, path: &Path) -> Option<i64> {
        static TIMESTAMP: OnceLock<Regex> = OnceLock::new();
        let re = TIMESTAMP.get_or_init(|| {
            Regex::new(r"<timestamp>\s*(\d+)(?:\.\d+)?\s*</timestamp>").expect("valid regex")
        });
        let content = std::fs::read_to_string(path).ok()?;
        re.captures_iter(&content)
            .filter_map(|c| c[1].parse::<i64>().ok())
            .max()
    }
}

/// Everything a run produced
#[derive(Debug, Clone)]
pub struct DownloadResult {
    pub status: RunStatus,
    /// One outcome per submitted target, in submission order
    pub targets: Vec<TargetOutcome>,
    /// Mirror list as it stood at the end of the run
    pub mirrors: MirrorList,
    pub metadata: RepoMetadata,
    /// Run-level error for `Failed` and `Aborted`
    pub error: Option<RepoError>,
}

impl DownloadResult {
    pub fn is_success(&self) -> bool {
        self.status == RunStatus::Complete
    }

    /// Targets that did not complete, with their specific error
    pub fn errors(&self) -> impl Iterator<Item = (&str, &RepoError)> {
        self.targets
            .iter()
            .filter(|t| !t.is_done())
            .filter_map(|t| t.error.as_ref().map(|e| (t.path.as_str(), e)))
    }

    pub fn get(&self, path: &str) -> Option<&TargetOutcome> {
        self.targets.iter().find(|t| t.path == path)
    }

    pub fn downloaded_bytes(&self) -> u64 {
        self.targets.iter().map(|t| t.bytes).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    const REPOMD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<repomd xmlns="http://linux.duke.edu/metadata/repo">
  <revision>1700000300</revision>
  <data type="primary">
    <location href="repodata/primary.xml.gz"/>
    <timestamp>1700000100</timestamp>
  </data>
  <data type="filelists">
    <location href="repodata/filelists.xml.gz"/>
    <timestamp>1700000200.5</timestamp>
  </data>
</repomd>
"#;

    #[test]
    fn test_repomd_timestamp_is_newest() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("repomd.xml");
        std::fs::write(&path, REPOMD).unwrap();
        assert_eq!(RepomdTimestamp.repomd_timestamp(&path), Some(1_700_000_200));
        assert_eq!(RepomdTimestamp.repomd_timestamp(&dir.path().join("none")), None);
    }

    #[test]
    fn test_age() {
        let metadata = RepoMetadata {
            timestamp: Some(chrono::Utc::now().timestamp() - 120),
            metalink_timestamp: None,
        };
        let age = metadata.age().unwrap();
        assert!(age >= Duration::from_secs(120) && age < Duration::from_secs(130));
        assert_eq!(RepoMetadata::default().age(), None);
    }
}
