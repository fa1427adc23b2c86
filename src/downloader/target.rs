/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Download targets and their per-run state.

use super::mirror::MirrorId;
use crate::error::RepoError;
use crate::verify::Checksum;
use std::collections::HashSet;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// A logical file to fetch, relative to every mirror's base URL
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadTarget {
    /// Path relative to the mirror base, e.g. `repodata/repomd.xml`
    pub path: String,
    /// Defaults to the file name of `path` inside the handle's destdir
    pub destination: Option<PathBuf>,
    pub checksums: Vec<Checksum>,
    pub expected_size: Option<u64>,
    /// Continue a previous partial download
    pub resume: bool,
    /// Failure does not fail the run
    pub optional: bool,
    /// Run the handle's signature check on this file
    pub check_signature: bool,
}

impl DownloadTarget {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            destination: None,
            checksums: Vec::new(),
            expected_size: None,
            resume: false,
            optional: false,
            check_signature: false,
        }
    }

    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    pub fn with_checksum(mut self, checksum: Checksum) -> Self {
        self.checksums.push(checksum);
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.expected_size = Some(size);
        self
    }

    pub fn resumable(mut self) -> Self {
        self.resume = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn signed(mut self) -> Self {
        self.check_signature = true;
        self
    }

    /// Where the finished file lands
    pub fn destination_in(&self, destdir: &Path) -> PathBuf {
        match &self.destination {
            Some(path) => path.clone(),
            None => {
                let name = self.path.rsplit('/').next().unwrap_or(&self.path);
                destdir.join(name)
            }
        }
    }

    /// Full URL of this target on a mirror
    pub fn url_on(&self, base: &str) -> String {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }

    /// Whether `name` selects this target in a download or skip list.
    ///
    /// Matches the full path, the file name, the file name without
    /// extensions, or the record type of a `<checksum>-<type>.<ext>` file.
    pub fn matches(&self, name: &str) -> bool {
        let path = self.path.split('?').next().unwrap_or(&self.path);
        let file = path.rsplit('/').next().unwrap_or(path);
        let stem = file.split('.').next().unwrap_or(file);
        path == name
            || file == name
            || stem == name
            || stem.rsplit_once('-').map(|(_, kind)| kind) == Some(name)
    }
}

/// Temporary file an attempt writes to before promotion
pub(crate) fn part_path(destination: &Path) -> PathBuf {
    let mut name = OsString::from(destination.as_os_str());
    name.push(".part");
    PathBuf::from(name)
}

/// Scheduling state of a target within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetStatus {
    Pending,
    InFlight,
    Done,
    Failed,
}

/// Terminal transfer status reported to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStatus {
    Successful,
    /// A verified copy was already present; nothing was transferred
    AlreadyExists,
    Error,
}

/// One failed attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    pub mirror: String,
    pub error: RepoError,
}

/// Final outcome of one target
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetOutcome {
    pub path: String,
    pub destination: PathBuf,
    pub status: TransferStatus,
    /// Mirror that served the file
    pub mirror: Option<String>,
    pub attempts: u32,
    pub bytes: u64,
    pub optional: bool,
    pub error: Option<RepoError>,
    /// Failed attempts, oldest first
    pub history: Vec<AttemptRecord>,
}

impl TargetOutcome {
    pub fn is_done(&self) -> bool {
        matches!(
            self.status,
            TransferStatus::Successful | TransferStatus::AlreadyExists
        )
    }

    /// Error of the most recent failed attempt
    pub fn reason(&self) -> Option<&RepoError> {
        self.history.last().map(|r| &r.error).or(self.error.as_ref())
    }
}

/// Mutable bookkeeping owned by the scheduling loop
#[derive(Debug)]
pub(crate) struct TargetState {
    pub spec: DownloadTarget,
    pub destination: PathBuf,
    pub status: TargetStatus,
    pub attempts: u32,
    pub tried: HashSet<MirrorId>,
    /// Mirror imposed by the mirror failure callback for the next attempt
    pub forced: Option<MirrorId>,
    /// Mirrors the failure callback already forced for this target
    pub forced_retries: HashSet<MirrorId>,
    pub served_by: Option<MirrorId>,
    pub already_present: bool,
    pub bytes: u64,
    pub history: Vec<(MirrorId, RepoError)>,
    pub error: Option<RepoError>,
}

impl TargetState {
    pub fn new(spec: DownloadTarget, destdir: &Path, ignore_missing: bool) -> Self {
        let destination = spec.destination_in(destdir);
        let mut spec = spec;
        spec.optional |= ignore_missing;
        Self {
            spec,
            destination,
            status: TargetStatus::Pending,
            attempts: 0,
            tried: HashSet::new(),
            forced: None,
            forced_retries: HashSet::new(),
            served_by: None,
            already_present: false,
            bytes: 0,
            history: Vec::new(),
            error: None,
        }
    }

    pub fn last_error(&self) -> Option<&RepoError> {
        self.history.last().map(|(_, e)| e)
    }
}
