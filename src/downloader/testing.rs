/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! In-memory transport for engine tests.

use crate::error::{RepoError, RepoResult};
use crate::transport::{Progress, TransferRequest, Transport};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

/// What a mirror does with a fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Serve,
    /// Connection error
    Fail,
    /// Serves bytes that match no checksum
    Corrupt,
    /// Reports one progress event, then never finishes
    Hang,
}

/// Content served for a file name
pub fn body_for(path: &str) -> Vec<u8> {
    let name = path.rsplit('/').next().unwrap_or(path);
    format!("payload of {}\n", name).into_bytes()
}

pub fn sha256_of(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

#[derive(Default)]
struct Gauges {
    active: usize,
    peak: usize,
    per_mirror: HashMap<String, (usize, usize)>,
}

#[derive(Default)]
pub struct ScriptedTransport {
    behaviors: Vec<(String, Behavior)>,
    files: HashMap<String, Vec<u8>>,
    probes: HashMap<String, Option<Duration>>,
    delay: Duration,
    gauges: Mutex<Gauges>,
    calls: Mutex<Vec<String>>,
    offsets: Mutex<Vec<u64>>,
    probed: Mutex<Vec<String>>,
    cancelled: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mirror(mut self, base: &str, behavior: Behavior) -> Self {
        self.behaviors
            .push((format!("{}/", base.trim_end_matches('/')), behavior));
        self
    }

    /// Serve `content` for a full URL or a file name
    pub fn file(mut self, key: &str, content: impl Into<Vec<u8>>) -> Self {
        self.files.insert(key.to_string(), content.into());
        self
    }

    /// Sleep this long inside every fetch
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn probe_latency(mut self, url: &str, latency: Duration) -> Self {
        self.probes.insert(url.to_string(), Some(latency));
        self
    }

    pub fn probe_failure(mut self, url: &str) -> Self {
        self.probes.insert(url.to_string(), None);
        self
    }

    /// Highest number of concurrent fetches
    pub fn peak(&self) -> usize {
        self.gauges.lock().unwrap().peak
    }

    /// Highest number of concurrent fetches against one mirror
    pub fn peak_for(&self, base: &str) -> usize {
        let key = format!("{}/", base.trim_end_matches('/'));
        self.gauges
            .lock()
            .unwrap()
            .per_mirror
            .get(&key)
            .map(|(_, peak)| *peak)
            .unwrap_or(0)
    }

    /// Requested URLs in call order
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, base: &str) -> usize {
        let key = format!("{}/", base.trim_end_matches('/'));
        self.calls().iter().filter(|u| u.starts_with(&key)).count()
    }

    /// Resume offsets of the fetches, in call order
    pub fn resumed_from(&self) -> Vec<u64> {
        self.offsets.lock().unwrap().clone()
    }

    pub fn probed(&self) -> Vec<String> {
        self.probed.lock().unwrap().clone()
    }

    /// Fetches dropped before they finished
    pub fn cancelled(&self) -> usize {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn behavior(&self, url: &str) -> (String, Behavior) {
        self.behaviors
            .iter()
            .find(|(base, _)| url.starts_with(base.as_str()))
            .cloned()
            .unwrap_or_else(|| {
                let base = url.rsplit_once('/').map(|(b, _)| b).unwrap_or(url);
                (format!("{}/", base), Behavior::Serve)
            })
    }

    fn content(&self, url: &str) -> Vec<u8> {
        if let Some(content) = self.files.get(url) {
            return content.clone();
        }
        let name = url.rsplit('/').next().unwrap_or(url);
        self.files.get(name).cloned().unwrap_or_else(|| body_for(name))
    }

    fn enter(&self, mirror: &str) -> InFlight<'_> {
        let mut gauges = self.gauges.lock().unwrap();
        gauges.active += 1;
        gauges.peak = gauges.peak.max(gauges.active);
        let entry = gauges.per_mirror.entry(mirror.to_string()).or_default();
        entry.0 += 1;
        entry.1 = entry.1.max(entry.0);
        InFlight {
            transport: self,
            mirror: mirror.to_string(),
            finished: false,
        }
    }
}

struct InFlight<'a> {
    transport: &'a ScriptedTransport,
    mirror: String,
    finished: bool,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let mut gauges = self.transport.gauges.lock().unwrap();
        gauges.active -= 1;
        if let Some(entry) = gauges.per_mirror.get_mut(&self.mirror) {
            entry.0 -= 1;
        }
        if !self.finished {
            self.transport.cancelled.fetch_add(1, Ordering::SeqCst);
        }
    }
}

async fn write_file(path: &std::path::Path, data: &[u8], append: bool) -> RepoResult<()> {
    let mut file = if append {
        tokio::fs::OpenOptions::new().append(true).open(path).await
    } else {
        tokio::fs::File::create(path).await
    }
    .map_err(|e| RepoError::io(path, e))?;
    file.write_all(data).await.map_err(|e| RepoError::io(path, e))?;
    file.flush().await.map_err(|e| RepoError::io(path, e))
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn fetch(&self, request: &TransferRequest, progress: &Progress) -> RepoResult<u64> {
        let (mirror, behavior) = self.behavior(&request.url);
        self.calls.lock().unwrap().push(request.url.clone());
        self.offsets.lock().unwrap().push(request.resume_from);
        let mut guard = self.enter(&mirror);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let body = self.content(&request.url);
        let total = body.len() as u64;
        let result = match behavior {
            Behavior::Serve => {
                let offset = (request.resume_from as usize).min(body.len());
                progress.report(request.resume_from, total);
                write_file(&request.destination, &body[offset..], offset > 0)
                    .await
                    .map(|()| {
                        progress.report(total, total);
                        (body.len() - offset) as u64
                    })
            }
            Behavior::Fail => Err(RepoError::transport(&request.url, "connection refused")),
            Behavior::Corrupt => {
                let data = b"corrupted payload";
                let len = data.len() as u64;
                progress.report(0, len);
                write_file(&request.destination, data, false).await.map(|()| {
                    progress.report(len, len);
                    len
                })
            }
            Behavior::Hang => {
                progress.report(0, total);
                std::future::pending::<RepoResult<u64>>().await
            }
        };
        guard.finished = true;
        result
    }

    async fn probe(&self, url: &str, _limit: Duration) -> RepoResult<Duration> {
        self.probed.lock().unwrap().push(url.to_string());
        match self.probes.get(url) {
            Some(Some(latency)) => {
                tokio::time::sleep(*latency).await;
                Ok(*latency)
            }
            Some(None) => Err(RepoError::transport(url, "probe refused")),
            None => Ok(Duration::from_millis(1)),
        }
    }
}
