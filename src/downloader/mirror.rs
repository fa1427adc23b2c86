/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Mirror list with failure tracking and adaptive ranking.
//!
//! Mirrors are stored once and addressed by [`MirrorId`]; preference order is
//! a separate index vector. Re-sorting therefore never invalidates the mirror
//! referenced by an in-flight attempt.

use std::collections::HashSet;
use std::time::Duration;

/// Stable index of a mirror inside a [`MirrorList`]
pub type MirrorId = usize;

/// Weight of the newest sample in the adaptive rank
const RANK_SMOOTHING: f64 = 0.5;

const MIB: f64 = 1024.0 * 1024.0;

/// Mirror with run-time performance tracking
#[derive(Debug, Clone)]
pub struct Mirror {
    pub url: String,
    /// Position in the source order, used as tie breaker
    position: usize,
    /// Seconds per MiB observed by transfers in this run, lower is better
    rank: Option<f64>,
    /// Latency in seconds from fastest-mirror detection
    probe: Option<f64>,
    consecutive_failures: u32,
    successes: u64,
    failures: u64,
    bytes_downloaded: u64,
    dead: bool,
    in_flight: usize,
}

impl Mirror {
    fn new(url: String, position: usize) -> Self {
        Self {
            url,
            position,
            rank: None,
            probe: None,
            consecutive_failures: 0,
            successes: 0,
            failures: 0,
            bytes_downloaded: 0,
            dead: false,
            in_flight: 0,
        }
    }

    pub fn rank(&self) -> Option<f64> {
        self.rank
    }

    pub fn probe_latency(&self) -> Option<f64> {
        self.probe
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn successes(&self) -> u64 {
        self.successes
    }

    pub fn failures(&self) -> u64 {
        self.failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded
    }

    /// Mirrors proven by a transfer come first, then probe order
    fn sort_key(&self) -> (f64, f64) {
        (
            self.rank.unwrap_or(f64::INFINITY),
            self.probe.unwrap_or(f64::INFINITY),
        )
    }
}

/// Result of looking for a mirror for one target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Selection {
    /// Start an attempt on this mirror
    Assign(MirrorId),
    /// A usable mirror exists but has no free slot
    Busy,
    /// No live mirror is left that the target has not tried
    Exhausted,
}

/// Ordered set of candidate mirrors for one run
#[derive(Debug, Clone)]
pub struct MirrorList {
    mirrors: Vec<Mirror>,
    order: Vec<MirrorId>,
    allowed_failures: Option<u32>,
    adaptive: bool,
}

impl MirrorList {
    /// Build from URLs in preference order; duplicates keep their first position
    pub fn new<I, S>(urls: I, allowed_failures: Option<u32>, adaptive: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let mut mirrors = Vec::new();
        for url in urls {
            let url: String = url.into();
            let key = url.trim_end_matches('/').to_string();
            if key.is_empty() || !seen.insert(key) {
                continue;
            }
            let position = mirrors.len();
            mirrors.push(Mirror::new(url, position));
        }
        let order = (0..mirrors.len()).collect();
        Self {
            mirrors,
            order,
            allowed_failures,
            adaptive,
        }
    }

    pub fn len(&self) -> usize {
        self.mirrors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mirrors.is_empty()
    }

    pub fn get(&self, id: MirrorId) -> &Mirror {
        &self.mirrors[id]
    }

    /// Find a mirror by base URL (trailing slashes ignored)
    pub fn find(&self, url: &str) -> Option<MirrorId> {
        let wanted = url.trim_end_matches('/');
        self.mirrors
            .iter()
            .position(|m| m.url.trim_end_matches('/') == wanted)
    }

    /// Mirrors in current preference order
    pub fn ranked(&self) -> impl Iterator<Item = &Mirror> {
        self.order.iter().map(move |&id| &self.mirrors[id])
    }

    /// URLs in current preference order
    pub fn urls(&self) -> Vec<String> {
        self.ranked().map(|m| m.url.clone()).collect()
    }

    /// Record a failed attempt. Returns true if this failure killed the mirror.
    pub fn report_failure(&mut self, id: MirrorId) -> bool {
        let allowed = self.allowed_failures;
        let mirror = &mut self.mirrors[id];
        mirror.failures += 1;
        mirror.consecutive_failures += 1;
        if mirror.dead {
            return false;
        }
        match allowed {
            Some(limit) if mirror.consecutive_failures >= limit => {
                mirror.dead = true;
                true
            }
            _ => false,
        }
    }

    /// Record a successful attempt of `bytes` taking `elapsed`.
    ///
    /// With adaptive sorting the observed seconds per MiB are folded into the
    /// mirror's rank and the list is re-sorted.
    pub fn report_success(&mut self, id: MirrorId, bytes: u64, elapsed: Duration) {
        let mirror = &mut self.mirrors[id];
        mirror.successes += 1;
        mirror.consecutive_failures = 0;
        mirror.bytes_downloaded += bytes;

        if self.adaptive {
            let mib = (bytes as f64 / MIB).max(1.0 / 1024.0);
            let sample = elapsed.as_secs_f64() / mib;
            mirror.rank = Some(match mirror.rank {
                Some(previous) => previous * (1.0 - RANK_SMOOTHING) + sample * RANK_SMOOTHING,
                None => sample,
            });
            self.resort();
        }
    }

    /// Apply probe latencies in seconds.
    /// Mirrors missing from `ranks` or ranked `None` go last.
    pub fn apply_ranks<'a, I>(&mut self, ranks: I)
    where
        I: IntoIterator<Item = (&'a str, Option<f64>)>,
    {
        for (url, latency) in ranks {
            if let Some(id) = self.find(url) {
                self.mirrors[id].probe = latency;
            }
        }
        self.resort();
    }

    /// Stable sort by transfer rank, then probe latency, then source position
    fn resort(&mut self) {
        let mirrors = &self.mirrors;
        self.order.sort_by(|&a, &b| {
            let (a, b) = (&mirrors[a], &mirrors[b]);
            let (a_rank, a_probe) = a.sort_key();
            let (b_rank, b_probe) = b.sort_key();
            a_rank
                .total_cmp(&b_rank)
                .then(a_probe.total_cmp(&b_probe))
                .then(a.position.cmp(&b.position))
        });
    }

    /// True once every mirror is dead
    pub fn is_exhausted(&self) -> bool {
        self.mirrors.iter().all(|m| m.dead)
    }

    /// Pick the best mirror for a target.
    ///
    /// `forced` bypasses the dead and already-tried filters but still waits for
    /// a free slot.
    pub fn select(
        &self,
        tried: &HashSet<MirrorId>,
        forced: Option<MirrorId>,
        per_mirror_limit: usize,
    ) -> Selection {
        if let Some(id) = forced {
            return if self.mirrors[id].in_flight < per_mirror_limit {
                Selection::Assign(id)
            } else {
                Selection::Busy
            };
        }

        let mut busy = false;
        for &id in &self.order {
            let mirror = &self.mirrors[id];
            if mirror.dead || tried.contains(&id) {
                continue;
            }
            if mirror.in_flight < per_mirror_limit {
                return Selection::Assign(id);
            }
            busy = true;
        }
        if busy {
            Selection::Busy
        } else {
            Selection::Exhausted
        }
    }

    pub(crate) fn acquire(&mut self, id: MirrorId) {
        self.mirrors[id].in_flight += 1;
    }

    pub(crate) fn release(&mut self, id: MirrorId) {
        let mirror = &mut self.mirrors[id];
        mirror.in_flight = mirror.in_flight.saturating_sub(1);
    }
}
