/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Global and per-mirror slot accounting for a download run.
//!
//! Owned by the scheduling loop, which is the only writer; no atomics needed.

use super::mirror::{MirrorId, MirrorList};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Scheduler {
    /// Attempts currently running
    active: usize,
    max_parallel: usize,
    max_per_mirror: usize,
    /// Highest `active` seen during the run
    peak: usize,
    total_bytes: u64,
    start_time: Instant,
}

impl Scheduler {
    pub fn new(max_parallel: usize, max_per_mirror: usize) -> Self {
        Self {
            active: 0,
            max_parallel: max_parallel.max(1),
            max_per_mirror: max_per_mirror.max(1),
            peak: 0,
            total_bytes: 0,
            start_time: Instant::now(),
        }
    }

    /// Whether a new attempt fits under the global limit
    pub fn has_slot(&self) -> bool {
        self.active < self.max_parallel
    }

    pub fn per_mirror_limit(&self) -> usize {
        self.max_per_mirror
    }

    /// Take a global slot and a slot on `mirror`
    pub fn try_acquire(&mut self, mirrors: &mut MirrorList, mirror: MirrorId) -> bool {
        if !self.has_slot() || mirrors.get(mirror).in_flight() >= self.max_per_mirror {
            return false;
        }
        self.active += 1;
        self.peak = self.peak.max(self.active);
        mirrors.acquire(mirror);
        true
    }

    /// Release the slots taken by [`try_acquire`](Self::try_acquire)
    pub fn release(&mut self, mirrors: &mut MirrorList, mirror: MirrorId) {
        self.active = self.active.saturating_sub(1);
        mirrors.release(mirror);
    }

    pub fn record_bytes(&mut self, bytes: u64) {
        self.total_bytes += bytes;
    }

    /// Bytes per second since the run started
    pub fn throughput(&self) -> u64 {
        let elapsed = self.start_time.elapsed().as_millis() as u64;
        if elapsed == 0 {
            return 0;
        }
        (self.total_bytes * 1000) / elapsed
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_limit() {
        let mut mirrors = MirrorList::new(["http://a", "http://b"], None, false);
        let mut scheduler = Scheduler::new(2, 5);
        assert!(scheduler.try_acquire(&mut mirrors, 0));
        assert!(scheduler.try_acquire(&mut mirrors, 1));
        assert!(!scheduler.has_slot());
        assert!(!scheduler.try_acquire(&mut mirrors, 0));
        assert_eq!(scheduler.active(), 2);

        scheduler.release(&mut mirrors, 0);
        assert!(scheduler.has_slot());
        assert_eq!(mirrors.get(0).in_flight(), 0);
        assert_eq!(scheduler.peak(), 2);
    }

    #[test]
    fn test_per_mirror_limit() {
        let mut mirrors = MirrorList::new(["http://a"], None, false);
        let mut scheduler = Scheduler::new(10, 1);
        assert!(scheduler.try_acquire(&mut mirrors, 0));
        assert!(!scheduler.try_acquire(&mut mirrors, 0));
        assert_eq!(scheduler.active(), 1);
    }

    #[test]
    fn test_bytes_accounting() {
        let mut scheduler = Scheduler::new(1, 1);
        scheduler.record_bytes(2048);
        scheduler.record_bytes(1024);
        assert_eq!(scheduler.total_bytes(), 3072);
    }
}
