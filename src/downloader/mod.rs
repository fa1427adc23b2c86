/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Mirror-aware download engine with bounded parallelism, per-target
//! failover, fastest-mirror ranking and integrity checks.

mod engine;
mod fastest;
mod mirror;
mod result;
mod scheduler;
mod target;
mod transfer;
pub mod cache;
pub mod sources;

#[cfg(test)]
pub(crate) mod testing;

pub use engine::{DownloadEngine, MirrorSet};
pub use fastest::{rank_mirrors, ProbeReport};
pub use mirror::{Mirror, MirrorId, MirrorList, Selection};
pub use result::{DownloadResult, MetadataExtractor, RepoMetadata, RepomdTimestamp, RunStatus};
pub use scheduler::Scheduler;
pub use target::{AttemptRecord, DownloadTarget, TargetOutcome, TransferStatus};
