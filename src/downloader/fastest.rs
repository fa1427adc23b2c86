/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Fastest-mirror detection.
//!
//! Latencies come from the persisted cache when fresh enough, otherwise from a
//! concurrent HEAD probe of every remaining mirror. Mirrors whose probe fails
//! or times out are ranked last. Cancelling the run token or an abort from the
//! fastest-mirror callback stops detection.

use super::cache::{CacheEntry, FastestMirrorCache};
use super::mirror::MirrorList;
use crate::callbacks::{CallbackStatus, Callbacks, FastestMirrorData, FastestMirrorStage};
use crate::error::{RepoError, RepoResult};
use crate::handle::FastestMirrorOptions;
use crate::transport::Transport;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Probes running at the same time
const PROBE_CONCURRENCY: usize = 16;

/// Measured latency of one mirror
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeReport {
    pub url: String,
    /// `None` when the mirror did not answer in time
    pub latency: Option<Duration>,
    pub from_cache: bool,
}

fn notify(callbacks: &Callbacks, stage: FastestMirrorStage, data: &FastestMirrorData) -> RepoResult<()> {
    match callbacks.fastest_mirror(stage, data) {
        CallbackStatus::Ok => Ok(()),
        CallbackStatus::Abort => Err(RepoError::CallbackInterrupted {
            reason: "fastest mirror callback requested abort".to_string(),
        }),
        CallbackStatus::Error => Err(RepoError::CallbackInterrupted {
            reason: "fastest mirror callback failed".to_string(),
        }),
    }
}

/// Rank `mirrors` by latency and return the measurements in the new order.
///
/// Fails with [`RepoError::Interrupted`] once `token` is cancelled and with
/// [`RepoError::CallbackInterrupted`] when the callback stops detection.
pub async fn rank_mirrors(
    transport: &dyn Transport,
    options: &FastestMirrorOptions,
    callbacks: &Callbacks,
    mirrors: &mut MirrorList,
    token: &CancellationToken,
) -> RepoResult<Vec<ProbeReport>> {
    if token.is_cancelled() {
        return Err(RepoError::Interrupted);
    }
    notify(callbacks, FastestMirrorStage::Init, &FastestMirrorData::None)?;

    let mut cache = match &options.cache_path {
        Some(path) => {
            notify(
                callbacks,
                FastestMirrorStage::CacheLoading,
                &FastestMirrorData::CachePath(path.clone()),
            )?;
            let cache = FastestMirrorCache::load(path, options.max_age);
            notify(
                callbacks,
                FastestMirrorStage::CacheLoadingStatus,
                &FastestMirrorData::Status(None),
            )?;
            cache
        }
        None => FastestMirrorCache::in_memory(),
    };

    let mut measured: HashMap<String, (Option<Duration>, bool)> = HashMap::new();
    let mut pending = Vec::new();
    for url in mirrors.urls() {
        match cache.get(&url) {
            Some(entry) => {
                measured.insert(url, (entry.latency(), true));
            }
            None => pending.push(url),
        }
    }

    notify(
        callbacks,
        FastestMirrorStage::Detection,
        &FastestMirrorData::MirrorCount(pending.len()),
    )?;
    debug!(cached = measured.len(), probing = pending.len(), "detecting fastest mirror");

    let limit = options.timeout;
    let probing = stream::iter(pending)
        .map(|url| async move {
            let latency = match timeout(limit, transport.probe(&url, limit)).await {
                Ok(Ok(latency)) => Some(latency),
                Ok(Err(e)) => {
                    debug!(mirror = %url, error = %e, "probe failed");
                    None
                }
                Err(_) => {
                    debug!(mirror = %url, "probe timed out");
                    None
                }
            };
            (url, latency)
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect::<Vec<(String, Option<Duration>)>>();
    let probed = tokio::select! {
        _ = token.cancelled() => {
            debug!("mirror detection interrupted");
            return Err(RepoError::Interrupted);
        }
        probed = probing => probed,
    };

    notify(callbacks, FastestMirrorStage::Finishing, &FastestMirrorData::None)?;

    for (url, latency) in probed {
        cache.insert(url.clone(), CacheEntry::now(latency));
        measured.insert(url, (latency, false));
    }

    let status = match cache.save() {
        Ok(()) => None,
        Err(e) => {
            warn!(error = %e, "could not save fastest mirror cache");
            Some(e.to_string())
        }
    };

    mirrors.apply_ranks(
        measured
            .iter()
            .map(|(url, (latency, _))| (url.as_str(), latency.map(|d| d.as_secs_f64()))),
    );

    let reports: Vec<ProbeReport> = mirrors
        .urls()
        .into_iter()
        .map(|url| {
            let (latency, from_cache) = measured.get(&url).copied().unwrap_or((None, false));
            ProbeReport {
                url,
                latency,
                from_cache,
            }
        })
        .collect();

    if let Some(best) = reports.first() {
        info!(mirror = %best.url, latency = ?best.latency, "fastest mirror");
    }
    notify(callbacks, FastestMirrorStage::Status, &FastestMirrorData::Status(status))?;
    Ok(reports)
}
