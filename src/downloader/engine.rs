/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Download orchestrator.
//!
//! A run is driven by a single control loop that owns the mirror list, the
//! target states and the capacity counters. Attempts execute as tasks in a
//! [`JoinSet`] and report back through one unbounded channel, so scheduling
//! state needs no locking. Callbacks are invoked from the loop itself.

use super::fastest::{rank_mirrors, ProbeReport};
use super::mirror::{MirrorId, MirrorList, Selection};
use super::result::{DownloadResult, MetadataExtractor, RepoMetadata, RepomdTimestamp, RunStatus};
use super::scheduler::Scheduler;
use super::sources::{
    parse_metalink, parse_mirrorlist, Metalink, METALINK_FILE, MIRRORLIST_FILE, REPOMD_NAME,
};
use super::target::{
    AttemptRecord, DownloadTarget, TargetOutcome, TargetState, TargetStatus, TransferStatus,
};
use super::transfer::{self, Attempt, AttemptOutcome};
use crate::callbacks::{CallbackStatus, MirrorFailure, MirrorFailureAction};
use crate::error::{ErrorKind, RepoError, RepoResult};
use crate::handle::{is_local, Handle, RepoType};
use crate::transport::{DefaultTransport, Progress, TransferRequest, Transport};
use crate::verify::{StandardVerifier, Verification, Verifier};
use futures::FutureExt;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};
use url::Url;

/// How long cancelled attempts get to acknowledge before they are aborted
const ABORT_GRACE: Duration = Duration::from_secs(2);

/// Mirrors resolved for a run
#[derive(Debug, Clone)]
pub struct MirrorSet {
    pub mirrors: MirrorList,
    /// Parsed metalink, when one was configured and fetched
    pub metalink: Option<Metalink>,
    /// Fastest-mirror measurements, empty when detection is disabled
    pub probes: Vec<ProbeReport>,
}

/// Mirror-aware parallel downloader
pub struct DownloadEngine {
    handle: Arc<Handle>,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn Verifier>,
    extractor: Arc<dyn MetadataExtractor>,
    interrupt: CancellationToken,
}

impl DownloadEngine {
    /// Validate `handle` and build an engine with the default transport.
    pub fn new(handle: Handle) -> RepoResult<Self> {
        handle.validate_options()?;
        let transport = Arc::new(DefaultTransport::new(&handle)?);
        let signature = if handle.gpg_check {
            handle.signature_check.clone()
        } else {
            None
        };
        let verifier = Arc::new(StandardVerifier::new(handle.checksum, signature));

        Ok(Self {
            handle: Arc::new(handle),
            transport,
            verifier,
            extractor: Arc::new(RepomdTimestamp),
            interrupt: CancellationToken::new(),
        })
    }

    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_verifier(mut self, verifier: Arc<dyn Verifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn MetadataExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Token that aborts every current and later run once cancelled
    pub fn interrupter(&self) -> CancellationToken {
        self.interrupt.clone()
    }

    /// Build and rank the mirror list without downloading any target
    pub async fn resolve_mirrors(&self) -> RepoResult<MirrorSet> {
        self.handle.validate()?;
        self.ensure_destdir().await?;
        self.build_mirrors(&self.interrupt).await
    }

    /// Download `targets`.
    ///
    /// Configuration problems are returned as `Err` before any I/O; every
    /// per-target failure is reported inside the [`DownloadResult`].
    pub async fn perform(&self, targets: Vec<DownloadTarget>) -> RepoResult<DownloadResult> {
        self.download(targets, false).await
    }

    /// Download packages; with `failfast` the first failed required target
    /// stops the remaining transfers.
    pub async fn download_packages(
        &self,
        targets: Vec<DownloadTarget>,
        failfast: bool,
    ) -> RepoResult<DownloadResult> {
        self.download(targets, failfast).await
    }

    /// Fetch one absolute URL, ignoring the handle's mirrors.
    ///
    /// Lands in `destination`, or in the destination directory under the
    /// URL's file name.
    pub async fn download_url(
        &self,
        url: &str,
        destination: Option<PathBuf>,
    ) -> RepoResult<TargetOutcome> {
        if self.handle.local && !is_local(url) {
            return Err(RepoError::NotLocal {
                url: url.to_string(),
            });
        }
        let (base, path, name) = split_url(url)?;
        let destination = destination.unwrap_or_else(|| self.handle.destdir.join(name));
        let targets = self.prepare(vec![DownloadTarget::new(path).with_destination(destination)])?;
        self.ensure_destdir().await?;

        let mirrors = MirrorList::new([base], self.handle.allowed_mirror_failures, false);
        let result = Run::new(self, mirrors, targets, self.interrupt.child_token(), false)
            .execute()
            .await;
        result.targets.into_iter().next().ok_or(RepoError::NoUrl)
    }

    async fn download(&self, targets: Vec<DownloadTarget>, failfast: bool) -> RepoResult<DownloadResult> {
        self.handle.validate()?;
        let mut targets = self.prepare(self.select_targets(targets))?;
        self.ensure_destdir().await?;

        let token = self.interrupt.child_token();
        let set = match self.build_mirrors(&token).await {
            Ok(set) => set,
            Err(reason) if reason.kind() == ErrorKind::Cancellation => {
                info!(reason = %reason, "stopped while resolving mirrors");
                let mirrors = MirrorList::new(Vec::<String>::new(), None, false);
                let mut run = Run::new(self, mirrors, targets, token, failfast);
                run.begin_abort(reason);
                return Ok(run.execute().await);
            }
            Err(e) => return Err(e),
        };
        let metalink_timestamp = set.metalink.as_ref().and_then(|m| m.timestamp);

        if self.handle.fetch_mirrors_only {
            info!(mirrors = set.mirrors.len(), "mirror list ready, downloads skipped");
            return Ok(DownloadResult {
                status: RunStatus::Complete,
                targets: Vec::new(),
                mirrors: set.mirrors,
                metadata: RepoMetadata {
                    timestamp: None,
                    metalink_timestamp,
                },
                error: None,
            });
        }

        if let Some(metalink) = &set.metalink {
            apply_metalink(&mut targets, metalink);
        }

        let mut result = Run::new(self, set.mirrors, targets, token, failfast)
            .execute()
            .await;
        result.metadata.metalink_timestamp = metalink_timestamp;
        Ok(result)
    }

    /// Apply the download and skip lists; repomd.xml is always kept
    fn select_targets(&self, targets: Vec<DownloadTarget>) -> Vec<DownloadTarget> {
        let handle = &self.handle;
        if handle.download_list.is_none() && handle.skip_list.is_empty() {
            return targets;
        }
        targets
            .into_iter()
            .filter(|target| {
                if is_repomd(&target.path) {
                    return true;
                }
                let listed = handle
                    .download_list
                    .as_ref()
                    .map_or(true, |names| names.iter().any(|n| target.matches(n)));
                let skipped = handle.skip_list.iter().any(|n| target.matches(n));
                if !listed || skipped {
                    debug!(path = %target.path, "excluded by download lists");
                }
                listed && !skipped
            })
            .collect()
    }

    /// Turn targets into run state, rejecting empty paths and duplicate
    /// destinations.
    fn prepare(&self, targets: Vec<DownloadTarget>) -> RepoResult<Vec<TargetState>> {
        let mut seen = HashSet::new();
        targets
            .into_iter()
            .map(|target| {
                if target.path.trim().is_empty() {
                    return Err(RepoError::bad_option("targets", "target path must not be empty"));
                }
                let state = TargetState::new(target, &self.handle.destdir, self.handle.ignore_missing);
                if !seen.insert(state.destination.clone()) {
                    return Err(RepoError::bad_option(
                        "targets",
                        format!("duplicate destination '{}'", state.destination.display()),
                    ));
                }
                Ok(state)
            })
            .collect()
    }

    async fn ensure_destdir(&self) -> RepoResult<()> {
        let destdir = &self.handle.destdir;
        tokio::fs::create_dir_all(destdir)
            .await
            .map_err(|e| RepoError::CannotCreateDir {
                path: destdir.display().to_string(),
                message: e.to_string(),
            })
    }

    async fn build_mirrors(&self, token: &CancellationToken) -> RepoResult<MirrorSet> {
        let handle = &self.handle;
        let mut urls = handle.resolved_urls();
        let mut metalink = None;

        if let Some(url) = &handle.metalink_url {
            let url = handle.substitute(url);
            let parsed = match self.fetch_document(&url, METALINK_FILE, token).await {
                Ok(content) => parse_metalink(&content, REPOMD_NAME),
                Err(e) => Err(e),
            };
            match parsed {
                Ok(document) => {
                    debug!(mirrors = document.urls.len(), "metalink loaded");
                    urls.extend(document.base_urls());
                    metalink = Some(document);
                }
                Err(e) if urls.is_empty() || e == RepoError::Interrupted => return Err(e),
                Err(e) => warn!(error = %e, "metalink unusable, using configured urls"),
            }
        } else if let Some(url) = &handle.mirrorlist_url {
            let url = handle.substitute(url);
            let parsed = match self.fetch_document(&url, MIRRORLIST_FILE, token).await {
                Ok(content) => parse_mirrorlist(&content),
                Err(e) => Err(e),
            };
            match parsed {
                Ok(list) => {
                    debug!(mirrors = list.len(), "mirrorlist loaded");
                    urls.extend(list);
                }
                Err(e) if urls.is_empty() || e == RepoError::Interrupted => return Err(e),
                Err(e) => warn!(error = %e, "mirrorlist unusable, using configured urls"),
            }
        }

        if handle.local {
            urls.retain(|url| {
                let keep = is_local(url);
                if !keep {
                    debug!(mirror = %url, "skipping remote mirror in local mode");
                }
                keep
            });
        }

        let mut mirrors = MirrorList::new(
            urls,
            handle.allowed_mirror_failures,
            handle.adaptive_mirror_sorting,
        );
        if mirrors.is_empty() {
            return Err(RepoError::NoUrl);
        }

        let probes = if handle.fastest_mirror.enabled {
            rank_mirrors(
                self.transport.as_ref(),
                &handle.fastest_mirror,
                &handle.callbacks,
                &mut mirrors,
                token,
            )
            .await?
        } else {
            Vec::new()
        };

        Ok(MirrorSet {
            mirrors,
            metalink,
            probes,
        })
    }

    /// Fetch a mirrorlist or metalink into the destination directory
    async fn fetch_document(
        &self,
        url: &str,
        name: &str,
        token: &CancellationToken,
    ) -> RepoResult<String> {
        let destination = self.handle.destdir.join(name);
        let request = TransferRequest {
            url: url.to_string(),
            destination: destination.clone(),
            resume_from: 0,
        };
        let progress = Progress::noop();
        tokio::select! {
            _ = token.cancelled() => return Err(RepoError::Interrupted),
            fetched = self.transport.fetch(&request, &progress) => { fetched?; }
        }
        tokio::fs::read_to_string(&destination)
            .await
            .map_err(|e| RepoError::io(&destination, e))
    }
}

/// Metalink digests and size apply to a repomd.xml target that has none
fn apply_metalink(targets: &mut [TargetState], metalink: &Metalink) {
    for state in targets.iter_mut().filter(|s| is_repomd(&s.spec.path)) {
        if state.spec.checksums.is_empty() {
            state.spec.checksums = metalink.checksums.clone();
        }
        if state.spec.expected_size.is_none() {
            state.spec.expected_size = metalink.size;
        }
    }
}

fn is_repomd(path: &str) -> bool {
    path.rsplit('/').next() == Some(REPOMD_NAME)
}

/// Split an absolute URL into (mirror base, target path, file name)
fn split_url(url: &str) -> RepoResult<(String, String, String)> {
    let bad = |reason: &str| RepoError::BadUrl {
        url: url.to_string(),
        reason: reason.to_string(),
    };

    if url.starts_with('/') {
        let (dir, file) = url.rsplit_once('/').ok_or_else(|| bad("not a file path"))?;
        if file.is_empty() {
            return Err(bad("URL does not name a file"));
        }
        let dir = if dir.is_empty() { "/" } else { dir };
        return Ok((dir.to_string(), file.to_string(), file.to_string()));
    }

    let parsed = Url::parse(url).map_err(|e| bad(&e.to_string()))?;
    let path = parsed.path().to_string();
    let (dir, file) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
    if file.is_empty() {
        return Err(bad("URL does not name a file"));
    }

    let mut base = parsed.clone();
    base.set_query(None);
    base.set_fragment(None);
    base.set_path(dir);
    let target = match parsed.query() {
        Some(query) => format!("{}?{}", file, query),
        None => file.to_string(),
    };
    Ok((base.to_string(), target, file.to_string()))
}

async fn interrupt_signal(enabled: bool) {
    if enabled && tokio::signal::ctrl_c().await.is_ok() {
        return;
    }
    std::future::pending::<()>().await
}

enum Event {
    Progress { target: usize, now: u64, total: u64 },
    Finished(AttemptOutcome),
}

enum Step {
    Event(Option<Event>),
    Interrupted,
    Signal,
}

/// State of one orchestration run
struct Run<'e> {
    engine: &'e DownloadEngine,
    mirrors: MirrorList,
    targets: Vec<TargetState>,
    scheduler: Scheduler,
    /// Target index → mirror of its in-flight attempt
    running: HashMap<usize, MirrorId>,
    workers: JoinSet<()>,
    sender: mpsc::UnboundedSender<Event>,
    events: mpsc::UnboundedReceiver<Event>,
    token: CancellationToken,
    max_tries: u32,
    failfast: bool,
    /// Why the run is stopping, set once
    abort: Option<RepoError>,
    failed_fast: bool,
}

impl<'e> Run<'e> {
    fn new(
        engine: &'e DownloadEngine,
        mirrors: MirrorList,
        targets: Vec<TargetState>,
        token: CancellationToken,
        failfast: bool,
    ) -> Self {
        let handle = &engine.handle;
        let (sender, events) = mpsc::unbounded_channel();
        Self {
            engine,
            mirrors,
            targets,
            scheduler: Scheduler::new(handle.max_parallel_downloads, handle.max_downloads_per_mirror),
            running: HashMap::new(),
            workers: JoinSet::new(),
            sender,
            events,
            token,
            max_tries: match handle.max_mirror_tries {
                0 => u32::MAX,
                n => n,
            },
            failfast,
            abort: None,
            failed_fast: false,
        }
    }

    async fn execute(self) -> DownloadResult {
        let span = crate::span_run!(self.targets.len());
        self.drive().instrument(span).await
    }

    async fn drive(mut self) -> DownloadResult {
        self.detect_present().await;
        if self.token.is_cancelled() {
            self.begin_abort(RepoError::Interrupted);
        }

        let signal = interrupt_signal(self.engine.handle.interruptible);
        tokio::pin!(signal);

        loop {
            if self.abort.is_none() {
                self.schedule();
            }
            if self.running.is_empty() {
                break;
            }

            let step = tokio::select! {
                biased;
                _ = self.token.cancelled(), if self.abort.is_none() => Step::Interrupted,
                _ = &mut signal, if self.abort.is_none() => Step::Signal,
                event = self.events.recv() => Step::Event(event),
            };

            match step {
                Step::Interrupted => self.begin_abort(RepoError::Interrupted),
                Step::Signal => {
                    warn!("interrupted by signal");
                    self.begin_abort(RepoError::Interrupted);
                }
                Step::Event(Some(event)) => self.handle_event(event),
                Step::Event(None) => break,
            }
            if self.abort.is_some() {
                break;
            }
        }

        self.drain().await;
        self.finish()
    }

    /// Mark targets whose destination already verifies as done; in update
    /// mode an existing file without known checksums is kept as is
    async fn detect_present(&mut self) {
        let (checksum, update) = (self.engine.handle.checksum, self.engine.handle.update);
        if !checksum && !update {
            return;
        }
        for state in self.targets.iter_mut() {
            if !state.destination.is_file() {
                continue;
            }
            let verify = checksum && !state.spec.checksums.is_empty();
            if !verify && !update {
                continue;
            }
            let present = if verify {
                let verifier = self.engine.verifier.clone();
                let (path, spec) = (state.destination.clone(), state.spec.clone());
                let verification =
                    tokio::task::spawn_blocking(move || verifier.verify(&path, &spec)).await;
                matches!(verification, Ok(Verification::Valid))
            } else {
                true
            };
            if present {
                debug!(path = %state.spec.path, "already present and valid");
                state.status = TargetStatus::Done;
                state.already_present = true;
            }
        }
    }

    fn schedule(&mut self) {
        for idx in 0..self.targets.len() {
            if self.targets[idx].status != TargetStatus::Pending {
                continue;
            }
            if !self.scheduler.has_slot() {
                break;
            }
            let state = &self.targets[idx];
            let selection =
                self.mirrors
                    .select(&state.tried, state.forced, self.scheduler.per_mirror_limit());
            match selection {
                Selection::Assign(mirror) => self.start(idx, mirror),
                Selection::Busy => {}
                Selection::Exhausted => self.fail_exhausted(idx),
            }
            if self.abort.is_some() {
                break;
            }
        }
    }

    fn start(&mut self, idx: usize, mirror: MirrorId) {
        if !self.scheduler.try_acquire(&mut self.mirrors, mirror) {
            return;
        }
        let base = &self.mirrors.get(mirror).url;
        let state = &mut self.targets[idx];
        state.status = TargetStatus::InFlight;
        state.attempts += 1;
        state.tried.insert(mirror);
        state.forced = None;

        let attempt = Attempt {
            target: idx,
            mirror,
            url: state.spec.url_on(base),
            spec: state.spec.clone(),
            destination: state.destination.clone(),
        };
        debug!(path = %state.spec.path, mirror = %base, attempt = state.attempts, "starting attempt");
        self.running.insert(idx, mirror);

        let transport = self.engine.transport.clone();
        let verifier = self.engine.verifier.clone();
        let token = self.token.clone();
        let events = self.sender.clone();

        self.workers.spawn(async move {
            let started = Instant::now();
            let progress = {
                let events = events.clone();
                Progress::new(move |now, total| {
                    let _ = events.send(Event::Progress {
                        target: idx,
                        now,
                        total,
                    });
                })
            };

            let result = AssertUnwindSafe(transfer::run(&attempt, transport, verifier, progress, token))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(RepoError::transport(&attempt.url, "transfer task panicked")));

            let _ = events.send(Event::Finished(AttemptOutcome {
                target: attempt.target,
                mirror: attempt.mirror,
                result,
                elapsed: started.elapsed(),
            }));
        });
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Progress { target, now, total } => {
                if !self.running.contains_key(&target) {
                    return;
                }
                let engine = self.engine;
                let path = &self.targets[target].spec.path;
                match engine.handle.callbacks.progress(path, now, total) {
                    CallbackStatus::Ok => {}
                    CallbackStatus::Abort => self.begin_abort(RepoError::CallbackInterrupted {
                        reason: "progress callback requested abort".to_string(),
                    }),
                    CallbackStatus::Error => self.begin_abort(RepoError::CallbackInterrupted {
                        reason: "progress callback failed".to_string(),
                    }),
                }
            }
            Event::Finished(outcome) => self.finished(outcome),
        }
    }

    fn finished(&mut self, outcome: AttemptOutcome) {
        let idx = outcome.target;
        let mirror = match self.running.remove(&idx) {
            Some(mirror) => mirror,
            None => {
                warn!(target = idx, "completion for an unknown attempt");
                return;
            }
        };
        debug_assert_eq!(mirror, outcome.mirror, "attempt finished on another mirror");
        self.scheduler.release(&mut self.mirrors, mirror);

        match outcome.result {
            Ok(bytes) => {
                self.scheduler.record_bytes(bytes);
                self.mirrors.report_success(mirror, bytes, outcome.elapsed);
                let state = &mut self.targets[idx];
                state.status = TargetStatus::Done;
                state.served_by = Some(mirror);
                state.bytes = bytes;
                info!(
                    path = %state.spec.path,
                    mirror = %self.mirrors.get(mirror).url,
                    bytes,
                    "downloaded"
                );
            }
            Err(error) if self.abort.is_some() || error == RepoError::Interrupted => {
                let state = &mut self.targets[idx];
                state.status = TargetStatus::Failed;
                if error != RepoError::Interrupted {
                    state.history.push((mirror, error));
                }
                self.begin_abort(RepoError::Interrupted);
            }
            Err(error) => self.on_failure(idx, mirror, error),
        }
    }

    fn on_failure(&mut self, idx: usize, mirror: MirrorId, error: RepoError) {
        let engine = self.engine;
        self.targets[idx].history.push((mirror, error.clone()));

        if !error.is_retryable() {
            self.fail_target(idx, error);
            return;
        }

        let base = self.mirrors.get(mirror).url.clone();
        if self.mirrors.report_failure(mirror) {
            warn!(mirror = %base, "mirror disabled after repeated failures");
        }
        debug!(path = %self.targets[idx].spec.path, mirror = %base, error = %error, "attempt failed");

        let action = engine.handle.callbacks.mirror_failure(&MirrorFailure {
            target: &self.targets[idx].spec.path,
            mirror: &base,
            error: &error,
        });

        match action {
            MirrorFailureAction::RetryDefault => self.retry_or_fail(idx),
            MirrorFailureAction::ForceFail => {
                let target = self.targets[idx].spec.path.clone();
                self.fail_target(
                    idx,
                    RepoError::ForcedFailure {
                        target,
                        last_error: error.to_string(),
                    },
                );
            }
            MirrorFailureAction::ForceMirror(url) => match self.mirrors.find(&url) {
                Some(forced) => self.force_mirror(idx, forced, &url),
                None => {
                    warn!(mirror = %url, "failure handler chose an unknown mirror");
                    self.retry_or_fail(idx);
                }
            },
            MirrorFailureAction::Abort => {
                self.targets[idx].status = TargetStatus::Failed;
                self.begin_abort(RepoError::CallbackInterrupted {
                    reason: "mirror failure callback requested abort".to_string(),
                });
            }
        }
    }

    /// Retry on the mirror picked by the failure callback, at most once per
    /// mirror and target
    fn force_mirror(&mut self, idx: usize, forced: MirrorId, url: &str) {
        if self.targets[idx].attempts >= self.max_tries {
            self.fail_exhausted(idx);
            return;
        }
        let state = &mut self.targets[idx];
        if !state.forced_retries.insert(forced) {
            warn!(mirror = %url, path = %state.spec.path, "mirror already forced once, using default failover");
            self.retry_or_fail(idx);
            return;
        }
        debug!(mirror = %url, "retrying on mirror chosen by failure handler");
        state.forced = Some(forced);
        state.status = TargetStatus::Pending;
    }

    fn retry_or_fail(&mut self, idx: usize) {
        let state = &mut self.targets[idx];
        if state.attempts < self.max_tries && !self.mirrors.is_exhausted() {
            state.status = TargetStatus::Pending;
        } else {
            self.fail_exhausted(idx);
        }
    }

    fn fail_exhausted(&mut self, idx: usize) {
        let state = &self.targets[idx];
        let error = RepoError::MirrorsExhausted {
            target: state.spec.path.clone(),
            attempts: state.attempts,
            last_error: state
                .last_error()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "no usable mirror".to_string()),
        };
        self.fail_target(idx, error);
    }

    fn fail_target(&mut self, idx: usize, error: RepoError) {
        let state = &mut self.targets[idx];
        state.status = TargetStatus::Failed;
        let required = !state.spec.optional;
        if required {
            warn!(path = %state.spec.path, error = %error, "download failed");
        } else {
            info!(path = %state.spec.path, error = %error, "optional download failed");
        }
        state.error = Some(error.clone());

        if self.failfast && required && self.abort.is_none() {
            self.failed_fast = true;
            self.begin_abort(error);
        }
    }

    fn begin_abort(&mut self, reason: RepoError) {
        if self.abort.is_some() {
            return;
        }
        info!(reason = %reason, in_flight = self.running.len(), "stopping run");
        self.abort = Some(reason);
        self.token.cancel();
    }

    /// Wait for cancelled attempts, then abort whatever is left
    async fn drain(&mut self) {
        if !self.running.is_empty() {
            let deadline = tokio::time::Instant::now() + ABORT_GRACE;
            while !self.running.is_empty() {
                match tokio::time::timeout_at(deadline, self.events.recv()).await {
                    Ok(Some(Event::Finished(outcome))) => self.finished(outcome),
                    Ok(Some(Event::Progress { .. })) => {}
                    Ok(None) | Err(_) => break,
                }
            }
        }

        if !self.running.is_empty() {
            warn!(count = self.running.len(), "attempts did not stop in time, aborting them");
            self.workers.abort_all();
            for (idx, mirror) in std::mem::take(&mut self.running) {
                self.scheduler.release(&mut self.mirrors, mirror);
                self.targets[idx].status = TargetStatus::Failed;
            }
        }
        while self.workers.join_next().await.is_some() {}
    }

    fn finish(self) -> DownloadResult {
        let Run {
            engine,
            mirrors,
            targets,
            scheduler,
            abort,
            failed_fast,
            ..
        } = self;

        let outcomes: Vec<TargetOutcome> = targets
            .into_iter()
            .map(|state| {
                let done = state.status == TargetStatus::Done;
                let status = match (done, state.already_present) {
                    (false, _) => TransferStatus::Error,
                    (true, true) => TransferStatus::AlreadyExists,
                    (true, false) => TransferStatus::Successful,
                };
                let error = if done {
                    None
                } else {
                    Some(
                        state
                            .error
                            .or_else(|| abort.clone())
                            .unwrap_or(RepoError::Interrupted),
                    )
                };
                TargetOutcome {
                    path: state.spec.path,
                    destination: state.destination,
                    status,
                    mirror: state.served_by.map(|id| mirrors.get(id).url.clone()),
                    attempts: state.attempts,
                    bytes: state.bytes,
                    optional: state.spec.optional,
                    error,
                    history: state
                        .history
                        .into_iter()
                        .map(|(id, error)| AttemptRecord {
                            mirror: mirrors.get(id).url.clone(),
                            error,
                        })
                        .collect(),
                }
            })
            .collect();

        let failed: Vec<String> = outcomes
            .iter()
            .filter(|o| !o.is_done() && !o.optional)
            .map(|o| o.path.clone())
            .collect();

        let (status, error) = match abort {
            Some(reason) if !failed_fast => (RunStatus::Aborted, Some(reason)),
            _ if !failed.is_empty() => (RunStatus::Failed, Some(RepoError::IncompleteRepo { failed })),
            _ => (RunStatus::Complete, None),
        };

        let mut metadata = RepoMetadata::default();
        if engine.handle.repo_type == RepoType::Yum {
            metadata.timestamp = outcomes
                .iter()
                .filter(|o| o.is_done() && is_repomd(&o.path))
                .find_map(|o| engine.extractor.repomd_timestamp(&o.destination));
        }

        info!(
            status = ?status,
            done = outcomes.iter().filter(|o| o.is_done()).count(),
            failed = outcomes.iter().filter(|o| !o.is_done()).count(),
            bytes = scheduler.total_bytes(),
            peak = scheduler.peak(),
            elapsed_ms = scheduler.elapsed().as_millis() as u64,
            throughput = scheduler.throughput(),
            "run finished"
        );

        DownloadResult {
            status,
            targets: outcomes,
            mirrors,
            metadata,
            error,
        }
    }
}
