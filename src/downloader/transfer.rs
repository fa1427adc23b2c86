/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! One transfer attempt: fetch into `<dest>.part`, verify, promote.

use super::mirror::MirrorId;
use super::target::{part_path, DownloadTarget};
use crate::error::{RepoError, RepoResult};
use crate::transport::{Progress, TransferRequest, Transport};
use crate::verify::{Verification, Verifier};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, Instrument};

/// A (target, mirror) pairing handed to a worker
#[derive(Debug, Clone)]
pub(crate) struct Attempt {
    pub target: usize,
    pub mirror: MirrorId,
    pub url: String,
    pub spec: DownloadTarget,
    pub destination: PathBuf,
}

/// Completion event of an attempt, sent exactly once
#[derive(Debug)]
pub(crate) struct AttemptOutcome {
    pub target: usize,
    pub mirror: MirrorId,
    /// Bytes transferred by this attempt
    pub result: RepoResult<u64>,
    pub elapsed: Duration,
}

pub(crate) async fn run(
    attempt: &Attempt,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn Verifier>,
    progress: Progress,
    token: CancellationToken,
) -> RepoResult<u64> {
    let span = crate::span_attempt!(attempt.spec.path.as_str(), attempt.url.as_str());
    transfer(attempt, transport, verifier, progress, token)
        .instrument(span)
        .await
}

async fn transfer(
    attempt: &Attempt,
    transport: Arc<dyn Transport>,
    verifier: Arc<dyn Verifier>,
    progress: Progress,
    token: CancellationToken,
) -> RepoResult<u64> {
    let part = part_path(&attempt.destination);
    if let Some(parent) = attempt.destination.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| RepoError::CannotCreateDir {
                path: parent.display().to_string(),
                message: e.to_string(),
            })?;
    }

    let resume = attempt.spec.resume && transport.supports_resume();
    let resume_from = if resume {
        tokio::fs::metadata(&part).await.map(|m| m.len()).unwrap_or(0)
    } else {
        discard(&part).await;
        0
    };
    if resume_from > 0 {
        debug!(offset = resume_from, "resuming partial download");
    }

    let request = TransferRequest {
        url: attempt.url.clone(),
        destination: part.clone(),
        resume_from,
    };

    let fetched = tokio::select! {
        _ = token.cancelled() => Err(RepoError::Interrupted),
        result = transport.fetch(&request, &progress) => result,
    };
    let written = match fetched {
        Ok(written) => written,
        Err(e) => {
            if !resume {
                discard(&part).await;
            }
            debug!(error = %e, "attempt failed");
            return Err(e);
        }
    };

    let check = part.clone();
    let spec = attempt.spec.clone();
    let verification = tokio::task::spawn_blocking(move || verifier.verify(&check, &spec))
        .await
        .map_err(|e| RepoError::Io {
            path: part.display().to_string(),
            message: format!("verification task failed: {}", e),
        })?;

    if let Verification::Invalid(e) = verification {
        discard(&part).await;
        debug!(error = %e, "verification failed, partial file discarded");
        return Err(e);
    }

    tokio::fs::rename(&part, &attempt.destination)
        .await
        .map_err(|e| RepoError::io(&attempt.destination, e))?;
    debug!(bytes = written, "attempt finished");
    Ok(written)
}

async fn discard(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            debug!(path = %path.display(), error = %e, "could not remove partial file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::downloader::testing::{body_for, sha256_of, Behavior, ScriptedTransport};
    use crate::verify::{Checksum, ChecksumType, StandardVerifier};
    use tempfile::tempdir;

    fn attempt(dir: &Path, spec: DownloadTarget) -> Attempt {
        Attempt {
            target: 0,
            mirror: 0,
            url: spec.url_on("http://m1"),
            destination: dir.join(&spec.path),
            spec,
        }
    }

    fn verifier() -> Arc<dyn Verifier> {
        Arc::new(StandardVerifier::new(true, None))
    }

    #[tokio::test]
    async fn test_promotes_verified_file() {
        let dir = tempdir().unwrap();
        let spec = DownloadTarget::new("a.rpm")
            .with_checksum(Checksum::new(ChecksumType::Sha256, sha256_of(&body_for("a.rpm"))));
        let attempt = attempt(dir.path(), spec);

        let transport = Arc::new(ScriptedTransport::new());
        let bytes = run(&attempt, transport, verifier(), Progress::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bytes, body_for("a.rpm").len() as u64);
        assert_eq!(std::fs::read(dir.path().join("a.rpm")).unwrap(), body_for("a.rpm"));
        assert!(!part_path(&dir.path().join("a.rpm")).exists());
    }

    #[tokio::test]
    async fn test_corrupt_file_never_promoted() {
        let dir = tempdir().unwrap();
        let spec = DownloadTarget::new("a.rpm")
            .with_checksum(Checksum::new(ChecksumType::Sha256, sha256_of(&body_for("a.rpm"))));
        let attempt = attempt(dir.path(), spec);

        let transport = Arc::new(ScriptedTransport::new().mirror("http://m1", Behavior::Corrupt));
        let err = run(&attempt, transport, verifier(), Progress::noop(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, RepoError::BadChecksum { .. }));
        assert!(!dir.path().join("a.rpm").exists());
        assert!(!part_path(&dir.path().join("a.rpm")).exists());
    }

    #[tokio::test]
    async fn test_cancellation_stops_transfer() {
        let dir = tempdir().unwrap();
        let attempt = attempt(dir.path(), DownloadTarget::new("a.rpm"));
        let transport = Arc::new(ScriptedTransport::new().mirror("http://m1", Behavior::Hang));
        let token = CancellationToken::new();

        let handle = {
            let token = token.clone();
            let transport = transport.clone();
            tokio::spawn(async move {
                run(&attempt, transport, verifier(), Progress::noop(), token).await
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        token.cancel();

        let result = handle.await.unwrap();
        assert_eq!(result, Err(RepoError::Interrupted));
        assert_eq!(transport.cancelled(), 1);
        assert!(!dir.path().join("a.rpm").exists());
    }

    #[tokio::test]
    async fn test_resume_continues_partial_file() {
        let dir = tempdir().unwrap();
        let body = body_for("a.rpm");
        let destination = dir.path().join("a.rpm");
        std::fs::write(part_path(&destination), &body[..4]).unwrap();

        let spec = DownloadTarget::new("a.rpm")
            .resumable()
            .with_checksum(Checksum::new(ChecksumType::Sha256, sha256_of(&body)));
        let attempt = attempt(dir.path(), spec);

        let transport = Arc::new(ScriptedTransport::new());
        let bytes = run(&attempt, transport.clone(), verifier(), Progress::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(bytes, (body.len() - 4) as u64);
        assert_eq!(transport.resumed_from(), vec![4]);
        assert_eq!(std::fs::read(&destination).unwrap(), body);
    }

    #[tokio::test]
    async fn test_stale_partial_file_discarded_without_resume() {
        let dir = tempdir().unwrap();
        let destination = dir.path().join("a.rpm");
        std::fs::write(part_path(&destination), b"garbage").unwrap();

        let attempt = attempt(dir.path(), DownloadTarget::new("a.rpm"));
        let transport = Arc::new(ScriptedTransport::new());
        run(&attempt, transport.clone(), verifier(), Progress::noop(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(transport.resumed_from(), vec![0]);
        assert_eq!(std::fs::read(&destination).unwrap(), body_for("a.rpm"));
    }
}
