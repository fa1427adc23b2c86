/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! User callbacks invoked by the download engine.
//!
//! Every callback is called synchronously from the scheduling loop while the
//! loop holds no locks, so a callback may block or take its own locks without
//! deadlocking transfers. While a callback runs no new attempt is scheduled;
//! in-flight transfers keep running. A panicking callback is caught and
//! treated as a request to stop the run.

use crate::error::RepoError;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::warn;

/// Return value of progress and fastest-mirror callbacks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStatus {
    /// Keep going
    Ok,
    /// Stop the whole run
    Abort,
    /// The callback itself failed; the run stops as well
    Error,
}

/// Stages reported while ranking mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastestMirrorStage {
    Init,
    CacheLoading,
    CacheLoadingStatus,
    Detection,
    Finishing,
    Status,
}

/// Data attached to a [`FastestMirrorStage`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FastestMirrorData {
    None,
    /// Cache file about to be loaded
    CachePath(PathBuf),
    /// Number of mirrors that will be probed
    MirrorCount(usize),
    /// `None` on success, otherwise an error description
    Status(Option<String>),
}

/// What to do after an attempt failed on a mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorFailureAction {
    /// Default failover
    RetryDefault,
    /// Give up on this target now
    ForceFail,
    /// Retry this target on the mirror with this base URL
    ForceMirror(String),
    /// Stop the whole run
    Abort,
}

/// Arguments of the handle-mirror-failure callback
#[derive(Debug)]
pub struct MirrorFailure<'a> {
    pub target: &'a str,
    pub mirror: &'a str,
    pub error: &'a RepoError,
}

pub type ProgressCallback = Arc<dyn Fn(&str, u64, u64) -> CallbackStatus + Send + Sync>;
pub type FastestMirrorCallback =
    Arc<dyn Fn(FastestMirrorStage, &FastestMirrorData) -> CallbackStatus + Send + Sync>;
pub type MirrorFailureCallback = Arc<dyn Fn(&MirrorFailure<'_>) -> MirrorFailureAction + Send + Sync>;

/// Callbacks configured on a [`Handle`](crate::Handle)
#[derive(Clone, Default)]
pub struct Callbacks {
    /// Called with `(target, bytes_now, bytes_total)`; total is 0 when unknown
    pub progress: Option<ProgressCallback>,
    pub fastest_mirror: Option<FastestMirrorCallback>,
    pub mirror_failure: Option<MirrorFailureCallback>,
}

impl Callbacks {
    pub(crate) fn progress(&self, target: &str, now: u64, total: u64) -> CallbackStatus {
        match &self.progress {
            Some(cb) => guarded("progress", || cb(target, now, total)).unwrap_or(CallbackStatus::Error),
            None => CallbackStatus::Ok,
        }
    }

    pub(crate) fn fastest_mirror(
        &self,
        stage: FastestMirrorStage,
        data: &FastestMirrorData,
    ) -> CallbackStatus {
        match &self.fastest_mirror {
            Some(cb) => guarded("fastest_mirror", || cb(stage, data)).unwrap_or(CallbackStatus::Error),
            None => CallbackStatus::Ok,
        }
    }

    pub(crate) fn mirror_failure(&self, failure: &MirrorFailure<'_>) -> MirrorFailureAction {
        match &self.mirror_failure {
            Some(cb) => guarded("mirror_failure", || cb(failure)).unwrap_or(MirrorFailureAction::Abort),
            None => MirrorFailureAction::RetryDefault,
        }
    }
}

fn guarded<R>(name: &'static str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(callback = name, "callback panicked");
            None
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("progress", &self.progress.is_some())
            .field("fastest_mirror", &self.fastest_mirror.is_some())
            .field("mirror_failure", &self.mirror_failure.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_without_callbacks() {
        let callbacks = Callbacks::default();
        assert_eq!(callbacks.progress("a.rpm", 1, 2), CallbackStatus::Ok);
        assert_eq!(
            callbacks.fastest_mirror(FastestMirrorStage::Detection, &FastestMirrorData::MirrorCount(2)),
            CallbackStatus::Ok
        );
        let err = RepoError::Interrupted;
        let failure = MirrorFailure {
            target: "a.rpm",
            mirror: "http://m1",
            error: &err,
        };
        assert_eq!(callbacks.mirror_failure(&failure), MirrorFailureAction::RetryDefault);
    }

    #[test]
    fn test_panicking_callback_is_contained() {
        let callbacks = Callbacks {
            progress: Some(Arc::new(|_: &str, _: u64, _: u64| -> CallbackStatus { panic!("boom") })),
            fastest_mirror: Some(Arc::new(
                |_: FastestMirrorStage, _: &FastestMirrorData| -> CallbackStatus { panic!("boom") },
            )),
            mirror_failure: Some(Arc::new(|_: &MirrorFailure<'_>| -> MirrorFailureAction {
                panic!("boom")
            })),
        };
        assert_eq!(callbacks.progress("a.rpm", 1, 2), CallbackStatus::Error);
        assert_eq!(
            callbacks.fastest_mirror(FastestMirrorStage::Init, &FastestMirrorData::None),
            CallbackStatus::Error
        );
        let err = RepoError::Interrupted;
        let failure = MirrorFailure {
            target: "a.rpm",
            mirror: "http://m1",
            error: &err,
        };
        assert_eq!(callbacks.mirror_failure(&failure), MirrorFailureAction::Abort);
    }
}
