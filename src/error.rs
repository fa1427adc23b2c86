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

//! Error taxonomy for handle validation, transfers, verification and runs.

use std::fmt;
use thiserror::Error;

/// Main error type for repofetch operations.
///
/// Errors carry rendered messages rather than source objects so that they can
/// be cloned into per-target outcomes of a [`DownloadResult`](crate::DownloadResult).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RepoError {
    /// An option was set to a value that cannot be used
    #[error("Bad value for option '{option}': {reason}")]
    BadOption { option: &'static str, reason: String },

    /// Neither urls nor a mirrorlist/metalink were configured
    #[error("No usable URL: set urls, a mirrorlist or a metalink")]
    NoUrl,

    /// A URL could not be parsed or has an unsupported scheme
    #[error("Bad URL '{url}': {reason}")]
    BadUrl { url: String, reason: String },

    /// Local-only mode was requested with a remote URL
    #[error("URL '{url}' is not local but local mode is enabled")]
    NotLocal { url: String },

    /// Checksum algorithm name not recognised
    #[error("Unknown checksum type '{name}'")]
    UnknownChecksum { name: String },

    /// GPG check requested but no signature checker is installed
    #[error("GPG check requested but no signature checker is configured")]
    GpgNotSupported,

    /// Destination directory could not be created
    #[error("Cannot create directory '{path}': {message}")]
    CannotCreateDir { path: String, message: String },

    /// File system errors
    #[error("I/O error for '{path}': {message}")]
    Io { path: String, message: String },

    /// Connection, protocol or timeout failure of a single transfer
    #[error("Transfer of {url} failed: {message}")]
    Transport { url: String, message: String },

    /// Server answered with a non-success status
    #[error("Bad status {status} from {url}")]
    BadStatus { url: String, status: u16 },

    /// Transfer aborted because throughput stayed under the low-speed limit
    #[error("Transfer of {url} too slow: under {limit} B/s for {seconds}s")]
    LowSpeed { url: String, limit: u64, seconds: u64 },

    /// The mirrorlist document is unusable
    #[error("Bad mirrorlist: {reason}")]
    Mirrorlist { reason: String },

    /// The metalink document is unusable
    #[error("Bad metalink: {reason}")]
    Metalink { reason: String },

    /// Checksum mismatch
    #[error("Checksum mismatch for '{file}': expected {expected}, got {actual}")]
    BadChecksum {
        file: String,
        expected: String,
        actual: String,
    },

    /// Size differs from the announced one
    #[error("Size mismatch for '{file}': expected {expected} bytes, got {actual}")]
    BadSize { file: String, expected: u64, actual: u64 },

    /// Signature verification failure
    #[error("Signature verification failed for '{file}': {reason}")]
    BadGpg { file: String, reason: String },

    /// No viable mirror remains for a target
    #[error("All mirrors failed for '{target}' after {attempts} attempts: {last_error}")]
    MirrorsExhausted {
        target: String,
        attempts: u32,
        last_error: String,
    },

    /// A handle-mirror-failure callback refused further attempts
    #[error("Download of '{target}' stopped by mirror failure handler: {last_error}")]
    ForcedFailure { target: String, last_error: String },

    /// Required targets could not be downloaded
    #[error("Repository incomplete: {} required target(s) failed", .failed.len())]
    IncompleteRepo { failed: Vec<String> },

    /// Interrupted by the caller or a signal
    #[error("Interrupted")]
    Interrupted,

    /// A user callback requested the run to stop
    #[error("Interrupted by callback: {reason}")]
    CallbackInterrupted { reason: String },
}

/// Coarse classification used by the orchestrator to decide on retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Malformed or missing option, detected before any I/O
    Configuration,
    /// Per-attempt network failure
    Transport,
    /// Checksum, size or signature mismatch
    Verification,
    /// No mirror left for a target
    Exhaustion,
    /// Caller or callback interruption
    Cancellation,
    /// Local file system failure
    Io,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Configuration => write!(f, "configuration"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Verification => write!(f, "verification"),
            ErrorKind::Exhaustion => write!(f, "exhaustion"),
            ErrorKind::Cancellation => write!(f, "cancellation"),
            ErrorKind::Io => write!(f, "io"),
        }
    }
}

impl RepoError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            RepoError::BadOption { .. }
            | RepoError::NoUrl
            | RepoError::BadUrl { .. }
            | RepoError::NotLocal { .. }
            | RepoError::UnknownChecksum { .. }
            | RepoError::GpgNotSupported => ErrorKind::Configuration,
            RepoError::Transport { .. }
            | RepoError::BadStatus { .. }
            | RepoError::LowSpeed { .. }
            | RepoError::Mirrorlist { .. }
            | RepoError::Metalink { .. } => ErrorKind::Transport,
            RepoError::BadChecksum { .. } | RepoError::BadSize { .. } | RepoError::BadGpg { .. } => {
                ErrorKind::Verification
            }
            RepoError::MirrorsExhausted { .. }
            | RepoError::ForcedFailure { .. }
            | RepoError::IncompleteRepo { .. } => ErrorKind::Exhaustion,
            RepoError::Interrupted | RepoError::CallbackInterrupted { .. } => ErrorKind::Cancellation,
            RepoError::CannotCreateDir { .. } | RepoError::Io { .. } => ErrorKind::Io,
        }
    }

    /// Whether another mirror may succeed where this attempt failed
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Transport | ErrorKind::Verification)
    }

    /// Create an option error
    pub fn bad_option(option: &'static str, reason: impl Into<String>) -> Self {
        RepoError::BadOption {
            option,
            reason: reason.into(),
        }
    }

    /// Create a transport error
    pub fn transport(url: impl Into<String>, message: impl fmt::Display) -> Self {
        RepoError::Transport {
            url: url.into(),
            message: message.to_string(),
        }
    }

    /// Create an I/O error for a path
    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        RepoError::Io {
            path: path.as_ref().display().to_string(),
            message: source.to_string(),
        }
    }
}

impl From<reqwest::Error> for RepoError {
    fn from(e: reqwest::Error) -> Self {
        let url = e.url().map(|u| u.to_string()).unwrap_or_default();
        match e.status() {
            Some(status) => RepoError::BadStatus {
                url,
                status: status.as_u16(),
            },
            None => RepoError::Transport {
                url,
                message: e.to_string(),
            },
        }
    }
}

/// Result type alias for repofetch operations
pub type RepoResult<T> = std::result::Result<T, RepoError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = RepoError::BadChecksum {
            file: "repomd.xml".to_string(),
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        assert_eq!(
            format!("{}", err),
            "Checksum mismatch for 'repomd.xml': expected aa, got bb"
        );
    }

    #[test]
    fn test_incomplete_repo_display() {
        let err = RepoError::IncompleteRepo {
            failed: vec!["a.rpm".to_string(), "b.rpm".to_string()],
        };
        assert_eq!(format!("{}", err), "Repository incomplete: 2 required target(s) failed");
    }

    #[test]
    fn test_classification() {
        assert!(RepoError::transport("http://m1/x", "reset").is_retryable());
        assert!(RepoError::BadGpg {
            file: "x".into(),
            reason: "bad".into()
        }
        .is_retryable());
        assert!(!RepoError::NoUrl.is_retryable());
        assert!(!RepoError::Io {
            path: "/var/cache".into(),
            message: "no space left on device".into()
        }
        .is_retryable());
        assert!(!RepoError::Interrupted.is_retryable());
        assert_eq!(RepoError::GpgNotSupported.kind(), ErrorKind::Configuration);
        assert_eq!(
            RepoError::IncompleteRepo { failed: vec![] }.kind(),
            ErrorKind::Exhaustion
        );
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::Verification.to_string(), "verification");
    }
}
