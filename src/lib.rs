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

//! Mirror-aware parallel downloads for package repositories.
//!
//! Configure a [`Handle`], hand it to a [`DownloadEngine`] and submit
//! [`DownloadTarget`]s. Each target is fetched from the best available mirror,
//! verified, and only then moved into place; failed attempts move on to the
//! next mirror until the target succeeds or its mirrors are used up.

pub mod callbacks;
pub mod config;
pub mod downloader;
pub mod error;
pub mod handle;
pub mod logging;
pub mod transport;
pub mod verify;

pub use callbacks::{
    CallbackStatus, Callbacks, FastestMirrorData, FastestMirrorStage, MirrorFailure,
    MirrorFailureAction,
};
pub use config::Config;
pub use downloader::{
    DownloadEngine, DownloadResult, DownloadTarget, MirrorList, RunStatus, TargetOutcome,
    TransferStatus,
};
pub use error::{ErrorKind, RepoError, RepoResult};
pub use handle::{Handle, RepoType};
pub use transport::Transport;
pub use verify::{Checksum, ChecksumType};
