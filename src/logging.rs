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

//! Subscriber setup for binaries embedding the engine.
//!
//! The library only emits `tracing` events; installing a subscriber is left
//! to the caller so there is no process-wide logging state in the core.

use std::path::Path;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize logging with a specific level
pub fn init_with_level(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(
            fmt::layer()
                .with_target(false)
                .with_thread_ids(false)
                .with_thread_names(false)
                .compact(),
        )
        .try_init();
}

/// Initialize logging with optional file output
pub fn init_with_file(level: &str, log_file: Option<&Path>) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if let Some(path) = log_file {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }

        if let Ok(file) = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
        {
            let file_layer = fmt::layer()
                .with_writer(file)
                .with_ansi(false)
                .with_target(true);

            let _ = tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().compact().with_writer(std::io::stderr))
                .with(file_layer)
                .try_init();

            return;
        }
    }

    // Fallback to console-only
    init_with_level(level);
}

/// Span covering one orchestrator run
#[macro_export]
macro_rules! span_run {
    ($targets:expr) => {
        tracing::info_span!("run", targets = $targets)
    };
}

/// Span covering one transfer attempt
#[macro_export]
macro_rules! span_attempt {
    ($target:expr, $mirror:expr) => {
        tracing::debug_span!("attempt", path = $target, mirror = $mirror)
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        // try_init refuses a second global subscriber instead of panicking
        init_with_level("debug");
        init_with_level("info");
    }

    #[test]
    fn test_file_logging_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("logs").join("repofetch.log");
        init_with_file("info", Some(&log));
        assert!(log.parent().unwrap().exists());
    }
}
