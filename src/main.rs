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

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use comfy_table::presets::UTF8_FULL;
use comfy_table::Table;
use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use repofetch::downloader::{DownloadEngine, DownloadResult, DownloadTarget, TransferStatus};
use repofetch::{logging, CallbackStatus, Checksum, Config, FastestMirrorStage, Handle};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::warn;

const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Copyright (C) 2025  repofetch contributors\n",
    "License GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>\n\n",
    "This is free software; you are free to change and redistribute it.\n",
    "There is NO WARRANTY, to the extent permitted by law."
);

#[derive(Parser)]
#[command(name = "repofetch")]
#[command(version, long_version = LONG_VERSION)]
#[command(about = "Mirror-aware parallel downloader for linux package repositories.")]
struct Cli {
    /// More output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Also write logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download targets relative to the repository's mirrors
    Fetch {
        #[command(flatten)]
        source: SourceArgs,
        /// Stop everything once a required target fails
        #[arg(long)]
        failfast: bool,
        /// Treat every target as optional
        #[arg(long)]
        ignore_missing: bool,
        /// Add repodata/repomd.xml to the targets
        #[arg(long)]
        repomd: bool,
        /// Keep files already present in the destination directory
        #[arg(long)]
        update: bool,
        /// Only fetch targets matching NAME (repeatable)
        #[arg(long = "only", value_name = "NAME")]
        only: Vec<String>,
        /// Skip targets matching NAME (repeatable)
        #[arg(long = "skip", value_name = "NAME")]
        skip: Vec<String>,
        /// Targets as PATH or PATH@TYPE:DIGEST
        #[arg(value_name = "TARGETS")]
        targets: Vec<String>,
    },
    /// Download one absolute URL
    Url {
        url: String,
        #[arg(short, long)]
        output: Option<PathBuf>,
        #[arg(short, long)]
        destdir: Option<PathBuf>,
    },
    /// Resolve and rank the repository's mirrors
    Mirrors {
        #[command(flatten)]
        source: SourceArgs,
    },
}

#[derive(Args)]
struct SourceArgs {
    /// Base URL of the repository (repeatable)
    #[arg(short, long = "url")]
    urls: Vec<String>,
    #[arg(long)]
    mirrorlist: Option<String>,
    #[arg(long)]
    metalink: Option<String>,
    #[arg(short, long)]
    destdir: Option<PathBuf>,
    /// Parallel downloads
    #[arg(short, long)]
    jobs: Option<usize>,
    #[arg(long)]
    per_mirror: Option<usize>,
    /// Probe mirrors and start with the fastest
    #[arg(long)]
    fastest_mirror: bool,
    /// Substitution as NAME=VALUE (repeatable)
    #[arg(long = "var", value_name = "NAME=VALUE")]
    vars: Vec<String>,
}

impl SourceArgs {
    fn apply(&self, config: &mut Config) -> Result<()> {
        if !self.urls.is_empty() {
            config.mirrors.urls = self.urls.clone();
        }
        if self.mirrorlist.is_some() {
            config.mirrors.mirrorlist = self.mirrorlist.clone();
        }
        if self.metalink.is_some() {
            config.mirrors.metalink = self.metalink.clone();
        }
        if let Some(destdir) = &self.destdir {
            config.download.destdir = destdir.clone();
        }
        if let Some(jobs) = self.jobs {
            config.download.max_parallel_downloads = jobs;
        }
        if let Some(per_mirror) = self.per_mirror {
            config.download.max_downloads_per_mirror = per_mirror;
        }
        if self.fastest_mirror {
            config.fastest_mirror.enabled = true;
        }
        for var in &self.vars {
            let (name, value) = var
                .split_once('=')
                .ok_or_else(|| anyhow!("invalid --var '{}', expected NAME=VALUE", var))?;
            config.mirrors.vars.insert(name.to_string(), value.to_string());
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load();

    let level = match cli.verbose {
        0 => config.logging.level.clone(),
        1 => "info".to_string(),
        _ => "debug".to_string(),
    };
    let log_file = cli.log_file.clone().or_else(|| config.logging.file.clone());
    logging::init_with_file(&level, log_file.as_deref());
    for warning in &config.warnings {
        warn!("{}", warning);
    }

    match cli.command {
        Command::Fetch {
            source,
            failfast,
            ignore_missing,
            repomd,
            update,
            only,
            skip,
            targets,
        } => {
            source.apply(&mut config)?;
            config.download.ignore_missing |= ignore_missing;
            config.download.update |= update;
            if !only.is_empty() {
                config.download.download_list = Some(only);
            }
            config.download.skip_list.extend(skip);
            let mut parsed = Vec::new();
            if repomd {
                parsed.push(DownloadTarget::new("repodata/repomd.xml"));
            }
            for spec in &targets {
                parsed.push(parse_target(spec)?);
            }
            if parsed.is_empty() {
                bail!("no targets given");
            }
            fetch(&config, parsed, failfast).await
        }
        Command::Url {
            url,
            output,
            destdir,
        } => {
            if let Some(destdir) = destdir {
                config.download.destdir = destdir;
            }
            fetch_url(&config, &url, output).await
        }
        Command::Mirrors { source } => {
            source.apply(&mut config)?;
            config.fastest_mirror.enabled = true;
            show_mirrors(&config).await
        }
    }
}

fn parse_target(spec: &str) -> Result<DownloadTarget> {
    match spec.rsplit_once('@') {
        Some((path, digest)) if digest.contains(':') => {
            let (kind, value) = digest
                .split_once(':')
                .ok_or_else(|| anyhow!("invalid digest in '{}'", spec))?;
            let checksum = Checksum::parse(kind, value)
                .with_context(|| format!("invalid target '{}'", spec))?;
            Ok(DownloadTarget::new(path).with_checksum(checksum))
        }
        _ => Ok(DownloadTarget::new(spec)),
    }
}

fn build_handle(config: &Config) -> Result<Handle> {
    config.validate().map_err(|e| anyhow!("invalid configuration: {}", e))?;
    Ok(config.to_handle())
}

/// Progress bars keyed by target, created on first report
fn attach_progress(handle: &mut Handle, mp: &MultiProgress) {
    let bars: Arc<Mutex<HashMap<String, ProgressBar>>> = Arc::new(Mutex::new(HashMap::new()));
    let mp = mp.clone();
    let style = ProgressStyle::with_template(
        "   {spinner:.blue} {msg} [{bar:20.blue/cyan}] {bytes}/{total_bytes}",
    )
    .map(|s| s.progress_chars("=>-"))
    .unwrap_or_else(|_| ProgressStyle::default_bar());

    handle.callbacks.progress = Some(Arc::new(move |target: &str, now: u64, total: u64| {
        let mut bars = match bars.lock() {
            Ok(bars) => bars,
            Err(_) => return CallbackStatus::Error,
        };
        let pb = bars.entry(target.to_string()).or_insert_with(|| {
            let pb = mp.add(ProgressBar::new(total));
            pb.set_style(style.clone());
            pb.set_message(target.rsplit('/').next().unwrap_or(target).to_string());
            pb
        });
        if total > 0 {
            pb.set_length(total);
        }
        pb.set_position(now);
        if total > 0 && now >= total {
            pb.finish_and_clear();
        }
        CallbackStatus::Ok
    }));

    handle.callbacks.fastest_mirror = Some(Arc::new(|stage: FastestMirrorStage, _: &repofetch::FastestMirrorData| {
        if stage == FastestMirrorStage::Detection {
            eprintln!("{}", console::style(":: probing mirrors...").bold());
        }
        CallbackStatus::Ok
    }));
}

async fn fetch(config: &Config, targets: Vec<DownloadTarget>, failfast: bool) -> Result<()> {
    let mut handle = build_handle(config)?;
    let mp = MultiProgress::new();
    attach_progress(&mut handle, &mp);

    let total = targets.len() as u64;
    let engine = DownloadEngine::new(handle)?;
    println!("{}", style(format!(":: fetching {} target(s)...", total)).bold());
    let result = engine.download_packages(targets, failfast).await?;
    mp.clear().ok();

    print_summary(&result);
    if result.is_success() {
        println!(
            "{} {:.2} MiB downloaded",
            style("::").bold().green(),
            result.downloaded_bytes() as f64 / 1024.0 / 1024.0
        );
        Ok(())
    } else {
        match &result.error {
            Some(e) => Err(anyhow!("{}", e)),
            None => Err(anyhow!("download failed")),
        }
    }
}

fn print_summary(result: &DownloadResult) {
    let mut t = Table::new();
    t.load_preset(UTF8_FULL);
    t.set_header(vec!["target", "status", "mirror", "attempts", "detail"]);
    for outcome in &result.targets {
        let status = match outcome.status {
            TransferStatus::Successful => style("ok").green().to_string(),
            TransferStatus::AlreadyExists => style("cached").cyan().to_string(),
            TransferStatus::Error if outcome.optional => style("skipped").yellow().to_string(),
            TransferStatus::Error => style("failed").red().to_string(),
        };
        let detail = match &outcome.error {
            Some(e) => e.to_string(),
            None => format!("{:.2} KiB", outcome.bytes as f64 / 1024.0),
        };
        t.add_row(vec![
            outcome.path.clone(),
            status,
            outcome.mirror.clone().unwrap_or_else(|| "-".to_string()),
            outcome.attempts.to_string(),
            detail,
        ]);
    }
    println!("{}", t);
}

async fn fetch_url(config: &Config, url: &str, output: Option<PathBuf>) -> Result<()> {
    let mut handle = build_handle(config)?;
    let mp = MultiProgress::new();
    attach_progress(&mut handle, &mp);

    let engine = DownloadEngine::new(handle)?;
    let outcome = engine.download_url(url, output).await?;
    mp.clear().ok();

    match outcome.error {
        None => {
            println!(
                "{} {}",
                style("::").bold().green(),
                outcome.destination.display()
            );
            Ok(())
        }
        Some(e) => Err(anyhow!("{}: {}", url, e)),
    }
}

async fn show_mirrors(config: &Config) -> Result<()> {
    let handle = build_handle(config)?;
    let pb = ProgressBar::new_spinner();
    if let Ok(spinner) = ProgressStyle::default_spinner()
        .tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏")
        .template("{spinner:.cyan} {msg}")
    {
        pb.set_style(spinner);
    }
    pb.set_message("resolving mirrors...");
    pb.enable_steady_tick(Duration::from_millis(80));

    let engine = DownloadEngine::new(handle)?;
    let set = engine.resolve_mirrors().await;
    pb.finish_and_clear();
    let set = set?;

    let mut t = Table::new();
    t.load_preset(UTF8_FULL);
    t.set_header(vec!["#", "mirror", "latency", "source"]);
    for (i, report) in set.probes.iter().enumerate() {
        let latency = match report.latency {
            Some(d) => format!("{} ms", d.as_millis()),
            None => style("unreachable").red().to_string(),
        };
        let source = if report.from_cache { "cache" } else { "probe" };
        t.add_row(vec![
            (i + 1).to_string(),
            report.url.clone(),
            latency,
            source.to_string(),
        ]);
    }
    println!("{}", t);

    if let Some(metalink) = &set.metalink {
        if let Some(ts) = metalink.timestamp.and_then(|ts| chrono::DateTime::from_timestamp(ts, 0)) {
            println!("metalink timestamp: {}", ts.format("%Y-%m-%d %H:%M:%S UTC"));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use repofetch::ChecksumType;

    #[test]
    fn test_parse_target() {
        let plain = parse_target("Packages/a/a-1.0.rpm").unwrap();
        assert!(plain.checksums.is_empty());

        let digest = "a".repeat(64);
        let target = parse_target(&format!("Packages/a.rpm@sha256:{}", digest)).unwrap();
        assert_eq!(target.path, "Packages/a.rpm");
        assert_eq!(target.checksums[0].kind, ChecksumType::Sha256);

        assert!(parse_target("a.rpm@sha256:xyz").is_err());
    }

    #[test]
    fn test_cli_parses_fetch() {
        let cli = Cli::try_parse_from([
            "repofetch",
            "fetch",
            "-u",
            "http://mirror.example/os",
            "--var",
            "releasever=40",
            "-j",
            "5",
            "--repomd",
            "--only",
            "primary",
            "--skip",
            "other",
            "Packages/a.rpm",
        ])
        .unwrap();
        match cli.command {
            Command::Fetch {
                source,
                repomd,
                only,
                skip,
                targets,
                ..
            } => {
                assert!(repomd);
                assert_eq!(only, vec!["primary"]);
                assert_eq!(skip, vec!["other"]);
                assert_eq!(targets, vec!["Packages/a.rpm"]);
                let mut config = Config::default();
                source.apply(&mut config).unwrap();
                assert_eq!(config.download.max_parallel_downloads, 5);
                assert_eq!(config.mirrors.vars["releasever"], "40");
            }
            _ => panic!("expected fetch"),
        }
    }
}
