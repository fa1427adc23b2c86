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

//! Configuration management with validation and defaults.

use crate::handle::{
    Credentials, FastestMirrorOptions, Handle, HttpOptions, IpResolve, ProxyOptions, ProxyType, RepoType,
};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main configuration structure for repofetch
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub download: DownloadConfig,
    pub mirrors: MirrorConfig,
    pub fastest_mirror: FastestMirrorConfig,
    pub proxy: ProxyConfig,
    pub logging: LoggingConfig,

    /// Problems found while loading config files
    #[serde(skip)]
    pub warnings: Vec<String>,
}

/// Transfer and verification settings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct DownloadConfig {
    /// Destination directory
    pub destdir: PathBuf,

    /// `yum`, `suse` or `deb`
    pub repo_type: String,

    pub max_parallel_downloads: usize,
    pub max_downloads_per_mirror: usize,

    /// Attempts per target (0 = one per mirror)
    pub max_mirror_tries: u32,

    pub checksum: bool,
    pub ignore_missing: bool,
    pub interruptible: bool,

    /// Keep files already present in destdir
    pub update: bool,

    /// Only download targets matching these names (e.g. `primary`)
    pub download_list: Option<Vec<String>>,
    /// Never download targets matching these names
    pub skip_list: Vec<String>,

    pub user_agent: Option<String>,
    pub connect_timeout_secs: u64,

    /// Bytes per second per transfer (0 = unlimited)
    pub max_speed: u64,
    pub low_speed_limit: u64,
    pub low_speed_time_secs: u64,
    pub ssl_verify_peer: bool,
    pub ssl_verify_host: bool,

    /// `whatever`, `v4` or `v6`
    pub ip_resolve: String,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        let http = HttpOptions::default();
        Self {
            destdir: PathBuf::from("."),
            repo_type: "yum".to_string(),
            max_parallel_downloads: 3,
            max_downloads_per_mirror: 3,
            max_mirror_tries: 0,
            checksum: true,
            ignore_missing: false,
            interruptible: true,
            update: false,
            download_list: None,
            skip_list: Vec::new(),
            user_agent: None,
            connect_timeout_secs: http.connect_timeout.as_secs(),
            max_speed: 0,
            low_speed_limit: http.low_speed_limit,
            low_speed_time_secs: http.low_speed_time.as_secs(),
            ssl_verify_peer: true,
            ssl_verify_host: true,
            ip_resolve: "whatever".to_string(),
        }
    }
}

/// Mirror sources and failover policy
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Base URLs tried before any mirrorlist/metalink mirror
    pub urls: Vec<String>,
    pub mirrorlist: Option<String>,
    pub metalink: Option<String>,

    /// Only accept local sources
    pub local: bool,

    /// Consecutive failures before a mirror is dropped (0 = never)
    pub allowed_failures: u32,

    pub adaptive_sorting: bool,

    /// `$name` substitutions
    pub vars: BTreeMap<String, String>,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            mirrorlist: None,
            metalink: None,
            local: false,
            allowed_failures: 4,
            adaptive_sorting: true,
            vars: BTreeMap::new(),
        }
    }
}

/// Fastest-mirror detection
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct FastestMirrorConfig {
    pub enabled: bool,
    pub cache_path: Option<PathBuf>,
    pub max_age_secs: u64,
    pub timeout_secs: f64,
}

impl Default for FastestMirrorConfig {
    fn default() -> Self {
        let defaults = FastestMirrorOptions::default();
        Self {
            enabled: false,
            cache_path: dirs::cache_dir().map(|d| d.join("repofetch").join("fastestmirror.json")),
            max_age_secs: defaults.max_age.as_secs(),
            timeout_secs: defaults.timeout.as_secs_f64(),
        }
    }
}

/// Proxy configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    pub url: Option<String>,
    /// `http`, `socks5` or `socks5h`; taken from the URL when unset
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log file path (empty = no file logging)
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
            file: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with precedence:
    /// 1. /etc/repofetch/repofetch.toml (system-wide)
    /// 2. ~/.config/repofetch/config.toml (user)
    /// 3. Environment variables (REPOFETCH_*)
    pub fn load() -> Self {
        let mut paths = vec![PathBuf::from("/etc/repofetch/repofetch.toml")];
        if let Some(config_dir) = dirs::config_dir() {
            paths.push(config_dir.join("repofetch").join("config.toml"));
        }
        Self::load_from(&paths).apply_env_overrides()
    }

    /// Layer the given files over the defaults, later files winning
    pub fn load_from<P: AsRef<Path>>(paths: &[P]) -> Self {
        let mut config = Config::default();
        for path in paths {
            let path = path.as_ref();
            if !path.exists() {
                continue;
            }
            let parsed = fs::read_to_string(path)
                .map_err(|e| e.to_string())
                .and_then(|content| toml::from_str::<Config>(&content).map_err(|e| e.to_string()));
            match parsed {
                Ok(parsed) => config = config.merge(parsed),
                Err(e) => config
                    .warnings
                    .push(format!("ignoring {}: {}", path.display(), e)),
            }
        }
        config
    }

    /// Merge another config into this one (other takes precedence for non-default values)
    fn merge(mut self, other: Config) -> Self {
        self.download = self.download.merge(other.download);
        self.mirrors = self.mirrors.merge(other.mirrors);
        self.fastest_mirror = self.fastest_mirror.merge(other.fastest_mirror);
        if other.proxy.url.is_some() {
            self.proxy = other.proxy;
        }
        let default = LoggingConfig::default();
        if other.logging.level != default.level {
            self.logging.level = other.logging.level;
        }
        if other.logging.file.is_some() {
            self.logging.file = other.logging.file;
        }
        self.warnings.extend(other.warnings);
        self
    }

    fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    /// Apply `REPOFETCH_*` overrides read through `var`
    fn apply_overrides(mut self, var: impl Fn(&str) -> Option<String>) -> Self {
        let flag = |val: String| val == "1" || val.eq_ignore_ascii_case("true");

        if let Some(val) = var("REPOFETCH_DESTDIR") {
            self.download.destdir = PathBuf::from(val);
        }
        if let Some(n) = var("REPOFETCH_PARALLEL").and_then(|v| v.parse().ok()) {
            self.download.max_parallel_downloads = n;
        }
        if let Some(n) = var("REPOFETCH_PER_MIRROR").and_then(|v| v.parse().ok()) {
            self.download.max_downloads_per_mirror = n;
        }
        if let Some(val) = var("REPOFETCH_URLS") {
            self.mirrors.urls = val
                .split(',')
                .map(str::trim)
                .filter(|u| !u.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(val) = var("REPOFETCH_MIRRORLIST") {
            self.mirrors.mirrorlist = Some(val);
        }
        if let Some(val) = var("REPOFETCH_METALINK") {
            self.mirrors.metalink = Some(val);
        }
        if let Some(val) = var("REPOFETCH_FASTEST_MIRROR") {
            self.fastest_mirror.enabled = flag(val);
        }
        if let Some(val) = var("REPOFETCH_PROXY") {
            self.proxy.url = Some(val);
        }
        if let Some(val) = var("REPOFETCH_LOG_LEVEL") {
            self.logging.level = val;
        }

        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        let download = &self.download;
        if download.max_parallel_downloads == 0 {
            return Err("max_parallel_downloads must be at least 1".to_string());
        }
        if download.max_parallel_downloads > 64 {
            return Err("max_parallel_downloads must be at most 64".to_string());
        }
        if download.max_downloads_per_mirror == 0 {
            return Err("max_downloads_per_mirror must be at least 1".to_string());
        }
        if parse_repo_type(&download.repo_type).is_none() {
            return Err(format!(
                "repo_type must be one of yum, suse, deb (got '{}')",
                download.repo_type
            ));
        }
        let timeout = self.fastest_mirror.timeout_secs;
        if timeout.is_nan() || timeout <= 0.0 {
            return Err("fastest_mirror.timeout_secs must be positive".to_string());
        }
        if IpResolve::parse(&download.ip_resolve).is_none() {
            return Err(format!(
                "ip_resolve must be one of whatever, v4, v6 (got '{}')",
                download.ip_resolve
            ));
        }
        if let Some(kind) = &self.proxy.kind {
            if ProxyType::parse(kind).is_none() {
                return Err(format!("proxy.type must be one of http, socks5, socks5h (got '{}')", kind));
            }
        }
        if self.proxy.password.is_some() && self.proxy.username.is_none() {
            return Err("proxy.password requires proxy.username".to_string());
        }
        Ok(())
    }

    /// Build a download handle; call [`validate`](Self::validate) first
    pub fn to_handle(&self) -> Handle {
        let download = &self.download;
        let mirrors = &self.mirrors;

        let mut http = HttpOptions {
            connect_timeout: Duration::from_secs(download.connect_timeout_secs),
            ssl_verify_peer: download.ssl_verify_peer,
            ssl_verify_host: download.ssl_verify_host,
            ip_resolve: IpResolve::parse(&download.ip_resolve).unwrap_or_default(),
            max_speed: download.max_speed,
            low_speed_limit: download.low_speed_limit,
            low_speed_time: Duration::from_secs(download.low_speed_time_secs),
            ..HttpOptions::default()
        };
        if let Some(agent) = &download.user_agent {
            http.user_agent = agent.clone();
        }
        http.proxy = self.proxy.url.as_ref().map(|url| ProxyOptions {
            url: url.clone(),
            kind: self.proxy.kind.as_deref().and_then(ProxyType::parse),
            auth: self.proxy.username.as_ref().map(|username| Credentials {
                username: username.clone(),
                password: self.proxy.password.clone().unwrap_or_default(),
            }),
        });

        Handle {
            urls: mirrors.urls.clone(),
            mirrorlist_url: mirrors.mirrorlist.clone(),
            metalink_url: mirrors.metalink.clone(),
            local: mirrors.local,
            destdir: download.destdir.clone(),
            repo_type: parse_repo_type(&download.repo_type).unwrap_or_default(),
            varsub: mirrors
                .vars
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            http,
            max_parallel_downloads: download.max_parallel_downloads,
            max_downloads_per_mirror: download.max_downloads_per_mirror,
            max_mirror_tries: download.max_mirror_tries,
            allowed_mirror_failures: match mirrors.allowed_failures {
                0 => None,
                n => Some(n),
            },
            adaptive_mirror_sorting: mirrors.adaptive_sorting,
            fastest_mirror: FastestMirrorOptions {
                enabled: self.fastest_mirror.enabled,
                cache_path: self.fastest_mirror.cache_path.clone(),
                max_age: Duration::from_secs(self.fastest_mirror.max_age_secs),
                timeout: Duration::from_secs_f64(self.fastest_mirror.timeout_secs.max(0.001)),
            },
            interruptible: download.interruptible,
            checksum: download.checksum,
            ignore_missing: download.ignore_missing,
            update: download.update,
            download_list: download.download_list.clone(),
            skip_list: download.skip_list.clone(),
            ..Handle::default()
        }
    }
}

fn parse_repo_type(name: &str) -> Option<RepoType> {
    match name.to_ascii_lowercase().as_str() {
        "yum" | "rpm-md" => Some(RepoType::Yum),
        "suse" | "yast2" => Some(RepoType::Suse),
        "deb" | "apt" => Some(RepoType::Deb),
        _ => None,
    }
}

impl DownloadConfig {
    fn merge(mut self, other: DownloadConfig) -> Self {
        let default = DownloadConfig::default();

        if other.destdir != default.destdir {
            self.destdir = other.destdir;
        }
        if other.repo_type != default.repo_type {
            self.repo_type = other.repo_type;
        }
        if other.max_parallel_downloads != default.max_parallel_downloads {
            self.max_parallel_downloads = other.max_parallel_downloads;
        }
        if other.max_downloads_per_mirror != default.max_downloads_per_mirror {
            self.max_downloads_per_mirror = other.max_downloads_per_mirror;
        }
        if other.max_mirror_tries != default.max_mirror_tries {
            self.max_mirror_tries = other.max_mirror_tries;
        }
        if other.checksum != default.checksum {
            self.checksum = other.checksum;
        }
        if other.ignore_missing != default.ignore_missing {
            self.ignore_missing = other.ignore_missing;
        }
        if other.interruptible != default.interruptible {
            self.interruptible = other.interruptible;
        }
        if other.update != default.update {
            self.update = other.update;
        }
        if other.download_list.is_some() {
            self.download_list = other.download_list;
        }
        if !other.skip_list.is_empty() {
            self.skip_list = other.skip_list;
        }
        if other.user_agent.is_some() {
            self.user_agent = other.user_agent;
        }
        if other.connect_timeout_secs != default.connect_timeout_secs {
            self.connect_timeout_secs = other.connect_timeout_secs;
        }
        if other.max_speed != default.max_speed {
            self.max_speed = other.max_speed;
        }
        if other.low_speed_limit != default.low_speed_limit {
            self.low_speed_limit = other.low_speed_limit;
        }
        if other.low_speed_time_secs != default.low_speed_time_secs {
            self.low_speed_time_secs = other.low_speed_time_secs;
        }
        if other.ssl_verify_peer != default.ssl_verify_peer {
            self.ssl_verify_peer = other.ssl_verify_peer;
        }
        if other.ssl_verify_host != default.ssl_verify_host {
            self.ssl_verify_host = other.ssl_verify_host;
        }
        if other.ip_resolve != default.ip_resolve {
            self.ip_resolve = other.ip_resolve;
        }

        self
    }
}

impl MirrorConfig {
    fn merge(mut self, other: MirrorConfig) -> Self {
        let default = MirrorConfig::default();

        if !other.urls.is_empty() {
            self.urls = other.urls;
        }
        if other.mirrorlist.is_some() {
            self.mirrorlist = other.mirrorlist;
        }
        if other.metalink.is_some() {
            self.metalink = other.metalink;
        }
        if other.local != default.local {
            self.local = other.local;
        }
        if other.allowed_failures != default.allowed_failures {
            self.allowed_failures = other.allowed_failures;
        }
        if other.adaptive_sorting != default.adaptive_sorting {
            self.adaptive_sorting = other.adaptive_sorting;
        }
        self.vars.extend(other.vars);

        self
    }
}

impl FastestMirrorConfig {
    fn merge(mut self, other: FastestMirrorConfig) -> Self {
        let default = FastestMirrorConfig::default();

        if other.enabled != default.enabled {
            self.enabled = other.enabled;
        }
        if other.cache_path != default.cache_path {
            self.cache_path = other.cache_path;
        }
        if other.max_age_secs != default.max_age_secs {
            self.max_age_secs = other.max_age_secs;
        }
        if other.timeout_secs != default.timeout_secs {
            self.timeout_secs = other.timeout_secs;
        }

        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.download.max_parallel_downloads, 3);
        assert_eq!(config.mirrors.allowed_failures, 4);

        let handle = config.to_handle();
        assert_eq!(handle.allowed_mirror_failures, Some(4));
        assert_eq!(handle.repo_type, RepoType::Yum);
        assert!(handle.validate_options().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        config.download.max_parallel_downloads = 0;
        assert!(config.validate().is_err());

        config.download.max_parallel_downloads = 100;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.download.repo_type = "arch".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.password = Some("secret".to_string());
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.download.ip_resolve = "v5".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.proxy.kind = Some("socks4".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_transfer_options_reach_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
[download]
update = true
download_list = ["primary", "filelists"]
skip_list = ["other"]
ip_resolve = "v4"
ssl_verify_host = false

[proxy]
url = "proxy.example:1080"
type = "socks5h"
"#,
        )
        .unwrap();

        let config = Config::load_from(&[&path]);
        assert!(config.warnings.is_empty());
        assert!(config.validate().is_ok());

        let handle = config.to_handle();
        assert!(handle.update);
        assert_eq!(
            handle.download_list,
            Some(vec!["primary".to_string(), "filelists".to_string()])
        );
        assert_eq!(handle.skip_list, vec!["other".to_string()]);
        assert_eq!(handle.http.ip_resolve, IpResolve::V4);
        assert!(!handle.http.ssl_verify_host);
        assert_eq!(
            handle.http.proxy.map(|p| p.resolved_url()),
            Some("socks5h://proxy.example:1080".to_string())
        );
    }

    #[test]
    fn test_layered_files() {
        let dir = tempdir().unwrap();
        let system = dir.path().join("system.toml");
        let user = dir.path().join("user.toml");
        fs::write(
            &system,
            r#"
[download]
max_parallel_downloads = 8
repo_type = "suse"

[mirrors]
urls = ["http://system.example/os"]
vars = { basearch = "x86_64" }
"#,
        )
        .unwrap();
        fs::write(
            &user,
            r#"
[mirrors]
urls = ["http://user.example/os"]
allowed_failures = 0
vars = { releasever = "40" }

[fastest_mirror]
enabled = true
"#,
        )
        .unwrap();

        let config = Config::load_from(&[system, user, dir.path().join("missing.toml")]);
        assert!(config.warnings.is_empty());
        assert_eq!(config.download.max_parallel_downloads, 8);
        assert_eq!(config.mirrors.urls, vec!["http://user.example/os"]);
        assert_eq!(config.mirrors.vars.len(), 2);

        let handle = config.to_handle();
        assert_eq!(handle.repo_type, RepoType::Suse);
        assert_eq!(handle.allowed_mirror_failures, None);
        assert!(handle.fastest_mirror.enabled);
        assert_eq!(handle.substitute("$releasever/$basearch"), "40/x86_64");
    }

    #[test]
    fn test_broken_file_is_reported() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "[download\nmax_parallel_downloads = ").unwrap();

        let config = Config::load_from(&[&path]);
        assert_eq!(config.warnings.len(), 1);
        assert_eq!(config.download, DownloadConfig::default());
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("REPOFETCH_PARALLEL", "6"),
            ("REPOFETCH_URLS", "http://a.example/os, http://b.example/os,"),
            ("REPOFETCH_FASTEST_MIRROR", "true"),
            ("REPOFETCH_PROXY", "http://proxy:3128"),
        ]
        .into_iter()
        .collect();

        let config = Config::default().apply_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.download.max_parallel_downloads, 6);
        assert_eq!(
            config.mirrors.urls,
            vec!["http://a.example/os", "http://b.example/os"]
        );
        assert!(config.fastest_mirror.enabled);

        let handle = config.to_handle();
        assert_eq!(handle.http.proxy.unwrap().url, "http://proxy:3128");
    }
}
