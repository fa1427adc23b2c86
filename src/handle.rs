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

//! Download session configuration.
//!
//! A [`Handle`] is built by the caller, validated once, and then shared
//! read-only (behind an `Arc`) by every task of a download run.

use crate::callbacks::Callbacks;
use crate::error::{RepoError, RepoResult};
use crate::verify::SignatureCheck;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use url::Url;

const SUPPORTED_SCHEMES: &[&str] = &["http", "https", "ftp", "file"];

/// Layout of the repository being fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RepoType {
    #[default]
    Yum,
    Suse,
    Deb,
}

/// Username and password pair
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Proxy protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyType {
    Http,
    Socks5,
    /// SOCKS5 with host names resolved by the proxy
    Socks5Hostname,
}

impl ProxyType {
    /// Parse `http`, `socks5` or `socks5h`; SOCKS4 is not supported
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "http" => Some(ProxyType::Http),
            "socks5" => Some(ProxyType::Socks5),
            "socks5h" | "socks5_hostname" => Some(ProxyType::Socks5Hostname),
            _ => None,
        }
    }

    fn scheme(self) -> &'static str {
        match self {
            ProxyType::Http => "http",
            ProxyType::Socks5 => "socks5",
            ProxyType::Socks5Hostname => "socks5h",
        }
    }
}

/// Proxy settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyOptions {
    /// Proxy URL, e.g. `http://proxy:3128` or `socks5://proxy:1080`
    pub url: String,
    /// Overrides the scheme of `url` when set
    pub kind: Option<ProxyType>,
    pub auth: Option<Credentials>,
}

impl ProxyOptions {
    /// Proxy URL with the scheme implied by `kind`
    pub fn resolved_url(&self) -> String {
        match self.kind {
            None => self.url.clone(),
            Some(kind) => {
                let rest = self.url.split_once("://").map(|(_, rest)| rest).unwrap_or(&self.url);
                format!("{}://{}", kind.scheme(), rest)
            }
        }
    }
}

/// Address family used to reach mirrors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IpResolve {
    #[default]
    Any,
    V4,
    V6,
}

impl IpResolve {
    /// Parse `whatever`, `v4` or `v6`
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "whatever" | "any" => Some(IpResolve::Any),
            "v4" | "ipv4" => Some(IpResolve::V4),
            "v6" | "ipv6" => Some(IpResolve::V6),
            _ => None,
        }
    }

    /// Local bind address that pins the address family
    pub fn local_address(self) -> Option<IpAddr> {
        match self {
            IpResolve::Any => None,
            IpResolve::V4 => Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            IpResolve::V6 => Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        }
    }
}

/// Transport-level options
#[derive(Debug, Clone)]
pub struct HttpOptions {
    pub user_agent: String,
    /// Extra request headers
    pub headers: Vec<(String, String)>,
    pub auth: Option<Credentials>,
    pub proxy: Option<ProxyOptions>,
    pub connect_timeout: Duration,
    pub ssl_verify_peer: bool,
    /// Check that the certificate matches the host name
    pub ssl_verify_host: bool,
    pub ip_resolve: IpResolve,
    /// Bytes per second per transfer, 0 = unlimited
    pub max_speed: u64,
    /// Abort a transfer slower than `low_speed_limit` B/s for this long
    pub low_speed_time: Duration,
    pub low_speed_limit: u64,
}

impl Default for HttpOptions {
    fn default() -> Self {
        Self {
            user_agent: format!("repofetch/{}", env!("CARGO_PKG_VERSION")),
            headers: Vec::new(),
            auth: None,
            proxy: None,
            connect_timeout: Duration::from_secs(30),
            ssl_verify_peer: true,
            ssl_verify_host: true,
            ip_resolve: IpResolve::Any,
            max_speed: 0,
            low_speed_time: Duration::from_secs(30),
            low_speed_limit: 1000,
        }
    }
}

/// Fastest-mirror detection options
#[derive(Debug, Clone)]
pub struct FastestMirrorOptions {
    pub enabled: bool,
    /// Persisted latency cache
    pub cache_path: Option<PathBuf>,
    /// Cache entries older than this are ignored
    pub max_age: Duration,
    /// Upper bound of one probe
    pub timeout: Duration,
}

impl Default for FastestMirrorOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            cache_path: None,
            max_age: Duration::from_secs(2_592_000), // 30 days
            timeout: Duration::from_secs(2),
        }
    }
}

/// Configuration of a download session
#[derive(Clone)]
pub struct Handle {
    /// Base URLs, tried in this order before any mirrorlist/metalink mirror
    pub urls: Vec<String>,
    pub mirrorlist_url: Option<String>,
    /// Takes precedence over `mirrorlist_url` when both are set
    pub metalink_url: Option<String>,
    /// Only local (`file://` or absolute path) sources are allowed
    pub local: bool,
    /// Stop after the mirror list is built
    pub fetch_mirrors_only: bool,
    pub destdir: PathBuf,
    pub repo_type: RepoType,
    /// `$name` substitutions applied to urls, mirrorlist and metalink
    pub varsub: Vec<(String, String)>,
    pub http: HttpOptions,
    pub max_parallel_downloads: usize,
    pub max_downloads_per_mirror: usize,
    /// Attempts per target, 0 = one per mirror
    pub max_mirror_tries: u32,
    /// Consecutive failures before a mirror is dropped, `None` = never
    pub allowed_mirror_failures: Option<u32>,
    pub adaptive_mirror_sorting: bool,
    pub fastest_mirror: FastestMirrorOptions,
    /// Abort the run on SIGINT
    pub interruptible: bool,
    pub checksum: bool,
    pub gpg_check: bool,
    /// Every target is optional
    pub ignore_missing: bool,
    /// Keep destination files that already exist; files with known
    /// checksums must still verify
    pub update: bool,
    /// Only targets matching one of these names are downloaded
    pub download_list: Option<Vec<String>>,
    /// Targets matching one of these names are skipped
    pub skip_list: Vec<String>,
    pub callbacks: Callbacks,
    pub signature_check: Option<Arc<dyn SignatureCheck>>,
}

impl Default for Handle {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            mirrorlist_url: None,
            metalink_url: None,
            local: false,
            fetch_mirrors_only: false,
            destdir: PathBuf::from("."),
            repo_type: RepoType::default(),
            varsub: Vec::new(),
            http: HttpOptions::default(),
            max_parallel_downloads: 3,
            max_downloads_per_mirror: 3,
            max_mirror_tries: 0,
            allowed_mirror_failures: Some(4),
            adaptive_mirror_sorting: true,
            fastest_mirror: FastestMirrorOptions::default(),
            interruptible: false,
            checksum: true,
            gpg_check: false,
            ignore_missing: false,
            update: false,
            download_list: None,
            skip_list: Vec::new(),
            callbacks: Callbacks::default(),
            signature_check: None,
        }
    }
}

impl Handle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set base URLs
    pub fn with_urls<I, S>(mut self, urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.urls = urls.into_iter().map(Into::into).collect();
        self
    }

    /// Set the destination directory
    pub fn with_destdir(mut self, destdir: impl Into<PathBuf>) -> Self {
        self.destdir = destdir.into();
        self
    }

    /// Add a `$name` substitution
    pub fn with_var(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.varsub.push((name.into(), value.into()));
        self
    }

    /// Apply variable substitution to `input`.
    ///
    /// Both `$name` and `${name}` forms are replaced; longer names win so that
    /// `$releasever_major` is not clobbered by `$releasever`.
    pub fn substitute(&self, input: &str) -> String {
        if self.varsub.is_empty() || !input.contains('$') {
            return input.to_string();
        }
        let mut vars: Vec<&(String, String)> = self.varsub.iter().collect();
        vars.sort_by(|a, b| b.0.len().cmp(&a.0.len()));

        let mut out = input.to_string();
        for (name, value) in vars {
            let name = name.trim_start_matches('$');
            out = out.replace(&format!("${{{}}}", name), value);
            out = out.replace(&format!("${}", name), value);
        }
        out
    }

    /// Base URLs after substitution
    pub fn resolved_urls(&self) -> Vec<String> {
        self.urls.iter().map(|u| self.substitute(u)).collect()
    }

    /// Check the configuration; no I/O is performed
    pub fn validate(&self) -> RepoResult<()> {
        if !self.has_sources() {
            return Err(RepoError::NoUrl);
        }
        self.validate_options()
    }

    /// Whether urls, a mirrorlist or a metalink are configured
    pub fn has_sources(&self) -> bool {
        !self.urls.is_empty() || self.mirrorlist_url.is_some() || self.metalink_url.is_some()
    }

    /// Like [`validate`](Self::validate) but allows a handle without any
    /// source, as used for one-shot URL downloads
    pub fn validate_options(&self) -> RepoResult<()> {
        if self.max_parallel_downloads == 0 {
            return Err(RepoError::bad_option("max_parallel_downloads", "must be at least 1"));
        }
        if self.max_downloads_per_mirror == 0 {
            return Err(RepoError::bad_option("max_downloads_per_mirror", "must be at least 1"));
        }
        if self.allowed_mirror_failures == Some(0) {
            return Err(RepoError::bad_option(
                "allowed_mirror_failures",
                "must be at least 1, use None to never drop mirrors",
            ));
        }
        if self.fastest_mirror.enabled && self.fastest_mirror.timeout.is_zero() {
            return Err(RepoError::bad_option("fastest_mirror_timeout", "must be positive"));
        }
        if self.http.low_speed_limit > 0 && self.http.low_speed_time.is_zero() {
            return Err(RepoError::bad_option(
                "low_speed_time",
                "must be positive when a low speed limit is set",
            ));
        }
        if self.destdir.as_os_str().is_empty() {
            return Err(RepoError::bad_option("destdir", "must not be empty"));
        }
        if self.gpg_check && self.signature_check.is_none() {
            return Err(RepoError::GpgNotSupported);
        }

        for url in self.resolved_urls() {
            self.check_source(&url)?;
        }
        if let Some(url) = &self.mirrorlist_url {
            self.check_source(&self.substitute(url))?;
        }
        if let Some(url) = &self.metalink_url {
            self.check_source(&self.substitute(url))?;
        }

        if let Some(proxy) = &self.http.proxy {
            let url = proxy.resolved_url();
            Url::parse(&url).map_err(|e| RepoError::BadUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        }
        for (name, _) in &self.http.headers {
            if name.is_empty() || name.contains(|c: char| c.is_whitespace() || c == ':') {
                return Err(RepoError::bad_option("http_headers", format!("invalid header name '{}'", name)));
            }
        }

        Ok(())
    }

    fn check_source(&self, url: &str) -> RepoResult<()> {
        let local = is_local(url);
        if self.local && !local {
            return Err(RepoError::NotLocal { url: url.to_string() });
        }
        if local && Path::new(url).is_absolute() {
            return Ok(());
        }
        let parsed = Url::parse(url).map_err(|e| RepoError::BadUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;
        if !SUPPORTED_SCHEMES.contains(&parsed.scheme()) {
            return Err(RepoError::BadUrl {
                url: url.to_string(),
                reason: format!("unsupported scheme '{}'", parsed.scheme()),
            });
        }
        Ok(())
    }
}

/// Whether `url` points to the local file system
pub fn is_local(url: &str) -> bool {
    url.starts_with("file://") || url.starts_with('/')
}

impl fmt::Debug for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("urls", &self.urls)
            .field("mirrorlist_url", &self.mirrorlist_url)
            .field("metalink_url", &self.metalink_url)
            .field("local", &self.local)
            .field("destdir", &self.destdir)
            .field("repo_type", &self.repo_type)
            .field("max_parallel_downloads", &self.max_parallel_downloads)
            .field("max_downloads_per_mirror", &self.max_downloads_per_mirror)
            .field("max_mirror_tries", &self.max_mirror_tries)
            .field("allowed_mirror_failures", &self.allowed_mirror_failures)
            .field("adaptive_mirror_sorting", &self.adaptive_mirror_sorting)
            .field("fastest_mirror", &self.fastest_mirror)
            .field("checksum", &self.checksum)
            .field("gpg_check", &self.gpg_check)
            .field("update", &self.update)
            .field("download_list", &self.download_list)
            .field("skip_list", &self.skip_list)
            .field("callbacks", &self.callbacks)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Handle {
        Handle::new().with_urls(["http://mirror.example/fedora"])
    }

    #[test]
    fn test_default_handle_is_valid_with_url() {
        assert!(base().validate().is_ok());
    }

    #[test]
    fn test_requires_some_url() {
        assert_eq!(Handle::new().validate(), Err(RepoError::NoUrl));

        let mut handle = Handle::new();
        handle.mirrorlist_url = Some("https://mirrors.example/mirrorlist?repo=fedora".to_string());
        assert!(handle.validate().is_ok());
    }

    #[test]
    fn test_rejects_zero_limits() {
        let mut handle = base();
        handle.max_parallel_downloads = 0;
        assert!(matches!(
            handle.validate(),
            Err(RepoError::BadOption { option: "max_parallel_downloads", .. })
        ));

        let mut handle = base();
        handle.max_downloads_per_mirror = 0;
        assert!(handle.validate().is_err());

        let mut handle = base();
        handle.allowed_mirror_failures = Some(0);
        assert!(handle.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_urls() {
        let handle = Handle::new().with_urls(["not a url"]);
        assert!(matches!(handle.validate(), Err(RepoError::BadUrl { .. })));

        let handle = Handle::new().with_urls(["gopher://old.example/repo"]);
        assert!(matches!(handle.validate(), Err(RepoError::BadUrl { .. })));
    }

    #[test]
    fn test_local_mode() {
        let mut handle = Handle::new().with_urls(["/srv/repo", "file:///srv/other"]);
        handle.local = true;
        assert!(handle.validate().is_ok());

        handle.urls.push("https://mirror.example/repo".to_string());
        assert!(matches!(handle.validate(), Err(RepoError::NotLocal { .. })));
    }

    #[test]
    fn test_gpg_requires_checker() {
        let mut handle = base();
        handle.gpg_check = true;
        assert_eq!(handle.validate(), Err(RepoError::GpgNotSupported));
    }

    #[test]
    fn test_substitution() {
        let handle = Handle::new()
            .with_urls(["http://dl.example/$releasever/${basearch}/os/"])
            .with_var("releasever", "40")
            .with_var("releasever_major", "4")
            .with_var("basearch", "x86_64");
        assert_eq!(handle.resolved_urls(), vec!["http://dl.example/40/x86_64/os/"]);
        assert_eq!(handle.substitute("$releasever_major-$releasever"), "4-40");
        assert_eq!(handle.substitute("plain"), "plain");
    }

    #[test]
    fn test_proxy_type_rewrites_scheme() {
        let mut proxy = ProxyOptions {
            url: "http://proxy.example:1080".to_string(),
            kind: None,
            auth: None,
        };
        assert_eq!(proxy.resolved_url(), "http://proxy.example:1080");

        proxy.kind = ProxyType::parse("socks5h");
        assert_eq!(proxy.resolved_url(), "socks5h://proxy.example:1080");

        proxy.url = "proxy.example:1080".to_string();
        proxy.kind = Some(ProxyType::Socks5);
        assert_eq!(proxy.resolved_url(), "socks5://proxy.example:1080");

        assert_eq!(ProxyType::parse("socks4"), None);
    }

    #[test]
    fn test_ip_resolve() {
        assert_eq!(IpResolve::parse("whatever"), Some(IpResolve::Any));
        assert_eq!(IpResolve::Any.local_address(), None);
        assert_eq!(
            IpResolve::parse("v6").and_then(IpResolve::local_address),
            Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        );
        assert!(IpResolve::V4.local_address().map_or(false, |a| a.is_ipv4()));
        assert_eq!(IpResolve::parse("v5"), None);
    }

    #[test]
    fn test_debug_redacts_password() {
        let creds = Credentials {
            username: "user".into(),
            password: "hunter2".into(),
        };
        assert!(!format!("{:?}", creds).contains("hunter2"));
    }
}
