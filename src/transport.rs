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

//! Single-URL transfers.
//!
//! The engine never talks to the network directly; it drives a [`Transport`]
//! once per attempt. Cancelling an attempt drops the future returned by
//! [`Transport::fetch`], so implementations must leave nothing running once
//! that future is dropped.

use crate::error::{RepoError, RepoResult};
use crate::handle::{is_local, Handle, HttpOptions};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RANGE};
use reqwest::{Client, Proxy, StatusCode};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

/// Stall guard used when no low-speed limit is configured
const STALL_TIMEOUT: Duration = Duration::from_secs(120);

/// Buffer size of local copies
const COPY_CHUNK: usize = 64 * 1024;

/// One fetch of one URL into one file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub destination: PathBuf,
    /// Continue an existing partial file from this offset
    pub resume_from: u64,
}

/// Byte-level progress sink handed to a transport
#[derive(Clone)]
pub struct Progress {
    report: Arc<dyn Fn(u64, u64) + Send + Sync>,
}

impl Progress {
    pub fn new(report: impl Fn(u64, u64) + Send + Sync + 'static) -> Self {
        Self {
            report: Arc::new(report),
        }
    }

    pub fn noop() -> Self {
        Self::new(|_, _| {})
    }

    /// Report `now` bytes of `total` (0 when unknown), counting resumed bytes
    pub fn report(&self, now: u64, total: u64) {
        (self.report)(now, total)
    }
}

/// Capability to fetch one URL
#[async_trait]
pub trait Transport: Send + Sync {
    /// Fetch `request.url` into `request.destination`, returning the number of
    /// bytes written by this call.
    async fn fetch(&self, request: &TransferRequest, progress: &Progress) -> RepoResult<u64>;

    /// Cheap reachability probe returning the observed latency
    async fn probe(&self, url: &str, limit: Duration) -> RepoResult<Duration>;

    /// Whether partial files can be continued with `resume_from`
    fn supports_resume(&self) -> bool {
        true
    }
}

/// HTTP(S) transport on top of reqwest
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    options: HttpOptions,
}

impl HttpTransport {
    pub fn new(options: &HttpOptions) -> RepoResult<Self> {
        let mut headers = HeaderMap::new();
        for (name, value) in &options.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| RepoError::bad_option("http_headers", e.to_string()))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| RepoError::bad_option("http_headers", e.to_string()))?;
            headers.insert(name, value);
        }

        let mut builder = Client::builder()
            .pool_idle_timeout(Duration::from_secs(90))
            .connect_timeout(options.connect_timeout)
            .tcp_nodelay(true)
            .user_agent(options.user_agent.clone())
            .default_headers(headers)
            .danger_accept_invalid_certs(!options.ssl_verify_peer)
            .danger_accept_invalid_hostnames(!options.ssl_verify_host)
            .local_address(options.ip_resolve.local_address());

        if let Some(proxy) = &options.proxy {
            let url = proxy.resolved_url();
            let mut p = Proxy::all(&url).map_err(|e| RepoError::BadUrl {
                url: url.clone(),
                reason: e.to_string(),
            })?;
            if let Some(auth) = &proxy.auth {
                p = p.basic_auth(&auth.username, &auth.password);
            }
            builder = builder.proxy(p);
        }

        let client = builder
            .build()
            .map_err(|e| RepoError::bad_option("http", format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            options: options.clone(),
        })
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.client.get(url);
        match &self.options.auth {
            Some(auth) => request.basic_auth(&auth.username, Some(&auth.password)),
            None => request,
        }
    }

    /// Chunk wait bound and low-speed window
    fn window(&self) -> (Duration, Option<u64>) {
        if self.options.low_speed_limit > 0 && !self.options.low_speed_time.is_zero() {
            (self.options.low_speed_time, Some(self.options.low_speed_limit))
        } else {
            (STALL_TIMEOUT, None)
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, request: &TransferRequest, progress: &Progress) -> RepoResult<u64> {
        let url = request.url.as_str();
        let mut builder = self.get(url);
        if request.resume_from > 0 {
            builder = builder.header(RANGE, format!("bytes={}-", request.resume_from));
        }

        let response = builder.send().await.map_err(|e| RepoError::transport(url, e))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RepoError::BadStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        // A server ignoring the range sends the whole body again
        let resumed = request.resume_from > 0 && status == StatusCode::PARTIAL_CONTENT;
        let offset = if resumed { request.resume_from } else { 0 };
        let mut file = open_destination(&request.destination, resumed).await?;
        let total = response.content_length().map(|len| len + offset).unwrap_or(0);

        let (window, limit) = self.window();
        let mut stream = response.bytes_stream();
        let started = Instant::now();
        let mut window_start = Instant::now();
        let mut window_bytes = 0u64;
        let mut written = 0u64;

        loop {
            let chunk = match timeout(window, stream.next()).await {
                Ok(Some(Ok(chunk))) => chunk,
                Ok(Some(Err(e))) => return Err(RepoError::transport(url, e)),
                Ok(None) => break,
                Err(_) => {
                    return Err(match limit {
                        Some(limit) => RepoError::LowSpeed {
                            url: url.to_string(),
                            limit,
                            seconds: window.as_secs(),
                        },
                        None => RepoError::transport(url, "download stalled"),
                    })
                }
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| RepoError::io(&request.destination, e))?;
            let len = chunk.len() as u64;
            written += len;
            window_bytes += len;
            progress.report(offset + written, total);

            if let Some(limit) = limit {
                let elapsed = window_start.elapsed();
                if elapsed >= window {
                    if window_bytes < limit.saturating_mul(elapsed.as_secs().max(1)) {
                        return Err(RepoError::LowSpeed {
                            url: url.to_string(),
                            limit,
                            seconds: window.as_secs(),
                        });
                    }
                    window_start = Instant::now();
                    window_bytes = 0;
                }
            }

            if self.options.max_speed > 0 {
                let due = Duration::from_secs_f64(written as f64 / self.options.max_speed as f64);
                let elapsed = started.elapsed();
                if due > elapsed {
                    tokio::time::sleep(due - elapsed).await;
                }
            }
        }

        file.flush()
            .await
            .map_err(|e| RepoError::io(&request.destination, e))?;
        debug!(url, bytes = written, resumed, "transfer finished");
        Ok(written)
    }

    async fn probe(&self, url: &str, limit: Duration) -> RepoResult<Duration> {
        let start = Instant::now();
        match timeout(limit, self.client.head(url).send()).await {
            Ok(Ok(_)) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(RepoError::transport(url, e)),
            Err(_) => Err(RepoError::transport(url, "probe timed out")),
        }
    }
}

/// Copies from the local file system (`file://` URLs and absolute paths)
#[derive(Debug, Clone, Default)]
pub struct FileTransport;

impl FileTransport {
    fn source_path(url: &str) -> PathBuf {
        PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
    }
}

#[async_trait]
impl Transport for FileTransport {
    async fn fetch(&self, request: &TransferRequest, progress: &Progress) -> RepoResult<u64> {
        let source = Self::source_path(&request.url);
        let total = tokio::fs::metadata(&source)
            .await
            .map_err(|e| RepoError::transport(&request.url, e))?
            .len();
        progress.report(0, total);

        let mut reader = File::open(&source)
            .await
            .map_err(|e| RepoError::transport(&request.url, e))?;
        let mut writer = open_destination(&request.destination, false).await?;
        let mut buf = vec![0u8; COPY_CHUNK];
        let mut copied = 0u64;
        loop {
            let n = reader
                .read(&mut buf)
                .await
                .map_err(|e| RepoError::transport(&request.url, e))?;
            if n == 0 {
                break;
            }
            writer
                .write_all(&buf[..n])
                .await
                .map_err(|e| RepoError::io(&request.destination, e))?;
            copied += n as u64;
            progress.report(copied, total);
        }
        writer
            .flush()
            .await
            .map_err(|e| RepoError::io(&request.destination, e))?;
        Ok(copied)
    }

    async fn probe(&self, url: &str, _limit: Duration) -> RepoResult<Duration> {
        let start = Instant::now();
        tokio::fs::metadata(Self::source_path(url))
            .await
            .map_err(|e| RepoError::transport(url, e))?;
        Ok(start.elapsed())
    }

    fn supports_resume(&self) -> bool {
        false
    }
}

/// Dispatches local URLs to [`FileTransport`] and the rest to [`HttpTransport`]
#[derive(Debug, Clone)]
pub struct DefaultTransport {
    http: HttpTransport,
    file: FileTransport,
}

impl DefaultTransport {
    pub fn new(handle: &Handle) -> RepoResult<Self> {
        Ok(Self {
            http: HttpTransport::new(&handle.http)?,
            file: FileTransport,
        })
    }
}

#[async_trait]
impl Transport for DefaultTransport {
    async fn fetch(&self, request: &TransferRequest, progress: &Progress) -> RepoResult<u64> {
        if is_local(&request.url) {
            let mut request = request.clone();
            request.resume_from = 0;
            self.file.fetch(&request, progress).await
        } else {
            self.http.fetch(request, progress).await
        }
    }

    async fn probe(&self, url: &str, limit: Duration) -> RepoResult<Duration> {
        if is_local(url) {
            self.file.probe(url, limit).await
        } else {
            self.http.probe(url, limit).await
        }
    }
}

async fn open_destination(path: &Path, append: bool) -> RepoResult<File> {
    let result = if append {
        OpenOptions::new().append(true).open(path).await
    } else {
        File::create(path).await
    };
    result.map_err(|e| RepoError::io(path, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_file_transport_copies_and_reports() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("source.rpm");
        std::fs::write(&source, b"package payload").unwrap();
        let destination = dir.path().join("out.rpm");

        let seen = Arc::new(AtomicU64::new(0));
        let sink = seen.clone();
        let progress = Progress::new(move |now, _| sink.store(now, Ordering::SeqCst));

        let request = TransferRequest {
            url: format!("file://{}", source.display()),
            destination: destination.clone(),
            resume_from: 0,
        };
        let copied = FileTransport.fetch(&request, &progress).await.unwrap();
        assert_eq!(copied, 15);
        assert_eq!(seen.load(Ordering::SeqCst), 15);
        assert_eq!(std::fs::read(&destination).unwrap(), b"package payload");
    }

    #[tokio::test]
    async fn test_file_transport_missing_source() {
        let dir = tempdir().unwrap();
        let request = TransferRequest {
            url: dir.path().join("absent").display().to_string(),
            destination: dir.path().join("out"),
            resume_from: 0,
        };
        let err = FileTransport.fetch(&request, &Progress::noop()).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(FileTransport.probe(&request.url, Duration::from_secs(1)).await.is_err());
    }

    #[tokio::test]
    async fn test_dropped_file_fetch_stops_writing() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("big.rpm");
        std::fs::write(&source, vec![7u8; 4 * COPY_CHUNK]).unwrap();
        let destination = dir.path().join("big.rpm.part");
        let request = TransferRequest {
            url: source.display().to_string(),
            destination: destination.clone(),
            resume_from: 0,
        };

        let transport = FileTransport;
        let progress = Progress::noop();
        let fetch = transport.fetch(&request, &progress);
        assert!(timeout(Duration::ZERO, fetch).await.is_err());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!destination.exists());
    }

    #[test]
    fn test_http_transport_rejects_bad_header() {
        let options = HttpOptions {
            headers: vec![("X-Bad\n".to_string(), "v".to_string())],
            ..HttpOptions::default()
        };
        assert!(HttpTransport::new(&options).is_err());
    }

    #[test]
    fn test_http_transport_accepts_socks_proxy_and_ipv4() {
        let options = HttpOptions {
            proxy: Some(crate::handle::ProxyOptions {
                url: "proxy.example:1080".to_string(),
                kind: Some(crate::handle::ProxyType::Socks5Hostname),
                auth: None,
            }),
            ip_resolve: crate::handle::IpResolve::V4,
            ssl_verify_host: false,
            ..HttpOptions::default()
        };
        assert!(HttpTransport::new(&options).is_ok());
    }

    #[test]
    fn test_http_window() {
        let transport = HttpTransport::new(&HttpOptions::default()).unwrap();
        assert_eq!(transport.window(), (Duration::from_secs(30), Some(1000)));

        let options = HttpOptions {
            low_speed_limit: 0,
            ..HttpOptions::default()
        };
        let transport = HttpTransport::new(&options).unwrap();
        assert_eq!(transport.window(), (STALL_TIMEOUT, None));
    }
}
