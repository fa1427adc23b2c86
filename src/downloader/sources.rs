/*
 * repofetch - Mirror-aware parallel downloader for linux package repositories.
 * Copyright (C) 2025  repofetch contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 */

//! Mirrorlist and metalink documents.

use crate::error::{RepoError, RepoResult};
use crate::verify::Checksum;
use regex::Regex;
use std::sync::OnceLock;
use tracing::debug;

/// Name under which a fetched mirrorlist is kept in the destination directory
pub const MIRRORLIST_FILE: &str = "mirrorlist";
/// Name under which a fetched metalink is kept in the destination directory
pub const METALINK_FILE: &str = "metalink.xml";
/// File a yum metalink describes
pub const REPOMD_NAME: &str = "repomd.xml";
/// Suffix stripped from metalink URLs to get the repository base
pub const REPOMD_SUFFIX: &str = "repodata/repomd.xml";

const MIRROR_SCHEMES: &[&str] = &["http://", "https://", "ftp://", "file://"];

fn has_mirror_scheme(url: &str) -> bool {
    MIRROR_SCHEMES.iter().any(|s| url.starts_with(s))
}

/// Parse a mirrorlist: one URL per line, `#` starts a comment.
pub fn parse_mirrorlist(content: &str) -> RepoResult<Vec<String>> {
    let mut urls = Vec::new();
    for line in content.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        if has_mirror_scheme(line) {
            urls.push(line.to_string());
        } else {
            debug!(line, "skipping mirrorlist entry with unsupported scheme");
        }
    }

    if urls.is_empty() {
        return Err(RepoError::Mirrorlist {
            reason: "no usable URL in mirrorlist".to_string(),
        });
    }
    Ok(urls)
}

/// A mirror entry of a metalink
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetalinkUrl {
    pub url: String,
    pub protocol: Option<String>,
    pub location: Option<String>,
    /// 0 to 100, higher is preferred
    pub preference: u32,
}

/// The parts of a metalink document the engine uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metalink {
    pub filename: String,
    pub timestamp: Option<i64>,
    pub size: Option<u64>,
    /// Expected digests of `filename`
    pub checksums: Vec<Checksum>,
    /// Sorted by descending preference, document order within equal preference
    pub urls: Vec<MetalinkUrl>,
}

impl Metalink {
    /// Repository base URLs, with the `repodata/repomd.xml` suffix removed
    pub fn base_urls(&self) -> Vec<String> {
        self.urls
            .iter()
            .filter_map(|u| {
                let base = u.url.strip_suffix(REPOMD_SUFFIX)?;
                Some(base.trim_end_matches('/').to_string())
            })
            .collect()
    }
}

struct MetalinkPatterns {
    file: Regex,
    timestamp: Regex,
    size: Regex,
    hash: Regex,
    url: Regex,
    attr: Regex,
}

fn patterns() -> &'static MetalinkPatterns {
    static PATTERNS: OnceLock<MetalinkPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| MetalinkPatterns {
        file: Regex::new(r#"(?s)<file\s+name="([^"]+)"\s*>(.*?)</file>"#).expect("valid regex"),
        timestamp: Regex::new(r"<(?:\w+:)?timestamp>\s*(\d+)\s*</(?:\w+:)?timestamp>").expect("valid regex"),
        size: Regex::new(r"<size>\s*(\d+)\s*</size>").expect("valid regex"),
        hash: Regex::new(r#"<hash\s+type="([^"]+)"\s*>\s*([0-9a-fA-F]+)\s*</hash>"#).expect("valid regex"),
        url: Regex::new(r"(?s)<url\b([^>]*)>\s*([^<]+?)\s*</url>").expect("valid regex"),
        attr: Regex::new(r#"(\w+)="([^"]*)""#).expect("valid regex"),
    })
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// Extract the `<file name="filename">` entry of a metalink document.
pub fn parse_metalink(content: &str, filename: &str) -> RepoResult<Metalink> {
    let p = patterns();

    if !content.contains("<metalink") {
        return Err(RepoError::Metalink {
            reason: "document is not a metalink".to_string(),
        });
    }

    let block = p
        .file
        .captures_iter(content)
        .find(|c| &c[1] == filename)
        .map(|c| c.get(2).map(|m| m.as_str()).unwrap_or_default())
        .ok_or_else(|| RepoError::Metalink {
            reason: format!("no <file name=\"{}\"> entry", filename),
        })?;

    let timestamp = p.timestamp.captures(block).and_then(|c| c[1].parse().ok());
    let size = p.size.captures(block).and_then(|c| c[1].parse().ok());

    let checksums = p
        .hash
        .captures_iter(block)
        .filter_map(|c| match Checksum::parse(&c[1], &c[2]) {
            Ok(checksum) => Some(checksum),
            Err(e) => {
                debug!(error = %e, "ignoring metalink hash");
                None
            }
        })
        .collect();

    let mut urls: Vec<MetalinkUrl> = p
        .url
        .captures_iter(block)
        .filter_map(|c| {
            let url = unescape(&c[2]);
            if !has_mirror_scheme(&url) {
                return None;
            }
            let mut entry = MetalinkUrl {
                url,
                protocol: None,
                location: None,
                preference: 100,
            };
            for attr in p.attr.captures_iter(&c[1]) {
                match &attr[1] {
                    "protocol" => entry.protocol = Some(attr[2].to_string()),
                    "location" => entry.location = Some(attr[2].to_string()),
                    "preference" => entry.preference = attr[2].parse().unwrap_or(100),
                    _ => {}
                }
            }
            Some(entry)
        })
        .collect();

    if urls.is_empty() {
        return Err(RepoError::Metalink {
            reason: format!("no usable URL for '{}'", filename),
        });
    }
    urls.sort_by(|a, b| b.preference.cmp(&a.preference));

    Ok(Metalink {
        filename: filename.to_string(),
        timestamp,
        size,
        checksums,
        urls,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::verify::ChecksumType;

    const METALINK: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<metalink version="3.0" xmlns="http://www.metalinker.org/" xmlns:mm0="http://fedorahosted.org/mirrormanager">
 <files>
  <file name="repomd.xml">
   <mm0:timestamp>1700000000</mm0:timestamp>
   <size>4127</size>
   <verification>
    <hash type="md5">5d41402abc4b2a76b9719d911017c592</hash>
    <hash type="sha256">2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824</hash>
    <hash type="crc32">deadbeef</hash>
   </verification>
   <resources maxconnections="1">
    <url protocol="http" type="http" location="DE" preference="90">http://de.example/fedora/40/os/repodata/repomd.xml</url>
    <url protocol="https" type="https" location="US" preference="100">https://us.example/fedora/40/os/repodata/repomd.xml</url>
    <url protocol="rsync" type="rsync" location="US" preference="100">rsync://us.example/fedora/40/os/repodata/repomd.xml</url>
    <url protocol="https" type="https" location="FR" preference="90">https://fr.example/fedora/40/os/repodata/repomd.xml?a=1&amp;b=2</url>
   </resources>
  </file>
 </files>
</metalink>
"#;

    #[test]
    fn test_parse_mirrorlist() {
        let content = "# fedora mirrors\n\nhttp://a.example/repo/\nhttps://b.example/repo # fast\nrsync://c.example/repo\n  ftp://d.example/repo  \n";
        let urls = parse_mirrorlist(content).unwrap();
        assert_eq!(
            urls,
            vec![
                "http://a.example/repo/",
                "https://b.example/repo",
                "ftp://d.example/repo"
            ]
        );
    }

    #[test]
    fn test_empty_mirrorlist_is_an_error() {
        assert!(matches!(
            parse_mirrorlist("# nothing here\n"),
            Err(RepoError::Mirrorlist { .. })
        ));
    }

    #[test]
    fn test_parse_metalink() {
        let metalink = parse_metalink(METALINK, REPOMD_NAME).unwrap();
        assert_eq!(metalink.timestamp, Some(1_700_000_000));
        assert_eq!(metalink.size, Some(4127));
        assert_eq!(metalink.checksums.len(), 2);
        assert_eq!(metalink.checksums[1].kind, ChecksumType::Sha256);

        let urls: Vec<_> = metalink.urls.iter().map(|u| u.url.as_str()).collect();
        assert_eq!(
            urls,
            vec![
                "https://us.example/fedora/40/os/repodata/repomd.xml",
                "http://de.example/fedora/40/os/repodata/repomd.xml",
                "https://fr.example/fedora/40/os/repodata/repomd.xml?a=1&b=2",
            ]
        );
        assert_eq!(metalink.urls[0].location.as_deref(), Some("US"));
    }

    #[test]
    fn test_metalink_base_urls() {
        let metalink = parse_metalink(METALINK, REPOMD_NAME).unwrap();
        assert_eq!(
            metalink.base_urls(),
            vec!["https://us.example/fedora/40/os", "http://de.example/fedora/40/os"]
        );
    }

    #[test]
    fn test_metalink_missing_file() {
        assert!(matches!(
            parse_metalink(METALINK, "primary.xml.gz"),
            Err(RepoError::Metalink { .. })
        ));
        assert!(parse_metalink("<html></html>", REPOMD_NAME).is_err());
    }
}
