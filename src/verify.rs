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

//! Checksum and signature verification of completed artifacts.

use crate::downloader::DownloadTarget;
use crate::error::{RepoError, RepoResult};
use md5::Md5;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;

/// Supported digest algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumType {
    Md5,
    Sha1,
    Sha224,
    Sha256,
    Sha384,
    Sha512,
}

impl ChecksumType {
    /// Length of the hex digest
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumType::Md5 => 32,
            ChecksumType::Sha1 => 40,
            ChecksumType::Sha224 => 56,
            ChecksumType::Sha256 => 64,
            ChecksumType::Sha384 => 96,
            ChecksumType::Sha512 => 128,
        }
    }
}

impl FromStr for ChecksumType {
    type Err = RepoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace('-', "").as_str() {
            "md5" => Ok(ChecksumType::Md5),
            "sha" | "sha1" => Ok(ChecksumType::Sha1),
            "sha224" => Ok(ChecksumType::Sha224),
            "sha256" => Ok(ChecksumType::Sha256),
            "sha384" => Ok(ChecksumType::Sha384),
            "sha512" => Ok(ChecksumType::Sha512),
            _ => Err(RepoError::UnknownChecksum {
                name: s.to_string(),
            }),
        }
    }
}

impl fmt::Display for ChecksumType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChecksumType::Md5 => "md5",
            ChecksumType::Sha1 => "sha1",
            ChecksumType::Sha224 => "sha224",
            ChecksumType::Sha256 => "sha256",
            ChecksumType::Sha384 => "sha384",
            ChecksumType::Sha512 => "sha512",
        };
        write!(f, "{}", name)
    }
}

/// An expected digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Checksum {
    pub kind: ChecksumType,
    /// Lowercase hex digest
    pub value: String,
}

impl Checksum {
    pub fn new(kind: ChecksumType, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into().to_ascii_lowercase(),
        }
    }

    /// Parse `name` and `value`, rejecting digests of the wrong length
    pub fn parse(name: &str, value: &str) -> RepoResult<Self> {
        let kind: ChecksumType = name.parse()?;
        let value = value.trim();
        if value.len() != kind.hex_len() || !value.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(RepoError::bad_option(
                "checksum",
                format!("'{}' is not a valid {} digest", value, kind),
            ));
        }
        Ok(Self::new(kind, value))
    }

    /// Compute the digest of a file and compare it with this one
    pub fn check_file(&self, path: &Path) -> RepoResult<()> {
        let actual = file_digest(path, self.kind).map_err(|e| RepoError::io(path, e))?;
        if actual == self.value {
            Ok(())
        } else {
            Err(RepoError::BadChecksum {
                file: path.display().to_string(),
                expected: format!("{}:{}", self.kind, self.value),
                actual: format!("{}:{}", self.kind, actual),
            })
        }
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.value)
    }
}

/// Hex digest of a whole file
pub fn file_digest(path: &Path, kind: ChecksumType) -> io::Result<String> {
    let reader = BufReader::new(File::open(path)?);
    match kind {
        ChecksumType::Md5 => digest_reader::<Md5, _>(reader),
        ChecksumType::Sha1 => digest_reader::<Sha1, _>(reader),
        ChecksumType::Sha224 => digest_reader::<Sha224, _>(reader),
        ChecksumType::Sha256 => digest_reader::<Sha256, _>(reader),
        ChecksumType::Sha384 => digest_reader::<Sha384, _>(reader),
        ChecksumType::Sha512 => digest_reader::<Sha512, _>(reader),
    }
}

fn digest_reader<D: Digest, R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Outcome of verifying one artifact
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verification {
    Valid,
    Invalid(RepoError),
}

/// Validates a completed artifact before it is promoted to its destination.
///
/// Called from a blocking thread, never from the scheduling loop.
pub trait Verifier: Send + Sync {
    fn verify(&self, path: &Path, target: &DownloadTarget) -> Verification;
}

/// Detached signature verification hook (GPG internals live outside this crate).
pub trait SignatureCheck: Send + Sync {
    /// Return `Err(reason)` when the signature of `path` does not validate
    fn check(&self, path: &Path) -> Result<(), String>;
}

/// Size, checksum and optional signature verification
#[derive(Clone, Default)]
pub struct StandardVerifier {
    checksums: bool,
    signature: Option<Arc<dyn SignatureCheck>>,
}

impl StandardVerifier {
    pub fn new(checksums: bool, signature: Option<Arc<dyn SignatureCheck>>) -> Self {
        Self {
            checksums,
            signature,
        }
    }

    fn run(&self, path: &Path, target: &DownloadTarget) -> RepoResult<()> {
        if let Some(expected) = target.expected_size {
            let actual = std::fs::metadata(path)
                .map_err(|e| RepoError::io(path, e))?
                .len();
            if actual != expected {
                return Err(RepoError::BadSize {
                    file: target.path.clone(),
                    expected,
                    actual,
                });
            }
        }

        if self.checksums {
            for checksum in &target.checksums {
                checksum.check_file(path).map_err(|e| match e {
                    RepoError::BadChecksum {
                        expected, actual, ..
                    } => RepoError::BadChecksum {
                        file: target.path.clone(),
                        expected,
                        actual,
                    },
                    other => other,
                })?;
            }
        }

        if target.check_signature {
            if let Some(signature) = &self.signature {
                signature.check(path).map_err(|reason| RepoError::BadGpg {
                    file: target.path.clone(),
                    reason,
                })?;
            }
        }

        Ok(())
    }
}

impl Verifier for StandardVerifier {
    fn verify(&self, path: &Path, target: &DownloadTarget) -> Verification {
        match self.run(path, target) {
            Ok(()) => Verification::Valid,
            Err(e) => Verification::Invalid(e),
        }
    }
}

impl fmt::Debug for StandardVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StandardVerifier")
            .field("checksums", &self.checksums)
            .field("signature", &self.signature.is_some())
            .finish()
    }
}
