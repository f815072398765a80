// Copyright 2023 Helsing GmbH
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! # Blob storage trait and implementations.
//!
//! This module contains the [`Storage`] trait, which the mirror uses to
//! persist the four kinds of blobs it caches: provider indexes, version
//! manifests, provider archives, and the two per-archive sidecars (the
//! computed directory hash and the original upstream URL).
//!
//! Blobs are written on first fetch and immutable afterwards; there is no
//! eviction. Writes must be atomic: a reader either sees a complete blob or
//! none at all. Absence is a distinct, non-fatal outcome and is reported as
//! [`StorageError::Missing`] rather than a bare IO failure, so that callers
//! can fall through to the upstream without inspecting error internals.

use std::{fmt, path::PathBuf, sync::Arc};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::types::ProviderAddress;

mod filesystem;
mod memory;

pub use filesystem::Filesystem;
pub use memory::InMemory;

/// Generic, shared error type.
///
/// As the underlying error type used by the implementation is not known,
/// this shared representation is used. The [`Arc`] allows errors to be
/// cloned while retaining as much information as possible.
pub type SharedError = Arc<dyn std::error::Error + Send + Sync>;

/// Error reading or writing a blob.
///
/// The only classification callers rely on is [`Missing`][StorageError::Missing]:
/// the cache-or-fetch path falls through to the upstream on it, while any
/// other error is surfaced to the client as a storage failure.
#[derive(thiserror::Error, Debug, Clone)]
pub enum StorageError {
    /// The blob does not exist.
    #[error("blob missing")]
    Missing(#[source] SharedError),

    /// Unknown error.
    #[error(transparent)]
    Other(#[from] SharedError),
}

/// Arbitrary storage instance.
pub type AnyStorage = Arc<dyn Storage>;

/// An open, readable archive blob.
///
/// Wraps the backend's reader together with the blob length when the backing
/// resource knows it (a file on disk, an in-memory buffer), so the edge can
/// emit a `Content-Length` header while streaming.
pub struct ArchiveStream {
    len: Option<u64>,
    reader: Box<dyn AsyncRead + Send + Unpin>,
}

impl ArchiveStream {
    /// Wrap a reader, with the total length if known.
    pub fn new(reader: impl AsyncRead + Send + Unpin + 'static, len: Option<u64>) -> Self {
        Self {
            len,
            reader: Box::new(reader),
        }
    }

    /// Total number of bytes this stream will yield, if known.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    /// The underlying reader.
    pub fn into_reader(self) -> Box<dyn AsyncRead + Send + Unpin> {
        self.reader
    }

    /// Drain the stream into memory.
    pub async fn collect(mut self) -> std::io::Result<Vec<u8>> {
        let mut buffer = match self.len {
            Some(len) => Vec::with_capacity(len as usize),
            None => Vec::new(),
        };
        self.reader.read_to_end(&mut buffer).await?;
        Ok(buffer)
    }
}

impl fmt::Debug for ArchiveStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveStream").field("len", &self.len).finish()
    }
}

/// # Storage for cached mirror blobs
///
/// Four namespaces share one trait: indexes and manifests are addressed by
/// provider (and version), archives and their sidecars by a cache-relative
/// path of the shape `hostname/namespace/type/<filename>.zip`.
///
/// ## Put semantics
///
/// All puts are atomic overwrites. Blobs are immutable in practice, but two
/// concurrent first-time fills may race on the same path; the last committed
/// write wins and readers never observe torn bytes.
///
/// ## Sidecars
///
/// Sidecar getters return `Ok(None)` when no sidecar exists. A missing hash
/// sidecar is an expected state (hashing is best-effort), not an error.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + fmt::Debug {
    /// Read the cached index document for a provider.
    async fn get_index(&self, provider: &ProviderAddress) -> Result<Bytes, StorageError>;

    /// Write the index document for a provider.
    async fn put_index(&self, provider: &ProviderAddress, data: &[u8])
        -> Result<(), StorageError>;

    /// Read the cached version manifest for a provider version.
    async fn get_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
    ) -> Result<Bytes, StorageError>;

    /// Write the version manifest for a provider version.
    async fn put_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
        data: &[u8],
    ) -> Result<(), StorageError>;

    /// Open a cached archive for reading. The caller owns the stream.
    async fn get_archive(&self, path: &str) -> Result<ArchiveStream, StorageError>;

    /// Write an archive blob.
    async fn put_archive(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Whether an archive blob exists.
    async fn archive_exists(&self, path: &str) -> Result<bool, StorageError>;

    /// Read the stored directory hash for an archive, if one was computed.
    async fn get_h1_hash(&self, path: &str) -> Result<Option<String>, StorageError>;

    /// Store the directory hash for an archive.
    async fn put_h1_hash(&self, path: &str, hash: &str) -> Result<(), StorageError>;

    /// Read the original upstream URL for an archive, if recorded.
    async fn get_upstream_url(&self, path: &str) -> Result<Option<String>, StorageError>;

    /// Record the original upstream URL for an archive.
    async fn put_upstream_url(&self, path: &str, url: &str) -> Result<(), StorageError>;
}

/// Error produced for blob paths that reduce to nothing.
#[derive(thiserror::Error, Debug, Clone)]
#[error("invalid blob path: {0:?}")]
pub struct InvalidPath(String);

/// Reduce a caller-supplied blob path to its normal components.
///
/// Leading separators, `.` and parent-directory references are dropped, so
/// the result always names something at or below a storage root. Paths that
/// reduce to nothing are rejected.
fn clean_path(path: &str) -> Result<PathBuf, StorageError> {
    use std::path::Component;

    let cleaned: PathBuf = std::path::Path::new(path)
        .components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part),
            _ => None,
        })
        .collect();

    if cleaned.as_os_str().is_empty() {
        return Err(StorageError::Other(Arc::new(InvalidPath(path.to_owned()))));
    }

    Ok(cleaned)
}

/// The cleaned path as a string key for map-backed storage.
fn clean_key(path: &str) -> Result<String, StorageError> {
    Ok(clean_path(path)?.to_string_lossy().into_owned())
}
