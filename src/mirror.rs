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

//! The mirror core: cache-or-fetch orchestration.
//!
//! Each of the three resource kinds follows the same outline: answer from
//! storage when possible, otherwise fetch upstream, persist, and serve the
//! fresh copy. Manifests have one important twist: the stored blob is
//! always the *raw upstream* document, and archive URLs are rewritten to
//! point at this mirror on every read. Rewriting on the read path means the
//! public base URL can change without invalidating the cache.
//!
//! Rewriting has a side effect: for every archive mentioned, the original
//! URL is recorded in a sidecar *before* any client can ask for the archive,
//! so a later cache miss on the archive path knows where to go.

use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use url::Url;

use crate::{
    digest,
    metrics::Metrics,
    storage::{AnyStorage, ArchiveStream, StorageError},
    types::{ProviderAddress, VersionManifest},
    upstream::{Upstream, UpstreamError},
};

/// Error serving a mirror operation.
///
/// The edge maps [`NotFound`][MirrorError::NotFound] to 404 and everything
/// else to a generic 500; the variants exist so logs and error counters can
/// tell the failure domains apart.
#[derive(Error, Debug)]
pub enum MirrorError {
    /// The provider, version or archive exists neither in cache nor
    /// upstream.
    #[error("not found")]
    NotFound,

    /// The upstream could not be reached, or kept answering errors after
    /// all retries.
    #[error("upstream request failed")]
    Upstream(#[source] UpstreamError),

    /// A document (from upstream or from cache) does not parse.
    #[error("malformed manifest document")]
    Protocol(#[source] serde_json::Error),

    /// Unexpected storage failure while reading.
    #[error("storage read failed")]
    StorageRead(#[source] StorageError),

    /// Unexpected storage failure while writing on the archive fill path.
    #[error("storage write failed")]
    StorageWrite(#[source] StorageError),

    /// Re-serializing a document failed.
    #[error("failed to serialize document")]
    Serialize(#[source] serde_json::Error),
}

impl MirrorError {
    /// Short label for error counters.
    pub fn cause(&self) -> &'static str {
        match self {
            MirrorError::NotFound => "not_found",
            MirrorError::Upstream(_) => "upstream_failed",
            MirrorError::Protocol(_) => "malformed_document",
            MirrorError::StorageRead(_) => "storage_read",
            MirrorError::StorageWrite(_) => "storage_write",
            MirrorError::Serialize(_) => "serialize",
        }
    }
}

impl From<UpstreamError> for MirrorError {
    fn from(error: UpstreamError) -> Self {
        match error {
            UpstreamError::NotFound => MirrorError::NotFound,
            UpstreamError::Protocol(error) => MirrorError::Protocol(error),
            other => MirrorError::Upstream(other),
        }
    }
}

/// The caching mirror service.
#[derive(Clone, Debug)]
pub struct Mirror {
    storage: AnyStorage,
    upstream: Arc<dyn Upstream>,
    base_url: String,
    metrics: Metrics,
}

impl Mirror {
    /// Create a mirror over a storage backend and an upstream client.
    ///
    /// `base_url` is the public URL clients reach this mirror under; one
    /// trailing slash is tolerated.
    pub fn new(
        storage: AnyStorage,
        upstream: Arc<dyn Upstream>,
        base_url: impl Into<String>,
        metrics: Metrics,
    ) -> Self {
        let mut base_url = base_url.into();
        if let Some(trimmed) = base_url.strip_suffix('/') {
            base_url = trimmed.to_owned();
        }

        Self {
            storage,
            upstream,
            base_url,
            metrics,
        }
    }

    /// Serve the version index for a provider.
    pub async fn get_index(&self, provider: &ProviderAddress) -> Result<Bytes, MirrorError> {
        match self.storage.get_index(provider).await {
            Ok(cached) => {
                self.metrics.record_cache_hit("index");
                tracing::debug!(%provider, "index served from cache");
                return Ok(cached);
            }
            Err(StorageError::Missing(_)) => self.metrics.record_cache_miss("index"),
            Err(error) => return Err(MirrorError::StorageRead(error)),
        }

        let index = self.upstream.fetch_index(provider).await?;
        let data = serde_json::to_vec(&index).map_err(MirrorError::Serialize)?;

        if let Err(error) = self.storage.put_index(provider, &data).await {
            tracing::warn!(%provider, %error, "failed to cache index");
        }

        tracing::info!(%provider, "index fetched from upstream");
        Ok(Bytes::from(data))
    }

    /// Serve the manifest for one provider version.
    ///
    /// Whether the raw document came from cache or was just fetched, the
    /// response always goes through the rewrite step.
    pub async fn get_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
    ) -> Result<Bytes, MirrorError> {
        let raw = match self.storage.get_manifest(provider, version).await {
            Ok(cached) => {
                self.metrics.record_cache_hit("version");
                tracing::debug!(%provider, version, "manifest served from cache");
                cached
            }
            Err(StorageError::Missing(_)) => {
                self.metrics.record_cache_miss("version");

                let manifest = self.upstream.fetch_manifest(provider, version).await?;
                let data = serde_json::to_vec(&manifest).map_err(MirrorError::Serialize)?;

                if let Err(error) = self.storage.put_manifest(provider, version, &data).await {
                    tracing::warn!(%provider, version, %error, "failed to cache manifest");
                }

                tracing::info!(%provider, version, "manifest fetched from upstream");
                Bytes::from(data)
            }
            Err(error) => return Err(MirrorError::StorageRead(error)),
        };

        self.rewrite_manifest(provider, &raw).await
    }

    /// Serve an archive blob, filling the cache from upstream on miss.
    pub async fn get_archive(&self, path: &str) -> Result<ArchiveStream, MirrorError> {
        match self.storage.get_archive(path).await {
            Ok(stream) => {
                self.metrics.record_cache_hit("archive");
                tracing::debug!(path, "archive served from cache");
                return Ok(stream);
            }
            Err(StorageError::Missing(_)) => self.metrics.record_cache_miss("archive"),
            Err(error) => return Err(MirrorError::StorageRead(error)),
        }

        // Only archives previously announced through a manifest have an
        // upstream sidecar; anything else is a client bypassing the flow.
        let upstream_url = match self.storage.get_upstream_url(path).await {
            Ok(Some(url)) if !url.is_empty() => url,
            Ok(_) => return Err(MirrorError::NotFound),
            Err(error) => return Err(MirrorError::StorageRead(error)),
        };

        let data = self.upstream.fetch_archive(&upstream_url).await?;
        tracing::info!(path, bytes = data.len(), "archive fetched from upstream");

        // Hashing is best effort: a malformed archive is still cached and
        // served, it just never gains an h1 entry in manifests.
        let buffer = data.clone();
        match tokio::task::spawn_blocking(move || digest::compute_h1(&buffer)).await {
            Ok(Ok(hash)) => {
                if let Err(error) = self.storage.put_h1_hash(path, &hash).await {
                    tracing::warn!(path, %error, "failed to store archive hash");
                }
            }
            Ok(Err(error)) => tracing::warn!(path, %error, "failed to hash archive"),
            Err(error) => tracing::warn!(path, %error, "archive hash task failed"),
        }

        self.storage
            .put_archive(path, &data)
            .await
            .map_err(MirrorError::StorageWrite)?;

        // Replay from the cache so the response comes from the committed
        // blob rather than the buffer we just wrote.
        self.storage
            .get_archive(path)
            .await
            .map_err(MirrorError::StorageRead)
    }

    /// Rewrite archive URLs in a raw manifest to point at this mirror and
    /// inject any directory hashes computed on earlier archive fetches.
    async fn rewrite_manifest(
        &self,
        provider: &ProviderAddress,
        raw: &[u8],
    ) -> Result<Bytes, MirrorError> {
        let mut manifest: VersionManifest =
            serde_json::from_slice(raw).map_err(MirrorError::Protocol)?;

        for (platform, archive) in manifest.archives.iter_mut() {
            if archive.url.is_empty() {
                continue;
            }

            // An unusable url is passed through untouched rather than
            // rewritten to a cache path we could never fill.
            if let Err(error) = archive.validate_url() {
                tracing::warn!(%platform, %error, "not rewriting unusable archive url");
                continue;
            }

            let upstream_url = archive.url.clone();
            let filename = archive_filename(&upstream_url);
            let local_path = provider.archive_path(&filename);

            if let Err(error) = self
                .storage
                .put_upstream_url(&local_path, &upstream_url)
                .await
            {
                tracing::warn!(%platform, path = %local_path, %error, "failed to record upstream url");
            }

            archive.url = format!("{}/{}", self.base_url, local_path);

            match self.storage.get_h1_hash(&local_path).await {
                Ok(Some(hash)) if !hash.is_empty() && !archive.has_h1_hash() => {
                    archive.hashes.push(hash);
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(%platform, path = %local_path, %error, "failed to read stored hash");
                }
            }
        }

        serde_json::to_vec(&manifest)
            .map(Bytes::from)
            .map_err(MirrorError::Serialize)
    }
}

/// The last path segment of an archive URL, used as the cache file name.
fn archive_filename(url: &str) -> String {
    let path = match Url::parse(url) {
        Ok(parsed) => parsed.path().trim_matches('/').to_owned(),
        Err(_) => url.to_owned(),
    };

    path.rsplit('/')
        .next()
        .filter(|segment| !segment.is_empty())
        .unwrap_or("archive.zip")
        .to_owned()
}
