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

//! Upstream registry client.
//!
//! Two upstream dialects hide behind the [`Upstream`] trait. A plain network
//! mirror serves the static JSON layout directly; the public registry API
//! instead offers paginated version lists and per-platform download
//! endpoints, which this client folds into the mirror-protocol shapes on the
//! fly. Which dialect applies is decided once, from the configured base URL.

use std::{fmt, time::Duration};

use bytes::Bytes;
use serde::Deserialize;
use thiserror::Error;
use tokio::time::Instant;
use url::Url;

use crate::{
    config::{Config, Platform, UpstreamDialect},
    metrics::Metrics,
    types::{ArchiveEntry, ProviderAddress, ProviderIndex, VersionInfo, VersionManifest},
};

/// Hostname of the public registry, which speaks the registry API rather
/// than the mirror protocol.
const REGISTRY_API_HOST: &str = "registry.terraform.io";

/// Request failure context.
#[derive(Error, Debug)]
#[error("GET request to {url}")]
pub struct RequestError {
    url: String,
    #[source]
    source: reqwest::Error,
}

impl RequestError {
    fn new(url: impl Into<String>) -> impl FnOnce(reqwest::Error) -> Self {
        let url = url.into();
        move |source| Self { url, source }
    }

    /// The target URL of the request.
    pub fn url(&self) -> &str {
        &self.url
    }
}

/// Error fetching from the upstream.
#[derive(Error, Debug)]
pub enum UpstreamError {
    /// The provider, version or archive does not exist upstream.
    #[error("not found upstream")]
    NotFound,

    /// Transport failure after all retries were exhausted.
    #[error(transparent)]
    Transport(#[from] RequestError),

    /// The upstream answered with an unexpected status code.
    #[error("unexpected status code: {0}")]
    Status(u16),

    /// The upstream answered 2xx with a body that does not parse.
    #[error("malformed upstream response")]
    Protocol(#[source] serde_json::Error),

    /// An archive URL could not be resolved against the upstream base.
    #[error("invalid archive url: {0:?}")]
    BadArchiveUrl(String),
}

/// Upstream fetch operations, as the mirror consumes them.
#[async_trait::async_trait]
pub trait Upstream: Send + Sync + fmt::Debug {
    /// Fetch the version index for a provider.
    async fn fetch_index(&self, provider: &ProviderAddress)
        -> Result<ProviderIndex, UpstreamError>;

    /// Fetch the per-platform manifest for one provider version.
    async fn fetch_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
    ) -> Result<VersionManifest, UpstreamError>;

    /// Fetch an archive. Relative URLs resolve against the configured base.
    async fn fetch_archive(&self, url: &str) -> Result<Bytes, UpstreamError>;
}

/// Body of a registry-API version listing.
#[derive(Debug, Deserialize)]
struct RegistryVersions {
    versions: Vec<RegistryVersion>,
}

#[derive(Debug, Deserialize)]
struct RegistryVersion {
    version: String,
}

/// Body of a registry-API per-platform download endpoint.
#[derive(Debug, Deserialize)]
struct DownloadInfo {
    download_url: String,
    shasum: String,
}

/// HTTP client for the configured upstream registry.
#[derive(Debug, Clone)]
pub struct UpstreamClient {
    base: Url,
    client: reqwest::Client,
    max_retries: u32,
    platforms: Vec<Platform>,
    registry_api: bool,
    metrics: Metrics,
}

impl UpstreamClient {
    /// Build a client from the process configuration.
    ///
    /// The dialect is resolved once: with `auto` the public registry
    /// hostname selects the registry API and everything else the mirror
    /// protocol.
    pub fn new(config: &Config, metrics: Metrics) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout())
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()?;

        let registry_api = match config.upstream_dialect {
            UpstreamDialect::Auto => {
                config.upstream_url.host_str() == Some(REGISTRY_API_HOST)
            }
            UpstreamDialect::Mirror => false,
            UpstreamDialect::Registry => true,
        };

        Ok(Self {
            base: config.upstream_url.clone(),
            client,
            max_retries: config.max_retries,
            platforms: config.registry_platforms.clone(),
            registry_api,
            metrics,
        })
    }

    /// Whether the upstream speaks the registry API.
    fn is_registry_api(&self) -> bool {
        self.registry_api
    }

    /// The base URL without its trailing slash, for path concatenation.
    fn base_str(&self) -> &str {
        self.base.as_str().trim_end_matches('/')
    }

    /// GET a metadata URL with retries.
    ///
    /// Transport failures and 5xx responses are retried with an exponential
    /// backoff of `2^attempt` seconds up to the configured maximum; 4xx
    /// responses are returned to the caller as-is, without retry.
    async fn fetch(&self, url: &str, kind: &'static str) -> Result<(Bytes, u16), UpstreamError> {
        let mut last_transport: Option<RequestError> = None;
        let mut last_status: Option<u16> = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let backoff = Duration::from_secs(1u64 << (attempt - 1));
                tracing::warn!(url, attempt, backoff = ?backoff, "retrying upstream fetch");
                tokio::time::sleep(backoff).await;
            }

            let start = Instant::now();
            let response = match self.client.get(url).send().await {
                Ok(response) => response,
                Err(error) => {
                    last_transport = Some(RequestError::new(url)(error));
                    continue;
                }
            };

            let status = response.status();
            self.metrics
                .record_upstream_request(status.as_u16(), start.elapsed(), kind);

            if status.is_server_error() {
                last_status = Some(status.as_u16());
                last_transport = None;
                continue;
            }

            // 2xx and 4xx both resolve the fetch; the caller decides what a
            // 4xx means for the operation.
            let body = response
                .bytes()
                .await
                .map_err(RequestError::new(url))?;

            return Ok((body, status.as_u16()));
        }

        match (last_transport, last_status) {
            (Some(error), _) => Err(error.into()),
            (None, Some(status)) => Err(UpstreamError::Status(status)),
            (None, None) => unreachable!("fetch loop runs at least once"),
        }
    }

    async fn fetch_mirror_index(
        &self,
        provider: &ProviderAddress,
    ) -> Result<ProviderIndex, UpstreamError> {
        let url = format!(
            "{}/{}/{}/{}/index.json",
            self.base_str(),
            provider.hostname(),
            provider.namespace(),
            provider.provider_type()
        );

        let (body, status) = self.fetch(&url, "index").await?;
        match status {
            404 => Err(UpstreamError::NotFound),
            200 => serde_json::from_slice(&body).map_err(UpstreamError::Protocol),
            other => Err(UpstreamError::Status(other)),
        }
    }

    async fn fetch_registry_index(
        &self,
        provider: &ProviderAddress,
    ) -> Result<ProviderIndex, UpstreamError> {
        let url = format!(
            "{}/v1/providers/{}/{}/versions",
            self.base_str(),
            provider.namespace(),
            provider.provider_type()
        );

        let (body, status) = self.fetch(&url, "index").await?;
        let listing: RegistryVersions = match status {
            404 => return Err(UpstreamError::NotFound),
            200 => serde_json::from_slice(&body).map_err(UpstreamError::Protocol)?,
            other => return Err(UpstreamError::Status(other)),
        };

        let versions = listing
            .versions
            .into_iter()
            .map(|entry| (entry.version, VersionInfo {}))
            .collect();

        Ok(ProviderIndex { versions })
    }

    async fn fetch_mirror_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
    ) -> Result<VersionManifest, UpstreamError> {
        let url = format!(
            "{}/{}/{}/{}/{version}.json",
            self.base_str(),
            provider.hostname(),
            provider.namespace(),
            provider.provider_type()
        );

        let (body, status) = self.fetch(&url, "version").await?;
        match status {
            404 => Err(UpstreamError::NotFound),
            200 => serde_json::from_slice(&body).map_err(UpstreamError::Protocol),
            other => Err(UpstreamError::Status(other)),
        }
    }

    /// Aggregate a manifest from the registry API's per-platform download
    /// endpoints.
    ///
    /// A 404 means the platform is simply not published and is skipped. If
    /// every probe comes back 404 the version itself does not exist; any
    /// other reason for ending up empty-handed is reported as the last
    /// failure seen.
    async fn fetch_registry_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
    ) -> Result<VersionManifest, UpstreamError> {
        let mut manifest = VersionManifest::default();
        let mut last_failure: Option<UpstreamError> = None;

        for platform in &self.platforms {
            let url = format!(
                "{}/v1/providers/{}/{}/{version}/download/{}/{}",
                self.base_str(),
                provider.namespace(),
                provider.provider_type(),
                platform.os,
                platform.arch
            );

            let (body, status) = match self.fetch(&url, "version").await {
                Ok(result) => result,
                Err(error) => {
                    tracing::debug!(%platform, %error, "platform probe failed");
                    last_failure = Some(error);
                    continue;
                }
            };

            if status == 404 {
                continue;
            }
            if status != 200 {
                last_failure = Some(UpstreamError::Status(status));
                continue;
            }

            let info: DownloadInfo = match serde_json::from_slice(&body) {
                Ok(info) => info,
                Err(error) => {
                    tracing::debug!(%platform, %error, "platform probe returned junk");
                    last_failure = Some(UpstreamError::Protocol(error));
                    continue;
                }
            };

            manifest.archives.insert(
                platform.to_string(),
                ArchiveEntry {
                    url: info.download_url,
                    hashes: vec![format!("zh:{}", info.shasum)],
                },
            );
        }

        if manifest.archives.is_empty() {
            return Err(last_failure.unwrap_or(UpstreamError::NotFound));
        }

        Ok(manifest)
    }
}

#[async_trait::async_trait]
impl Upstream for UpstreamClient {
    async fn fetch_index(
        &self,
        provider: &ProviderAddress,
    ) -> Result<ProviderIndex, UpstreamError> {
        if self.is_registry_api() {
            self.fetch_registry_index(provider).await
        } else {
            self.fetch_mirror_index(provider).await
        }
    }

    async fn fetch_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
    ) -> Result<VersionManifest, UpstreamError> {
        if self.is_registry_api() {
            self.fetch_registry_manifest(provider, version).await
        } else {
            self.fetch_mirror_manifest(provider, version).await
        }
    }

    async fn fetch_archive(&self, url: &str) -> Result<Bytes, UpstreamError> {
        let resolved = match Url::parse(url) {
            Ok(absolute) => absolute,
            Err(url::ParseError::RelativeUrlWithoutBase) => self
                .base
                .join(url)
                .map_err(|_| UpstreamError::BadArchiveUrl(url.to_owned()))?,
            Err(_) => return Err(UpstreamError::BadArchiveUrl(url.to_owned())),
        };

        let start = Instant::now();
        let response = self
            .client
            .get(resolved.clone())
            .send()
            .await
            .map_err(RequestError::new(resolved.as_str()))?;

        let status = response.status();
        self.metrics
            .record_upstream_request(status.as_u16(), start.elapsed(), "archive");

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(UpstreamError::NotFound);
        }
        if !status.is_success() {
            return Err(UpstreamError::Status(status.as_u16()));
        }

        response
            .bytes()
            .await
            .map_err(RequestError::new(resolved.as_str()))
            .map_err(Into::into)
    }
}
