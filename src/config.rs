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

//! Process configuration.
//!
//! All settings can be supplied as command line flags or `MIRROR_*`
//! environment variables and are fixed for the lifetime of the process.

use std::{fmt, path::PathBuf, str::FromStr, time::Duration};

use clap::{Parser, ValueEnum};
use thiserror::Error;
use url::Url;

/// The default platform probe set for the registry-API dialect.
///
/// The registry has no single manifest endpoint, so the upstream client has
/// to ask for each platform individually. These are the pairs providers
/// commonly publish; missing ones answer 404 and are skipped.
const DEFAULT_PLATFORMS: &str = "linux_amd64,linux_arm64,darwin_amd64,darwin_arm64,windows_amd64,windows_386,freebsd_amd64,openbsd_amd64";

/// Error validating the configuration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    /// The listen port is outside the valid range.
    #[error("port must be between 1 and 65535")]
    InvalidPort,

    /// A timeout was set to zero.
    #[error("{0} must be positive")]
    InvalidTimeout(&'static str),

    /// The cache directory is empty.
    #[error("cache directory must not be empty")]
    EmptyCacheDir,

    /// The public base URL is empty.
    #[error("base URL must not be empty")]
    EmptyBaseUrl,

    /// The public base URL carries more than one trailing slash.
    #[error("base URL has redundant trailing slashes: {0:?}")]
    MalformedBaseUrl(String),

    /// The registry platform probe set is empty.
    #[error("registry platform set must not be empty")]
    EmptyPlatforms,
}

/// Which storage backend to use.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StorageKind {
    /// Cache blobs on the local filesystem.
    Filesystem,
    /// Keep blobs in process memory. Useful for tests and scratch setups.
    Memory,
}

/// Which protocol the upstream speaks.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpstreamDialect {
    /// Decide from the upstream URL: the public registry hostname speaks
    /// the registry API, everything else the mirror protocol.
    Auto,
    /// Force the native mirror protocol (static JSON layout).
    Mirror,
    /// Force the registry API (version listing + per-platform downloads).
    Registry,
}

/// Log verbosity.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// The equivalent tracing filter directive.
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Log output format.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum LogFormat {
    /// One JSON object per line.
    Json,
    /// Human readable single-line output.
    Text,
}

/// An `<os>_<arch>` platform pair probed against the registry API.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Platform {
    /// Operating system, e.g. `linux`.
    pub os: String,
    /// CPU architecture, e.g. `amd64`.
    pub arch: String,
}

/// Error parsing a [`Platform`] from its `<os>_<arch>` form.
#[derive(Error, Debug, PartialEq, Eq)]
#[error("platform must have the form <os>_<arch>, got {0:?}")]
pub struct PlatformParseError(String);

impl FromStr for Platform {
    type Err = PlatformParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.split_once('_') {
            Some((os, arch)) if !os.is_empty() && !arch.is_empty() => Ok(Platform {
                os: os.to_owned(),
                arch: arch.to_owned(),
            }),
            _ => Err(PlatformParseError(input.to_owned())),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.os, self.arch)
    }
}

/// Mirror configuration.
#[derive(Parser, Clone, Debug)]
#[command(name = "provider-mirror", version, about)]
pub struct Config {
    /// Address to listen on for incoming connections.
    #[arg(long, env = "MIRROR_HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port to listen on.
    #[arg(long, env = "MIRROR_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Server read timeout, in seconds.
    #[arg(long, env = "MIRROR_READ_TIMEOUT_SECS", default_value_t = 30)]
    pub read_timeout_secs: u64,

    /// Server write timeout, in seconds.
    #[arg(long, env = "MIRROR_WRITE_TIMEOUT_SECS", default_value_t = 30)]
    pub write_timeout_secs: u64,

    /// How long to wait for connections to drain on shutdown, in seconds.
    #[arg(long, env = "MIRROR_SHUTDOWN_TIMEOUT_SECS", default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Which storage backend to cache blobs in.
    #[arg(long, env = "MIRROR_STORAGE", value_enum, default_value = "filesystem")]
    pub storage: StorageKind,

    /// Directory the filesystem backend caches blobs under.
    #[arg(
        long,
        env = "MIRROR_CACHE_DIR",
        default_value = "/var/cache/provider-mirror"
    )]
    pub cache_dir: PathBuf,

    /// Base URL of the upstream registry.
    #[arg(
        long,
        env = "MIRROR_UPSTREAM_URL",
        default_value = "https://registry.terraform.io"
    )]
    pub upstream_url: Url,

    /// Which protocol the upstream speaks. `auto` decides from the URL.
    #[arg(
        long,
        env = "MIRROR_UPSTREAM_DIALECT",
        value_enum,
        default_value = "auto"
    )]
    pub upstream_dialect: UpstreamDialect,

    /// Per-request timeout for upstream fetches, in seconds.
    #[arg(long, env = "MIRROR_UPSTREAM_TIMEOUT_SECS", default_value_t = 60)]
    pub upstream_timeout_secs: u64,

    /// How many times a failed metadata fetch is retried.
    #[arg(long, env = "MIRROR_MAX_RETRIES", default_value_t = 3)]
    pub max_retries: u32,

    /// Public base URL clients reach this mirror under. Rewritten archive
    /// URLs start with this.
    #[arg(long, env = "MIRROR_BASE_URL", default_value = "http://localhost:8080")]
    pub base_url: String,

    /// Platforms probed when the upstream speaks the registry API.
    #[arg(
        long,
        env = "MIRROR_REGISTRY_PLATFORMS",
        value_delimiter = ',',
        default_value = DEFAULT_PLATFORMS
    )]
    pub registry_platforms: Vec<Platform>,

    /// Log verbosity.
    #[arg(long, env = "MIRROR_LOG_LEVEL", value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Log output format.
    #[arg(long, env = "MIRROR_LOG_FORMAT", value_enum, default_value = "json")]
    pub log_format: LogFormat,

    /// Whether to record and expose Prometheus metrics.
    #[arg(
        long,
        env = "MIRROR_METRICS_ENABLED",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub metrics_enabled: bool,
}

impl Config {
    /// Validate the configuration and normalize the public base URL.
    ///
    /// Exactly one trailing slash is trimmed from the base URL; anything
    /// beyond that is treated as a configuration mistake rather than
    /// silently repaired.
    pub fn validate(mut self) -> Result<Self, ConfigError> {
        if self.port == 0 {
            return Err(ConfigError::InvalidPort);
        }

        if self.read_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("read timeout"));
        }
        if self.write_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("write timeout"));
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("shutdown timeout"));
        }
        if self.upstream_timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout("upstream timeout"));
        }

        if self.cache_dir.as_os_str().is_empty() {
            return Err(ConfigError::EmptyCacheDir);
        }

        if self.base_url.is_empty() {
            return Err(ConfigError::EmptyBaseUrl);
        }
        if let Some(trimmed) = self.base_url.strip_suffix('/') {
            if trimmed.is_empty() || trimmed.ends_with('/') {
                return Err(ConfigError::MalformedBaseUrl(self.base_url));
            }
            self.base_url = trimmed.to_owned();
        }

        if self.registry_platforms.is_empty() {
            return Err(ConfigError::EmptyPlatforms);
        }

        Ok(self)
    }

    /// Server read timeout.
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    /// Server write timeout.
    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }

    /// Shutdown drain deadline.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Upstream per-request timeout.
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}
