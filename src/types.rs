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

//! Wire types of the provider network mirror protocol.
//!
//! Two JSON documents make up the metadata side of the protocol: the *index*,
//! listing the versions known for a provider, and the *version manifest*,
//! listing the per-platform archives for one of those versions. Both use
//! [`BTreeMap`] so that serialization is deterministic: serving the same
//! cached document twice must produce identical bytes.

use std::{collections::BTreeMap, fmt};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

/// Error validating a [`ProviderAddress`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// A required component of the address is empty.
    #[error("{0} is required")]
    Missing(&'static str),

    /// A component contains a path separator or traversal sequence.
    #[error("invalid {field}: {value:?}")]
    Invalid {
        /// Which component was rejected.
        field: &'static str,
        /// The offending value.
        value: String,
    },
}

/// A provider's network address: the `(hostname, namespace, type)` triple.
///
/// Hostname is the registry DNS name (e.g. `registry.terraform.io`),
/// namespace the organisation (e.g. `hashicorp`) and type the short provider
/// name (e.g. `aws`). All three components double as path segments in both
/// the HTTP surface and the cache layout, so construction rejects anything
/// that could escape a directory.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ProviderAddress {
    hostname: String,
    namespace: String,
    provider_type: String,
}

impl ProviderAddress {
    /// Validate and construct a provider address.
    pub fn new(
        hostname: impl Into<String>,
        namespace: impl Into<String>,
        provider_type: impl Into<String>,
    ) -> Result<Self, AddressError> {
        let hostname = hostname.into();
        let namespace = namespace.into();
        let provider_type = provider_type.into();

        check_component("hostname", &hostname)?;
        check_component("namespace", &namespace)?;
        check_component("type", &provider_type)?;

        Ok(Self {
            hostname,
            namespace,
            provider_type,
        })
    }

    /// The registry DNS name.
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The organisation namespace.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// The short provider name.
    pub fn provider_type(&self) -> &str {
        &self.provider_type
    }

    /// Cache-relative path of an archive belonging to this provider.
    pub fn archive_path(&self, filename: &str) -> String {
        let Self {
            hostname,
            namespace,
            provider_type,
        } = self;
        format!("{hostname}/{namespace}/{provider_type}/{filename}")
    }
}

impl fmt::Display for ProviderAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.hostname, self.namespace, self.provider_type
        )
    }
}

fn check_component(field: &'static str, value: &str) -> Result<(), AddressError> {
    if value.is_empty() {
        return Err(AddressError::Missing(field));
    }

    if value.contains(['/', '\\']) || value == "." || value.contains("..") {
        return Err(AddressError::Invalid {
            field,
            value: value.to_owned(),
        });
    }

    Ok(())
}

/// Entry for one version in a [`ProviderIndex`].
///
/// The protocol reserves this object for future use; today it is always
/// empty and serializes as `{}`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionInfo {}

/// The index document: all versions known for one provider.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderIndex {
    /// Known versions, keyed by version string.
    pub versions: BTreeMap<String, VersionInfo>,
}

/// The version manifest document: per-platform archives for one version.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionManifest {
    /// Archives keyed by platform (`<os>_<arch>`, e.g. `linux_amd64`).
    pub archives: BTreeMap<String, ArchiveEntry>,
}

/// A downloadable provider archive for one platform.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchiveEntry {
    /// Where to download the archive. May be relative to the document it
    /// appears in.
    pub url: String,

    /// Content hashes, each prefixed with its algorithm tag (`zh:`, `h1:`).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hashes: Vec<String>,
}

/// Error validating an archive URL.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid archive url: {0:?}")]
pub struct InvalidUrl(pub String);

impl ArchiveEntry {
    /// Check that the archive URL is present and well-formed.
    ///
    /// Relative URLs are accepted; they are resolved against the upstream
    /// base when the archive is fetched.
    pub fn validate_url(&self) -> Result<(), InvalidUrl> {
        if self.url.is_empty() {
            return Err(InvalidUrl(self.url.clone()));
        }

        match Url::parse(&self.url) {
            Ok(_) | Err(url::ParseError::RelativeUrlWithoutBase) => Ok(()),
            Err(_) => Err(InvalidUrl(self.url.clone())),
        }
    }

    /// Whether the hash list already carries a strong directory hash.
    pub fn has_h1_hash(&self) -> bool {
        self.hashes.iter().any(|hash| hash.starts_with("h1:"))
    }
}
