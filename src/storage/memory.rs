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

use std::{
    collections::HashMap,
    io::Cursor,
    sync::{Mutex, PoisonError},
};

use super::*;

/// In-memory blob storage.
///
/// Holds every namespace in a [`HashMap`] behind one mutex. Nothing survives
/// a restart; this backend exists for tests and scratch deployments.
#[derive(Debug, Default)]
pub struct InMemory {
    shelves: Mutex<Shelves>,
}

#[derive(Debug, Default)]
struct Shelves {
    indexes: HashMap<String, Bytes>,
    manifests: HashMap<String, Bytes>,
    archives: HashMap<String, Bytes>,
    h1_hashes: HashMap<String, String>,
    upstream_urls: HashMap<String, String>,
}

#[derive(thiserror::Error, Debug)]
#[error("no cached blob at {0:?}")]
struct NotCached(String);

#[derive(thiserror::Error, Debug)]
#[error("storage mutex poisoned")]
struct Poisoned;

impl InMemory {
    /// Create an empty in-memory store.
    pub fn new() -> Self {
        Self::default()
    }

    fn with_shelves<T>(
        &self,
        f: impl FnOnce(&mut Shelves) -> Result<T, StorageError>,
    ) -> Result<T, StorageError> {
        let mut shelves = self
            .shelves
            .lock()
            .map_err(|_: PoisonError<_>| StorageError::Other(Arc::new(Poisoned)))?;
        f(&mut shelves)
    }

    fn missing(key: &str) -> StorageError {
        StorageError::Missing(Arc::new(NotCached(key.to_owned())))
    }
}

fn manifest_key(provider: &ProviderAddress, version: &str) -> String {
    format!("{provider}/{version}")
}

#[async_trait::async_trait]
impl Storage for InMemory {
    async fn get_index(&self, provider: &ProviderAddress) -> Result<Bytes, StorageError> {
        let key = provider.to_string();
        self.with_shelves(|shelves| {
            shelves
                .indexes
                .get(&key)
                .cloned()
                .ok_or_else(|| Self::missing(&key))
        })
    }

    async fn put_index(
        &self,
        provider: &ProviderAddress,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let key = provider.to_string();
        let data = Bytes::copy_from_slice(data);
        self.with_shelves(|shelves| {
            shelves.indexes.insert(key, data);
            Ok(())
        })
    }

    async fn get_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
    ) -> Result<Bytes, StorageError> {
        let key = manifest_key(provider, version);
        self.with_shelves(|shelves| {
            shelves
                .manifests
                .get(&key)
                .cloned()
                .ok_or_else(|| Self::missing(&key))
        })
    }

    async fn put_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        let key = manifest_key(provider, version);
        let data = Bytes::copy_from_slice(data);
        self.with_shelves(|shelves| {
            shelves.manifests.insert(key, data);
            Ok(())
        })
    }

    async fn get_archive(&self, path: &str) -> Result<ArchiveStream, StorageError> {
        let key = clean_key(path)?;
        let bytes = self.with_shelves(|shelves| {
            shelves
                .archives
                .get(&key)
                .cloned()
                .ok_or_else(|| Self::missing(&key))
        })?;

        let len = bytes.len() as u64;
        Ok(ArchiveStream::new(Cursor::new(bytes), Some(len)))
    }

    async fn put_archive(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let key = clean_key(path)?;
        let data = Bytes::copy_from_slice(data);
        self.with_shelves(|shelves| {
            shelves.archives.insert(key, data);
            Ok(())
        })
    }

    async fn archive_exists(&self, path: &str) -> Result<bool, StorageError> {
        let key = clean_key(path)?;
        self.with_shelves(|shelves| Ok(shelves.archives.contains_key(&key)))
    }

    async fn get_h1_hash(&self, path: &str) -> Result<Option<String>, StorageError> {
        let key = clean_key(path)?;
        self.with_shelves(|shelves| Ok(shelves.h1_hashes.get(&key).cloned()))
    }

    async fn put_h1_hash(&self, path: &str, hash: &str) -> Result<(), StorageError> {
        let key = clean_key(path)?;
        let hash = hash.to_owned();
        self.with_shelves(|shelves| {
            shelves.h1_hashes.insert(key, hash);
            Ok(())
        })
    }

    async fn get_upstream_url(&self, path: &str) -> Result<Option<String>, StorageError> {
        let key = clean_key(path)?;
        self.with_shelves(|shelves| Ok(shelves.upstream_urls.get(&key).cloned()))
    }

    async fn put_upstream_url(&self, path: &str, url: &str) -> Result<(), StorageError> {
        let key = clean_key(path)?;
        let url = url.to_owned();
        self.with_shelves(|shelves| {
            shelves.upstream_urls.insert(key, url);
            Ok(())
        })
    }
}
