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
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::atomic::{AtomicU64, Ordering},
};

use tokio::fs;

use super::*;

/// Counter distinguishing concurrent temp files within this process.
static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Filesystem-backed blob storage.
///
/// The cache layout mirrors the key structure:
///
/// ```text
/// <root>/<hostname>/<namespace>/<type>/index.json
/// <root>/<hostname>/<namespace>/<type>/<version>.json
/// <root>/<hostname>/<namespace>/<type>/<filename>.zip
/// <root>/<hostname>/<namespace>/<type>/<filename>.zip.h1
/// <root>/<hostname>/<namespace>/<type>/<filename>.zip.upstream
/// ```
///
/// Writes go to a temporary sibling first and are committed with a rename,
/// so concurrent readers never observe a half-written blob.
#[derive(Clone, Debug)]
pub struct Filesystem {
    root: PathBuf,
}

#[derive(thiserror::Error, Debug)]
#[error("io error at {path:?}")]
pub struct FilesystemError {
    path: PathBuf,
    #[source]
    error: std::io::Error,
}

impl FilesystemError {
    fn new(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |error| Self { path, error }
    }

    fn is_not_found(&self) -> bool {
        self.error.kind() == ErrorKind::NotFound
    }
}

impl From<FilesystemError> for StorageError {
    fn from(error: FilesystemError) -> Self {
        if error.is_not_found() {
            StorageError::Missing(Arc::new(error))
        } else {
            StorageError::Other(Arc::new(error))
        }
    }
}

impl Filesystem {
    /// Open a filesystem store rooted at `root`, creating the directory if
    /// needed. Fails when the root cannot be created or entered, so an
    /// unusable cache surfaces at startup rather than on the first request.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, FilesystemError> {
        let root = root.into();

        fs::create_dir_all(&root)
            .await
            .map_err(FilesystemError::new(&root))?;

        let root = fs::canonicalize(&root)
            .await
            .map_err(FilesystemError::new(&root))?;

        Ok(Self { root })
    }

    /// The cache root of this store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn index_path(&self, provider: &ProviderAddress) -> PathBuf {
        self.provider_dir(provider).join("index.json")
    }

    // The version string is reduced to normal path components like any other
    // caller supplied input, so it cannot climb out of the provider tree.
    fn manifest_path(
        &self,
        provider: &ProviderAddress,
        version: &str,
    ) -> Result<PathBuf, StorageError> {
        let file = clean_path(&format!("{version}.json"))?;
        Ok(self.provider_dir(provider).join(file))
    }

    fn provider_dir(&self, provider: &ProviderAddress) -> PathBuf {
        self.root
            .join(provider.hostname())
            .join(provider.namespace())
            .join(provider.provider_type())
    }

    /// Resolve a caller-supplied archive path to an absolute path under the
    /// cache root. The path is reduced to its normal components first and
    /// the joined result is checked against the root again; anything that
    /// would land outside is rejected.
    fn blob_path(&self, path: &str) -> Result<PathBuf, StorageError> {
        let full = self.root.join(clean_path(path)?);

        if !full.starts_with(&self.root) {
            return Err(StorageError::Other(Arc::new(InvalidPath::from(path))));
        }

        Ok(full)
    }

    async fn read_file(&self, path: &Path) -> Result<Bytes, StorageError> {
        fs::read(path)
            .await
            .map(Bytes::from)
            .map_err(FilesystemError::new(path))
            .map_err(Into::into)
    }

    /// Write `data` to a temporary sibling of `path` and commit with a
    /// rename. The temp file is removed if anything before the rename fails.
    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<(), StorageError> {
        let dir = path.parent().unwrap_or(&self.root);

        fs::create_dir_all(dir)
            .await
            .map_err(FilesystemError::new(dir))?;

        let temp = dir.join(format!(
            ".tmp-{}-{}",
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        if let Err(error) = fs::write(&temp, data).await {
            let _ = fs::remove_file(&temp).await;
            return Err(FilesystemError::new(&temp)(error).into());
        }

        if let Err(error) = fs::rename(&temp, path).await {
            let _ = fs::remove_file(&temp).await;
            return Err(FilesystemError::new(path)(error).into());
        }

        Ok(())
    }

    fn sidecar_path(&self, path: &str, suffix: &str) -> Result<PathBuf, StorageError> {
        let base = self.blob_path(path)?;
        let mut full = base.into_os_string();
        full.push(".");
        full.push(suffix);
        Ok(PathBuf::from(full))
    }

    async fn read_sidecar(&self, path: PathBuf) -> Result<Option<String>, StorageError> {
        match self.read_file(&path).await {
            Ok(bytes) => {
                let text = String::from_utf8(bytes.to_vec())
                    .map_err(|error| StorageError::Other(Arc::new(error)))?;
                Ok(Some(text))
            }
            Err(StorageError::Missing(_)) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

impl From<&str> for InvalidPath {
    fn from(path: &str) -> Self {
        InvalidPath(path.to_owned())
    }
}

#[async_trait::async_trait]
impl Storage for Filesystem {
    async fn get_index(&self, provider: &ProviderAddress) -> Result<Bytes, StorageError> {
        self.read_file(&self.index_path(provider)).await
    }

    async fn put_index(
        &self,
        provider: &ProviderAddress,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.write_atomic(&self.index_path(provider), data).await
    }

    async fn get_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
    ) -> Result<Bytes, StorageError> {
        self.read_file(&self.manifest_path(provider, version)?).await
    }

    async fn put_manifest(
        &self,
        provider: &ProviderAddress,
        version: &str,
        data: &[u8],
    ) -> Result<(), StorageError> {
        self.write_atomic(&self.manifest_path(provider, version)?, data)
            .await
    }

    async fn get_archive(&self, path: &str) -> Result<ArchiveStream, StorageError> {
        let full = self.blob_path(path)?;

        let file = fs::File::open(&full)
            .await
            .map_err(FilesystemError::new(&full))?;

        let len = file
            .metadata()
            .await
            .map_err(FilesystemError::new(&full))?
            .len();

        Ok(ArchiveStream::new(file, Some(len)))
    }

    async fn put_archive(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        let full = self.blob_path(path)?;
        self.write_atomic(&full, data).await
    }

    async fn archive_exists(&self, path: &str) -> Result<bool, StorageError> {
        let full = self.blob_path(path)?;
        match fs::metadata(&full).await {
            Ok(_) => Ok(true),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(false),
            Err(error) => Err(FilesystemError::new(&full)(error).into()),
        }
    }

    async fn get_h1_hash(&self, path: &str) -> Result<Option<String>, StorageError> {
        let full = self.sidecar_path(path, "h1")?;
        self.read_sidecar(full).await
    }

    async fn put_h1_hash(&self, path: &str, hash: &str) -> Result<(), StorageError> {
        let full = self.sidecar_path(path, "h1")?;
        self.write_atomic(&full, hash.as_bytes()).await
    }

    async fn get_upstream_url(&self, path: &str) -> Result<Option<String>, StorageError> {
        let full = self.sidecar_path(path, "upstream")?;
        self.read_sidecar(full).await
    }

    async fn put_upstream_url(&self, path: &str, url: &str) -> Result<(), StorageError> {
        let full = self.sidecar_path(path, "upstream")?;
        self.write_atomic(&full, url.as_bytes()).await
    }
}
