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

//! Strong content hashing for provider archives.
//!
//! Provider tooling verifies archives against an `h1:` hash taken over the
//! *extracted* directory tree, not over the raw ZIP bytes. The two differ:
//! a hash of the container would include directory entries and metadata that
//! an extract-then-hash computation never sees. To interoperate, this module
//! reproduces the directory-hash scheme byte for byte:
//!
//! 1. expand the archive into a fresh scratch directory,
//! 2. for every regular file, in byte-sorted relative-path order, emit the
//!    record `"<sha256-hex>  <path>\n"`,
//! 3. SHA-256 the concatenated records and emit `"h1:" + base64`.

use std::{
    fs::File,
    io::{self, Cursor, Read},
    path::{Path, PathBuf},
};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest as _, Sha256};
use thiserror::Error;
use walkdir::WalkDir;
use zip::ZipArchive;

/// Error computing an archive hash.
///
/// Any of these aborts the hash but never the request: the mirror serves the
/// archive without an `h1:` entry instead.
#[derive(Error, Debug)]
pub enum DigestError {
    /// The archive is not a readable ZIP container.
    #[error("malformed archive")]
    Archive(#[from] zip::result::ZipError),

    /// An archive entry would extract outside the scratch directory.
    #[error("archive entry escapes extraction root: {0:?}")]
    UnsafeEntry(String),

    /// A file name cannot be represented in a hash record.
    #[error("archive entry name contains a newline: {0:?}")]
    UnhashableName(String),

    /// Scratch-area IO failed.
    #[error("io error while hashing archive")]
    Io(#[from] io::Error),
}

/// Compute the `h1:` hash of a provider archive.
///
/// Expands the ZIP into a temporary directory and hashes the resulting tree.
/// This does blocking file IO; run it under `spawn_blocking` from async
/// contexts.
pub fn compute_h1(archive: &[u8]) -> Result<String, DigestError> {
    let scratch = tempfile::tempdir()?;

    extract(archive, scratch.path())?;

    hash_tree(scratch.path())
}

/// Expand `archive` into `root`.
///
/// Every output path is re-checked to lie under `root` after joining, so a
/// crafted entry name cannot write elsewhere.
fn extract(archive: &[u8], root: &Path) -> Result<(), DigestError> {
    let mut archive = ZipArchive::new(Cursor::new(archive))?;

    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;

        let Some(relative) = entry.enclosed_name() else {
            return Err(DigestError::UnsafeEntry(entry.name().to_owned()));
        };

        let path = root.join(relative);
        if !path.starts_with(root) {
            return Err(DigestError::UnsafeEntry(entry.name().to_owned()));
        }

        if entry.is_dir() {
            std::fs::create_dir_all(&path)?;
            continue;
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut output = File::create(&path)?;
        io::copy(&mut entry, &mut output)?;
    }

    Ok(())
}

/// Hash the extracted tree under `root`.
fn hash_tree(root: &Path) -> Result<String, DigestError> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        let relative = entry
            .path()
            .strip_prefix(root)
            .expect("walked path is under its root");
        files.push((slash_path(relative), entry.path().to_path_buf()));
    }

    files.sort();

    let mut outer = Sha256::new();
    for (name, path) in files {
        if name.contains('\n') {
            return Err(DigestError::UnhashableName(name));
        }

        let digest = file_sha256(&path)?;
        outer.update(format!("{}  {}\n", hex::encode(digest), name));
    }

    Ok(format!("h1:{}", BASE64.encode(outer.finalize())))
}

fn file_sha256(path: &Path) -> Result<[u8; 32], DigestError> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];

    loop {
        let read = file.read(&mut buffer)?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hasher.finalize().into())
}

/// Relative path with `/` separators regardless of platform.
fn slash_path(path: &Path) -> String {
    let mut out = String::new();
    for component in path.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(&component.as_os_str().to_string_lossy());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use zip::write::SimpleFileOptions;

    fn build_zip(entries: &[(&str, Option<&[u8]>)]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default();

        for (name, contents) in entries {
            match contents {
                Some(contents) => {
                    writer.start_file(*name, options).unwrap();
                    writer.write_all(contents).unwrap();
                }
                None => {
                    writer.add_directory(*name, options).unwrap();
                }
            }
        }

        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn hash_has_the_expected_shape() {
        let archive = build_zip(&[("terraform-provider-aws", Some(b"binary"))]);

        let hash = compute_h1(&archive).unwrap();

        // "h1:" plus base64 of a 32 byte digest.
        assert!(hash.starts_with("h1:"));
        assert_eq!(hash.len(), 3 + 44);
    }

    #[test]
    fn hash_is_deterministic() {
        let archive = build_zip(&[("a.txt", Some(b"aaa")), ("b.txt", Some(b"bbb"))]);

        assert_eq!(compute_h1(&archive).unwrap(), compute_h1(&archive).unwrap());
    }

    #[test]
    fn hash_ignores_entry_order() {
        let forward = build_zip(&[("a.txt", Some(b"aaa")), ("b.txt", Some(b"bbb"))]);
        let backward = build_zip(&[("b.txt", Some(b"bbb")), ("a.txt", Some(b"aaa"))]);

        assert_eq!(
            compute_h1(&forward).unwrap(),
            compute_h1(&backward).unwrap()
        );
    }

    #[test]
    fn hash_ignores_directory_entries() {
        // The whole point of extract-then-hash: explicit directory entries
        // in the container must not change the result.
        let plain = build_zip(&[("sub/file.txt", Some(b"content"))]);
        let with_dirs = build_zip(&[("sub", None), ("sub/file.txt", Some(b"content"))]);

        assert_eq!(
            compute_h1(&plain).unwrap(),
            compute_h1(&with_dirs).unwrap()
        );
    }

    #[test]
    fn hash_depends_on_content_and_names() {
        let base = build_zip(&[("a.txt", Some(b"aaa"))]);
        let other_content = build_zip(&[("a.txt", Some(b"bbb"))]);
        let other_name = build_zip(&[("b.txt", Some(b"aaa"))]);

        let base = compute_h1(&base).unwrap();
        assert_ne!(base, compute_h1(&other_content).unwrap());
        assert_ne!(base, compute_h1(&other_name).unwrap());
    }

    #[test]
    fn rejects_garbage_input() {
        assert!(matches!(
            compute_h1(b"this is not a zip"),
            Err(DigestError::Archive(_))
        ));
    }

    #[test]
    fn rejects_traversal_entries() {
        // Hand-assemble an entry name the writer API would refuse.
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        writer
            .start_file("../escape.txt", SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"x").unwrap();
        let archive = writer.finish().unwrap().into_inner();

        assert!(matches!(
            compute_h1(&archive),
            Err(DigestError::UnsafeEntry(_))
        ));
    }

    #[test]
    fn empty_archive_hashes_to_the_empty_tree() {
        let empty = build_zip(&[]);
        let only_dirs = build_zip(&[("sub", None)]);

        // An empty tree still has a well-defined hash, and directory-only
        // archives collapse to it.
        assert_eq!(compute_h1(&empty).unwrap(), compute_h1(&only_dirs).unwrap());
    }
}
