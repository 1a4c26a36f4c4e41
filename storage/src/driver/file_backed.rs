// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncReadExt;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

struct Inner {
    /// Path to where blobs are stored.
    instances_path: PathBuf,

    /// Path to temporary directory where writes are stored.
    tmp_blobs_path: PathBuf,

    /// Sequence number added to temporary filenames for writes.
    blob_sequence: AtomicUsize,
}

impl Inner {
    /// Compute the path in the filesystem where the content for `digest` is or will be stored.
    /// The path uses a three-level directory structure based on a prefix of the digest in order
    /// to reduce the potential number of files per directory (for filesystems that have issues
    /// with large numbers of files in a directory).
    fn path_for_digest(&self, digest: &Digest) -> PathBuf {
        let hex_hash = digest.hex();
        let mut blobs_path = self.instances_path.clone();
        blobs_path.push(digest.instance_name.to_string());
        blobs_path.push("blobs");
        blobs_path.push(&hex_hash[0..2]);
        blobs_path.push(&hex_hash[2..4]);
        blobs_path.push(&hex_hash[4..6]);
        blobs_path.push(format!("{}-{}.bin", hex_hash, digest.size_bytes));
        blobs_path
    }

    async fn blob_exists(&self, digest: &Digest) -> bool {
        let path = self.path_for_digest(digest);
        tokio::fs::metadata(path).await.is_ok()
    }
}

/// A backend that stores blob content as files in the filesystem, in a three-level directory
/// structure keyed by a prefix of the hex digest: `{base}/instances/{name}/blobs/XX/YY/ZZ/{hex}-{size}.bin`.
/// Writes land in a per-process temporary directory and are renamed into place on completion, so
/// a reader never observes a partially written file.
pub struct FileBackedStorage {
    inner: Arc<Inner>,
}

impl FileBackedStorage {
    pub async fn new(base_path: impl AsRef<Path>, container_id: &str) -> Result<Self, StorageError> {
        let base_path = base_path.as_ref().join("v1").to_owned();

        let instances_path = base_path.join("instances");
        tokio::fs::create_dir_all(&instances_path)
            .await
            .map_err(|err| format!("failed to make directory: {instances_path:?}: {err}"))?;

        let tmp_blobs_path = base_path.join("tmp").join(container_id);
        tokio::fs::create_dir_all(&tmp_blobs_path)
            .await
            .map_err(|err| format!("failed to make directory: {tmp_blobs_path:?}: {err}"))?;

        Ok(FileBackedStorage {
            inner: Arc::new(Inner {
                instances_path,
                tmp_blobs_path,
                blob_sequence: AtomicUsize::new(0),
            }),
        })
    }
}

#[async_trait]
impl BlobAccess for FileBackedStorage {
    async fn get(&self, _ctx: &Context, digest: Digest) -> Buffer {
        if digest.is_empty_blob() {
            return Buffer::new_cas_from_bytes(digest, bytes::Bytes::new());
        }
        let blob_path = self.inner.path_for_digest(&digest);
        let mut blob_file = match tokio::fs::File::open(&blob_path).await {
            Ok(f) => f,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Buffer::new_error(StorageError::NotFound(format!("{digest:?}")));
            }
            Err(err) => {
                return Buffer::new_error(StorageError::Internal(format!(
                    "error while accessing digest {digest:?}: {err}"
                )));
            }
        };
        let mut content = Vec::new();
        if let Err(err) = blob_file.read_to_end(&mut content).await {
            return Buffer::new_error(StorageError::Internal(format!(
                "error while reading digest {digest:?}: {err}"
            )));
        }
        Buffer::new_pre_validated_from_bytes(content.into())
    }

    async fn put(&self, _ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        metrics::counter!("toolchain_storage_blobs_written_total", 1, "driver" => "file");

        if self.inner.blob_exists(&digest).await {
            buffer.discard();
            return Ok(());
        }

        let blob_path = self.inner.path_for_digest(&digest);
        let blob_directory_path = blob_path
            .parent()
            .map(|p| p.to_path_buf())
            .ok_or_else(|| StorageError::Internal("No parent directory for blob path.".to_string()))?;
        tokio::fs::create_dir_all(&blob_directory_path)
            .await
            .map_err(|err| format!("failed to create directory: {blob_directory_path:?}: {err}"))?;

        let sequence = self.inner.blob_sequence.fetch_add(1, Ordering::SeqCst);
        let tmp_path = self.inner.tmp_blobs_path.join(format!(
            "{}-{}.seq{}",
            digest.hex(),
            digest.size_bytes,
            sequence,
        ));

        let content = buffer.to_byte_slice(digest.size_bytes as usize).await?;
        tokio::fs::write(&tmp_path, &content)
            .await
            .map_err(|err| format!("failed to write file: {tmp_path:?}: {err}"))?;

        match tokio::fs::rename(&tmp_path, &blob_path).await {
            Ok(_) => Ok(()),
            // Another writer finished first; the content is equivalent (same digest), so this is
            // not a conflict.
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                Ok(())
            }
            Err(err) => Err(StorageError::Internal(format!(
                "error while writing digest {digest:?}: {err}"
            ))),
        }
    }

    async fn find_missing(&self, _ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let mut futures = Vec::new();
        for digest in digests.iter().filter(|d| !d.is_empty_blob()) {
            futures.push(async move {
                if self.inner.blob_exists(digest).await {
                    None
                } else {
                    Some(digest.clone())
                }
            });
        }
        let missing = futures::future::join_all(futures)
            .await
            .into_iter()
            .flatten()
            .collect();
        Ok(missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::TestData;

    #[tokio::test]
    async fn basic_read_write() {
        let base_path = tempfile::tempdir().unwrap();
        let storage = FileBackedStorage::new(base_path.path(), "test").await.unwrap();
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");

        let missing = storage
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.contains(&content.digest));

        storage.put(&ctx, content.digest.clone(), content.buffer()).await.unwrap();

        let missing = storage
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.is_empty());

        let read_back = storage
            .get(&ctx, content.digest.clone())
            .await
            .to_byte_slice(1024)
            .await
            .unwrap();
        assert_eq!(read_back, content.bytes);
    }

    #[tokio::test]
    async fn multiple_writers_race_without_conflict() {
        let base_path = tempfile::tempdir().unwrap();
        let storage = FileBackedStorage::new(base_path.path(), "test").await.unwrap();
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");

        let (r1, r2) = tokio::join!(
            storage.put(&ctx, content.digest.clone(), content.buffer()),
            storage.put(&ctx, content.digest.clone(), content.buffer())
        );
        r1.unwrap();
        r2.unwrap();

        let entries = walkdir::WalkDir::new(base_path.path().join("v1").join("instances"))
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .collect::<Vec<_>>();
        assert_eq!(entries.len(), 1, "There must only be one file.");
    }

    #[tokio::test]
    async fn missing_blob_surfaces_as_not_found() {
        let base_path = tempfile::tempdir().unwrap();
        let storage = FileBackedStorage::new(base_path.path(), "test").await.unwrap();
        let ctx = Context::new();
        let content = TestData::from_static(b"never written");
        let result = storage.get(&ctx, content.digest).await.to_byte_slice(1024).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
