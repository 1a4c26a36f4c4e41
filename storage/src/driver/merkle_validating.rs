// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Wraps a backend that has no notion of content-addressing and forces every `Get`/`Put` through
//! a CAS-kind `Buffer`, so the hash/size implied by the digest is verified as bytes flow, instead
//! of trusting whatever the backend hands back.
//!
//! Grounded on the teacher's `WriteDigestVerifier`/`ReadDigestVerifier` pair (which hashed writes
//! and reads by hand with a raw `Sha256`); here the hashing and mismatch handling live once, in
//! `Buffer`'s own CAS verification, and this decorator only has to choose a `RepairStrategy` and
//! re-wrap the inner backend's buffer.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;

use digest::{Digest, DigestSet};

use crate::buffer::{Buffer, RepairStrategy};
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

type DeleteFn =
    Arc<dyn Fn(Digest) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send>> + Send + Sync>;

pub struct MerkleValidatingStorage<BA> {
    underlying: BA,
    on_get_corruption: DeleteFn,
}

impl<BA> MerkleValidatingStorage<BA> {
    /// `on_get_corruption` is invoked (best-effort) to evict an entry whose bytes fail to hash
    /// to the expected digest on `Get`. Writes are always `Irreparable`: a corrupt write is
    /// simply rejected before it reaches `underlying`.
    pub fn new(underlying: BA, on_get_corruption: DeleteFn) -> Self {
        Self {
            underlying,
            on_get_corruption,
        }
    }
}

#[async_trait]
impl<BA> BlobAccess for MerkleValidatingStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        if digest.is_empty_blob() {
            return Buffer::new_cas_from_bytes(digest, bytes::Bytes::new());
        }
        let inner_buffer = self.underlying.get(ctx, digest.clone()).await;
        let repair = RepairStrategy::Reparable(self.on_get_corruption.clone());
        Buffer::new_cas_from_stream_with_repair(digest, inner_buffer.into_reader(), repair)
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let verified = Buffer::new_cas_from_stream_with_repair(
            digest.clone(),
            buffer.into_reader(),
            RepairStrategy::Irreparable,
        );
        self.underlying.put(ctx, digest, verified).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.underlying.find_missing(ctx, digests).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::driver::MemoryStorage;
    use crate::testutil::TestData;

    fn no_delete() -> DeleteFn {
        Arc::new(|_digest| Box::pin(async { Ok(()) }))
    }

    #[tokio::test]
    async fn good_write_then_read_round_trips() {
        let storage = MerkleValidatingStorage::new(MemoryStorage::new(), no_delete());
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");

        storage.put(&ctx, content.digest.clone(), content.buffer()).await.unwrap();
        let read_back = storage
            .get(&ctx, content.digest.clone())
            .await
            .to_byte_slice(1024)
            .await
            .unwrap();
        assert_eq!(read_back, content.bytes);
    }

    #[tokio::test]
    async fn bad_write_is_rejected_before_reaching_backend() {
        let storage = MerkleValidatingStorage::new(MemoryStorage::new(), no_delete());
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");
        let wrong_bytes = bytes::Bytes::from_static(b"barfoo");

        let result = storage
            .put(
                &ctx,
                content.digest.clone(),
                Buffer::new_pre_validated_from_bytes(wrong_bytes),
            )
            .await;
        assert!(matches!(result, Err(StorageError::InvalidHash { .. })));

        let missing = storage
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.contains(&content.digest));
    }

    #[tokio::test]
    async fn corrupted_read_deletes_exactly_once() {
        let backend = MemoryStorage::new();
        let content = TestData::from_static(b"foobar");
        let tampered_digest = content.digest.clone();
        // Write corrupted bytes of the same length directly to the backend, bypassing
        // verification, to simulate on-disk corruption.
        let ctx = Context::new();
        backend
            .put(
                &ctx,
                tampered_digest.clone(),
                Buffer::new_pre_validated_from_bytes(bytes::Bytes::from_static(b"barfoo")),
            )
            .await
            .unwrap();

        let delete_calls = Arc::new(AtomicUsize::new(0));
        let delete_calls2 = delete_calls.clone();
        let storage = MerkleValidatingStorage::new(
            backend,
            Arc::new(move |_digest| {
                let counter = delete_calls2.clone();
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            }),
        );

        let result = storage.get(&ctx, tampered_digest).await.to_byte_slice(1024).await;
        assert!(result.is_err());
        assert_eq!(delete_calls.load(Ordering::SeqCst), 1);
    }
}
