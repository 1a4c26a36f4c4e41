// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Keeps two equivalent backends in sync while tolerating per-backend failure: reads alternate
//! round-robin with NotFound fallback and best-effort async repair, writes go to both, and
//! `FindMissing` cross-synchronizes digests one side has but the other doesn't.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

pub struct MirroredStorage<A, B> {
    backend_a: Arc<A>,
    name_a: String,
    backend_b: Arc<B>,
    name_b: String,
    round_robin: AtomicUsize,
}

impl<A, B> MirroredStorage<A, B>
where
    A: BlobAccess + Send + Sync + 'static,
    B: BlobAccess + Send + Sync + 'static,
{
    pub fn new(name_a: impl Into<String>, backend_a: A, name_b: impl Into<String>, backend_b: B) -> Self {
        Self {
            backend_a: Arc::new(backend_a),
            name_a: name_a.into(),
            backend_b: Arc::new(backend_b),
            name_b: name_b.into(),
            round_robin: AtomicUsize::new(0),
        }
    }

    /// Best-effort async repair of a backend that missed a digest another backend had. Spawned
    /// as a task attached to a child of the request's context, so it keeps going after the
    /// caller's Get has returned but is still cancelled if the caller cancels.
    fn repair<T: BlobAccess + Send + Sync + 'static>(
        backend: Arc<T>,
        backend_name: String,
        ctx: Context,
        digest: Digest,
        bytes: bytes::Bytes,
    ) {
        tokio::spawn(async move {
            let repair_buffer = Buffer::new_pre_validated_from_bytes(bytes);
            if let Err(err) = backend.put(&ctx, digest.clone(), repair_buffer).await {
                log::warn!("mirrored: repair of {backend_name} for {digest:?} failed: {err}");
            }
        });
    }
}

#[async_trait]
impl<A, B> BlobAccess for MirroredStorage<A, B>
where
    A: BlobAccess + Send + Sync + 'static,
    B: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let round = self.round_robin.fetch_add(1, Ordering::Relaxed);
        let max_size = digest.size_bytes as usize;

        macro_rules! try_pair {
            ($first:expr, $first_name:expr, $second:expr, $second_name:expr) => {{
                let first_buffer = $first.get(ctx, digest.clone()).await;
                match first_buffer.to_byte_slice(max_size).await {
                    Ok(bytes) => Buffer::new_pre_validated_from_bytes(bytes),
                    Err(first_err) if first_err.is_not_found() => {
                        let second_buffer = $second.get(ctx, digest.clone()).await;
                        match second_buffer.to_byte_slice(max_size).await {
                            Ok(bytes) => {
                                Self::repair(
                                    $first.clone(),
                                    $first_name.clone(),
                                    ctx.child(),
                                    digest.clone(),
                                    bytes.clone(),
                                );
                                Buffer::new_pre_validated_from_bytes(bytes)
                            }
                            Err(second_err) if second_err.is_not_found() => Buffer::new_error(second_err),
                            Err(second_err) => Buffer::new_error(second_err.with_prefix($second_name.clone())),
                        }
                    }
                    Err(first_err) => Buffer::new_error(first_err.with_prefix($first_name.clone())),
                }
            }};
        }

        if round % 2 == 0 {
            try_pair!(self.backend_a, self.name_a, self.backend_b, self.name_b)
        } else {
            try_pair!(self.backend_b, self.name_b, self.backend_a, self.name_a)
        }
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let (buffer_a, buffer_b) = buffer.clone_stream(digest.size_bytes as usize);
        let (result_a, result_b) = tokio::join!(
            self.backend_a.put(ctx, digest.clone(), buffer_a),
            self.backend_b.put(ctx, digest.clone(), buffer_b)
        );
        result_a.map_err(|err| err.with_prefix(self.name_a.clone()))?;
        result_b.map_err(|err| err.with_prefix(self.name_b.clone()))?;
        Ok(())
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let (missing_a, missing_b) = tokio::join!(
            self.backend_a.find_missing(ctx, digests.clone()),
            self.backend_b.find_missing(ctx, digests.clone())
        );
        let missing_a = missing_a.map_err(|err| err.with_prefix(self.name_a.clone()))?;
        let missing_b = missing_b.map_err(|err| err.with_prefix(self.name_b.clone()))?;

        // MA ∩ MB, via the identity X ∩ Y = X \ (X \ Y).
        let truly_missing = missing_a.difference(&missing_a.difference(&missing_b));

        // Present in A, missing in B: sync A -> B. Present in B, missing in A: sync B -> A.
        let missing_from_b_only = missing_b.difference(&missing_a);
        for digest in missing_from_b_only.iter() {
            self.sync(ctx, digest.clone(), &self.backend_a, &self.name_a, &self.backend_b, &self.name_b)
                .await?;
        }
        let missing_from_a_only = missing_a.difference(&missing_b);
        for digest in missing_from_a_only.iter() {
            self.sync(ctx, digest.clone(), &self.backend_b, &self.name_b, &self.backend_a, &self.name_a)
                .await?;
        }

        Ok(truly_missing)
    }
}

impl<A, B> MirroredStorage<A, B>
where
    A: BlobAccess + Send + Sync + 'static,
    B: BlobAccess + Send + Sync + 'static,
{
    /// Synchronizes a single digest from `source` (which has it) to `dest` (which doesn't).
    async fn sync<S: BlobAccess + Send + Sync + 'static, D: BlobAccess + Send + Sync + 'static>(
        &self,
        ctx: &Context,
        digest: Digest,
        source: &Arc<S>,
        source_name: &str,
        dest: &Arc<D>,
        dest_name: &str,
    ) -> Result<(), StorageError> {
        let max_size = digest.size_bytes as usize;
        let bytes = source
            .get(ctx, digest.clone())
            .await
            .to_byte_slice(max_size)
            .await
            .map_err(|err| {
                StorageError::Internal(format!(
                    "Failed to synchronize blob {digest:?} from backend {source_name} to backend {dest_name}: {err}"
                ))
            })?;
        dest.put(ctx, digest.clone(), Buffer::new_pre_validated_from_bytes(bytes))
            .await
            .map_err(|err| {
                StorageError::Internal(format!(
                    "Failed to synchronize blob {digest:?} from backend {source_name} to backend {dest_name}: {err}"
                ))
            })
    }
}
