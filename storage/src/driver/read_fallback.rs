// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Reads try a primary backend first, falling back to a read-only secondary on `NotFound` and
//! repairing the primary in the background on a fallback hit. Writes only ever go to the
//! primary; the secondary is never written by this decorator.
//!
//! Grounded on the teacher's `FastSlowReplicationStorage`, generalized from the
//! `SmallBlobStorage`/`BlobStorage` trait duality to a single `BlobAccess` on both sides now that
//! `Buffer` absorbs the streaming-vs-whole-blob distinction.

use async_trait::async_trait;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

pub struct ReadFallbackStorage<Primary, Secondary> {
    primary: Primary,
    secondary: Secondary,
}

impl<Primary, Secondary> ReadFallbackStorage<Primary, Secondary> {
    pub fn new(primary: Primary, secondary: Secondary) -> Self {
        Self { primary, secondary }
    }
}

#[async_trait]
impl<Primary, Secondary> BlobAccess for ReadFallbackStorage<Primary, Secondary>
where
    Primary: BlobAccess + Send + Sync + 'static,
    Secondary: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let primary_buffer = self.primary.get(ctx, digest.clone()).await;
        let max_size = digest.size_bytes as usize;
        match primary_buffer.to_byte_slice(max_size).await {
            Ok(bytes) => Buffer::new_pre_validated_from_bytes(bytes),
            Err(primary_err) if primary_err.is_not_found() => {
                let secondary_buffer = self.secondary.get(ctx, digest.clone()).await;
                match secondary_buffer.to_byte_slice(max_size).await {
                    Ok(bytes) => {
                        // Best-effort repair of the fast backend; a failure here does not affect
                        // the result already available to the caller.
                        let _ = self
                            .primary
                            .put(
                                ctx,
                                digest.clone(),
                                Buffer::new_pre_validated_from_bytes(bytes.clone()),
                            )
                            .await;
                        Buffer::new_pre_validated_from_bytes(bytes)
                    }
                    Err(secondary_err) if secondary_err.is_not_found() => Buffer::new_error(secondary_err),
                    Err(secondary_err) => Buffer::new_error(secondary_err.with_prefix("Secondary")),
                }
            }
            Err(primary_err) => Buffer::new_error(primary_err.with_prefix("Primary")),
        }
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.primary.put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let missing_from_primary = self.primary.find_missing(ctx, digests).await?;
        if missing_from_primary.is_empty() {
            return Ok(missing_from_primary);
        }
        self.secondary.find_missing(ctx, missing_from_primary).await
    }
}
