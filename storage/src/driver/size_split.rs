// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Routes a blob to one of two backends by its declared size, so a small-object store (e.g.
//! Redis) and a large-object store (e.g. an object store) can each see only the sizes they're
//! good at.

use async_trait::async_trait;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

pub struct SizeSplitStorage<Small, Large> {
    cutoff_size_bytes: u64,
    small: Small,
    large: Large,
}

impl<Small, Large> SizeSplitStorage<Small, Large>
where
    Small: BlobAccess,
    Large: BlobAccess,
{
    pub fn new(cutoff_size_bytes: u64, small: Small, large: Large) -> Self {
        Self {
            cutoff_size_bytes,
            small,
            large,
        }
    }

    fn resolve(&self, size_bytes: u64) -> &dyn BlobAccess {
        if size_bytes < self.cutoff_size_bytes {
            &self.small
        } else {
            &self.large
        }
    }
}

#[async_trait]
impl<Small, Large> BlobAccess for SizeSplitStorage<Small, Large>
where
    Small: BlobAccess + Send + Sync + 'static,
    Large: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        self.resolve(digest.size_bytes).get(ctx, digest).await
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.resolve(digest.size_bytes).put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let (small_digests, large_digests): (Vec<Digest>, Vec<Digest>) = digests
            .into_iter()
            .partition(|d| d.size_bytes < self.cutoff_size_bytes);

        let (small_missing, large_missing) = tokio::join!(
            self.small.find_missing(ctx, small_digests.into_iter().collect()),
            self.large.find_missing(ctx, large_digests.into_iter().collect())
        );
        Ok(small_missing?.union(&large_missing?))
    }
}
