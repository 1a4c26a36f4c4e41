// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Speeds up `FindMissing` by remembering which digests were recently confirmed present,
//! so repeat checks for the same blobs (common across a build) skip the underlying backend
//! entirely until the entry's TTL lapses.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

/// An injectable source of "now", so TTL tests can pin fixed instants instead of racing the
/// wall clock.
pub type NowFn = Arc<dyn Fn() -> SystemTime + Send + Sync>;

pub fn system_clock() -> NowFn {
    Arc::new(SystemTime::now)
}

/// A `BlobAccess` that speeds up `FindMissing` by caching the existence of digests confirmed
/// present in an underlying storage backend, per §4.11.
pub struct ExistenceCacheStorage<BA> {
    cache: Mutex<LruCache<Digest, SystemTime>>,
    ttl: Duration,
    now: NowFn,
    underlying: BA,
}

impl<BA> ExistenceCacheStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    pub fn new(max_entries: NonZeroUsize, ttl: Duration, underlying: BA) -> Self {
        Self::with_clock(max_entries, ttl, underlying, system_clock())
    }

    pub fn with_clock(max_entries: NonZeroUsize, ttl: Duration, underlying: BA, now: NowFn) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(max_entries)),
            ttl,
            now,
            underlying,
        }
    }

    /// Digests from `digests` not currently known-present (missing, or present but expired).
    fn maybe_missing(&self, digests: &DigestSet) -> Vec<Digest> {
        let now = (self.now)();
        let mut cache = self.cache.lock();
        digests
            .iter()
            .filter(|digest| match cache.get(digest) {
                Some(expires_at) => *expires_at <= now,
                None => true,
            })
            .cloned()
            .collect()
    }

    fn remember_present(&self, digests: impl IntoIterator<Item = Digest>) {
        let expires_at = (self.now)() + self.ttl;
        let mut cache = self.cache.lock();
        for digest in digests {
            cache.put(digest, expires_at);
        }
    }

    fn evict(&self, digest: &Digest) {
        self.cache.lock().pop(digest);
    }
}

#[async_trait]
impl<BA> BlobAccess for ExistenceCacheStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let max_size = digest.size_bytes as usize;
        let buffer = self.underlying.get(ctx, digest.clone()).await;
        match buffer.to_byte_slice(max_size).await {
            Ok(bytes) => Buffer::new_pre_validated_from_bytes(bytes),
            Err(err) => {
                if err.is_not_found() {
                    self.evict(&digest);
                }
                Buffer::new_error(err)
            }
        }
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.underlying.put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let maybe_missing = self.maybe_missing(&digests);
        if maybe_missing.is_empty() {
            return Ok(DigestSet::empty());
        }

        let maybe_missing_set: DigestSet = maybe_missing.iter().cloned().collect();
        let still_missing = self.underlying.find_missing(ctx, maybe_missing_set).await?;

        let newly_confirmed_present = maybe_missing.into_iter().filter(|digest| !still_missing.contains(digest));
        self.remember_present(newly_confirmed_present);

        Ok(still_missing)
    }
}
