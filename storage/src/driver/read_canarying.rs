// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Routes reads between a trusted `source` and an unreliable read-only `replica`, per instance
//! name: an unknown or expired instance name gets exactly one canary probe against the replica,
//! whose outcome decides whether subsequent requests for that instance name go to the replica or
//! fall back to the source until the cache entry expires. Writes always target `source`.

use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use lru::LruCache;
use parking_lot::Mutex;

use digest::{Digest, DigestSet, InstanceName};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::error::is_infrastructure_error;
use crate::driver::{BlobAccess, Capabilities, Slicer, StorageError};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CacheState {
    /// A canary probe is in flight; concurrent requests fall through to source until it lands.
    Canarying,
    UseReplica,
    UseSource,
}

struct CacheEntry {
    state: CacheState,
    expires_at: Instant,
}

enum Decision {
    Source,
    Replica,
    /// This call claims the canary slot: it alone probes the replica and records the outcome.
    Canary,
}

pub struct ReadCanaryingStorage<Source, Replica> {
    source: Source,
    replica: Replica,
    cache: Mutex<LruCache<InstanceName, CacheEntry>>,
    cache_duration: Duration,
}

impl<Source, Replica> ReadCanaryingStorage<Source, Replica>
where
    Source: BlobAccess + Send + Sync + 'static,
    Replica: BlobAccess + Send + Sync + 'static,
{
    pub fn new(source: Source, replica: Replica, max_instance_names: NonZeroUsize, cache_duration: Duration) -> Self {
        Self {
            source,
            replica,
            cache: Mutex::new(LruCache::new(max_instance_names)),
            cache_duration,
        }
    }

    /// Looks up (and, if this call is the one that gets to canary, claims) the routing decision
    /// for `instance_name`. State transitions happen under the lock; the network I/O the
    /// decision leads to happens entirely outside it.
    fn decide(&self, instance_name: &InstanceName) -> Decision {
        let mut cache = self.cache.lock();
        match cache.get(instance_name) {
            Some(entry) if Instant::now() < entry.expires_at => match entry.state {
                CacheState::UseSource => Decision::Source,
                CacheState::UseReplica => Decision::Replica,
                CacheState::Canarying => Decision::Source,
            },
            _ => {
                cache.put(
                    instance_name.clone(),
                    CacheEntry {
                        state: CacheState::Canarying,
                        expires_at: Instant::now() + self.cache_duration,
                    },
                );
                Decision::Canary
            }
        }
    }

    fn record(&self, instance_name: &InstanceName, state: CacheState) {
        self.cache.lock().put(
            instance_name.clone(),
            CacheEntry {
                state,
                expires_at: Instant::now() + self.cache_duration,
            },
        );
    }
}

#[async_trait]
impl<Source, Replica> BlobAccess for ReadCanaryingStorage<Source, Replica>
where
    Source: BlobAccess + Send + Sync + 'static,
    Replica: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let max_size = digest.size_bytes as usize;
        match self.decide(&digest.instance_name) {
            Decision::Source => self.source.get(ctx, digest).await.with_error_prefix("Source"),
            Decision::Replica => {
                let buffer = self.replica.get(ctx, digest.clone()).await;
                match buffer.to_byte_slice(max_size).await {
                    Ok(bytes) => Buffer::new_pre_validated_from_bytes(bytes),
                    Err(err) if is_infrastructure_error(&err) => {
                        self.record(&digest.instance_name, CacheState::UseSource);
                        self.source.get(ctx, digest).await.with_error_prefix("Source")
                    }
                    Err(err) => Buffer::new_error(err.with_prefix("Replica")),
                }
            }
            Decision::Canary => {
                let buffer = self.replica.get(ctx, digest.clone()).await;
                match buffer.to_byte_slice(max_size).await {
                    Ok(bytes) => {
                        self.record(&digest.instance_name, CacheState::UseReplica);
                        Buffer::new_pre_validated_from_bytes(bytes)
                    }
                    Err(err) if is_infrastructure_error(&err) => {
                        self.record(&digest.instance_name, CacheState::UseSource);
                        self.source.get(ctx, digest).await.with_error_prefix("Source")
                    }
                    Err(err) => {
                        // Non-infrastructure failure: the replica itself is trustworthy, this
                        // digest just isn't there (or is malformed). Keep routing to it.
                        self.record(&digest.instance_name, CacheState::UseReplica);
                        Buffer::new_error(err.with_prefix("Replica"))
                    }
                }
            }
        }
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.source.put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let mut result = DigestSet::empty();
        let mut to_source = DigestSet::empty();

        for (instance_name, group) in digests.partition_by_instance_name() {
            match self.decide(&instance_name) {
                Decision::Source => to_source = to_source.union(&group),
                Decision::Replica => match self.replica.find_missing(ctx, group.clone()).await {
                    Ok(missing) => result = result.union(&missing),
                    Err(err) if is_infrastructure_error(&err) => {
                        self.record(&instance_name, CacheState::UseSource);
                        to_source = to_source.union(&group);
                    }
                    Err(err) => return Err(err.with_prefix("Replica")),
                },
                Decision::Canary => match self.replica.find_missing(ctx, group.clone()).await {
                    Ok(missing) => {
                        self.record(&instance_name, CacheState::UseReplica);
                        result = result.union(&missing);
                    }
                    Err(err) if is_infrastructure_error(&err) => {
                        self.record(&instance_name, CacheState::UseSource);
                        to_source = to_source.union(&group);
                    }
                    Err(err) => {
                        self.record(&instance_name, CacheState::UseReplica);
                        return Err(err.with_prefix("Replica"));
                    }
                },
            }
        }

        if !to_source.is_empty() {
            let missing_from_source = self
                .source
                .find_missing(ctx, to_source)
                .await
                .map_err(|err| err.with_prefix("Source"))?;
            result = result.union(&missing_from_source);
        }

        Ok(result)
    }

    async fn get_from_composite(
        &self,
        ctx: &Context,
        parent_digest: Digest,
        child_digest: Digest,
        slicer: &Slicer,
    ) -> Buffer {
        match self.decide(&parent_digest.instance_name) {
            Decision::Source => self
                .source
                .get_from_composite(ctx, parent_digest, child_digest, slicer)
                .await
                .with_error_prefix("Source"),
            Decision::Replica => {
                let buffer = self
                    .replica
                    .get_from_composite(ctx, parent_digest.clone(), child_digest.clone(), slicer)
                    .await;
                let max_size = child_digest.size_bytes as usize;
                match buffer.to_byte_slice(max_size).await {
                    Ok(bytes) => Buffer::new_pre_validated_from_bytes(bytes),
                    Err(err) if is_infrastructure_error(&err) => {
                        self.record(&parent_digest.instance_name, CacheState::UseSource);
                        self.source
                            .get_from_composite(ctx, parent_digest, child_digest, slicer)
                            .await
                            .with_error_prefix("Source")
                    }
                    Err(err) => Buffer::new_error(err.with_prefix("Replica")),
                }
            }
            Decision::Canary => {
                let buffer = self
                    .replica
                    .get_from_composite(ctx, parent_digest.clone(), child_digest.clone(), slicer)
                    .await;
                let max_size = child_digest.size_bytes as usize;
                match buffer.to_byte_slice(max_size).await {
                    Ok(bytes) => {
                        self.record(&parent_digest.instance_name, CacheState::UseReplica);
                        Buffer::new_pre_validated_from_bytes(bytes)
                    }
                    Err(err) if is_infrastructure_error(&err) => {
                        self.record(&parent_digest.instance_name, CacheState::UseSource);
                        self.source
                            .get_from_composite(ctx, parent_digest, child_digest, slicer)
                            .await
                            .with_error_prefix("Source")
                    }
                    Err(err) => {
                        self.record(&parent_digest.instance_name, CacheState::UseReplica);
                        Buffer::new_error(err.with_prefix("Replica"))
                    }
                }
            }
        }
    }

    async fn get_capabilities(
        &self,
        ctx: &Context,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        self.source.get_capabilities(ctx, instance_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryStorage;
    use crate::testutil::{AlwaysExistsStorage, TestData};

    fn cache_size(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).unwrap()
    }

    #[tokio::test]
    async fn successful_canary_routes_subsequent_reads_to_replica() {
        let source = MemoryStorage::new();
        let replica = MemoryStorage::new();
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");
        replica.put(&ctx, content.digest.clone(), content.buffer()).await.unwrap();

        let storage = ReadCanaryingStorage::new(source, replica, cache_size(16), Duration::from_secs(60));

        // First call is the canary probe, and succeeds against the replica.
        let read_back = storage
            .get(&ctx, content.digest.clone())
            .await
            .to_byte_slice(1024)
            .await
            .unwrap();
        assert_eq!(read_back, content.bytes);

        // Second call should also go to the replica (now cached as use_replica); the source
        // never received this content, so a source-routed read would fail.
        let read_back_again = storage
            .get(&ctx, content.digest.clone())
            .await
            .to_byte_slice(1024)
            .await
            .unwrap();
        assert_eq!(read_back_again, content.bytes);
    }

    #[tokio::test]
    async fn infrastructure_error_falls_back_to_source_and_flips_state() {
        let source = MemoryStorage::new();
        let replica = AlwaysExistsStorage; // errors Unavailable on every get
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");
        source.put(&ctx, content.digest.clone(), content.buffer()).await.unwrap();

        let storage = ReadCanaryingStorage::new(source, replica, cache_size(16), Duration::from_secs(60));

        let read_back = storage
            .get(&ctx, content.digest.clone())
            .await
            .to_byte_slice(1024)
            .await
            .unwrap();
        assert_eq!(read_back, content.bytes);

        // The entry should now be use_source; a second call must not touch the (broken) replica
        // again, which would surface as an error since it always fails.
        let read_back_again = storage
            .get(&ctx, content.digest.clone())
            .await
            .to_byte_slice(1024)
            .await
            .unwrap();
        assert_eq!(read_back_again, content.bytes);
    }

    #[tokio::test]
    async fn application_error_from_replica_keeps_using_replica() {
        let source = MemoryStorage::new();
        let replica = MemoryStorage::new();
        let ctx = Context::new();
        let content = TestData::from_static(b"never written anywhere");

        let storage = ReadCanaryingStorage::new(source, replica, cache_size(16), Duration::from_secs(60));

        let result = storage.get(&ctx, content.digest.clone()).await.to_byte_slice(1024).await;
        match result {
            Err(StorageError::NotFound(msg)) => assert!(msg.contains("Replica")),
            other => panic!("expected a replica-prefixed NotFound, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn put_always_targets_source() {
        let source = MemoryStorage::new();
        let replica = MemoryStorage::new();
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");

        let storage = ReadCanaryingStorage::new(source, replica, cache_size(16), Duration::from_secs(60));
        storage.put(&ctx, content.digest.clone(), content.buffer()).await.unwrap();

        let missing_from_source = storage
            .source
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing_from_source.is_empty());

        let missing_from_replica = storage
            .replica
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing_from_replica.contains(&content.digest), "replica is write-only, should never have received it");
    }
}
