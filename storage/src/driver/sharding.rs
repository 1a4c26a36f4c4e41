// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Distributes digests over a set of shards using a consistent-hash algorithm, favoring high
//! availability over strong consistency: reads and writes involve a chain of replica shards for
//! each key (not just its primary shard), so a single unavailable shard does not fail a request.
//! Node and key placement are handled by the `consistent_hash_ring` crate.

use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;
use std::num::NonZeroUsize;

use async_trait::async_trait;
use consistent_hash_ring::{Ring, RingBuilder};
use futures::future;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::error::is_infrastructure_error;
use crate::driver::{BlobAccess, StorageError};

type BoxBlobAccess = Box<dyn BlobAccess + Send + Sync + 'static>;

/// Number of virtual nodes in the hash ring used for sharding.
const RING_SIZE: usize = 10240;

pub struct ShardingStorage<T> {
    ring: Ring<T>,
    shard_key_to_storage: HashMap<T, BoxBlobAccess>,
    key_replicas: NonZeroUsize,
    purpose: &'static str,
}

impl<T> ShardingStorage<T>
where
    T: Hash + Eq + Copy + Send + Sync + 'static,
{
    /// `key_replicas` is the number of shards checked per key, including the primary shard: Get
    /// tries each until one has the digest, Put writes to all of them, and FindMissing asks all
    /// of them and treats a digest as present if any replica has it.
    pub fn new(shards: Vec<(T, BoxBlobAccess)>, key_replicas: NonZeroUsize, purpose: &'static str) -> Self {
        let mut ring_builder = RingBuilder::default().vnodes(RING_SIZE);
        let mut shard_key_to_storage = HashMap::new();
        for (key, storage) in shards {
            shard_key_to_storage.insert(key, storage);
            ring_builder = ring_builder.node(key);
        }

        Self {
            ring: ring_builder.build(),
            shard_key_to_storage,
            key_replicas,
            purpose,
        }
    }

    fn replica_keys_for(&self, digest: &Digest) -> Vec<T> {
        self.ring.replicas(digest).take(self.key_replicas.into()).copied().collect()
    }

    fn storages_for_digest(&self, digest: &Digest) -> impl Iterator<Item = &BoxBlobAccess> {
        self.replica_keys_for(digest)
            .into_iter()
            .filter_map(|key| self.shard_key_to_storage.get(&key))
    }
}

#[async_trait]
impl<T> BlobAccess for ShardingStorage<T>
where
    T: Hash + Eq + Copy + Debug + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let max_size = digest.size_bytes as usize;
        let mut any_replica_available = false;

        for storage in self.storages_for_digest(&digest) {
            match storage.get(ctx, digest.clone()).await.to_byte_slice(max_size).await {
                Ok(bytes) => return Buffer::new_pre_validated_from_bytes(bytes),
                Err(err) if err.is_not_found() => any_replica_available = true,
                Err(err) if is_infrastructure_error(&err) => {
                    log::warn!("sharding({}): skipping unavailable shard during get: {err}", self.purpose);
                    metrics::counter!(
                        "toolchain_storage_shard_unavailable_total",
                        1,
                        "driver" => "sharding",
                        "purpose" => self.purpose,
                    );
                }
                Err(err) => return Buffer::new_error(err),
            }
        }

        if any_replica_available {
            Buffer::new_error(StorageError::NotFound(format!("{digest:?}")))
        } else {
            Buffer::new_error(StorageError::Unavailable(
                "no shards were available to answer read query".to_string(),
            ))
        }
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let replicas: Vec<&BoxBlobAccess> = self.storages_for_digest(&digest).collect();
        let max_size = digest.size_bytes as usize;
        let bytes = buffer.to_byte_slice(max_size).await?;

        let puts = replicas.iter().map(|storage| {
            let bytes = bytes.clone();
            let digest = digest.clone();
            async move {
                storage
                    .put(ctx, digest, Buffer::new_pre_validated_from_bytes(bytes))
                    .await
            }
        });
        let results = future::join_all(puts).await;

        let successes = results.iter().filter(|r| r.is_ok()).count();
        for result in &results {
            if let Err(err) = result {
                log::error!("sharding({}): write to a shard failed: {err}", self.purpose);
                metrics::counter!(
                    "toolchain_storage_sharding_write_error_total",
                    1,
                    "driver" => "sharding",
                    "purpose" => self.purpose,
                );
            }
        }

        if successes > 0 {
            Ok(())
        } else {
            Err(StorageError::Unavailable(format!(
                "all shards returned errors while writing {digest:?}"
            )))
        }
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let mut storage_to_digests: HashMap<T, HashSet<Digest>> = HashMap::new();
        for digest in digests.iter() {
            for key in self.replica_keys_for(digest) {
                storage_to_digests.entry(key).or_default().insert(digest.clone());
            }
        }

        let futures = storage_to_digests.iter().map(|(key, shard_digests)| {
            let digest_set: DigestSet = shard_digests.iter().cloned().collect();
            let storage = self.shard_key_to_storage.get(key).expect("shard key present in shard map");
            let key = *key;
            async move { (key, storage.find_missing(ctx, digest_set).await) }
        });
        let results = future::join_all(futures).await;

        let mut present_anywhere: HashSet<Digest> = HashSet::new();
        let mut responded_for: HashMap<&Digest, usize> = HashMap::new();
        for digest in digests.iter() {
            responded_for.insert(digest, 0);
        }

        for (shard_key, result) in &results {
            match result {
                Ok(missing_on_shard) => {
                    let digests_for_shard = storage_to_digests.get(shard_key).expect("shard key present");
                    for digest in digests_for_shard {
                        *responded_for.entry(digest).or_insert(0) += 1;
                        if !missing_on_shard.contains(digest) {
                            present_anywhere.insert(digest.clone());
                        }
                    }
                }
                Err(err) => {
                    log::error!("sharding({}): find_missing failed on shard {shard_key:?}: {err}", self.purpose);
                    if is_infrastructure_error(err) {
                        metrics::counter!(
                            "toolchain_storage_shard_unavailable_total",
                            1,
                            "driver" => "sharding",
                            "purpose" => self.purpose,
                        );
                    }
                }
            }
        }

        if responded_for.values().any(|count| *count == 0) {
            return Err(StorageError::Unavailable(
                "not enough shards were available to answer find_missing".to_string(),
            ));
        }

        Ok(digests.iter().filter(|digest| !present_anywhere.contains(*digest)).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::driver::MemoryStorage;
    use crate::testutil::{AlwaysExistsStorage, TestData};

    #[tokio::test]
    async fn basic_sharding_distributes_writes() {
        let storage1 = MemoryStorage::new();
        let storage2 = MemoryStorage::new();
        let ctx = Context::new();

        let storage: ShardingStorage<usize> = ShardingStorage::new(
            vec![(0, Box::new(storage1.clone())), (1, Box::new(storage2.clone()))],
            NonZeroUsize::new(1).unwrap(),
            "test",
        );

        let content1 = TestData::from_static(b"foobar");
        let content2 = TestData::from_static(b"barfoo");

        storage.put(&ctx, content1.digest.clone(), content1.buffer()).await.unwrap();
        storage.put(&ctx, content2.digest.clone(), content2.buffer()).await.unwrap();

        // With a single replica per key, each digest lands on exactly one of the two shards.
        let missing = storage
            .find_missing(&ctx, DigestSet::from_iter([content1.digest.clone(), content2.digest.clone()]))
            .await
            .unwrap();
        assert!(missing.is_empty());

        let read_back = storage.get(&ctx, content1.digest.clone()).await.to_byte_slice(1024).await.unwrap();
        assert_eq!(read_back, content1.bytes);
    }

    #[tokio::test]
    async fn replicated_writes_land_on_all_replicas() {
        let storage1 = MemoryStorage::new();
        let storage2 = MemoryStorage::new();
        let storage3 = MemoryStorage::new();
        let ctx = Context::new();

        let storage: ShardingStorage<usize> = ShardingStorage::new(
            vec![
                (0, Box::new(storage1.clone())),
                (1, Box::new(storage2.clone())),
                (2, Box::new(storage3.clone())),
            ],
            NonZeroUsize::new(2).unwrap(),
            "test",
        );

        let content = TestData::from_static(b"replicated");
        storage.put(&ctx, content.digest.clone(), content.buffer()).await.unwrap();

        let present_count = [&storage1, &storage2, &storage3]
            .into_iter()
            .filter(|shard| {
                futures::executor::block_on(
                    shard.find_missing(&ctx, DigestSet::to_singleton_set(content.digest.clone())),
                )
                .unwrap()
                .is_empty()
            })
            .count();
        assert_eq!(present_count, 2, "key_replicas=2 should have written to exactly two shards");
    }

    struct FailGatedStorage<S> {
        inner: S,
        respond_unavailable: Arc<AtomicBool>,
    }

    #[async_trait]
    impl<S> BlobAccess for FailGatedStorage<S>
    where
        S: BlobAccess + Send + Sync + 'static,
    {
        async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
            if self.respond_unavailable.load(Ordering::SeqCst) {
                Buffer::new_error(StorageError::Unavailable("unavailable".to_string()))
            } else {
                self.inner.get(ctx, digest).await
            }
        }

        async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
            if self.respond_unavailable.load(Ordering::SeqCst) {
                buffer.discard();
                Err(StorageError::Unavailable("unavailable".to_string()))
            } else {
                self.inner.put(ctx, digest, buffer).await
            }
        }

        async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
            if self.respond_unavailable.load(Ordering::SeqCst) {
                Err(StorageError::Unavailable("unavailable".to_string()))
            } else {
                self.inner.find_missing(ctx, digests).await
            }
        }
    }

    #[tokio::test]
    async fn sharding_falls_back_to_replicas_without_errors() {
        let shard1_unavailable = Arc::new(AtomicBool::new(false));
        let shard2_unavailable = Arc::new(AtomicBool::new(false));

        let storage1 = FailGatedStorage {
            inner: MemoryStorage::new(),
            respond_unavailable: shard1_unavailable.clone(),
        };
        let storage2 = FailGatedStorage {
            inner: MemoryStorage::new(),
            respond_unavailable: shard2_unavailable.clone(),
        };
        let ctx = Context::new();

        let storage: ShardingStorage<usize> = ShardingStorage::new(
            vec![(0, Box::new(storage1)), (1, Box::new(storage2))],
            NonZeroUsize::new(2).unwrap(),
            "test",
        );

        let content = TestData::from_static(b"foobar");
        storage.put(&ctx, content.digest.clone(), content.buffer()).await.unwrap();

        shard1_unavailable.store(true, Ordering::SeqCst);
        let missing = storage
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.is_empty(), "one available replica should still answer find_missing");

        let read_back = storage.get(&ctx, content.digest.clone()).await.to_byte_slice(1024).await;
        assert!(read_back.is_ok(), "one available replica should still answer get");

        shard2_unavailable.store(true, Ordering::SeqCst);
        let result = storage
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest.clone()))
            .await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));

        let result = storage.get(&ctx, content.digest.clone()).await.to_byte_slice(1024).await;
        assert!(matches!(result, Err(StorageError::Unavailable(_))));
    }

    #[tokio::test]
    async fn get_treats_every_replica_not_found_as_not_found() {
        let storage1 = MemoryStorage::new();
        let storage2 = MemoryStorage::new();
        let ctx = Context::new();

        let storage: ShardingStorage<usize> = ShardingStorage::new(
            vec![(0, Box::new(storage1)), (1, Box::new(storage2))],
            NonZeroUsize::new(2).unwrap(),
            "test",
        );

        let content = TestData::from_static(b"never written");
        let result = storage.get(&ctx, content.digest).await.to_byte_slice(1024).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn handles_existing_blobs_all() {
        let storage1 = AlwaysExistsStorage;
        let storage2 = AlwaysExistsStorage;
        let ctx = Context::new();

        let storage: ShardingStorage<usize> = ShardingStorage::new(
            vec![(0, Box::new(storage1)), (1, Box::new(storage2))],
            NonZeroUsize::new(2).unwrap(),
            "test",
        );

        let content = TestData::from_static(b"foobar");
        // Every replica already has it, so find_missing reports it present without a real write.
        let missing = storage
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest))
            .await
            .unwrap();
        assert!(missing.is_empty());
    }
}
