// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Walks an instance-name hierarchy on NotFound, from most to least specific, down to the root.
//! Grounded on the teacher's cache-then-origin fallback shape, generalized from a fixed two-level
//! chain to an arbitrary-depth `InstanceName` ancestry.

use std::collections::BTreeMap;

use async_trait::async_trait;

use digest::{Digest, DigestSet, InstanceName};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

pub struct HierarchicalStorage<BA> {
    underlying: BA,
}

impl<BA> HierarchicalStorage<BA> {
    pub fn new(underlying: BA) -> Self {
        Self { underlying }
    }
}

#[async_trait]
impl<BA> BlobAccess for HierarchicalStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let max_size = digest.size_bytes as usize;
        let mut instance_name = Some(digest.instance_name.clone());
        loop {
            let Some(current) = instance_name else {
                return Buffer::new_error(StorageError::NotFound(format!("{digest:?}")));
            };
            let at_level = digest.clone().with_instance_name(current.clone());
            let buffer = self.underlying.get(ctx, at_level).await;
            match buffer.to_byte_slice(max_size).await {
                Ok(bytes) => return Buffer::new_pre_validated_from_bytes(bytes),
                Err(err) if err.is_not_found() => {
                    instance_name = current.parent();
                }
                Err(err) => return Buffer::new_error(err.with_prefix(format!("{current}"))),
            }
        }
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.underlying.put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        // Phase 0: the original set, each digest at its own instance name. `found_under` tracks,
        // per original digest, the instance-name chain still left to climb so a hit at any level
        // erases the original (not the escalated) digest from the missing set.
        let mut still_searching: BTreeMap<Digest, InstanceName> = digests
            .iter()
            .map(|d| (d.clone(), d.instance_name.clone()))
            .collect();
        let mut truly_missing = DigestSet::empty();

        loop {
            if still_searching.is_empty() {
                break;
            }
            let probe: DigestSet = still_searching
                .iter()
                .map(|(original, at_instance)| original.clone().with_instance_name(at_instance.clone()))
                .collect();

            let missing_at_level = self.underlying.find_missing(ctx, probe).await?;

            let mut next_round = BTreeMap::new();
            for (original, at_instance) in still_searching {
                let probed = original.clone().with_instance_name(at_instance.clone());
                if missing_at_level.contains(&probed) {
                    match at_instance.parent() {
                        Some(parent) => {
                            next_round.insert(original, parent);
                        }
                        None => {
                            truly_missing.insert(original);
                        }
                    }
                }
                // else: found at this level, original digest is not missing.
            }
            still_searching = next_round;
        }

        Ok(truly_missing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryStorage;
    use digest::HashFunction;

    fn digest_at(instance_name: &str, content: &'static [u8]) -> Digest {
        Digest::of_bytes(InstanceName::from(instance_name), HashFunction::Sha256, &bytes::Bytes::from_static(content))
    }

    #[tokio::test]
    async fn falls_back_through_ancestry_to_root() {
        let backend = MemoryStorage::new();
        let ctx = Context::new();
        let at_root = digest_at("", b"Hello");
        backend.put(&ctx, at_root.clone(), Buffer::new_cas_from_bytes(at_root.clone(), bytes::Bytes::from_static(b"Hello"))).await.unwrap();

        let storage = HierarchicalStorage::new(backend);
        let requested = digest_at("a/b", b"Hello");
        let read_back = storage.get(&ctx, requested).await.to_byte_slice(1024).await.unwrap();
        assert_eq!(read_back, bytes::Bytes::from_static(b"Hello"));
    }

    #[tokio::test]
    async fn not_found_anywhere_surfaces_not_found() {
        let storage = HierarchicalStorage::new(MemoryStorage::new());
        let ctx = Context::new();
        let requested = digest_at("a/b", b"missing");
        let result = storage.get(&ctx, requested).await.to_byte_slice(1024).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn find_missing_escalates_to_parent_instance_names() {
        let backend = MemoryStorage::new();
        let ctx = Context::new();
        let at_root = digest_at("", b"only at root");
        backend.put(&ctx, at_root.clone(), Buffer::new_cas_from_bytes(at_root.clone(), bytes::Bytes::from_static(b"only at root"))).await.unwrap();

        let storage = HierarchicalStorage::new(backend);
        let requested = digest_at("a/b/c", b"only at root");
        let missing = storage.find_missing(&ctx, DigestSet::to_singleton_set(requested)).await.unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn find_missing_reports_absent_everywhere() {
        let storage = HierarchicalStorage::new(MemoryStorage::new());
        let ctx = Context::new();
        let requested = digest_at("a/b/c", b"nowhere");
        let missing = storage.find_missing(&ctx, DigestSet::to_singleton_set(requested.clone())).await.unwrap();
        assert_eq!(missing, DigestSet::to_singleton_set(requested));
    }
}
