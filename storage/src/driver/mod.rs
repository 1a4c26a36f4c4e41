// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

use digest::{Digest, DigestSet, HashFunction, InstanceName};

use crate::buffer::Buffer;
use crate::context::Context;

mod action_result_expiry;
mod action_result_timestamp;
mod always_errors;
mod authorizing;
mod chunking;
mod demultiplexing;
mod empty_blob;
pub mod error;
mod existence_cache;
mod file_backed;
mod hierarchical;
mod memory;
mod merkle_validating;
mod metrics;
mod mirrored;
mod null;
mod object_store;
pub mod redis;
mod read_canarying;
mod read_fallback;
mod reference_expanding;
mod sharding;
mod size_split;

pub use action_result_expiry::ActionResultExpiryStorage;
pub use action_result_timestamp::ActionResultTimestampStorage;
pub use always_errors::AlwaysErrorsStorage;
pub use authorizing::{AuthorizingStorage, Authorizer, InstanceNameWriteGate};
pub use chunking::ChunkingStorage;
pub use demultiplexing::DemultiplexingStorage;
pub use empty_blob::EmptyBlobStorage;
pub use error::{is_infrastructure_error, StorageError};
pub use existence_cache::ExistenceCacheStorage;
pub use file_backed::FileBackedStorage;
pub use hierarchical::HierarchicalStorage;
pub use memory::MemoryStorage;
pub use merkle_validating::MerkleValidatingStorage;
pub use self::metrics::MetricsMonitoredStorage;
pub use mirrored::MirroredStorage;
pub use null::NullStorage;
pub use object_store::{GcsClient, HttpClient, S3Client};
pub use read_canarying::ReadCanaryingStorage;
pub use read_fallback::ReadFallbackStorage;
pub use reference_expanding::ReferenceExpandingStorage;
pub use self::redis::{RedisBackend, RedisStorage};
pub use sharding::ShardingStorage;
pub use size_split::SizeSplitStorage;

/// Alias for the type of a read stream: the content-flow currency of the whole crate, carried
/// inside a [`Buffer`] rather than passed around loose.
pub type BoxReadStream = Pin<Box<dyn Stream<Item = Result<Bytes, StorageError>> + Send + 'static>>;

/// A caller-supplied function that extracts the bytes of `child_digest` out of an already
/// materialized `parent` blob (e.g. a REv2 `Tree` message), used by the default
/// `get_from_composite` implementation.
pub type Slicer = dyn Fn(&Bytes, &Digest) -> Result<Bytes, StorageError> + Send + Sync;

/// What a backend or decorator chain reports it can do, in lieu of pulling in the full REv2
/// `ServerCapabilities` schema (out of scope for this crate).
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    pub supported_hash_functions: Vec<HashFunction>,
    pub max_batch_total_size_bytes: u64,
}

/// The single contract every backend and decorator implements: get/put a blob by digest, and
/// test a set of digests for presence. A decorator wraps an inner `BlobAccess` value rather than
/// inheriting from it, so a pipeline is built by nesting constructors
/// (`Decorator::new(OtherDecorator::new(Backend::new(...)))`).
#[async_trait]
pub trait BlobAccess: Send + Sync {
    /// Fetches `digest`. Never fails outright for a missing entry in the sense of panicking;
    /// "not found" surfaces as a `Buffer` that yields `StorageError::NotFound` when consumed,
    /// letting callers choose whether and how eagerly to force that determination.
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer;

    /// Stores `buffer` under `digest`. Implementations that verify content before accepting it
    /// rely on `Buffer`'s own CAS-kind verification; a `Put` is not required to re-verify bytes
    /// that already carry a passing verdict.
    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError>;

    /// Returns the subset of `digests` absent from this backend (or chain).
    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError>;

    /// Fetches a sub-range of a composite parent blob (REv2 Tree decomposition) identified by
    /// `child_digest`. The default implementation fetches the whole parent and asks `slicer` to
    /// locate the child's bytes within it; backends that can address sub-ranges directly (e.g. a
    /// byte-range GET) should override this to avoid the full-parent fetch.
    async fn get_from_composite(
        &self,
        ctx: &Context,
        parent_digest: Digest,
        child_digest: Digest,
        slicer: &Slicer,
    ) -> Buffer {
        let max_size = (parent_digest.size_bytes as usize).max(child_digest.size_bytes as usize);
        let buffer = self.get(ctx, parent_digest).await;
        match buffer.to_byte_slice(max_size).await {
            Ok(parent_bytes) => match slicer(&parent_bytes, &child_digest) {
                Ok(child_bytes) => Buffer::new_cas_from_bytes(child_digest, child_bytes),
                Err(err) => Buffer::new_error(err),
            },
            Err(err) => Buffer::new_error(err),
        }
    }

    /// Reports this backend's (or chain's) capabilities for `instance_name`. Unimplemented by
    /// default; only a few backends have anything meaningful to say here.
    async fn get_capabilities(
        &self,
        _ctx: &Context,
        _instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        Err(StorageError::Unimplemented(
            "get_capabilities is not supported by this backend".to_string(),
        ))
    }
}

#[async_trait]
impl<BA> BlobAccess for Box<BA>
where
    BA: BlobAccess + ?Sized,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        (**self).get(ctx, digest).await
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        (**self).put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        (**self).find_missing(ctx, digests).await
    }

    async fn get_from_composite(
        &self,
        ctx: &Context,
        parent_digest: Digest,
        child_digest: Digest,
        slicer: &Slicer,
    ) -> Buffer {
        (**self)
            .get_from_composite(ctx, parent_digest, child_digest, slicer)
            .await
    }

    async fn get_capabilities(
        &self,
        ctx: &Context,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        (**self).get_capabilities(ctx, instance_name).await
    }
}

#[async_trait]
impl<BA> BlobAccess for std::sync::Arc<BA>
where
    BA: BlobAccess + ?Sized,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        (**self).get(ctx, digest).await
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        (**self).put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        (**self).find_missing(ctx, digests).await
    }

    async fn get_from_composite(
        &self,
        ctx: &Context,
        parent_digest: Digest,
        child_digest: Digest,
        slicer: &Slicer,
    ) -> Buffer {
        (**self)
            .get_from_composite(ctx, parent_digest, child_digest, slicer)
            .await
    }

    async fn get_capabilities(
        &self,
        ctx: &Context,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        (**self).get_capabilities(ctx, instance_name).await
    }
}
