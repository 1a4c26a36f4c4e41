// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Semaphore;

use digest::{Digest, DigestSet, HashFunction, InstanceName};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, Capabilities, Slicer, StorageError};

/// Container for digest/bytes of test content, hashed with SHA-256 under the root instance.
#[derive(Clone, Debug)]
pub struct TestData {
    pub bytes: Bytes,
    pub digest: Digest,
}

impl TestData {
    pub fn from_static(content: &'static [u8]) -> Self {
        let bytes = Bytes::from_static(content);
        let digest = Digest::of_bytes(InstanceName::root(), HashFunction::Sha256, &bytes);
        Self { bytes, digest }
    }

    pub fn buffer(&self) -> Buffer {
        Buffer::new_cas_from_bytes(self.digest.clone(), self.bytes.clone())
    }
}

/// Wraps an inner `BlobAccess`, counting how many times each method was called. Used by tests
/// asserting that a decorator avoids an unnecessary call to a backend (e.g. the existence cache
/// skipping a repeat `FindMissing`).
#[derive(Clone)]
pub struct CountMethodCallsStorage<S> {
    inner: S,
    pub get_count: Arc<AtomicUsize>,
    pub put_count: Arc<AtomicUsize>,
    pub find_missing_count: Arc<AtomicUsize>,
}

impl<S> CountMethodCallsStorage<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            get_count: Arc::new(AtomicUsize::new(0)),
            put_count: Arc::new(AtomicUsize::new(0)),
            find_missing_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn counts(&self) -> (usize, usize, usize) {
        (
            self.get_count.load(Ordering::SeqCst),
            self.put_count.load(Ordering::SeqCst),
            self.find_missing_count.load(Ordering::SeqCst),
        )
    }
}

#[async_trait]
impl<S> BlobAccess for CountMethodCallsStorage<S>
where
    S: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        self.get_count.fetch_add(1, Ordering::SeqCst);
        self.inner.get(ctx, digest).await
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.put_count.fetch_add(1, Ordering::SeqCst);
        self.inner.put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.find_missing_count.fetch_add(1, Ordering::SeqCst);
        self.inner.find_missing(ctx, digests).await
    }

    async fn get_from_composite(
        &self,
        ctx: &Context,
        parent_digest: Digest,
        child_digest: Digest,
        slicer: &Slicer,
    ) -> Buffer {
        self.inner
            .get_from_composite(ctx, parent_digest, child_digest, slicer)
            .await
    }

    async fn get_capabilities(
        &self,
        ctx: &Context,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        self.inner.get_capabilities(ctx, instance_name).await
    }
}

/// A backend that claims every digest is present, but errors on any attempted read. Useful for
/// exercising fallback/mirroring paths against a backend whose existence claim cannot be trusted
/// for content.
pub struct AlwaysExistsStorage;

#[async_trait]
impl BlobAccess for AlwaysExistsStorage {
    async fn get(&self, _ctx: &Context, _digest: Digest) -> Buffer {
        Buffer::new_error(StorageError::Unavailable(
            "This storage claims that all values exist, but doesn't actually contain anything."
                .to_string(),
        ))
    }

    async fn put(&self, _ctx: &Context, _digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        buffer.discard();
        Ok(())
    }

    async fn find_missing(&self, _ctx: &Context, _digests: DigestSet) -> Result<DigestSet, StorageError> {
        Ok(DigestSet::empty())
    }
}

#[derive(Copy, Clone, Debug)]
pub enum WriteSemaphoreOperation {
    Increment,
    Acquire,
}

impl WriteSemaphoreOperation {
    async fn execute(&self, semaphore: Arc<Semaphore>) -> Result<(), String> {
        match self {
            WriteSemaphoreOperation::Increment => semaphore.add_permits(1),
            WriteSemaphoreOperation::Acquire => {
                let _ = semaphore.acquire().await.map_err(|e| e.to_string())?;
            }
        }
        Ok(())
    }
}

/// Either increments or acquires the provided semaphore on writes.
///
/// The increment mode allows tests to detect when a write actually occurred to avoid flaky
/// sleeps to try and hope the write occurs. The acquire mode allows a test to block a write from
/// completing.
#[derive(Clone)]
pub struct WriteSemaphoreStorage<S> {
    inner: S,
    semaphore: Arc<Semaphore>,
    operation: WriteSemaphoreOperation,
}

impl<S> WriteSemaphoreStorage<S> {
    pub fn new(inner: S, semaphore: Arc<Semaphore>) -> Self {
        Self::with_operation(inner, semaphore, WriteSemaphoreOperation::Increment)
    }

    pub fn with_operation(
        inner: S,
        semaphore: Arc<Semaphore>,
        operation: WriteSemaphoreOperation,
    ) -> Self {
        Self {
            inner,
            semaphore,
            operation,
        }
    }

    pub fn into_inner(self) -> S {
        self.inner
    }

    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

#[async_trait]
impl<S> BlobAccess for WriteSemaphoreStorage<S>
where
    S: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        self.inner.get(ctx, digest).await
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.inner.put(ctx, digest, buffer).await?;
        self.operation.execute(self.semaphore.clone()).await?;
        Ok(())
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.inner.find_missing(ctx, digests).await
    }
}
