// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

struct Inner {
    blobs: HashMap<Digest, bytes::Bytes>,
}

/// An in-memory backend, primarily useful as the fast side of a `ReadFallbackStorage` pair and
/// in tests. Not durable: content is lost when the process exits.
#[derive(Clone)]
pub struct MemoryStorage {
    inner: Arc<Mutex<Inner>>,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStorage {
    pub fn new() -> Self {
        MemoryStorage {
            inner: Arc::new(Mutex::new(Inner {
                blobs: HashMap::new(),
            })),
        }
    }
}

#[async_trait]
impl BlobAccess for MemoryStorage {
    async fn get(&self, _ctx: &Context, digest: Digest) -> Buffer {
        if digest.is_empty_blob() {
            return Buffer::new_cas_from_bytes(digest, bytes::Bytes::new());
        }
        let content = self.inner.lock().blobs.get(&digest).cloned();
        match content {
            Some(bytes) => Buffer::new_pre_validated_from_bytes(bytes),
            None => Buffer::new_error(StorageError::NotFound(format!("{digest:?}"))),
        }
    }

    async fn put(&self, _ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let max_size = digest.size_bytes as usize;
        let bytes = buffer.to_byte_slice(max_size).await?;
        self.inner.lock().blobs.entry(digest).or_insert(bytes);
        Ok(())
    }

    async fn find_missing(&self, _ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let inner = self.inner.lock();
        Ok(digests
            .into_iter()
            .filter(|digest| !digest.is_empty_blob() && !inner.blobs.contains_key(digest))
            .collect())
    }
}
