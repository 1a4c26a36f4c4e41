// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

/// A backend that errors on every operation. Used in tests to exercise fallback/mirror paths
/// against a backend that is entirely unavailable, as distinct from one that is merely empty.
pub struct AlwaysErrorsStorage;

#[async_trait]
impl BlobAccess for AlwaysErrorsStorage {
    async fn get(&self, _ctx: &Context, _digest: Digest) -> Buffer {
        Buffer::new_error(StorageError::Unavailable("This always will error!".to_string()))
    }

    async fn put(&self, _ctx: &Context, _digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        buffer.discard();
        Err(StorageError::Unavailable("This always will error!".to_string()))
    }

    async fn find_missing(&self, _ctx: &Context, _digests: DigestSet) -> Result<DigestSet, StorageError> {
        Err(StorageError::Unavailable("This always will error!".to_string()))
    }
}
