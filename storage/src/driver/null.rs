// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use async_trait::async_trait;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

/// A backend that accepts (but does not store) all writes and reports every digest as missing.
/// Useful as the "discard" side of a mirrored pair, or in tests that need a backend guaranteed
/// to never have anything.
pub struct NullStorage;

#[async_trait]
impl BlobAccess for NullStorage {
    async fn get(&self, _ctx: &Context, digest: Digest) -> Buffer {
        Buffer::new_error(StorageError::NotFound(format!("{digest:?}")))
    }

    async fn put(&self, _ctx: &Context, _digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        buffer.discard();
        Ok(())
    }

    async fn find_missing(&self, _ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        Ok(digests)
    }
}
