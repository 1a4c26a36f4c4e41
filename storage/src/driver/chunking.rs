// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Normalizes arbitrary upstream chunk sizes to a preferred batch size on read and write,
//! relieving an underlying `BlobAccess` from having to implement that batching itself. Rechunking
//! happens downstream of any CAS validation a `Buffer` already performs internally: re-batching
//! only reshapes how already-verified (or still-verifying) bytes are grouped, never what bytes
//! flow or what integrity verdict they carry (per §4.2, "chunk boundaries in streams have no
//! semantic meaning").

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use futures::StreamExt;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, BoxReadStream, StorageError};

/// Wraps an underlying `BlobAccess` to re-batch its read/write streams into `chunk_size`-sized
/// pieces (the last piece of a stream may be smaller).
pub struct ChunkingStorage<BA> {
    underlying: BA,
    chunk_size: usize,
}

impl<BA> ChunkingStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    pub fn new(underlying: BA, chunk_size: usize) -> Self {
        ChunkingStorage { underlying, chunk_size }
    }

    pub fn into_inner(self) -> BA {
        self.underlying
    }

    pub fn get_inner(&self) -> &BA {
        &self.underlying
    }
}

/// Re-batches `inner`'s chunks into pieces of exactly `chunk_size` bytes, except for a final,
/// possibly-shorter piece. Errors from `inner` are passed through immediately without buffering.
fn rechunk(mut inner: BoxReadStream, chunk_size: usize) -> BoxReadStream {
    Box::pin(async_stream::try_stream! {
        let mut buffer = BytesMut::with_capacity(chunk_size);

        while let Some(chunk_result) = inner.next().await {
            let mut chunk = chunk_result?;

            while chunk.has_remaining() {
                let bytes_remaining_to_fill_chunk = chunk_size - buffer.len();
                let bytes_to_read = bytes_remaining_to_fill_chunk.min(chunk.len());
                buffer.extend_from_slice(&chunk[0..bytes_to_read]);
                chunk.advance(bytes_to_read);

                if buffer.len() >= chunk_size {
                    let item = std::mem::replace(&mut buffer, BytesMut::with_capacity(chunk_size));
                    yield item.freeze();
                }
            }
        }

        if !buffer.is_empty() {
            yield buffer.freeze();
        }
    })
}

#[async_trait]
impl<BA> BlobAccess for ChunkingStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let buffer = self.underlying.get(ctx, digest).await;
        let rechunked = rechunk(buffer.into_reader(), self.chunk_size);
        Buffer::new_pre_validated_from_stream(rechunked)
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let rechunked = rechunk(buffer.into_reader(), self.chunk_size);
        self.underlying
            .put(ctx, digest, Buffer::new_pre_validated_from_stream(rechunked))
            .await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.underlying.find_missing(ctx, digests).await
    }
}
