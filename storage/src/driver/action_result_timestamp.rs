// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Stamps an `ActionResult` with a completion timestamp on write, for clients that don't (or
//! can't) populate it themselves; paired with `ActionResultExpiryStorage`, which reads the same
//! field back out to give LRU-like TTL behavior even when clients never set it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use digest::{Digest, DigestSet};
use protos::action_cache::ActionResult;

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

/// An injectable source of "now", so expiry/injection tests can pin a fixed instant instead of
/// racing the wall clock.
pub type NowFn = Arc<dyn Fn() -> SystemTime + Send + Sync>;

pub fn system_clock() -> NowFn {
    Arc::new(SystemTime::now)
}

pub fn system_time_to_proto(time: SystemTime) -> prost_types::Timestamp {
    let duration = time.duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    prost_types::Timestamp {
        seconds: duration.as_secs() as i64,
        nanos: duration.subsec_nanos() as i32,
    }
}

pub struct ActionResultTimestampStorage<BA> {
    underlying: BA,
    now: NowFn,
    max_message_size: usize,
    injected_count: AtomicU64,
    passthrough_count: AtomicU64,
}

impl<BA> ActionResultTimestampStorage<BA> {
    pub fn new(underlying: BA, max_message_size: usize) -> Self {
        Self::with_clock(underlying, max_message_size, system_clock())
    }

    pub fn with_clock(underlying: BA, max_message_size: usize, now: NowFn) -> Self {
        Self {
            underlying,
            now,
            max_message_size,
            injected_count: AtomicU64::new(0),
            passthrough_count: AtomicU64::new(0),
        }
    }

    pub fn injected_count(&self) -> u64 {
        self.injected_count.load(Ordering::Relaxed)
    }

    pub fn passthrough_count(&self) -> u64 {
        self.passthrough_count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<BA> BlobAccess for ActionResultTimestampStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        self.underlying.get(ctx, digest).await
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let mut action_result: ActionResult = match buffer.to_proto().await {
            Ok(action_result) => action_result,
            Err(err) => return Err(err),
        };

        if action_result.worker_completed_timestamp().is_some() {
            self.passthrough_count.fetch_add(1, Ordering::Relaxed);
        } else {
            action_result.set_worker_completed_timestamp(system_time_to_proto((self.now)()));
            self.injected_count.fetch_add(1, Ordering::Relaxed);
        }

        let mut encoded = Vec::new();
        prost::Message::encode(&action_result, &mut encoded)
            .map_err(|err| StorageError::Internal(format!("failed to encode action result: {err}")))?;
        let re_emitted = Buffer::new_action_result_from_bytes(encoded.into(), self.max_message_size);
        self.underlying.put(ctx, digest, re_emitted).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.underlying.find_missing(ctx, digests).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryStorage;
    use digest::{HashFunction, InstanceName};
    use prost::Message;

    fn digest_for(bytes: &bytes::Bytes) -> Digest {
        Digest::of_bytes(InstanceName::root(), HashFunction::Sha256, bytes)
    }

    fn encode(action_result: &ActionResult) -> bytes::Bytes {
        let mut buf = Vec::new();
        action_result.encode(&mut buf).unwrap();
        buf.into()
    }

    #[tokio::test]
    async fn injects_timestamp_when_absent() {
        let backend = MemoryStorage::new();
        let ctx = Context::new();
        let action_result = ActionResult {
            exit_code: 0,
            ..Default::default()
        };
        let encoded = encode(&action_result);
        let digest = digest_for(&encoded);

        let fixed_now = std::time::UNIX_EPOCH + std::time::Duration::from_secs(1_700_000_000);
        let storage = ActionResultTimestampStorage::with_clock(backend, 1024 * 1024, Arc::new(move || fixed_now));

        storage
            .put(&ctx, digest.clone(), Buffer::new_action_result_from_bytes(encoded, 1024 * 1024))
            .await
            .unwrap();
        assert_eq!(storage.injected_count(), 1);

        let stored: ActionResult = storage.underlying.get(&ctx, digest).await.to_proto().await.unwrap();
        let stamped = stored.worker_completed_timestamp().unwrap();
        assert_eq!(stamped.seconds, 1_700_000_000);
    }

    #[tokio::test]
    async fn leaves_existing_timestamp_untouched() {
        let backend = MemoryStorage::new();
        let ctx = Context::new();
        let mut action_result = ActionResult {
            exit_code: 1,
            ..Default::default()
        };
        action_result.set_worker_completed_timestamp(prost_types::Timestamp {
            seconds: 42,
            nanos: 0,
        });
        let encoded = encode(&action_result);
        let digest = digest_for(&encoded);

        let storage = ActionResultTimestampStorage::new(backend, 1024 * 1024);
        storage
            .put(&ctx, digest.clone(), Buffer::new_action_result_from_bytes(encoded, 1024 * 1024))
            .await
            .unwrap();
        assert_eq!(storage.passthrough_count(), 1);

        let stored: ActionResult = storage.underlying.get(&ctx, digest).await.to_proto().await.unwrap();
        assert_eq!(stored.worker_completed_timestamp().unwrap().seconds, 42);
    }
}
