// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Treats an `ActionResult`'s `worker_completed_timestamp` as a TTL stamp: once a deterministic,
//! per-digest jittered expiration has passed, the result is reported NotFound rather than served
//! stale. The jitter is a fixed function of the timestamp alone, so every replica computes the
//! same cutoff without coordination.

use async_trait::async_trait;

use digest::{Digest, DigestSet};
use protos::action_cache::ActionResult;

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::action_result_timestamp::{system_clock, NowFn};
use crate::driver::{BlobAccess, StorageError};

/// Multiplicative mixing constant for `deterministic_jitter`. Chosen so that `(t * JITTER_MIX) >>
/// 32` scatters consecutive `t` values across the full jitter range; has no meaning beyond that.
const JITTER_MIX: u64 = 0x873a_798d_5536_ec4b;

/// A fixed scrambling of a unix timestamp into a wide pseudo-random range, stable across
/// processes given the same `t`. Not cryptographic; only needs to avoid clustering.
fn deterministic_jitter(t: u64, maximum_validity_jitter_secs: u64) -> u64 {
    if maximum_validity_jitter_secs == 0 {
        return 0;
    }
    let mixed = t.wrapping_mul(JITTER_MIX);
    (mixed >> 32) % maximum_validity_jitter_secs
}

fn expiration_time(worker_completed_unix: u64, minimum_validity_secs: u64, maximum_validity_jitter_secs: u64) -> u64 {
    worker_completed_unix + minimum_validity_secs + deterministic_jitter(worker_completed_unix, maximum_validity_jitter_secs)
}

/// Formats a unix timestamp as an ISO-8601 UTC instant (`YYYY-MM-DDTHH:MM:SSZ`), using Howard
/// Hinnant's civil-from-days algorithm so no additional date/time dependency is needed for this
/// one call site.
fn format_iso8601_utc(unix_secs: u64) -> String {
    let days = (unix_secs / 86_400) as i64;
    let time_of_day = unix_secs % 86_400;
    let (hour, minute, second) = (time_of_day / 3600, (time_of_day / 60) % 60, time_of_day % 60);

    let z = days + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let year = if month <= 2 { y + 1 } else { y };

    format!("{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}Z")
}

pub struct ActionResultExpiryStorage<BA> {
    underlying: BA,
    minimum_validity_secs: u64,
    maximum_validity_jitter_secs: u64,
    now: NowFn,
}

impl<BA> ActionResultExpiryStorage<BA> {
    pub fn new(underlying: BA, minimum_validity_secs: u64, maximum_validity_jitter_secs: u64) -> Self {
        Self::with_clock(underlying, minimum_validity_secs, maximum_validity_jitter_secs, system_clock())
    }

    pub fn with_clock(
        underlying: BA,
        minimum_validity_secs: u64,
        maximum_validity_jitter_secs: u64,
        now: NowFn,
    ) -> Self {
        Self {
            underlying,
            minimum_validity_secs,
            maximum_validity_jitter_secs,
            now,
        }
    }
}

#[async_trait]
impl<BA> BlobAccess for ActionResultExpiryStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let max_size = digest.size_bytes as usize;
        let underlying_buffer = self.underlying.get(ctx, digest.clone()).await;
        let bytes = match underlying_buffer.to_byte_slice(max_size).await {
            Ok(bytes) => bytes,
            Err(err) => return Buffer::new_error(err),
        };

        let action_result: ActionResult = match prost::Message::decode(bytes.clone()) {
            Ok(action_result) => action_result,
            Err(err) => return Buffer::new_error(StorageError::InvalidArgument(format!("malformed protobuf: {err}"))),
        };

        let Some(worker_completed_timestamp) = action_result.worker_completed_timestamp() else {
            return Buffer::new_pre_validated_from_bytes(bytes);
        };
        let worker_completed_unix = worker_completed_timestamp.seconds.max(0) as u64;
        let expiration =
            expiration_time(worker_completed_unix, self.minimum_validity_secs, self.maximum_validity_jitter_secs);

        let now_unix = (self.now)()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        if now_unix > expiration {
            return Buffer::new_error(StorageError::NotFound(format!(
                "action result {digest:?} expired at {}",
                format_iso8601_utc(expiration)
            )));
        }
        Buffer::new_pre_validated_from_bytes(bytes)
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        self.underlying.put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.underlying.find_missing(ctx, digests).await
    }
}
