// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Emits metrics for every call into an underlying `BlobAccess`: request counts, handling
//! latency, time-to-first-byte, and bytes transferred, labeled by driver/purpose/leaf and by the
//! REAPI instance name the call was made under.

use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};
use std::time::Instant;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use metrics::{counter, histogram};

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, BoxReadStream, StorageError};

const CANCELED_LABEL: &str = "canceled";
const OK_LABEL: &str = "ok";
const ERR_LABEL: &str = "err";

#[derive(Clone, Copy)]
enum Disposition {
    Incomplete,
    Complete,
    Error,
}

impl Disposition {
    fn label(&self) -> &'static str {
        match self {
            Disposition::Incomplete => CANCELED_LABEL,
            Disposition::Complete => OK_LABEL,
            Disposition::Error => ERR_LABEL,
        }
    }
}

/// A `BlobAccess` that emits metrics for calls into an underlying `BlobAccess` implementation.
#[derive(Clone, Debug)]
pub struct MetricsMonitoredStorage<BA> {
    driver_label: &'static str,
    purpose_label: &'static str,
    leaf_label: &'static str,
    inner: BA,
}

impl<BA> MetricsMonitoredStorage<BA> {
    pub fn new(inner: BA, driver_label: &'static str, purpose_label: &'static str, is_leaf: bool) -> Self {
        MetricsMonitoredStorage {
            driver_label,
            purpose_label,
            leaf_label: if is_leaf { "1" } else { "0" },
            inner,
        }
    }
}

struct ReadAttempt {
    driver_label: &'static str,
    purpose_label: &'static str,
    leaf_label: &'static str,
    instance: String,
    start_time: Instant,
    saw_first_byte: bool,
    disposition: Disposition,
    stream: BoxReadStream,
}

impl Stream for ReadAttempt {
    type Item = Result<Bytes, StorageError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        let result = futures::ready!(Pin::new(&mut self.stream).poll_next(cx));

        match &result {
            Some(Ok(chunk)) => {
                if !self.saw_first_byte {
                    histogram!(
                        "toolchain_storage_time_to_first_byte_seconds",
                        self.start_time.elapsed(),
                        "operation" => "get",
                        "driver" => self.driver_label,
                        "purpose" => self.purpose_label,
                        "leaf" => self.leaf_label,
                        "reapi_instance" => self.instance.clone(),
                    );
                    self.saw_first_byte = true;
                }
                counter!(
                    "toolchain_storage_bytes_read_total",
                    chunk.len() as u64,
                    "driver" => self.driver_label,
                    "purpose" => self.purpose_label,
                    "leaf" => self.leaf_label,
                    "reapi_instance" => self.instance.clone(),
                );
            }
            Some(Err(_)) => {
                self.disposition = Disposition::Error;
            }
            None => {
                if matches!(self.disposition, Disposition::Incomplete) {
                    self.disposition = Disposition::Complete;
                }
            }
        }

        Poll::Ready(result)
    }
}

impl Drop for ReadAttempt {
    fn drop(&mut self) {
        let result_label = self.disposition.label();
        counter!(
            "toolchain_storage_requests_handled_total",
            1,
            "operation" => "get",
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
            "result" => result_label,
            "reapi_instance" => self.instance.clone(),
        );
        histogram!(
            "toolchain_storage_requests_handling_seconds",
            self.start_time.elapsed(),
            "operation" => "get",
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
            "result" => result_label,
            "reapi_instance" => self.instance.clone(),
        );
    }
}

/// Wraps an outgoing `Put`'s byte stream so bytes-written/time-to-first-byte can be observed as
/// the caller drains it, without materializing the whole buffer in memory.
fn instrumented_write_stream(
    mut inner: BoxReadStream,
    driver_label: &'static str,
    purpose_label: &'static str,
    leaf_label: &'static str,
    instance: String,
    start_time: Instant,
) -> BoxReadStream {
    Box::pin(async_stream::try_stream! {
        let mut saw_first_byte = false;
        while let Some(chunk) = futures::StreamExt::next(&mut inner).await {
            let chunk = chunk?;
            if !saw_first_byte {
                histogram!(
                    "toolchain_storage_time_to_first_byte_seconds",
                    start_time.elapsed(),
                    "operation" => "put",
                    "driver" => driver_label,
                    "purpose" => purpose_label,
                    "leaf" => leaf_label,
                    "reapi_instance" => instance.clone(),
                );
                saw_first_byte = true;
            }
            counter!(
                "toolchain_storage_bytes_written_total",
                chunk.len() as u64,
                "driver" => driver_label,
                "purpose" => purpose_label,
                "leaf" => leaf_label,
                "reapi_instance" => instance.clone(),
            );
            yield chunk;
        }
    })
}

#[async_trait]
impl<BA> BlobAccess for MetricsMonitoredStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let instance_name = digest.instance_name.to_string();
        let start_time = Instant::now();

        counter!(
            "toolchain_storage_requests_started_total",
            1,
            "operation" => "get",
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
            "reapi_instance" => instance_name.clone(),
        );

        let buffer = self.inner.get(ctx, digest).await;
        let read_attempt = ReadAttempt {
            stream: buffer.into_reader(),
            saw_first_byte: false,
            disposition: Disposition::Incomplete,
            start_time,
            driver_label: self.driver_label,
            purpose_label: self.purpose_label,
            leaf_label: self.leaf_label,
            instance: instance_name,
        };
        Buffer::new_pre_validated_from_stream(Box::pin(read_attempt))
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let instance_name = digest.instance_name.to_string();
        let start_time = Instant::now();

        counter!(
            "toolchain_storage_requests_started_total",
            1,
            "operation" => "put",
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
            "reapi_instance" => instance_name.clone(),
        );

        let instrumented = instrumented_write_stream(
            buffer.into_reader(),
            self.driver_label,
            self.purpose_label,
            self.leaf_label,
            instance_name.clone(),
            start_time,
        );
        let result = self
            .inner
            .put(ctx, digest, Buffer::new_pre_validated_from_stream(instrumented))
            .await;

        let disposition = match &result {
            Ok(_) => Disposition::Complete,
            Err(_) => Disposition::Error,
        };
        let result_label = disposition.label();
        counter!(
            "toolchain_storage_requests_handled_total",
            1,
            "operation" => "put",
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
            "result" => result_label,
            "reapi_instance" => instance_name.clone(),
        );
        histogram!(
            "toolchain_storage_requests_handling_seconds",
            start_time.elapsed(),
            "operation" => "put",
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
            "result" => result_label,
            "reapi_instance" => instance_name,
        );
        result
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let start_time = Instant::now();
        counter!(
            "toolchain_storage_requests_started_total",
            1,
            "operation" => "find_missing",
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
        );
        counter!(
            "toolchain_storage_find_missing_digests_total",
            digests.len() as u64,
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
        );

        let result = self.inner.find_missing(ctx, digests).await;

        let result_label = match &result {
            Ok(_) => OK_LABEL,
            Err(_) => ERR_LABEL,
        };
        counter!(
            "toolchain_storage_requests_handled_total",
            1,
            "operation" => "find_missing",
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
            "result" => result_label,
        );
        histogram!(
            "toolchain_storage_requests_handling_seconds",
            start_time.elapsed(),
            "operation" => "find_missing",
            "driver" => self.driver_label,
            "purpose" => self.purpose_label,
            "leaf" => self.leaf_label,
            "result" => result_label,
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryStorage;
    use crate::testutil::TestData;

    #[tokio::test]
    async fn get_put_and_find_missing_pass_through_content_unchanged() {
        let storage = MetricsMonitoredStorage::new(MemoryStorage::new(), "memory", "cas", true);
        let ctx = Context::new();
        let content = TestData::from_static(b"metrics payload");

        storage.put(&ctx, content.digest.clone(), content.buffer()).await.unwrap();

        let missing = storage
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest.clone()))
            .await
            .unwrap();
        assert!(missing.is_empty());

        let read_back = storage
            .get(&ctx, content.digest.clone())
            .await
            .to_byte_slice(1024)
            .await
            .unwrap();
        assert_eq!(read_back, content.bytes);
    }

    #[tokio::test]
    async fn get_of_missing_digest_surfaces_not_found() {
        let storage = MetricsMonitoredStorage::new(MemoryStorage::new(), "memory", "cas", true);
        let ctx = Context::new();
        let content = TestData::from_static(b"never written");
        let result = storage.get(&ctx, content.digest).await.to_byte_slice(1024).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))));
    }
}
