// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Turns an Indirect CAS (whose entries describe *where* bytes live, not the bytes themselves)
//! into a read-only CAS: `Get` fetches the `IndirectContentEntry` keyed by `digest`, dispatches
//! to whichever upstream medium it names, honors the entry's byte range, decompresses if
//! required, and hands back a `Buffer` that validates the declared digest of the final
//! (decompressed) content. `Put` is rejected outright; `FindMissing` forwards to the ICAS.

use std::io::Read;

use async_trait::async_trait;
use bytes::Bytes;

use digest::{Digest, DigestSet};
use protos::icas::{Decompressor, IndirectContentEntry, Medium};

use crate::buffer::Buffer;
use crate::bytes::consolidate_stream;
use crate::context::Context;
use crate::driver::object_store::{ByteRange, GcsClient, HttpClient, S3Client};
use crate::driver::{BlobAccess, StorageError};

pub struct ReferenceExpandingStorage<Icas, Http, S3, Gcs> {
    icas: Icas,
    http_client: Http,
    s3_client: S3,
    gcs_client: Gcs,
    max_message_size_bytes: usize,
}

impl<Icas, Http, S3, Gcs> ReferenceExpandingStorage<Icas, Http, S3, Gcs>
where
    Icas: BlobAccess + Send + Sync + 'static,
    Http: HttpClient + Send + Sync + 'static,
    S3: S3Client + Send + Sync + 'static,
    Gcs: GcsClient + Send + Sync + 'static,
{
    pub fn new(icas: Icas, http_client: Http, s3_client: S3, gcs_client: Gcs, max_message_size_bytes: usize) -> Self {
        Self {
            icas,
            http_client,
            s3_client,
            gcs_client,
            max_message_size_bytes,
        }
    }

    fn range_of(entry: &IndirectContentEntry) -> ByteRange {
        ByteRange {
            offset: entry.offset_bytes,
            size: if entry.size_bytes == 0 { None } else { Some(entry.size_bytes) },
        }
    }

    async fn fetch_raw(&self, entry: &IndirectContentEntry) -> Result<Bytes, StorageError> {
        let range = Self::range_of(entry);
        let stream = match &entry.medium {
            Some(Medium::HttpUrl(http_url)) => self.http_client.get(&http_url.url, range).await?,
            Some(Medium::S3(location)) => self.s3_client.get_object(&location.bucket, &location.key, range).await?,
            Some(Medium::Gcs(location)) => {
                self.gcs_client.get_object(&location.bucket, &location.object, range).await?
            }
            None => return Err(StorageError::InvalidArgument("ICAS entry has no medium set".to_string())),
        };
        consolidate_stream(stream).await
    }

    fn decompress(entry: &IndirectContentEntry, raw: Bytes) -> Result<Bytes, StorageError> {
        match entry.decompressor() {
            Decompressor::Identity => Ok(raw),
            Decompressor::Deflate => {
                let mut decoder = flate2::read::DeflateDecoder::new(&raw[..]);
                let mut out = Vec::new();
                decoder
                    .read_to_end(&mut out)
                    .map_err(|err| StorageError::Internal(format!("DEFLATE decompression failed: {err}")))?;
                Ok(out.into())
            }
            Decompressor::Zstd => {
                let out = zstd::stream::decode_all(&raw[..])
                    .map_err(|err| StorageError::Internal(format!("Zstandard decompression failed: {err}")))?;
                Ok(out.into())
            }
        }
    }
}

#[async_trait]
impl<Icas, Http, S3, Gcs> BlobAccess for ReferenceExpandingStorage<Icas, Http, S3, Gcs>
where
    Icas: BlobAccess + Send + Sync + 'static,
    Http: HttpClient + Send + Sync + 'static,
    S3: S3Client + Send + Sync + 'static,
    Gcs: GcsClient + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let entry_buffer = self.icas.get(ctx, digest.clone()).await;
        let entry_bytes = match entry_buffer.to_byte_slice(self.max_message_size_bytes).await {
            Ok(bytes) => bytes,
            Err(err) => return Buffer::new_error(err),
        };
        let entry: IndirectContentEntry = match prost::Message::decode(entry_bytes) {
            Ok(entry) => entry,
            Err(err) => return Buffer::new_error(StorageError::InvalidArgument(format!("malformed ICAS entry: {err}"))),
        };

        let raw = match self.fetch_raw(&entry).await {
            Ok(raw) => raw,
            Err(err) => return Buffer::new_error(err),
        };
        match Self::decompress(&entry, raw) {
            Ok(content) => Buffer::new_cas_from_bytes(digest, content),
            Err(err) => Buffer::new_error(err),
        }
    }

    async fn put(&self, _ctx: &Context, _digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        buffer.discard();
        Err(StorageError::InvalidArgument(
            "reference-expanding storage is read-only".to_string(),
        ))
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.icas.find_missing(ctx, digests).await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use digest::{HashFunction, InstanceName};
    use prost::Message;

    use super::*;
    use crate::driver::object_store::ByteRange;
    use crate::driver::MemoryStorage;
    use protos::icas::HttpUrl;

    struct StaticHttpClient {
        body: Bytes,
        calls: Arc<AtomicUsize>,
        last_range: Arc<std::sync::Mutex<Option<ByteRange>>>,
    }

    #[async_trait]
    impl HttpClient for StaticHttpClient {
        async fn get(&self, _url: &str, range: ByteRange) -> Result<crate::driver::BoxReadStream, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            *self.last_range.lock().unwrap() = Some(range);
            let body = self.body.clone();
            Ok(Box::pin(futures::stream::once(async move { Ok(body) })))
        }
    }

    struct UnusedS3Client;
    #[async_trait]
    impl S3Client for UnusedS3Client {
        async fn get_object(&self, _bucket: &str, _key: &str, _range: ByteRange) -> Result<crate::driver::BoxReadStream, StorageError> {
            unimplemented!()
        }
    }

    struct UnusedGcsClient;
    #[async_trait]
    impl GcsClient for UnusedGcsClient {
        async fn get_object(&self, _bucket: &str, _object: &str, _range: ByteRange) -> Result<crate::driver::BoxReadStream, StorageError> {
            unimplemented!()
        }
    }

    fn digest_of(content: &[u8]) -> Digest {
        Digest::of_bytes(InstanceName::root(), HashFunction::Sha256, &Bytes::copy_from_slice(content))
    }

    async fn icas_with_entry(digest: Digest, entry: IndirectContentEntry) -> MemoryStorage {
        let icas = MemoryStorage::new();
        let mut encoded = Vec::new();
        entry.encode(&mut encoded).unwrap();
        let ctx = Context::new();
        icas.put(&ctx, digest, Buffer::new_pre_validated_from_bytes(encoded.into()))
            .await
            .unwrap();
        icas
    }

    #[tokio::test]
    async fn http_medium_fetches_and_validates_digest() {
        let content = Bytes::from_static(b"hello world");
        let digest = digest_of(&content);
        let entry = IndirectContentEntry {
            medium: Some(Medium::HttpUrl(HttpUrl {
                url: "https://example.test/blob".to_string(),
            })),
            offset_bytes: 0,
            size_bytes: 0,
            decompressor: Decompressor::Identity as i32,
        };
        let icas = icas_with_entry(digest.clone(), entry).await;

        let calls = Arc::new(AtomicUsize::new(0));
        let last_range = Arc::new(std::sync::Mutex::new(None));
        let http_client = StaticHttpClient {
            body: content.clone(),
            calls: calls.clone(),
            last_range: last_range.clone(),
        };

        let storage = ReferenceExpandingStorage::new(icas, http_client, UnusedS3Client, UnusedGcsClient, 1024 * 1024);
        let ctx = Context::new();
        let read_back = storage.get(&ctx, digest).await.to_byte_slice(1024).await.unwrap();
        assert_eq!(read_back, content);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(*last_range.lock().unwrap(), Some(ByteRange::full()));
    }

    #[tokio::test]
    async fn tampered_upstream_content_fails_digest_validation() {
        let content = Bytes::from_static(b"hello world");
        let digest = digest_of(&content);
        let entry = IndirectContentEntry {
            medium: Some(Medium::HttpUrl(HttpUrl {
                url: "https://example.test/blob".to_string(),
            })),
            offset_bytes: 0,
            size_bytes: 0,
            decompressor: Decompressor::Identity as i32,
        };
        let icas = icas_with_entry(digest.clone(), entry).await;

        let http_client = StaticHttpClient {
            body: Bytes::from_static(b"tampered!!!!"),
            calls: Arc::new(AtomicUsize::new(0)),
            last_range: Arc::new(std::sync::Mutex::new(None)),
        };

        let storage = ReferenceExpandingStorage::new(icas, http_client, UnusedS3Client, UnusedGcsClient, 1024 * 1024);
        let ctx = Context::new();
        let result = storage.get(&ctx, digest).await.to_byte_slice(1024).await;
        assert!(matches!(result, Err(StorageError::InvalidSize { .. }) | Err(StorageError::InvalidHash { .. })));
    }

    #[tokio::test]
    async fn honors_offset_and_size_as_a_byte_range() {
        // The entry's digest identifies the *expanded* content ("3456"), independent of how the
        // upstream medium is addressed; only `offset_bytes`/`size_bytes` describe the range.
        let expanded_content = Bytes::from_static(b"3456");
        let digest = digest_of(&expanded_content);
        let entry = IndirectContentEntry {
            medium: Some(Medium::HttpUrl(HttpUrl {
                url: "https://example.test/blob".to_string(),
            })),
            offset_bytes: 3,
            size_bytes: 4,
            decompressor: Decompressor::Identity as i32,
        };
        let icas = icas_with_entry(digest.clone(), entry).await;

        let last_range = Arc::new(std::sync::Mutex::new(None));
        let http_client = StaticHttpClient {
            body: expanded_content.clone(),
            calls: Arc::new(AtomicUsize::new(0)),
            last_range: last_range.clone(),
        };

        let storage = ReferenceExpandingStorage::new(icas, http_client, UnusedS3Client, UnusedGcsClient, 1024 * 1024);
        let ctx = Context::new();
        let read_back = storage.get(&ctx, digest).await.to_byte_slice(1024).await.unwrap();
        assert_eq!(read_back, expanded_content);
        assert_eq!(
            *last_range.lock().unwrap(),
            Some(ByteRange { offset: 3, size: Some(4) })
        );
    }

    #[tokio::test]
    async fn put_is_rejected() {
        let icas = MemoryStorage::new();
        let storage = ReferenceExpandingStorage::new(icas, UnusedHttpClient, UnusedS3Client, UnusedGcsClient, 1024);
        let ctx = Context::new();
        let content = Bytes::from_static(b"anything");
        let digest = digest_of(&content);
        let result = storage
            .put(&ctx, digest, Buffer::new_pre_validated_from_bytes(content))
            .await;
        assert!(matches!(result, Err(StorageError::InvalidArgument(_))));
    }

    struct UnusedHttpClient;
    #[async_trait]
    impl HttpClient for UnusedHttpClient {
        async fn get(&self, _url: &str, _range: ByteRange) -> Result<crate::driver::BoxReadStream, StorageError> {
            unimplemented!()
        }
    }
}
