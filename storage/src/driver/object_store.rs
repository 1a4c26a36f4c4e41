// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Minimal collaborator interfaces for the object-store-shaped backends this core treats as
//! external wire adapters (§4.3): an HTTP GET/Range client, and `NewReader`-shaped S3/GCS clients.
//! Only the read path is modeled — the reference-expanding decorator (§4.14) is this crate's only
//! caller, and it never writes. A concrete production client (the AWS/GCS SDKs, a pooled HTTP
//! client) is composed above this core; `ReqwestHttpClient` below is the one adapter this crate
//! provides directly, since `reqwest` is already part of the teacher's dependency stack.

use async_trait::async_trait;
use futures::TryStreamExt;
use reqwest::header::RANGE;

use crate::driver::{BoxReadStream, StorageError};

/// A byte range to request from an object: `offset` bytes in, `size` bytes long (`None` means
/// "to the end of the object"). Mirrors the ICAS `Reference`'s `offset_bytes`/`size_bytes` pair.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub size: Option<u64>,
}

impl ByteRange {
    pub fn full() -> Self {
        Self { offset: 0, size: None }
    }

    /// The HTTP `Range` header value for this range, per spec §6 (`bytes=<off>-<off+size-1>`,
    /// open-ended when `size` is `None` or zero). `None` if the range covers the whole object
    /// (no header needed).
    pub fn to_http_header_value(self) -> Option<String> {
        if self.offset == 0 && self.size.is_none() {
            return None;
        }
        match self.size {
            Some(size) if size > 0 => Some(format!("bytes={}-{}", self.offset, self.offset + size - 1)),
            _ => Some(format!("bytes={}-", self.offset)),
        }
    }
}

/// `GET <url>` with an optional byte range, for the ICAS `HttpUrl` medium.
#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn get(&self, url: &str, range: ByteRange) -> Result<BoxReadStream, StorageError>;
}

/// S3 `GetObject`, for the ICAS `S3` medium.
#[async_trait]
pub trait S3Client: Send + Sync {
    async fn get_object(&self, bucket: &str, key: &str, range: ByteRange) -> Result<BoxReadStream, StorageError>;
}

/// GCS object download, for the ICAS `Gcs` medium.
#[async_trait]
pub trait GcsClient: Send + Sync {
    async fn get_object(&self, bucket: &str, object: &str, range: ByteRange) -> Result<BoxReadStream, StorageError>;
}

/// An `HttpClient` backed by a `reqwest::Client`.
pub struct ReqwestHttpClient {
    client: reqwest::Client,
}

impl ReqwestHttpClient {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestHttpClient {
    fn default() -> Self {
        Self::new(reqwest::Client::new())
    }
}

#[async_trait]
impl HttpClient for ReqwestHttpClient {
    async fn get(&self, url: &str, range: ByteRange) -> Result<BoxReadStream, StorageError> {
        let mut request = self.client.get(url);
        if let Some(header_value) = range.to_http_header_value() {
            request = request.header(RANGE, header_value);
        }

        let response = request
            .send()
            .await
            .map_err(|err| StorageError::Unavailable(format!("GET {url} failed: {err}")))?;

        match response.status() {
            status if status == reqwest::StatusCode::NOT_FOUND => {
                return Err(StorageError::NotFound(format!("{url}")));
            }
            status if !status.is_success() => {
                return Err(StorageError::Unavailable(format!("GET {url} returned {status}")));
            }
            _ => {}
        }

        let url = url.to_string();
        let stream = response
            .bytes_stream()
            .map_err(move |err| StorageError::Unavailable(format!("GET {url}: {err}")));
        Ok(Box::pin(stream))
    }
}
