// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! `Buffer`: the single polymorphic carrier every `BlobAccess` method passes bytes through.
//!
//! A `Buffer` knows what *kind* of payload it carries (a CAS blob to be digest-verified, an
//! `ActionResult` protobuf, an ICAS reference protobuf, or bytes a backend has already
//! validated) and how it is currently represented (already in memory, or still an in-flight
//! stream). Consuming it — via `to_byte_slice`, `into_reader`, `to_proto`, `into_writer`,
//! `clone_copy`, `clone_stream`, or `discard` — materializes or forwards it exactly once; a
//! `Buffer` is not reusable after being consumed.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use async_stream::try_stream;
use bytes::Bytes;
use futures::StreamExt;
use prost::Message;
use tokio::io::{AsyncWrite, AsyncWriteExt};

use digest::Digest;

use crate::bytes::consolidate_stream;
use crate::driver::error::StorageError;
use crate::driver::BoxReadStream;

/// Invoked exactly once, when a CAS buffer's integrity has been determined (by verification, or
/// trivially for a zero-length buffer): `true` if the bytes matched the expected digest.
pub type DataIntegrityCallback = Box<dyn FnOnce(bool) + Send>;

type DeleteFn =
    Arc<dyn Fn(Digest) -> Pin<Box<dyn Future<Output = Result<(), StorageError>> + Send>> + Send + Sync>;
type NotifyFn = Arc<dyn Fn(bool) + Send + Sync>;

/// What a CAS buffer does when it detects, on read, that the bytes it carries do not hash to the
/// expected digest.
#[derive(Clone)]
pub enum RepairStrategy {
    /// Propagate the error; take no other action. The default for most read paths.
    Irreparable,
    /// Notify a backend-supplied callback of the verdict (true/false), in addition to
    /// propagating the error on failure. Used when the backend itself wants to react (e.g. to
    /// drop a connection believed to be corrupting data in flight).
    BackendProvided(NotifyFn),
    /// Best-effort delete the offending entry before propagating the error. Used by decorators
    /// (e.g. Merkle validation) that own enough of the backend to evict a bad entry.
    Reparable(DeleteFn),
}

impl RepairStrategy {
    async fn on_verdict(&self, digest: &Digest, ok: bool) {
        match self {
            RepairStrategy::Irreparable => {}
            RepairStrategy::BackendProvided(notify) => notify(ok),
            RepairStrategy::Reparable(delete) => {
                if !ok {
                    let _ = delete(digest.clone()).await;
                }
            }
        }
    }
}

enum BufferKind {
    /// Content-addressed bytes; materialization verifies `expected_digest` and applies
    /// `repair_strategy` on mismatch.
    Cas {
        expected_digest: Digest,
        repair_strategy: RepairStrategy,
    },
    /// An `ActionResult`-shaped protobuf payload; materialization enforces `max_message_size`
    /// before any decode is attempted.
    ActionResult { max_message_size: usize },
    /// An ICAS reference-entry-shaped protobuf payload, same size discipline as `ActionResult`.
    Reference { max_message_size: usize },
    /// Bytes a backend (or an inner decorator) has already validated; no further verification.
    PreValidated,
}

enum BufferSource {
    Bytes(Bytes),
    Stream(BoxReadStream),
    /// A buffer that is itself in a terminal error state (e.g. produced by a `Get` against a
    /// backend that failed before any bytes were seen).
    Error(StorageError),
}

/// See the module documentation.
pub struct Buffer {
    kind: BufferKind,
    source: BufferSource,
    integrity_callback: Option<DataIntegrityCallback>,
}

impl Buffer {
    pub fn new_error(err: StorageError) -> Self {
        Self {
            kind: BufferKind::PreValidated,
            source: BufferSource::Error(err),
            integrity_callback: None,
        }
    }

    pub fn new_cas_from_bytes(expected_digest: Digest, bytes: Bytes) -> Self {
        Self::new_cas_from_bytes_with_repair(expected_digest, bytes, RepairStrategy::Irreparable)
    }

    pub fn new_cas_from_bytes_with_repair(
        expected_digest: Digest,
        bytes: Bytes,
        repair_strategy: RepairStrategy,
    ) -> Self {
        Self {
            kind: BufferKind::Cas {
                expected_digest,
                repair_strategy,
            },
            source: BufferSource::Bytes(bytes),
            integrity_callback: None,
        }
    }

    pub fn new_cas_from_stream(expected_digest: Digest, stream: BoxReadStream) -> Self {
        Self::new_cas_from_stream_with_repair(expected_digest, stream, RepairStrategy::Irreparable)
    }

    pub fn new_cas_from_stream_with_repair(
        expected_digest: Digest,
        stream: BoxReadStream,
        repair_strategy: RepairStrategy,
    ) -> Self {
        Self {
            kind: BufferKind::Cas {
                expected_digest,
                repair_strategy,
            },
            source: BufferSource::Stream(stream),
            integrity_callback: None,
        }
    }

    pub fn new_action_result_from_bytes(bytes: Bytes, max_message_size: usize) -> Self {
        Self {
            kind: BufferKind::ActionResult { max_message_size },
            source: BufferSource::Bytes(bytes),
            integrity_callback: None,
        }
    }

    pub fn new_reference_from_bytes(bytes: Bytes, max_message_size: usize) -> Self {
        Self {
            kind: BufferKind::Reference { max_message_size },
            source: BufferSource::Bytes(bytes),
            integrity_callback: None,
        }
    }

    pub fn new_pre_validated_from_bytes(bytes: Bytes) -> Self {
        Self {
            kind: BufferKind::PreValidated,
            source: BufferSource::Bytes(bytes),
            integrity_callback: None,
        }
    }

    pub fn new_pre_validated_from_stream(stream: BoxReadStream) -> Self {
        Self {
            kind: BufferKind::PreValidated,
            source: BufferSource::Stream(stream),
            integrity_callback: None,
        }
    }

    /// Registers a callback fired exactly once, when this buffer's (CAS) integrity is
    /// determined. Has no effect on non-CAS buffers beyond being dropped unfired.
    pub fn on_integrity_checked(mut self, callback: DataIntegrityCallback) -> Self {
        self.integrity_callback = Some(callback);
        self
    }

    /// Prefixes the wrapped error, if this buffer is already in a terminal error state.
    /// A no-op on a buffer carrying bytes or a stream, since there is nothing to annotate yet.
    pub fn with_error_prefix(self, prefix: impl std::fmt::Display) -> Self {
        match self.source {
            BufferSource::Error(err) => Self {
                source: BufferSource::Error(err.with_prefix(prefix)),
                ..self
            },
            other => Self { source: other, ..self },
        }
    }

    /// The declared size in bytes, if known without materializing the buffer (always known for
    /// CAS buffers; otherwise only if the bytes are already in memory).
    pub fn size_bytes(&self) -> Result<u64, StorageError> {
        match (&self.kind, &self.source) {
            (BufferKind::Cas { expected_digest, .. }, _) => Ok(expected_digest.size_bytes),
            (_, BufferSource::Bytes(bytes)) => Ok(bytes.len() as u64),
            (_, BufferSource::Error(err)) => Err(err.clone()),
            _ => Err(StorageError::Internal(
                "buffer size is unknown until materialized".to_string(),
            )),
        }
    }

    /// Materializes the full contents into memory, enforcing `max_size` and verifying
    /// integrity (for CAS buffers) along the way.
    pub async fn to_byte_slice(self, max_size: usize) -> Result<Bytes, StorageError> {
        let declared = self.size_bytes().ok();
        if let Some(declared) = declared {
            if declared as usize > max_size {
                return Err(StorageError::ResourceExhausted(format!(
                    "buffer of {declared} bytes exceeds max_size {max_size}"
                )));
            }
        }
        let stream = self.into_reader();
        let bytes = consolidate_stream(stream).await?;
        if bytes.len() > max_size {
            return Err(StorageError::ResourceExhausted(format!(
                "buffer of {} bytes exceeds max_size {max_size}",
                bytes.len()
            )));
        }
        Ok(bytes)
    }

    /// Consumes the buffer as a stream, verifying CAS integrity incrementally as chunks flow
    /// and firing any registered integrity callback exactly once at end-of-stream.
    pub fn into_reader(self) -> BoxReadStream {
        self.to_chunk_reader(0, usize::MAX)
    }

    /// Like `into_reader`, but skips `offset_bytes` and yields at most `chunk_size` bytes total.
    /// For CAS buffers the full content is still hashed internally (a partial read cannot be
    /// verified against the whole-blob digest), so slicing a CAS buffer foregoes verification of
    /// the sliced range; callers that need both should use `to_byte_slice` or a non-sliced read.
    pub fn to_chunk_reader(self, offset_bytes: u64, chunk_size: usize) -> BoxReadStream {
        let Buffer {
            kind,
            source,
            integrity_callback,
        } = self;

        let sliced = offset_bytes != 0 || chunk_size != usize::MAX;

        match (kind, source) {
            (_, BufferSource::Error(err)) => Box::pin(try_stream! {
                Err(err)?;
            }),
            (BufferKind::Cas { .. }, _) if sliced => {
                let inner = match source_into_stream(source) {
                    Ok(s) => s,
                    Err(err) => return Box::pin(try_stream! { Err(err)?; }),
                };
                slice_stream(inner, offset_bytes, chunk_size)
            }
            (
                BufferKind::Cas {
                    expected_digest,
                    repair_strategy,
                },
                source,
            ) => {
                let inner = match source_into_stream(source) {
                    Ok(s) => s,
                    Err(err) => return Box::pin(try_stream! { Err(err)?; }),
                };
                verify_cas_stream(expected_digest, repair_strategy, inner, integrity_callback)
            }
            (_, source) => {
                let inner = match source_into_stream(source) {
                    Ok(s) => s,
                    Err(err) => return Box::pin(try_stream! { Err(err)?; }),
                };
                if sliced {
                    slice_stream(inner, offset_bytes, chunk_size)
                } else {
                    inner
                }
            }
        }
    }

    /// Decodes this buffer as a protobuf message of type `T`, refusing to decode anything over
    /// `max_message_size` bytes (checked before any decode is attempted).
    pub async fn to_proto<T: Message + Default>(self) -> Result<T, StorageError> {
        let max_message_size = match &self.kind {
            BufferKind::ActionResult { max_message_size } => *max_message_size,
            BufferKind::Reference { max_message_size } => *max_message_size,
            _ => usize::MAX,
        };
        let bytes = self.to_byte_slice(max_message_size).await?;
        T::decode(bytes).map_err(|err| StorageError::InvalidArgument(format!("malformed protobuf: {err}")))
    }

    /// Drains this buffer's contents into `writer`, verifying CAS integrity incrementally.
    pub async fn into_writer<W: AsyncWrite + Unpin>(self, mut writer: W) -> Result<(), StorageError> {
        let mut stream = self.into_reader();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|err| StorageError::Internal(format!("write failed: {err}")))?;
        }
        writer
            .flush()
            .await
            .map_err(|err| StorageError::Internal(format!("flush failed: {err}")))?;
        Ok(())
    }

    /// Materializes into memory (bounded by `max_bytes_in_memory`) and returns two independent,
    /// pre-validated buffers carrying identical bytes.
    pub async fn clone_copy(self, max_bytes_in_memory: usize) -> Result<(Buffer, Buffer), StorageError> {
        let bytes = self.to_byte_slice(max_bytes_in_memory).await?;
        Ok((
            Buffer::new_pre_validated_from_bytes(bytes.clone()),
            Buffer::new_pre_validated_from_bytes(bytes),
        ))
    }

    /// Tees this buffer's stream into two independent buffers without buffering the whole
    /// payload in memory. Backpressure: a chunk is only pulled off the source once both
    /// destinations have accepted the previous one; if one side is dropped, the other continues
    /// unobstructed.
    pub fn clone_stream(self, max_bytes_in_memory: usize) -> (Buffer, Buffer) {
        let (tx_a, rx_a) = async_channel::bounded::<Result<Bytes, StorageError>>(max_bytes_in_memory.max(1).min(64));
        let (tx_b, rx_b) = async_channel::bounded::<Result<Bytes, StorageError>>(max_bytes_in_memory.max(1).min(64));

        let mut source = self.into_reader();
        tokio::spawn(async move {
            while let Some(item) = source.next().await {
                let a_alive = tx_a.send(item.clone()).await.is_ok();
                let b_alive = tx_b.send(item).await.is_ok();
                if !a_alive && !b_alive {
                    break;
                }
            }
        });

        let stream_a: BoxReadStream = Box::pin(rx_a);
        let stream_b: BoxReadStream = Box::pin(rx_b);
        (
            Buffer::new_pre_validated_from_stream(stream_a),
            Buffer::new_pre_validated_from_stream(stream_b),
        )
    }

    /// Discards the buffer without reading it. For a CAS buffer, no integrity verdict is ever
    /// produced (the callback, if any, is simply dropped unfired).
    pub fn discard(self) {}
}

fn source_into_stream(source: BufferSource) -> Result<BoxReadStream, StorageError> {
    match source {
        BufferSource::Bytes(bytes) => Ok(Box::pin(futures::stream::once(async move {
            Ok::<_, StorageError>(bytes)
        }))),
        BufferSource::Stream(stream) => Ok(stream),
        BufferSource::Error(err) => Err(err),
    }
}

fn slice_stream(mut inner: BoxReadStream, offset_bytes: u64, chunk_size: usize) -> BoxReadStream {
    Box::pin(try_stream! {
        let mut to_skip = offset_bytes;
        let mut remaining = chunk_size;
        while let Some(chunk) = inner.next().await {
            if remaining == 0 {
                break;
            }
            let mut chunk = chunk?;
            if to_skip > 0 {
                if (to_skip as usize) >= chunk.len() {
                    to_skip -= chunk.len() as u64;
                    continue;
                }
                chunk = chunk.slice(to_skip as usize..);
                to_skip = 0;
            }
            if chunk.len() > remaining {
                chunk = chunk.slice(..remaining);
            }
            remaining -= chunk.len();
            yield chunk;
        }
    })
}

fn verify_cas_stream(
    expected_digest: Digest,
    repair_strategy: RepairStrategy,
    mut inner: BoxReadStream,
    integrity_callback: Option<DataIntegrityCallback>,
) -> BoxReadStream {
    Box::pin(try_stream! {
        let mut hasher = expected_digest.hash_function.incremental_hasher();
        let mut total_len: u64 = 0;

        while let Some(chunk) = inner.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            total_len += chunk.len() as u64;
            yield chunk;
        }

        let actual_hash = hasher.finalize();
        let ok = total_len == expected_digest.size_bytes && actual_hash == expected_digest.hash;

        repair_strategy.on_verdict(&expected_digest, ok).await;
        if let Some(callback) = integrity_callback {
            callback(ok);
        }

        if !ok {
            let actual_digest = Digest::from_slice(
                expected_digest.instance_name.clone(),
                expected_digest.hash_function,
                &actual_hash,
                total_len,
            )
            .unwrap_or_else(|_| expected_digest.clone());
            if total_len != expected_digest.size_bytes {
                Err(StorageError::InvalidSize {
                    expected_size: expected_digest.size_bytes,
                    is_data_loss: true,
                })?;
            } else {
                Err(StorageError::InvalidHash {
                    expected_digest,
                    actual_digest,
                    is_data_loss: true,
                })?;
            }
        }
    })
}
