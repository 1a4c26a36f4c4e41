// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Stores blobs in Redis as single keys, GET/SET-style. Intended for small blobs (action results,
//! references, or a CAS tier backing a small-object cache); large CAS content belongs behind
//! `ChunkingStorage` or an object-store backend instead.
//!
//! Keys have the format: `<hex-hash>-<sizeBytes>-<instance with '/' replaced by '-'>`, per
//! `Digest::key_with_instance`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::try_join_all;
use itertools::Itertools;
use redis::FromRedisValue;

use digest::{Digest, DigestSet};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::redis::common::{redis_pipeline, redis_query, ConnectionGetter};
use crate::driver::{BlobAccess, StorageError};

const DRIVER_LABEL: &str = "redis_direct";

/// Digests per `EXISTS` pipeline batch; keeps each round trip comfortably under common RPC
/// message-size limits.
const FIND_MISSING_BATCH_SIZE: usize = 10_000;

#[derive(Clone)]
pub struct RedisStorage<C>
where
    C: ConnectionGetter + Clone + Send + Sync,
{
    conn: C,
    prefix: String,
}

impl<C> RedisStorage<C>
where
    C: ConnectionGetter + Clone + Send + Sync + 'static,
{
    pub fn new(conn: C, prefix: Option<String>) -> Self {
        Self {
            conn,
            prefix: prefix.unwrap_or_default(),
        }
    }

    fn key_for_digest(&self, digest: &Digest) -> String {
        format!("{}{}", self.prefix, digest.key_with_instance())
    }
}

#[async_trait]
impl<C> BlobAccess for RedisStorage<C>
where
    C: ConnectionGetter + Clone + Send + Sync + 'static,
{
    async fn get(&self, _ctx: &Context, digest: Digest) -> Buffer {
        let key = self.key_for_digest(&digest);
        let mut conn = match self.conn.get_redis_connection(false).await {
            Ok(conn) => conn,
            Err(err) => return Buffer::new_error(err.into()),
        };

        let data_opt: Result<Option<Vec<u8>>, _> =
            redis_query(&mut conn, "GET", DRIVER_LABEL, redis::cmd("GET").arg(&key)).await;

        match data_opt {
            Ok(Some(data)) => Buffer::new_cas_from_bytes(digest, Bytes::from(data)),
            Ok(None) => Buffer::new_error(StorageError::NotFound(digest.key_with_instance())),
            Err(err) => Buffer::new_error(err.into()),
        }
    }

    async fn put(&self, _ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let key = self.key_for_digest(&digest);
        let content = buffer.to_byte_slice(digest.size_bytes as usize).await?;

        let mut conn = self.conn.get_redis_connection(true).await?;
        redis_query::<_, ()>(&mut conn, "SET", DRIVER_LABEL, redis::cmd("SET").arg(&key).arg(&content[..]))
            .await?;
        Ok(())
    }

    async fn find_missing(&self, _ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let batches = digests
            .iter()
            .cloned()
            .chunks(FIND_MISSING_BATCH_SIZE)
            .into_iter()
            .map(Iterator::collect::<Vec<_>>)
            .collect::<Vec<_>>();

        let batch_futures = batches.into_iter().map(|batch| async move {
            let mut pipeline = redis::pipe();
            for digest in &batch {
                pipeline.cmd("EXISTS").arg(self.key_for_digest(digest));
            }

            let mut conn = self.conn.get_redis_connection(false).await?;
            let exists_values: Vec<redis::Value> =
                redis_pipeline(&mut conn, "EXISTS", DRIVER_LABEL, &pipeline).await?;
            let exists_results: Vec<bool> = <bool as FromRedisValue>::from_redis_values(&exists_values)?;

            let missing: Vec<Digest> = batch
                .into_iter()
                .zip(exists_results)
                .filter_map(|(digest, exists)| if exists { None } else { Some(digest) })
                .collect();
            Ok::<_, StorageError>(missing)
        });

        let missing = try_join_all(batch_futures).await?.into_iter().flatten().collect::<DigestSet>();
        Ok(missing)
    }
}
