// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Shared helpers and the production `ConnectionGetter` implementation used by the Redis
//! drivers in this module.

use std::time::Instant;

use async_trait::async_trait;
use redis::aio::ConnectionLike;
use redis::{Cmd, FromRedisValue, Pipeline, RedisError, RedisResult};

use super::traits::AsRedisConnectionMut;

/// Obtains connections to Redis on behalf of a driver. Implementations may hand out connections
/// from a pool, a `ConnectionManager`, or (in tests) a canned mock.
#[async_trait]
pub trait ConnectionGetter {
    type Connection: ConnectionLike + AsRedisConnectionMut + Send + 'static;

    /// Obtain a connection. `read_write` is a hint that the caller intends to issue writes, which
    /// implementations that split reads to replicas can use to route to the primary.
    async fn get_redis_connection(&self, read_write: bool) -> Result<Self::Connection, RedisError>;

    /// Confirm that this backend can currently reach Redis.
    async fn verify_connection(&self) -> Result<(), String>;
}

/// Runs `cmd` against `conn`, recording latency and request-count metrics labeled by
/// `cmd_name`/`driver_label`.
pub async fn redis_query<C, V>(
    conn: &mut C,
    cmd_name: &'static str,
    driver_label: &'static str,
    cmd: &mut Cmd,
) -> Result<V, RedisError>
where
    C: ConnectionLike + Send,
    V: FromRedisValue,
{
    let start_time = Instant::now();
    let result: RedisResult<V> = cmd.query_async(conn).await;

    metrics::counter!(
        "toolchain_storage_redis_commands_total",
        1,
        "command" => cmd_name,
        "driver" => driver_label,
    );
    metrics::histogram!(
        "toolchain_storage_redis_command_duration_seconds",
        start_time.elapsed(),
        "command" => cmd_name,
        "driver" => driver_label,
    );

    result
}

/// Runs `pipeline` against `conn`, recording latency and request-count metrics labeled by
/// `cmd_name`/`driver_label`.
pub async fn redis_pipeline<C, V>(
    conn: &mut C,
    cmd_name: &'static str,
    driver_label: &'static str,
    pipeline: &Pipeline,
) -> Result<V, RedisError>
where
    C: ConnectionLike + Send,
    V: FromRedisValue,
{
    let start_time = Instant::now();
    let result: RedisResult<V> = pipeline.query_async(conn).await;

    metrics::counter!(
        "toolchain_storage_redis_commands_total",
        1,
        "command" => cmd_name,
        "driver" => driver_label,
    );
    metrics::histogram!(
        "toolchain_storage_redis_command_duration_seconds",
        start_time.elapsed(),
        "command" => cmd_name,
        "driver" => driver_label,
    );

    result
}

/// Identifies this connection to Redis via `CLIENT SETNAME`, which shows up in `CLIENT LIST` /
/// `INFO clients` on the server. Used by `verify_connection` implementations as a cheap
/// round-trip that also confirms authentication succeeded.
pub async fn send_info_cmd<C>(conn: &mut C, client_name: &str) -> RedisResult<()>
where
    C: ConnectionLike + Send,
{
    redis::cmd("CLIENT")
        .arg("SETNAME")
        .arg(client_name)
        .query_async(conn)
        .await
}

/// Production `ConnectionGetter` backed by a `redis::Client`, with an optional read-replica
/// client used for read-only requests.
#[derive(Clone)]
pub struct RedisBackend {
    name: String,
    primary: redis::Client,
    replica: Option<redis::Client>,
}

impl RedisBackend {
    pub fn new(name: impl Into<String>, primary_url: &str) -> RedisResult<Self> {
        Ok(RedisBackend {
            name: name.into(),
            primary: redis::Client::open(primary_url)?,
            replica: None,
        })
    }

    pub fn with_replica(mut self, replica_url: &str) -> RedisResult<Self> {
        self.replica = Some(redis::Client::open(replica_url)?);
        Ok(self)
    }
}

#[async_trait]
impl ConnectionGetter for RedisBackend {
    type Connection = redis::aio::Connection;

    async fn get_redis_connection(&self, read_write: bool) -> Result<Self::Connection, RedisError> {
        let client = if read_write {
            &self.primary
        } else {
            self.replica.as_ref().unwrap_or(&self.primary)
        };
        client.get_async_connection().await
    }

    async fn verify_connection(&self) -> Result<(), String> {
        let mut conn = self
            .get_redis_connection(true)
            .await
            .map_err(|err| format!("Redis error: {err}"))?;
        send_info_cmd(&mut conn, &self.name)
            .await
            .map_err(|err| format!("Redis error: {err}"))
    }
}
