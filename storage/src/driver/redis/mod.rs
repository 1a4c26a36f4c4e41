// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

pub mod common;
mod direct;
pub(crate) mod traits;

#[cfg(test)]
mod testutil;

pub use common::RedisBackend;
pub use direct::RedisStorage;
pub use traits::{AsRedisConnectionMut, IdentifyRedisConnection, RedisConnectionName};
