// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Authorization decorators: a cheap write-only instance-name gate, and a fuller per-operation
//! `Authorizer` that can deny any of Get/Put/FindMissing based on the instance names involved.

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;

use digest::{Digest, DigestSet, InstanceName};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, Capabilities, StorageError};

/// A predicate on `InstanceName` applied only to `Put`. Reads and `FindMissing` pass through
/// unchecked, since this gate exists to stop writes into instance names a caller shouldn't be
/// able to populate, not to hide existing content from them.
pub struct InstanceNameWriteGate<BA> {
    underlying: BA,
    allow: Arc<dyn Fn(&InstanceName) -> bool + Send + Sync>,
}

impl<BA> InstanceNameWriteGate<BA> {
    pub fn new(underlying: BA, allow: Arc<dyn Fn(&InstanceName) -> bool + Send + Sync>) -> Self {
        Self { underlying, allow }
    }
}

#[async_trait]
impl<BA> BlobAccess for InstanceNameWriteGate<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        self.underlying.get(ctx, digest).await
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        if !(self.allow)(&digest.instance_name) {
            buffer.discard();
            return Err(StorageError::PermissionDenied(format!(
                "writes to instance name \"{}\" are not permitted",
                digest.instance_name
            )));
        }
        self.underlying.put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        self.underlying.find_missing(ctx, digests).await
    }
}

/// Authorizes a single instance name for one kind of operation, returning the offending instance
/// name's denial reason if disallowed.
#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn authorize(&self, instance_name: &InstanceName) -> Result<(), String>;
}

/// Allows everything; the default when an operation has no authorization requirement.
pub struct AllowAll;

#[async_trait]
impl Authorizer for AllowAll {
    async fn authorize(&self, _instance_name: &InstanceName) -> Result<(), String> {
        Ok(())
    }
}

/// Gates all three operations behind independent `Authorizer`s. `FindMissing` authorizes the
/// deduplicated set of instance names present in the request and fails fast on the first denial.
pub struct AuthorizingStorage<BA> {
    underlying: BA,
    get_auth: Arc<dyn Authorizer>,
    put_auth: Arc<dyn Authorizer>,
    find_missing_auth: Arc<dyn Authorizer>,
}

impl<BA> AuthorizingStorage<BA> {
    pub fn new(
        underlying: BA,
        get_auth: Arc<dyn Authorizer>,
        put_auth: Arc<dyn Authorizer>,
        find_missing_auth: Arc<dyn Authorizer>,
    ) -> Self {
        Self {
            underlying,
            get_auth,
            put_auth,
            find_missing_auth,
        }
    }
}

#[async_trait]
impl<BA> BlobAccess for AuthorizingStorage<BA>
where
    BA: BlobAccess + Send + Sync + 'static,
{
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        if let Err(reason) = self.get_auth.authorize(&digest.instance_name).await {
            return Buffer::new_error(StorageError::PermissionDenied(format!(
                "instance name \"{}\": {reason}",
                digest.instance_name
            )));
        }
        self.underlying.get(ctx, digest).await
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        if let Err(reason) = self.put_auth.authorize(&digest.instance_name).await {
            buffer.discard();
            return Err(StorageError::PermissionDenied(format!(
                "instance name \"{}\": {reason}",
                digest.instance_name
            )));
        }
        self.underlying.put(ctx, digest, buffer).await
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        let instance_names: BTreeSet<InstanceName> =
            digests.iter().map(|d| d.instance_name.clone()).collect();
        for instance_name in &instance_names {
            if let Err(reason) = self.find_missing_auth.authorize(instance_name).await {
                return Err(StorageError::PermissionDenied(format!(
                    "instance name \"{instance_name}\": {reason}"
                )));
            }
        }
        self.underlying.find_missing(ctx, digests).await
    }

    async fn get_capabilities(
        &self,
        ctx: &Context,
        instance_name: &InstanceName,
    ) -> Result<Capabilities, StorageError> {
        self.underlying.get_capabilities(ctx, instance_name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryStorage;
    use crate::testutil::TestData;

    struct DenyInstance(&'static str);

    #[async_trait]
    impl Authorizer for DenyInstance {
        async fn authorize(&self, instance_name: &InstanceName) -> Result<(), String> {
            if instance_name.to_string() == self.0 {
                Err("denied by policy".to_string())
            } else {
                Ok(())
            }
        }
    }

    #[tokio::test]
    async fn write_gate_denies_disallowed_instance_name() {
        let storage = InstanceNameWriteGate::new(
            MemoryStorage::new(),
            Arc::new(|name: &InstanceName| name.to_string() != "forbidden"),
        );
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");
        let denied_digest = content.digest.clone().with_instance_name(InstanceName::from("forbidden"));

        let result = storage.put(&ctx, denied_digest, content.buffer()).await;
        assert!(matches!(result, Err(StorageError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn write_gate_allows_permitted_instance_name() {
        let storage = InstanceNameWriteGate::new(MemoryStorage::new(), Arc::new(|_: &InstanceName| true));
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");
        storage.put(&ctx, content.digest, content.buffer()).await.unwrap();
    }

    #[tokio::test]
    async fn authorizer_denies_find_missing_for_one_bad_instance_name() {
        let storage = AuthorizingStorage::new(
            MemoryStorage::new(),
            Arc::new(AllowAll),
            Arc::new(AllowAll),
            Arc::new(DenyInstance("forbidden")),
        );
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");
        let denied_digest = content.digest.with_instance_name(InstanceName::from("forbidden"));

        let result = storage.find_missing(&ctx, DigestSet::to_singleton_set(denied_digest)).await;
        assert!(matches!(result, Err(StorageError::PermissionDenied(_))));
    }
}
