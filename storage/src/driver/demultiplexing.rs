// Copyright 2022 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! Routes requests to one of several backends by instance name, rewriting the instance name on
//! the way in and out via an `InstanceNamePatcher` per route. Grounded on the teacher's
//! `DarkLaunchStorage`, which routed between exactly two backends by a fixed `HashSet` of
//! instance names; this generalizes to an arbitrary number of routes, matched by longest
//! instance-name prefix, as REAPI instance names are themselves hierarchical.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;

use digest::{Digest, DigestSet, InstanceName, InstanceNamePatcher};

use crate::buffer::Buffer;
use crate::context::Context;
use crate::driver::{BlobAccess, StorageError};

/// One routable destination: requests under `prefix` (or any descendant instance name) go to
/// `backend`, with the instance name rewritten by `patcher` before the call and rewritten back
/// on any digest `backend` returns.
pub struct Route {
    pub name: String,
    pub prefix: InstanceName,
    pub backend: Arc<dyn BlobAccess>,
    pub patcher: InstanceNamePatcher,
}

impl Route {
    pub fn new(name: impl Into<String>, prefix: InstanceName, backend: Arc<dyn BlobAccess>) -> Self {
        Self {
            name: name.into(),
            patcher: InstanceNamePatcher::identity(),
            prefix,
            backend,
        }
    }

    pub fn with_patcher(mut self, patcher: InstanceNamePatcher) -> Self {
        self.patcher = patcher;
        self
    }
}

const DEFAULT_ROUTE_NAME: &str = "default";

/// Dispatches by instance name across any number of backends. The route whose `prefix` is the
/// longest match for a given instance name wins; if none match, `default` is used unpatched.
///
/// `find_missing` queries each matched backend's partition sequentially by default, since most
/// deployments route few instance names to many backends and concurrent fan-out buys little;
/// set `parallel` to run the partitions concurrently instead.
pub struct DemultiplexingStorage {
    routes: Vec<Route>,
    default: Arc<dyn BlobAccess>,
    parallel: bool,
}

impl DemultiplexingStorage {
    pub fn new(routes: Vec<Route>, default: Arc<dyn BlobAccess>) -> Self {
        Self {
            routes,
            default,
            parallel: false,
        }
    }

    pub fn with_parallel_find_missing(mut self, parallel: bool) -> Self {
        self.parallel = parallel;
        self
    }

    fn resolve(&self, instance_name: &InstanceName) -> (&str, &dyn BlobAccess, &InstanceNamePatcher) {
        static IDENTITY: once_identity::Identity = once_identity::Identity;
        self.routes
            .iter()
            .filter(|route| instance_name.starts_with(&route.prefix))
            .max_by_key(|route| route.prefix.components().len())
            .map(|route| (route.name.as_str(), route.backend.as_ref(), &route.patcher))
            .unwrap_or((DEFAULT_ROUTE_NAME, self.default.as_ref(), IDENTITY.get()))
    }
}

/// A single statically-initialized identity patcher, handed out as a `&InstanceNamePatcher` for
/// the unmatched/default routing case.
mod once_identity {
    use std::sync::OnceLock;

    use digest::InstanceNamePatcher;

    pub struct Identity;

    impl Identity {
        pub fn get(&self) -> &'static InstanceNamePatcher {
            static CELL: OnceLock<InstanceNamePatcher> = OnceLock::new();
            CELL.get_or_init(InstanceNamePatcher::identity)
        }
    }
}

#[async_trait]
impl BlobAccess for DemultiplexingStorage {
    async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
        let (name, backend, patcher) = self.resolve(&digest.instance_name);
        let patched = match patcher.patch_digest(&digest) {
            Ok(d) => d,
            Err(err) => return Buffer::new_error(StorageError::InvalidArgument(err)),
        };
        let buffer = backend.get(ctx, patched).await;
        buffer.with_error_prefix(format!("Backend \"{name}\""))
    }

    async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
        let (name, backend, patcher) = self.resolve(&digest.instance_name);
        let patched = patcher
            .patch_digest(&digest)
            .map_err(StorageError::InvalidArgument)?;
        backend
            .put(ctx, patched, buffer)
            .await
            .map_err(|err| err.with_prefix(format!("Backend \"{name}\"")))
    }

    async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
        // Partition by instance name first, then regroup by resolved backend name so that two
        // instance names routed to the same backend share a single `find_missing` call, per §4.7.
        struct Group<'a> {
            backend: &'a dyn BlobAccess,
            // One entry per instance-name partition routed here: its patcher and the patched
            // (outgoing) subset, kept separate so results can be unpatched correctly afterward.
            subsets: Vec<(&'a InstanceNamePatcher, DigestSet)>,
        }

        let mut groups: std::collections::BTreeMap<&str, Group> = std::collections::BTreeMap::new();
        for (instance_name, subset) in digests.partition_by_instance_name() {
            let (name, backend, patcher) = self.resolve(&instance_name);
            let patched_subset: DigestSet = subset
                .iter()
                .map(|d| patcher.patch_digest(d))
                .collect::<Result<DigestSet, _>>()
                .map_err(StorageError::InvalidArgument)?;
            groups
                .entry(name)
                .or_insert_with(|| Group { backend, subsets: Vec::new() })
                .subsets
                .push((patcher, patched_subset));
        }

        let queries = groups.into_iter().map(|(name, group)| async move {
            let combined_patched = group
                .subsets
                .iter()
                .fold(DigestSet::empty(), |acc, (_, subset)| acc.union(subset));
            let missing_patched = group
                .backend
                .find_missing(ctx, combined_patched)
                .await
                .map_err(|err| err.with_prefix(format!("Backend \"{name}\"")))?;
            let mut unpatched = DigestSet::empty();
            for (patcher, subset) in &group.subsets {
                for digest in subset.iter() {
                    if missing_patched.contains(digest) {
                        unpatched.insert(patcher.unpatch_digest(digest).map_err(StorageError::InvalidArgument)?);
                    }
                }
            }
            Ok::<DigestSet, StorageError>(unpatched)
        });

        let mut combined = DigestSet::empty();
        if self.parallel {
            for result in join_all(queries).await {
                combined = combined.union(&result?);
            }
        } else {
            for query in queries {
                combined = combined.union(&query.await?);
            }
        }
        Ok(combined)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::MemoryStorage;
    use crate::testutil::TestData;
    use digest::HashFunction;

    fn digest_for(instance_name: &str, content: &'static [u8]) -> Digest {
        Digest::of_bytes(
            InstanceName::from(instance_name),
            HashFunction::Sha256,
            &bytes::Bytes::from_static(content),
        )
    }

    #[tokio::test]
    async fn routes_by_longest_prefix() {
        let team_a = Arc::new(MemoryStorage::new());
        let team_b = Arc::new(MemoryStorage::new());
        let default = Arc::new(MemoryStorage::new());

        let storage = DemultiplexingStorage::new(
            vec![
                Route::new("team-a", InstanceName::from("team-a"), team_a.clone()),
                Route::new("team-a-ci", InstanceName::from("team-a/ci"), team_b.clone()),
            ],
            default.clone(),
        );
        let ctx = Context::new();

        let a_digest = digest_for("team-a", b"foobar");
        storage.put(&ctx, a_digest.clone(), Buffer::new_cas_from_bytes(a_digest.clone(), bytes::Bytes::from_static(b"foobar"))).await.unwrap();
        assert!(team_a
            .find_missing(&ctx, DigestSet::to_singleton_set(a_digest))
            .await
            .unwrap()
            .is_empty());

        let ci_digest = digest_for("team-a/ci", b"foobar");
        storage.put(&ctx, ci_digest.clone(), Buffer::new_cas_from_bytes(ci_digest.clone(), bytes::Bytes::from_static(b"foobar"))).await.unwrap();
        assert!(team_b
            .find_missing(&ctx, DigestSet::to_singleton_set(ci_digest))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn unmatched_instance_goes_to_default() {
        let default = Arc::new(MemoryStorage::new());
        let storage = DemultiplexingStorage::new(vec![], default.clone());
        let ctx = Context::new();
        let content = TestData::from_static(b"foobar");

        storage.put(&ctx, content.digest.clone(), content.buffer()).await.unwrap();
        assert!(default
            .find_missing(&ctx, DigestSet::to_singleton_set(content.digest))
            .await
            .unwrap()
            .is_empty());
    }

    /// Wraps a backend and counts `find_missing` invocations, so tests can assert on call count
    /// rather than just on the result.
    struct CountingStorage {
        inner: MemoryStorage,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    #[async_trait]
    impl BlobAccess for CountingStorage {
        async fn get(&self, ctx: &Context, digest: Digest) -> Buffer {
            self.inner.get(ctx, digest).await
        }

        async fn put(&self, ctx: &Context, digest: Digest, buffer: Buffer) -> Result<(), StorageError> {
            self.inner.put(ctx, digest, buffer).await
        }

        async fn find_missing(&self, ctx: &Context, digests: DigestSet) -> Result<DigestSet, StorageError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            self.inner.find_missing(ctx, digests).await
        }
    }

    #[tokio::test]
    async fn find_missing_shares_one_call_across_instance_names_on_same_backend() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let calls = Arc::new(AtomicUsize::new(0));
        let shared_backend = Arc::new(CountingStorage {
            inner: MemoryStorage::new(),
            calls: calls.clone(),
        });

        let storage = DemultiplexingStorage::new(
            vec![
                Route::new("shared", InstanceName::from("team-a"), shared_backend.clone()),
                Route::new("shared", InstanceName::from("team-b"), shared_backend.clone()),
            ],
            Arc::new(MemoryStorage::new()),
        );
        let ctx = Context::new();

        let digest_a = digest_for("team-a", b"from a");
        let digest_b = digest_for("team-b", b"from b");

        let missing = storage
            .find_missing(&ctx, DigestSet::from_iter([digest_a.clone(), digest_b.clone()]))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1, "both partitions share one backend and must share one call");
        assert_eq!(missing, DigestSet::from_iter([digest_a, digest_b]));
    }
}
