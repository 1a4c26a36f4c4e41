// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! The scoped-cancellation substrate threaded through every `BlobAccess` call: a
//! `CancellationToken` plus an optional deadline, mirroring the way a request-scoped context
//! stops in-flight work when a caller hangs up or a deadline elapses.

use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;

use crate::driver::error::StorageError;

/// A request-scoped handle carrying cancellation and an optional deadline. Decorators that fan
/// out to multiple backends (mirrored, hierarchical, demultiplexing) pass clones of the same
/// `Context` down each branch; cancelling it from any path stops the others.
#[derive(Clone, Debug)]
pub struct Context {
    cancellation: CancellationToken,
    deadline: Option<Instant>,
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl Context {
    pub fn new() -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: None,
        }
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            deadline: Some(deadline),
        }
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    /// A child context: cancelling `self` also cancels the child, but not vice versa. Used when
    /// a decorator needs to cancel one branch (e.g. a losing canary race) without affecting the
    /// caller's own context.
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            deadline: self.deadline,
        }
    }

    pub fn cancel(&self) {
        self.cancellation.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }

    /// Returns an error if this context is already cancelled or past its deadline, else `Ok(())`.
    /// Called by backends at the start of an operation and decorators between fan-out steps.
    pub fn check(&self) -> Result<(), StorageError> {
        if self.is_cancelled() {
            return Err(StorageError::Cancelled("context cancelled".to_string()));
        }
        if self.is_expired() {
            return Err(StorageError::DeadlineExceeded(
                "context deadline exceeded".to_string(),
            ));
        }
        Ok(())
    }

    /// Races `fut` against cancellation/deadline, translating the loser into the same errors
    /// `check` produces.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, StorageError>
    where
        F: std::future::Future<Output = Result<T, StorageError>>,
    {
        self.check()?;
        match self.deadline {
            Some(deadline) => {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::select! {
                    _ = self.cancellation.cancelled() => {
                        Err(StorageError::Cancelled("context cancelled".to_string()))
                    }
                    _ = tokio::time::sleep(remaining) => {
                        Err(StorageError::DeadlineExceeded("context deadline exceeded".to_string()))
                    }
                    result = fut => result,
                }
            }
            None => {
                tokio::select! {
                    _ = self.cancellation.cancelled() => {
                        Err(StorageError::Cancelled("context cancelled".to_string()))
                    }
                    result = fut => result,
                }
            }
        }
    }
}
