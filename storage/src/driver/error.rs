// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use redis::RedisError;
use tonic::Status;

use digest::Digest;

/// The coarse error taxonomy shared by every `BlobAccess` operation and by `Buffer` consumer
/// methods. Decorators wrap the message with a human-readable context fragment (backend name,
/// instance name) using a consistent `"<Prefix>: <message>"` format; the underlying variant is
/// preserved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum StorageError {
    /// The object is absent. A normal outcome, never logged as fatal; consumed locally by
    /// fallback/mirror/hierarchical/read-canarying decorators where documented.
    NotFound(String),
    Cancelled(String),
    InvalidArgument(String),
    PermissionDenied(String),
    /// A `Buffer` consumer exceeded a declared size limit (e.g. `maxSize` on `ToByteSlice`, or
    /// a protobuf kind's max-message-size).
    ResourceExhausted(String),
    InvalidSize {
        expected_size: u64,
        is_data_loss: bool,
    },
    InvalidHash {
        expected_digest: Digest,
        actual_digest: Digest,
        is_data_loss: bool,
    },
    /// Integrity failure on read, or other inconsistent backend state.
    Internal(String),
    /// A transient backend/network failure ("infrastructure error").
    Unavailable(String),
    DeadlineExceeded(String),
    /// The operation is not supported by a backend (e.g. AC `FindMissing`).
    Unimplemented(String),
    OutOfRange(String, usize),
}

impl std::error::Error for StorageError {}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageError::NotFound(msg) => write!(f, "Not found: {msg}"),
            StorageError::Cancelled(msg) => write!(f, "Cancelled: {msg}"),
            StorageError::InvalidArgument(msg) => write!(f, "Invalid argument: {msg}"),
            StorageError::PermissionDenied(msg) => write!(f, "Permission denied: {msg}"),
            StorageError::ResourceExhausted(msg) => write!(f, "Resource exhausted: {msg}"),
            StorageError::InvalidSize {
                expected_size,
                is_data_loss,
            } => {
                if *is_data_loss {
                    write!(
                        f,
                        "Invalid size detected for content in data store (expected size was {expected_size})"
                    )
                } else {
                    write!(
                        f,
                        "Invalid size for provided content (expected size was {expected_size})"
                    )
                }
            }
            StorageError::InvalidHash {
                expected_digest,
                actual_digest,
                is_data_loss,
            } => {
                if *is_data_loss {
                    write!(
                        f,
                        "Invalid hash detected for content in data store (expected digest was {expected_digest:?}, actual digest is {actual_digest:?})"
                    )
                } else {
                    write!(
                        f,
                        "Invalid hash for provided content (expected digest was {expected_digest:?}, actual digest is {actual_digest:?})"
                    )
                }
            }
            StorageError::Internal(msg) => write!(f, "{msg}"),
            StorageError::Unavailable(msg) => write!(f, "{msg}"),
            StorageError::DeadlineExceeded(msg) => write!(f, "Deadline exceeded: {msg}"),
            StorageError::Unimplemented(msg) => write!(f, "Unimplemented: {msg}"),
            StorageError::OutOfRange(param_name, value) => {
                write!(f, "Out-of-range value {param_name} for parameter {value}")
            }
        }
    }
}

impl StorageError {
    /// Prefixes this error's message with `prefix` (e.g. a backend name or instance name),
    /// preserving the underlying variant, per the decorator wrapping convention in §7.
    pub fn with_prefix(self, prefix: impl fmt::Display) -> Self {
        let wrap = |msg: String| format!("{prefix}: {msg}");
        match self {
            Self::NotFound(msg) => Self::NotFound(wrap(msg)),
            Self::Cancelled(msg) => Self::Cancelled(wrap(msg)),
            Self::InvalidArgument(msg) => Self::InvalidArgument(wrap(msg)),
            Self::PermissionDenied(msg) => Self::PermissionDenied(wrap(msg)),
            Self::ResourceExhausted(msg) => Self::ResourceExhausted(wrap(msg)),
            Self::Internal(msg) => Self::Internal(wrap(msg)),
            Self::Unavailable(msg) => Self::Unavailable(wrap(msg)),
            Self::DeadlineExceeded(msg) => Self::DeadlineExceeded(wrap(msg)),
            Self::Unimplemented(msg) => Self::Unimplemented(wrap(msg)),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// The distinguished predicate over error codes used by the read-canarying decorator (§4.13) to
/// decide whether a failure reflects the replica being untrustworthy, versus a normal
/// application-level error (e.g. a malformed request) that says nothing about reliability.
pub fn is_infrastructure_error(err: &StorageError) -> bool {
    matches!(
        err,
        StorageError::Unavailable(_) | StorageError::DeadlineExceeded(_) | StorageError::Cancelled(_)
    )
}

impl From<RedisError> for StorageError {
    fn from(err: RedisError) -> Self {
        let err_str = format!("Redis error: {err}");
        if err.is_io_error()
            || err.is_cluster_error()
            || err.is_connection_refusal()
            || err.is_connection_dropped()
            || err.is_timeout()
        {
            StorageError::Unavailable(err_str)
        } else {
            StorageError::Internal(err_str)
        }
    }
}

impl From<String> for StorageError {
    fn from(msg: String) -> Self {
        StorageError::Internal(msg)
    }
}

impl From<StorageError> for String {
    fn from(err: StorageError) -> Self {
        format!("{err}")
    }
}

impl From<StorageError> for Status {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => Status::not_found(msg),
            StorageError::Cancelled(msg) => Status::cancelled(msg),
            StorageError::InvalidArgument(msg) => Status::invalid_argument(msg),
            StorageError::PermissionDenied(msg) => Status::permission_denied(msg),
            StorageError::ResourceExhausted(msg) => Status::resource_exhausted(msg),
            StorageError::InvalidSize { is_data_loss, .. }
            | StorageError::InvalidHash { is_data_loss, .. } => {
                let msg = format!("{err}");
                if is_data_loss {
                    Status::data_loss(msg)
                } else {
                    Status::invalid_argument(msg)
                }
            }
            StorageError::Internal(msg) => Status::internal(msg),
            StorageError::Unavailable(msg) => Status::unavailable(msg),
            StorageError::DeadlineExceeded(msg) => Status::deadline_exceeded(msg),
            StorageError::Unimplemented(msg) => Status::unimplemented(msg),
            StorageError::OutOfRange(_, _) => {
                let msg = format!("{err}");
                Status::out_of_range(msg)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn infrastructure_error_predicate() {
        assert!(is_infrastructure_error(&StorageError::Unavailable(
            "down".into()
        )));
        assert!(is_infrastructure_error(&StorageError::DeadlineExceeded(
            "too slow".into()
        )));
        assert!(!is_infrastructure_error(&StorageError::InvalidArgument(
            "bad".into()
        )));
        assert!(!is_infrastructure_error(&StorageError::NotFound(
            "missing".into()
        )));
    }

    #[test]
    fn with_prefix_preserves_variant() {
        let err = StorageError::NotFound("digest".into()).with_prefix("Backend A");
        assert_eq!(err, StorageError::NotFound("Backend A: digest".into()));
        assert!(err.is_not_found());
    }
}
