// Copyright 2020 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
#![allow(clippy::derive_partial_eq_without_eq)]

//! Hand-written `prost::Message` definitions for the handful of REv2/ICAS wire fields this
//! crate's callers actually read or write.
//!
//! The core does not vendor or code-generate the Bazel Remote Execution v2 proto tree: per its
//! scope, the wire schemas themselves are an external collaborator's concern. Only the fields
//! named below are part of the contract.

pub mod action_cache;
pub mod icas;
