// Copyright 2023 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

//! An Indirect CAS (ICAS) entry: rather than storing a blob's bytes directly, it records where
//! the bytes can be fetched from. Read by the reference-expanding `BlobAccess` decorator.

use prost::{Message, Oneof};

#[derive(Clone, PartialEq, Message)]
pub struct HttpUrl {
    #[prost(string, tag = "1")]
    pub url: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct S3Location {
    #[prost(string, tag = "1")]
    pub bucket: String,
    #[prost(string, tag = "2")]
    pub key: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct GcsLocation {
    #[prost(string, tag = "1")]
    pub bucket: String,
    #[prost(string, tag = "2")]
    pub object: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum Decompressor {
    Identity = 0,
    Deflate = 1,
    Zstd = 2,
}

impl Decompressor {
    pub fn from_i32(value: i32) -> Option<Self> {
        match value {
            0 => Some(Self::Identity),
            1 => Some(Self::Deflate),
            2 => Some(Self::Zstd),
            _ => None,
        }
    }
}

#[derive(Clone, PartialEq, Oneof)]
pub enum Medium {
    #[prost(message, tag = "1")]
    HttpUrl(HttpUrl),
    #[prost(message, tag = "2")]
    S3(S3Location),
    #[prost(message, tag = "3")]
    Gcs(GcsLocation),
}

#[derive(Clone, PartialEq, Message)]
pub struct IndirectContentEntry {
    #[prost(oneof = "Medium", tags = "1,2,3")]
    pub medium: Option<Medium>,

    /// Byte offset into the referenced object at which the content begins.
    #[prost(uint64, tag = "4")]
    pub offset_bytes: u64,

    /// Number of bytes to read starting at `offset_bytes`. Zero means "to the end".
    #[prost(uint64, tag = "5")]
    pub size_bytes: u64,

    #[prost(int32, tag = "6")]
    pub decompressor: i32,
}

impl IndirectContentEntry {
    pub fn decompressor(&self) -> Decompressor {
        Decompressor::from_i32(self.decompressor).unwrap_or(Decompressor::Identity)
    }
}
