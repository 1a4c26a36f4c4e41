// Copyright 2021 Toolchain Labs, Inc. All rights reserved.
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::fmt;

use bytes::Bytes;
use md5::Md5;
use sha1::Sha1;
use sha2::{Digest as Sha2Digest, Sha256, Sha384, Sha512};

// See the [`hashing` crate](https://github.com/pantsbuild/pants/blob/master/src/rust/engine/hashing/src/lib.rs)
// for the inspiration for this module.

/// The hash functions a `Digest` may be computed with. Mirrors the REv2 `digest_function`
/// enumeration without pulling in the full REv2 proto schema (out of scope for this crate).
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub enum HashFunction {
    Md5,
    Sha1,
    Sha256,
    Sha384,
    Sha512,
}

impl HashFunction {
    pub fn digest_length_bytes(&self) -> usize {
        match self {
            Self::Md5 => 16,
            Self::Sha1 => 20,
            Self::Sha256 => 32,
            Self::Sha384 => 48,
            Self::Sha512 => 64,
        }
    }

    /// The hash of the zero-byte blob, for this hash function.
    pub fn empty_hash(&self) -> &'static [u8] {
        match self {
            Self::Md5 => &[
                0xd4, 0x1d, 0x8c, 0xd9, 0x8f, 0x00, 0xb2, 0x04, 0xe9, 0x80, 0x09, 0x98, 0xec, 0xf8,
                0x42, 0x7e,
            ],
            Self::Sha1 => &[
                0xda, 0x39, 0xa3, 0xee, 0x5e, 0x6b, 0x4b, 0x0d, 0x32, 0x55, 0xbf, 0xef, 0x95, 0x60,
                0x18, 0x90, 0xaf, 0xd8, 0x07, 0x09,
            ],
            Self::Sha256 => &[
                0xe3, 0xb0, 0xc4, 0x42, 0x98, 0xfc, 0x1c, 0x14, 0x9a, 0xfb, 0xf4, 0xc8, 0x99, 0x6f,
                0xb9, 0x24, 0x27, 0xae, 0x41, 0xe4, 0x64, 0x9b, 0x93, 0x4c, 0xa4, 0x95, 0x99, 0x1b,
                0x78, 0x52, 0xb8, 0x55,
            ],
            Self::Sha384 => &[
                0x38, 0xb0, 0x60, 0xa7, 0x51, 0xac, 0x96, 0x38, 0x4c, 0xd9, 0x32, 0x7e, 0xb1, 0xb1,
                0xe3, 0x6a, 0x21, 0xfd, 0xb7, 0x11, 0x14, 0xbe, 0x07, 0x43, 0x4c, 0x0c, 0xc7, 0xbf,
                0x63, 0xf6, 0xe1, 0xda, 0x27, 0x4e, 0xde, 0xbf, 0xe7, 0x6f, 0x65, 0xfb, 0xd5, 0x1a,
                0xd2, 0xf1, 0x48, 0x98, 0xb9, 0x5b,
            ],
            Self::Sha512 => &[
                0xcf, 0x83, 0xe1, 0x35, 0x7e, 0xef, 0xb8, 0xbd, 0xf1, 0x54, 0x28, 0x50, 0xd6, 0x6d,
                0x80, 0x07, 0xd6, 0x20, 0xe4, 0x05, 0x0b, 0x57, 0x15, 0xdc, 0x83, 0xf4, 0xa9, 0x21,
                0xd3, 0x6c, 0xe9, 0xce, 0x47, 0xd0, 0xd1, 0x3c, 0x5d, 0x85, 0xf2, 0xb0, 0xff, 0x83,
                0x18, 0xd2, 0x87, 0x7e, 0xec, 0x2f, 0x63, 0xb9, 0x31, 0xbd, 0x47, 0x41, 0x7a, 0x81,
                0xa5, 0x38, 0x32, 0x7a, 0xf9, 0x27, 0xda, 0x3e,
            ],
        }
    }

    pub fn hash_bytes(&self, content: &[u8]) -> Vec<u8> {
        match self {
            Self::Md5 => Md5::default().chain_update(content).finalize().to_vec(),
            Self::Sha1 => Sha1::default().chain_update(content).finalize().to_vec(),
            Self::Sha256 => Sha256::default().chain_update(content).finalize().to_vec(),
            Self::Sha384 => Sha384::default().chain_update(content).finalize().to_vec(),
            Self::Sha512 => Sha512::default().chain_update(content).finalize().to_vec(),
        }
    }

    /// A streaming hasher for this hash function, used by the Buffer subsystem to validate a
    /// CAS digest incrementally as bytes flow through a stream.
    pub fn incremental_hasher(&self) -> RunningHash {
        match self {
            Self::Md5 => RunningHash::Md5(Box::default()),
            Self::Sha1 => RunningHash::Sha1(Box::default()),
            Self::Sha256 => RunningHash::Sha256(Box::default()),
            Self::Sha384 => RunningHash::Sha384(Box::default()),
            Self::Sha512 => RunningHash::Sha512(Box::default()),
        }
    }
}

/// An in-progress hash computation, fed chunk-by-chunk as a CAS buffer streams.
pub enum RunningHash {
    Md5(Box<Md5>),
    Sha1(Box<Sha1>),
    Sha256(Box<Sha256>),
    Sha384(Box<Sha384>),
    Sha512(Box<Sha512>),
}

impl RunningHash {
    pub fn update(&mut self, chunk: &[u8]) {
        match self {
            Self::Md5(h) => Sha2Digest::update(h.as_mut(), chunk),
            Self::Sha1(h) => Sha2Digest::update(h.as_mut(), chunk),
            Self::Sha256(h) => Sha2Digest::update(h.as_mut(), chunk),
            Self::Sha384(h) => Sha2Digest::update(h.as_mut(), chunk),
            Self::Sha512(h) => Sha2Digest::update(h.as_mut(), chunk),
        }
    }

    pub fn finalize(self) -> Vec<u8> {
        match self {
            Self::Md5(h) => h.finalize().to_vec(),
            Self::Sha1(h) => h.finalize().to_vec(),
            Self::Sha256(h) => h.finalize().to_vec(),
            Self::Sha384(h) => h.finalize().to_vec(),
            Self::Sha512(h) => h.finalize().to_vec(),
        }
    }
}

/// Identity tuple `(instance_name, hash_function, hash, size_bytes)` for a blob.
///
/// Unlike the teacher's original single-hash-function, `Copy` `Digest` (SHA-256 hardcoded, the
/// instance name carried separately as a bare `String`), this generalizes to the REv2 reality of
/// multiple hash functions and an instance-name-scoped identity, at the cost of `Copy`: the hash
/// is no longer a fixed-size array and the instance name owns heap data.
#[derive(Clone, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct Digest {
    pub instance_name: InstanceName,
    pub hash_function: HashFunction,
    pub hash: Vec<u8>,
    pub size_bytes: u64,
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Digest<{:?}, {}, {}, {:?}>",
            self.hash_function,
            hex::encode(&self.hash),
            self.size_bytes,
            self.instance_name
        )
    }
}

impl Digest {
    /// The well-known empty-blob digest for `hash_function`, under `instance_name`.
    pub fn empty(hash_function: HashFunction, instance_name: InstanceName) -> Self {
        Self {
            instance_name,
            hash: hash_function.empty_hash().to_vec(),
            hash_function,
            size_bytes: 0,
        }
    }

    pub fn new(
        instance_name: InstanceName,
        hash_function: HashFunction,
        hash_str: &str,
        size_bytes: u64,
    ) -> Result<Self, String> {
        let hash =
            hex::decode(hash_str).map_err(|err| format!("Failed to convert digest: {err}"))?;
        Self::from_slice(instance_name, hash_function, &hash, size_bytes)
    }

    pub fn from_slice(
        instance_name: InstanceName,
        hash_function: HashFunction,
        hash: &[u8],
        size_bytes: u64,
    ) -> Result<Self, String> {
        let expected_len = hash_function.digest_length_bytes();
        if hash.len() != expected_len {
            return Err(format!(
                "Digest for {hash_function:?} had unexpected length {} (expected {expected_len})",
                hash.len()
            ));
        }
        Ok(Self {
            instance_name,
            hash_function,
            hash: hash.to_vec(),
            size_bytes,
        })
    }

    pub fn of_bytes(
        instance_name: InstanceName,
        hash_function: HashFunction,
        content: &Bytes,
    ) -> Self {
        Self {
            instance_name,
            hash: hash_function.hash_bytes(&content[..]),
            hash_function,
            size_bytes: content.len() as u64,
        }
    }

    pub fn hex(&self) -> String {
        hex::encode(&self.hash)
    }

    /// Whether this digest is the well-known empty-blob digest for its hash function,
    /// regardless of instance name (the empty blob is a property of the hash function alone).
    pub fn is_empty_blob(&self) -> bool {
        self.size_bytes == 0 && self.hash == self.hash_function.empty_hash()
    }

    /// Returns a copy of this digest under a different instance name, leaving hash/size intact.
    pub fn with_instance_name(&self, instance_name: InstanceName) -> Self {
        Self {
            instance_name,
            ..self.clone()
        }
    }
}

/// A `/`-separated, possibly-empty sequence of non-empty path components naming a REAPI
/// instance. The root instance (`""`) has no parent.
///
/// This type understands the hierarchy that the demultiplexing, hierarchical-fallback, and
/// read-canarying `BlobAccess` decorators need: walking to a parent, testing ancestry, and
/// rewriting a leading prefix.
#[derive(Clone, Debug, Default, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct InstanceName {
    components: Vec<String>,
}

impl InstanceName {
    pub const ROOT: InstanceName = InstanceName {
        components: Vec::new(),
    };

    pub fn root() -> Self {
        Self::ROOT
    }

    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Returns the prefix with one fewer component, or `None` if this is already the root.
    pub fn parent(&self) -> Option<InstanceName> {
        if self.components.is_empty() {
            return None;
        }
        let mut components = self.components.clone();
        components.pop();
        Some(InstanceName { components })
    }

    /// True if `self` is `other`, or a descendant of `other`.
    pub fn starts_with(&self, other: &InstanceName) -> bool {
        self.components.len() >= other.components.len()
            && self.components[..other.components.len()] == other.components[..]
    }

    pub fn components(&self) -> &[String] {
        &self.components
    }
}

impl fmt::Display for InstanceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.components.join("/"))
    }
}

impl std::str::FromStr for InstanceName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::ROOT);
        }
        let components = s
            .split('/')
            .map(|component| {
                if component.is_empty() {
                    Err(format!("InstanceName {s:?} has an empty path component"))
                } else {
                    Ok(component.to_string())
                }
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(InstanceName { components })
    }
}

impl<T: AsRef<str>> From<T> for InstanceName {
    fn from(s: T) -> Self {
        s.as_ref().parse().unwrap_or_else(|err: String| {
            panic!("{err}");
        })
    }
}

/// Rewrites a leading `from_prefix` of an `InstanceName` to `to_prefix` (and back). Used by the
/// demultiplexing decorator to translate between a caller-visible instance name and the name a
/// particular backend expects.
#[derive(Clone, Debug, Default)]
pub struct InstanceNamePatcher {
    from_prefix: InstanceName,
    to_prefix: InstanceName,
}

impl InstanceNamePatcher {
    pub fn new(from_prefix: InstanceName, to_prefix: InstanceName) -> Self {
        Self {
            from_prefix,
            to_prefix,
        }
    }

    /// The patcher that does not alter instance names.
    pub fn identity() -> Self {
        Self::default()
    }

    pub fn patch_instance_name(&self, instance_name: &InstanceName) -> Result<InstanceName, String> {
        if !instance_name.starts_with(&self.from_prefix) {
            return Err(format!(
                "InstanceName {instance_name} does not start with expected prefix {}",
                self.from_prefix
            ));
        }
        let mut components = self.to_prefix.components.clone();
        components.extend_from_slice(&instance_name.components[self.from_prefix.components.len()..]);
        Ok(InstanceName { components })
    }

    pub fn unpatch_instance_name(&self, instance_name: &InstanceName) -> Result<InstanceName, String> {
        if !instance_name.starts_with(&self.to_prefix) {
            return Err(format!(
                "InstanceName {instance_name} does not start with expected prefix {}",
                self.to_prefix
            ));
        }
        let mut components = self.from_prefix.components.clone();
        components.extend_from_slice(&instance_name.components[self.to_prefix.components.len()..]);
        Ok(InstanceName { components })
    }

    /// Rewrites `digest.instance_name` from `from_prefix` to `to_prefix`, for an outgoing call
    /// to the backend this patcher is associated with.
    pub fn patch_digest(&self, digest: &Digest) -> Result<Digest, String> {
        Ok(digest.with_instance_name(self.patch_instance_name(&digest.instance_name)?))
    }

    /// The inverse of `patch_digest`: rewrites a digest returned by the backend back into the
    /// caller-visible instance name space.
    pub fn unpatch_digest(&self, digest: &Digest) -> Result<Digest, String> {
        Ok(digest.with_instance_name(self.unpatch_instance_name(&digest.instance_name)?))
    }
}

/// An unordered collection of `Digest`s with deterministic iteration order, used by decorators
/// (hierarchical fallback, mirrored, existence caching) that need set algebra over digests
/// rather than per-digest plumbing.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DigestSet {
    digests: std::collections::BTreeSet<Digest>,
}

impl DigestSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_iter(digests: impl IntoIterator<Item = Digest>) -> Self {
        Self {
            digests: digests.into_iter().collect(),
        }
    }

    pub fn to_singleton_set(digest: Digest) -> Self {
        let mut digests = std::collections::BTreeSet::new();
        digests.insert(digest);
        Self { digests }
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn contains(&self, digest: &Digest) -> bool {
        self.digests.contains(digest)
    }

    pub fn insert(&mut self, digest: Digest) -> bool {
        self.digests.insert(digest)
    }

    pub fn remove(&mut self, digest: &Digest) -> bool {
        self.digests.remove(digest)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Digest> {
        self.digests.iter()
    }

    pub fn into_vec(self) -> Vec<Digest> {
        self.digests.into_iter().collect()
    }

    pub fn union(&self, other: &DigestSet) -> DigestSet {
        Self {
            digests: self.digests.union(&other.digests).cloned().collect(),
        }
    }

    pub fn difference(&self, other: &DigestSet) -> DigestSet {
        Self {
            digests: self.digests.difference(&other.digests).cloned().collect(),
        }
    }

    /// Removes any well-known empty-blob digest from the set, since several backends (and the
    /// REAPI clients that talk to them) never expect to see it as a real entry.
    pub fn remove_empty_blob(&self) -> DigestSet {
        Self {
            digests: self
                .digests
                .iter()
                .filter(|d| !d.is_empty_blob())
                .cloned()
                .collect(),
        }
    }

    /// Splits this set into groups keyed by `Digest::instance_name`, as needed by
    /// demultiplexing/hierarchical-fallback-style decorators that dispatch per instance name.
    pub fn partition_by_instance_name(&self) -> std::collections::BTreeMap<InstanceName, DigestSet> {
        let mut groups: std::collections::BTreeMap<InstanceName, DigestSet> =
            std::collections::BTreeMap::new();
        for digest in &self.digests {
            groups
                .entry(digest.instance_name.clone())
                .or_default()
                .insert(digest.clone());
        }
        groups
    }
}

impl FromIterator<Digest> for DigestSet {
    fn from_iter<T: IntoIterator<Item = Digest>>(iter: T) -> Self {
        Self {
            digests: iter.into_iter().collect(),
        }
    }
}

impl IntoIterator for DigestSet {
    type Item = Digest;
    type IntoIter = std::collections::btree_set::IntoIter<Digest>;

    fn into_iter(self) -> Self::IntoIter {
        self.digests.into_iter()
    }
}

impl<'a> IntoIterator for &'a DigestSet {
    type Item = &'a Digest;
    type IntoIter = std::collections::btree_set::Iter<'a, Digest>;

    fn into_iter(self) -> Self::IntoIter {
        self.digests.iter()
    }
}

/// Wire key formats for key-value backends (Redis, etc), per the REAPI community convention.
impl Digest {
    /// `"<hex-hash>-<sizeBytes>"`
    pub fn key_without_instance(&self) -> String {
        format!("{}-{}", self.hex(), self.size_bytes)
    }

    /// `"<hex-hash>-<sizeBytes>-<instance with '/' replaced by '-'>"`
    pub fn key_with_instance(&self) -> String {
        format!(
            "{}-{}-{}",
            self.hex(),
            self.size_bytes,
            self.instance_name.to_string().replace('/', "-")
        )
    }
}
