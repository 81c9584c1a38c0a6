//! The content filter chain: pure `(encode, decode)` bijections applied to a
//! blob's stored bytes to produce the client-visible (post-filter) bytes,
//! and vice versa on write.
//!
//! A chain is an ordered list of filter names declared by the nearest
//! `.gitattributes` along a path. `decode` applies the chain leftmost-first
//! (read); `encode` applies it in reverse (write). The identity filter is
//! always available and is the chain for any path with no declaration.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::trace;

use crate::errors::FilterError;

/// A single named filter stage.
pub trait Filter: Send + Sync {
    fn name(&self) -> &'static str;

    /// stored bytes -> raw (client-visible) bytes.
    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, FilterError>;

    /// raw bytes -> stored bytes.
    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, FilterError>;
}

struct IdentityFilter;

impl Filter for IdentityFilter {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, FilterError> {
        Ok(stored.to_vec())
    }

    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, FilterError> {
        Ok(raw.to_vec())
    }
}

struct GzipFilter;

impl Filter for GzipFilter {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut out = Vec::new();
        GzDecoder::new(stored)
            .read_to_end(&mut out)
            .map_err(|e| FilterError::DecodeFailed {
                filter: self.name().to_string(),
                detail: e.to_string(),
            })?;
        Ok(out)
    }

    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(raw)
            .and_then(|_| encoder.finish())
            .map_err(|e| FilterError::EncodeFailed {
                filter: self.name().to_string(),
                detail: e.to_string(),
            })
    }
}

const LFS_POINTER_VERSION: &str = "version https://git-lfs.github.com/spec/v1";

/// Resolves an LFS pointer's referenced object content, e.g. from a
/// `.git/lfs/objects/<oid prefix>/<oid>` store. Kept behind a trait so the
/// actual storage backend (local cache, remote LFS server) is pluggable.
pub trait LfsObjectStore: Send + Sync {
    fn get(&self, oid: &str) -> Option<Vec<u8>>;
}

/// An `LfsObjectStore` that never has the object; used when LFS is declared
/// in `.gitattributes` but no object store is configured.
pub struct NoLfsObjects;

impl LfsObjectStore for NoLfsObjects {
    fn get(&self, _oid: &str) -> Option<Vec<u8>> {
        None
    }
}

struct LfsFilter<'a> {
    objects: &'a dyn LfsObjectStore,
}

struct LfsPointer {
    oid: String,
    size: u64,
}

fn parse_lfs_pointer(stored: &[u8]) -> Result<LfsPointer, FilterError> {
    let text = std::str::from_utf8(stored)
        .map_err(|e| FilterError::MalformedLfsPointer(e.to_string()))?;
    if !text.starts_with(LFS_POINTER_VERSION) {
        return Err(FilterError::MalformedLfsPointer(
            "missing LFS pointer version line".to_string(),
        ));
    }
    let mut oid = None;
    let mut size = None;
    for line in text.lines() {
        if let Some(v) = line.strip_prefix("oid sha256:") {
            oid = Some(v.trim().to_string());
        } else if let Some(v) = line.strip_prefix("size ") {
            size = v.trim().parse::<u64>().ok();
        }
    }
    match (oid, size) {
        (Some(oid), Some(size)) => Ok(LfsPointer { oid, size }),
        _ => Err(FilterError::MalformedLfsPointer(
            "missing oid or size field".to_string(),
        )),
    }
}

fn render_lfs_pointer(oid: &str, size: u64) -> Vec<u8> {
    format!("{LFS_POINTER_VERSION}\noid sha256:{oid}\nsize {size}\n").into_bytes()
}

impl<'a> Filter for LfsFilter<'a> {
    fn name(&self) -> &'static str {
        "lfs"
    }

    fn decode(&self, stored: &[u8]) -> Result<Vec<u8>, FilterError> {
        let pointer = parse_lfs_pointer(stored)?;
        self.objects
            .get(&pointer.oid)
            .ok_or_else(|| FilterError::LfsObjectMissing(pointer.oid.clone()))
    }

    fn encode(&self, raw: &[u8]) -> Result<Vec<u8>, FilterError> {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(raw);
        let oid = hex::encode(hasher.finalize());
        Ok(render_lfs_pointer(&oid, raw.len() as u64))
    }
}

/// An ordered chain of filter names, as declared by `.gitattributes`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct FilterChain(Vec<String>);

impl FilterChain {
    pub fn identity() -> Self {
        Self(Vec::new())
    }

    pub fn from_names(names: Vec<String>) -> Self {
        Self(names)
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }

    pub fn is_identity(&self) -> bool {
        self.0.is_empty()
    }

    /// A stable hash of the chain's contents, used as part of the
    /// `(blobId, chainHash) -> (md5, size)` cache key.
    pub fn chain_hash(&self) -> String {
        if self.0.is_empty() {
            return "identity".to_string();
        }
        self.0.join(",")
    }
}

/// Applies a [`FilterChain`] by name lookup, validating every referenced
/// filter exists (a config-time error per the source, surfaced here as soon
/// as a chain is resolved rather than deferred to first use).
pub struct FilterEngine<'a> {
    lfs_objects: &'a dyn LfsObjectStore,
}

impl<'a> FilterEngine<'a> {
    pub fn new(lfs_objects: &'a dyn LfsObjectStore) -> Self {
        Self { lfs_objects }
    }

    fn resolve(&self, name: &str) -> Result<Box<dyn Filter + '_>, FilterError> {
        match name {
            "identity" => Ok(Box::new(IdentityFilter)),
            "gzip" => Ok(Box::new(GzipFilter)),
            "lfs" => Ok(Box::new(LfsFilter {
                objects: self.lfs_objects,
            })),
            other => Err(FilterError::UnknownFilter(other.to_string())),
        }
    }

    /// Validate that every filter in `chain` is known. Called when a chain
    /// is first derived from `.gitattributes`, not per request.
    pub fn validate(&self, chain: &FilterChain) -> Result<(), FilterError> {
        for name in chain.names() {
            self.resolve(name)?;
        }
        Ok(())
    }

    /// stored bytes -> raw (client-visible) bytes, applying the chain
    /// leftmost-first.
    pub fn decode(&self, chain: &FilterChain, stored: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut data = stored.to_vec();
        for name in chain.names() {
            let filter = self.resolve(name)?;
            trace!(filter = name.as_str(), "decoding");
            data = filter.decode(&data)?;
        }
        Ok(data)
    }

    /// raw bytes -> stored bytes, applying the chain rightmost-first (the
    /// inverse order of decode).
    pub fn encode(&self, chain: &FilterChain, raw: &[u8]) -> Result<Vec<u8>, FilterError> {
        let mut data = raw.to_vec();
        for name in chain.names().iter().rev() {
            let filter = self.resolve(name)?;
            trace!(filter = name.as_str(), "encoding");
            data = filter.encode(&data)?;
        }
        Ok(data)
    }
}
