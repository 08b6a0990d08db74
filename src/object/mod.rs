mod bitmap;
mod metadata;

pub use bitmap::Bitmap;
pub use metadata::{Flags, Metadata};

use std::fmt;
use std::path::{Path, PathBuf};

/// Width of an object hash in bytes (160 bits).
pub const ID_HASH_SIZE: usize = 20;

/// Fixed-width object hash: the truncated blake3 digest of `path + ext`.
pub type IdHash = [u8; ID_HASH_SIZE];

/// Canonical identifier of a cached resource.
///
/// `path` is the canonical request URL; `ext` is the variant key (empty
/// for the root entry, non-empty for vary children). Two ids are equal
/// iff both parts are equal; the hash is a deterministic function of
/// both and is what keys the index and the on-disk layout.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectId {
    path: String,
    ext: String,
    hash: IdHash,
}

impl ObjectId {
    pub fn new(path: impl Into<String>) -> Self {
        Self::with_variant(path, "")
    }

    pub fn with_variant(path: impl Into<String>, ext: impl Into<String>) -> Self {
        let path = path.into();
        let ext = ext.into();
        let mut hasher = blake3::Hasher::new();
        hasher.update(path.as_bytes());
        hasher.update(ext.as_bytes());
        let digest = hasher.finalize();
        let mut hash = [0u8; ID_HASH_SIZE];
        hash.copy_from_slice(&digest.as_bytes()[..ID_HASH_SIZE]);
        Self { path, ext, hash }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn ext(&self) -> &str {
        &self.ext
    }

    /// Concatenation of path and variant key; the logical cache key.
    pub fn key(&self) -> String {
        format!("{}{}", self.path, self.ext)
    }

    pub fn hash(&self) -> IdHash {
        self.hash
    }

    pub fn hash_bytes(&self) -> &[u8] {
        &self.hash
    }

    pub fn hash_hex(&self) -> String {
        hex(&self.hash)
    }

    /// Read/write path of the object under a bucket root:
    /// `<base>/<h0>/<h2..4>/<hex>`.
    pub fn wpath(&self, base: &Path) -> PathBuf {
        wpath_for(self.hash, base)
    }

    /// Path of one chunk file: the object wpath suffixed with
    /// `-NNNNNN` (six decimal digits).
    pub fn wpath_chunk(&self, base: &Path, index: u32) -> PathBuf {
        let mut path = self.wpath(base).into_os_string();
        path.push(format!("-{index:06}"));
        PathBuf::from(path)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{{}:{}{}}}", self.hash_hex(), self.path, self.ext)
    }
}

/// Layout path for a raw hash, for callers that only hold the 20 bytes.
pub fn wpath_for(hash: IdHash, base: &Path) -> PathBuf {
    let hex = hex(&hash);
    base.join(&hex[0..1]).join(&hex[2..4]).join(&hex)
}

pub fn chunk_path_for(hash: IdHash, base: &Path, index: u32) -> PathBuf {
    let mut path = wpath_for(hash, base).into_os_string();
    path.push(format!("-{index:06}"));
    PathBuf::from(path)
}

fn hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
