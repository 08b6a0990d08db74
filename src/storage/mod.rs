pub mod bucket;
pub mod indexdb;
pub mod marked;
pub mod migrate;
pub mod selector;
pub mod sharedkv;
pub mod tiered;

use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::iox::Body;
use crate::object::{IdHash, Metadata, ObjectId};

pub use bucket::ChunkSink;
pub use marked::MarkedStorage;
pub use sharedkv::SharedKv;
pub use tiered::TieredStorage;

/// Storage class of a bucket; governs selector priority and migration
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Hot,
    Warm,
    Cold,
    InMemory,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Hot => "hot",
            Tier::Warm => "warm",
            Tier::Cold => "cold",
            Tier::InMemory => "inmemory",
        }
    }
}

/// LFU bookkeeping value: last hit time and hit count.
#[derive(Debug, Clone, Copy, Default)]
pub struct Mark {
    pub last_access: i64,
    pub refs: u64,
}

impl Mark {
    pub fn new(last_access: i64, refs: u64) -> Self {
        Self { last_access, refs }
    }
}

/// How a PURGE should treat the target.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PurgeControl {
    /// Hard-delete chunk data instead of marking expired.
    #[serde(default)]
    pub hard: bool,
    /// Treat the URL as a directory prefix.
    #[serde(default)]
    pub dir: bool,
    /// Mark matches expired (forcing revalidation) instead of deleting.
    #[serde(default)]
    pub mark_expired: bool,
}

/// Moves objects between tiers. Implemented by the tiered storage;
/// buckets hold a weak handle so eviction can demote without owning
/// their owner.
#[async_trait]
pub trait Migrator: Send + Sync {
    async fn promote(&self, id: &ObjectId, src: &dyn Bucket) -> Result<(), CacheError>;
    async fn demote(&self, id: &ObjectId, src: &dyn Bucket) -> Result<(), CacheError>;
}

/// One physical storage area: an index plus chunk files plus the LFU
/// bookkeeping that drives eviction and promotion.
#[async_trait]
pub trait Bucket: Send + Sync {
    /// Stable identifier; the root path for disk buckets, `/` for the
    /// in-memory bucket.
    fn id(&self) -> &str;
    fn tier(&self) -> Tier;
    /// Consistent-hash weight in [1, 1000].
    fn weight(&self) -> u32;
    /// Approximate number of cached objects (LFU length).
    fn objects(&self) -> u64;
    /// Whether the selector may route new objects here.
    fn accepting(&self) -> bool {
        true
    }

    async fn lookup(&self, id: &ObjectId) -> Result<Option<Metadata>, CacheError>;
    async fn store(&self, meta: &Metadata) -> Result<(), CacheError>;
    fn exists(&self, hash: &IdHash) -> bool;
    /// Bumps hit accounting and feeds the promotion sketch.
    async fn touch(&self, id: &ObjectId);

    /// Deletes only the index row.
    async fn remove(&self, id: &ObjectId) -> Result<(), CacheError>;
    async fn discard(&self, id: &ObjectId) -> Result<(), CacheError>;
    async fn discard_with_hash(&self, hash: IdHash) -> Result<(), CacheError>;
    async fn discard_with_message(&self, id: &ObjectId, msg: &str) -> Result<(), CacheError>;
    async fn discard_with_metadata(&self, meta: &Metadata) -> Result<(), CacheError>;

    /// Full metadata scan; the callback returns false to stop.
    fn iterate(&self, f: &mut dyn FnMut(Metadata) -> bool) -> Result<(), CacheError>;

    /// Opens a writer for one chunk; bytes land at the final path only
    /// when the sink commits.
    async fn write_chunk(
        &self,
        id: &ObjectId,
        index: u32,
    ) -> Result<(ChunkSink, PathBuf), CacheError>;
    async fn read_chunk(&self, id: &ObjectId, index: u32) -> Result<(Body, PathBuf), CacheError>;

    fn set_migrator(&self, migrator: Weak<dyn Migrator>);
    async fn close(&self);
}

/// The tier-routing faces of the store the pipeline talks to.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Hot → Warm → Cold existence probe; falls back to the warm
    /// selection (the write target for a miss).
    fn select(&self, id: &ObjectId) -> Arc<dyn Bucket>;
    fn select_in_tier(&self, id: &ObjectId, tier: Tier) -> Option<Arc<dyn Bucket>>;
    fn buckets(&self) -> Vec<Arc<dyn Bucket>>;
    fn shared_kv(&self) -> Arc<dyn SharedKv>;
    async fn purge(&self, url: &str, control: PurgeControl) -> Result<(), CacheError>;
    async fn close(&self);
}

/// Shared KV key for the per-host object counter.
pub fn domain_key(host: &str) -> Vec<u8> {
    format!("if/domain/{host}").into_bytes()
}

/// Shared KV key for the inverted directory index row of one object.
pub fn inverted_key(bucket_id: &str, object_key: &str) -> Vec<u8> {
    format!("ix/{bucket_id}/{object_key}").into_bytes()
}

/// Shared KV key for a directory purge mark.
pub fn dir_mark_key(prefix: &str) -> Vec<u8> {
    format!("dir/{prefix}").into_bytes()
}

pub(crate) fn host_of(url: &str) -> Option<String> {
    url.parse::<http::Uri>()
        .ok()
        .and_then(|uri| uri.host().map(|h| h.to_string()))
}
