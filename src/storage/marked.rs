use std::path::PathBuf;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{info, warn};

use crate::error::CacheError;
use crate::httpx;
use crate::iox::Body;
use crate::object::{IdHash, Metadata, ObjectId};
use crate::pathtrie::PathTrie;

use super::bucket::ChunkSink;
use super::tiered::persist_dir_mark;
use super::{Bucket, Migrator, PurgeControl, SharedKv, Storage, Tier};

/// Decides whether a cached object sits under a directory purge mark.
///
/// The trie holds purge timestamps keyed by URL prefix; an object is
/// marked expired when the deepest matching mark is at or after the
/// object's last authoritative fetch. Marks persist in shared KV under
/// `dir/` and reload at startup.
pub struct DirMarkChecker {
    kv: Arc<dyn SharedKv>,
    trie: RwLock<PathTrie<i64>>,
}

const DIR_PREFIX: &[u8] = b"dir/";

impl DirMarkChecker {
    pub fn load(kv: Arc<dyn SharedKv>) -> Self {
        let mut trie = PathTrie::new();
        let result = kv.iterate_prefix(DIR_PREFIX, &mut |key, value| {
            let store_path = String::from_utf8_lossy(&key[DIR_PREFIX.len()..]).to_string();
            if value.len() != 8 {
                warn!(key = %store_path, len = value.len(), "invalid dir mark value");
                return true;
            }
            let unix = u64::from_le_bytes(value.try_into().expect("checked length")) as i64;
            info!(prefix = %store_path, drop_time = unix, "purge mark reloaded");
            trie.insert(&store_path, unix);
            true
        });
        if let Err(err) = result {
            warn!(error = %err, "purge mark reload failed");
        }
        Self {
            kv,
            trie: RwLock::new(trie),
        }
    }

    /// True when a purge mark at or above the object's path is newer
    /// than the object's fetch time.
    pub fn marked(&self, path: &str, resp_unix: i64) -> bool {
        match self.trie.read().search(path) {
            Some(mark) => resp_unix <= mark,
            None => false,
        }
    }

    pub fn add(&self, store_path: &str) {
        let unix = httpx::now_unix();
        self.trie.write().insert(store_path, unix);
        if let Err(err) = persist_dir_mark(self.kv.as_ref(), store_path, unix) {
            warn!(prefix = %store_path, error = %err, "persisting purge mark failed");
            return;
        }
        info!(prefix = %store_path, drop_time = unix, "purge mark added");
    }
}

/// Storage wrapper layering directory purge marks over lookups.
pub struct MarkedStorage {
    inner: Arc<dyn Storage>,
    checker: Arc<DirMarkChecker>,
}

impl MarkedStorage {
    pub fn wrap(inner: Arc<dyn Storage>) -> Arc<Self> {
        let checker = Arc::new(DirMarkChecker::load(inner.shared_kv()));
        Arc::new(Self { inner, checker })
    }

    fn wrap_bucket(&self, bucket: Arc<dyn Bucket>) -> Arc<dyn Bucket> {
        Arc::new(MarkedBucket {
            base: bucket,
            checker: self.checker.clone(),
        })
    }
}

#[async_trait]
impl Storage for MarkedStorage {
    fn select(&self, id: &ObjectId) -> Arc<dyn Bucket> {
        self.wrap_bucket(self.inner.select(id))
    }

    fn select_in_tier(&self, id: &ObjectId, tier: Tier) -> Option<Arc<dyn Bucket>> {
        self.inner
            .select_in_tier(id, tier)
            .map(|bucket| self.wrap_bucket(bucket))
    }

    fn buckets(&self) -> Vec<Arc<dyn Bucket>> {
        self.inner.buckets()
    }

    fn shared_kv(&self) -> Arc<dyn SharedKv> {
        self.inner.shared_kv()
    }

    async fn purge(&self, url: &str, control: PurgeControl) -> Result<(), CacheError> {
        if control.dir && control.mark_expired {
            crate::metrics::record_purge("mark");
            self.checker.add(url);
            return Ok(());
        }
        self.inner.purge(url, control).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

struct MarkedBucket {
    base: Arc<dyn Bucket>,
    checker: Arc<DirMarkChecker>,
}

#[async_trait]
impl Bucket for MarkedBucket {
    fn id(&self) -> &str {
        self.base.id()
    }

    fn tier(&self) -> Tier {
        self.base.tier()
    }

    fn weight(&self) -> u32 {
        self.base.weight()
    }

    fn objects(&self) -> u64 {
        self.base.objects()
    }

    fn accepting(&self) -> bool {
        self.base.accepting()
    }

    async fn lookup(&self, id: &ObjectId) -> Result<Option<Metadata>, CacheError> {
        let meta = self.base.lookup(id).await?;
        Ok(meta.map(|mut meta| {
            if self.checker.marked(&meta.path, meta.resp_unix) {
                // expired for this lookup only; not persisted, so a
                // 304 revalidation can still restore freshness
                meta.expires_at = httpx::now_unix() - 1;
            }
            meta
        }))
    }

    async fn store(&self, meta: &Metadata) -> Result<(), CacheError> {
        self.base.store(meta).await
    }

    fn exists(&self, hash: &IdHash) -> bool {
        self.base.exists(hash)
    }

    async fn touch(&self, id: &ObjectId) {
        self.base.touch(id).await
    }

    async fn remove(&self, id: &ObjectId) -> Result<(), CacheError> {
        self.base.remove(id).await
    }

    async fn discard(&self, id: &ObjectId) -> Result<(), CacheError> {
        self.base.discard(id).await
    }

    async fn discard_with_hash(&self, hash: IdHash) -> Result<(), CacheError> {
        self.base.discard_with_hash(hash).await
    }

    async fn discard_with_message(&self, id: &ObjectId, msg: &str) -> Result<(), CacheError> {
        self.base.discard_with_message(id, msg).await
    }

    async fn discard_with_metadata(&self, meta: &Metadata) -> Result<(), CacheError> {
        self.base.discard_with_metadata(meta).await
    }

    fn iterate(&self, f: &mut dyn FnMut(Metadata) -> bool) -> Result<(), CacheError> {
        self.base.iterate(f)
    }

    async fn write_chunk(
        &self,
        id: &ObjectId,
        index: u32,
    ) -> Result<(ChunkSink, PathBuf), CacheError> {
        self.base.write_chunk(id, index).await
    }

    async fn read_chunk(&self, id: &ObjectId, index: u32) -> Result<(Body, PathBuf), CacheError> {
        self.base.read_chunk(id, index).await
    }

    fn set_migrator(&self, migrator: Weak<dyn Migrator>) {
        self.base.set_migrator(migrator)
    }

    async fn close(&self) {
        self.base.close().await
    }
}
