use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::algorithm::{Eviction, HeavyKeeper, LfuCache};
use crate::error::CacheError;
use crate::httpx;
use crate::iox::Body;
use crate::metrics;
use crate::object::{chunk_path_for, IdHash, Metadata, ObjectId};
use crate::storage::{
    domain_key, host_of, inverted_key, Bucket, Mark, Migrator, SharedKv, Tier,
};

use super::{BucketOptions, ChunkSink, PromoteOptions};

const EVICTION_QUEUE: usize = 100;
const MIN_SKETCH_WIDTH: usize = 4096;

/// Chunk I/O behind a bucket: real files for the disk tiers, a blob
/// map for the memory tier.
#[async_trait]
pub(super) trait ChunkIo: Send + Sync {
    async fn open_write(&self, dest: PathBuf) -> std::io::Result<ChunkSink>;
    async fn open_read(&self, dest: PathBuf) -> std::io::Result<Body>;
    async fn remove(&self, dest: PathBuf) -> std::io::Result<()>;
}

struct PromoteSketch {
    hk: HeavyKeeper,
    last_reset: Instant,
    opts: PromoteOptions,
}

/// The shared bucket machinery: index rows, LFU bookkeeping, shared-KV
/// side tables, eviction, and the promotion sketch. Disk and memory
/// buckets differ only in their [`ChunkIo`].
pub(super) struct StoreBucket {
    id: String,
    tier: Tier,
    weight: u32,
    base: PathBuf,
    index: Arc<dyn crate::storage::indexdb::IndexDb>,
    shared: Arc<dyn SharedKv>,
    chunks: Box<dyn ChunkIo>,
    cache: Mutex<LfuCache<IdHash, Mark>>,
    promote: Option<Mutex<PromoteSketch>>,
    migrator: RwLock<Option<Weak<dyn Migrator>>>,
    self_ref: Weak<StoreBucket>,
}

impl StoreBucket {
    pub(super) fn build(
        opts: &BucketOptions,
        id: String,
        base: PathBuf,
        index: Arc<dyn crate::storage::indexdb::IndexDb>,
        shared: Arc<dyn SharedKv>,
        chunks: Box<dyn ChunkIo>,
    ) -> Arc<Self> {
        let (evict_tx, evict_rx) = mpsc::channel(EVICTION_QUEUE);
        let mut cache = LfuCache::new(opts.max_object_limit);
        cache.set_eviction_sink(evict_tx);

        let promote = opts.promote.map(|p| {
            let width = opts.max_object_limit.max(MIN_SKETCH_WIDTH);
            Mutex::new(PromoteSketch {
                hk: HeavyKeeper::new(3, width, 0.9),
                last_reset: Instant::now(),
                opts: p,
            })
        });

        let bucket = Arc::new_cyclic(|weak| Self {
            id,
            tier: opts.tier,
            weight: opts.weight.clamp(1, 1000),
            base,
            index,
            shared,
            chunks,
            cache: Mutex::new(cache),
            promote,
            migrator: RwLock::new(None),
            self_ref: weak.clone(),
        });

        bucket.spawn_eviction_worker(evict_rx);
        if opts.async_load {
            let loader = bucket.clone();
            tokio::spawn(async move { loader.load_cache() });
        } else {
            bucket.load_cache();
        }
        bucket
    }

    /// Rebuilds the LFU, inverted index, and domain counters from the
    /// index rows. Lookups succeed against the index while this runs.
    fn load_cache(&self) {
        let mut loaded = 0usize;
        let result = self.index.iterate(None, &mut |key, meta| {
            if key.len() == crate::object::ID_HASH_SIZE {
                let mut hash = [0u8; crate::object::ID_HASH_SIZE];
                hash.copy_from_slice(key);
                self.cache
                    .lock()
                    .set(hash, Mark::new(meta.last_ref_unix, meta.refs));

                if let Some(host) = host_of(&meta.path) {
                    let _ = self.shared.incr(&domain_key(&host), 1);
                }
                let id = meta.id();
                let _ = self
                    .shared
                    .set(&inverted_key(&self.id, &id.key()), id.hash_bytes());
                loaded += 1;
            }
            true
        });
        if let Err(err) = result {
            warn!(bucket = %self.id, error = %err, "metadata load failed");
        }
        info!(bucket = %self.id, objects = loaded, "metadata load done");
        metrics::set_bucket_objects(&self.id, loaded as u64);
    }

    fn spawn_eviction_worker(&self, mut rx: mpsc::Receiver<Eviction<IdHash, Mark>>) {
        let weak = self.self_ref.clone();
        tokio::spawn(async move {
            while let Some(evicted) = rx.recv().await {
                let Some(bucket) = weak.upgrade() else { break };
                bucket.handle_eviction(evicted.key).await;
            }
        });
    }

    /// Evicted entries demote to a colder tier when a migrator is
    /// attached; otherwise, or on failure, they are discarded.
    async fn handle_eviction(&self, hash: IdHash) {
        let migrator = self
            .migrator
            .read()
            .as_ref()
            .and_then(|weak| weak.upgrade());

        if let Some(migrator) = migrator {
            let meta = match self.index.get(&hash) {
                Ok(Some(meta)) => Some(meta),
                _ => None,
            };
            if let Some(meta) = meta {
                let id = meta.id();
                match migrator.demote(&id, self).await {
                    Ok(()) => {
                        metrics::record_eviction("demoted");
                        return;
                    }
                    Err(err) => {
                        warn!(bucket = %self.id, key = %id.key(), error = %err, "demote failed");
                    }
                }
            }
        }

        metrics::record_eviction("discarded");
        if let Err(err) = self.discard_with_hash(hash).await
            && !matches!(err, CacheError::NotFound)
        {
            warn!(bucket = %self.id, error = %err, "evicted object discard failed");
        }
    }

    async fn discard_rows(&self, meta: Metadata) -> Result<(), CacheError> {
        // index row first so concurrent lookups cannot re-hit, then
        // children, chunk files, and the shared-KV side tables
        let mut queue = vec![meta];
        let mut first = true;

        while let Some(meta) = queue.pop() {
            let id = meta.id();
            if let Err(err) = self.index.delete(id.hash_bytes()) {
                warn!(bucket = %self.id, key = %id.key(), error = %err, "index delete failed");
            }
            self.cache.lock().remove(&id.hash());

            if meta.is_vary_index() {
                for vary_key in &meta.virtual_keys {
                    let child = ObjectId::with_variant(meta.path.clone(), vary_key.clone());
                    if child.hash() == id.hash() {
                        warn!(bucket = %self.id, key = %id.key(), "vary child collides with parent");
                        continue;
                    }
                    if let Ok(Some(child_meta)) = self.index.get(child.hash_bytes()) {
                        queue.push(child_meta);
                    }
                }
            }

            for chunk in meta.chunks.iter() {
                let path = chunk_path_for(id.hash(), &self.base, chunk);
                if let Err(err) = self.chunks.remove(path.clone()).await
                    && err.kind() != std::io::ErrorKind::NotFound
                {
                    warn!(path = %path.display(), error = %err, "chunk unlink failed");
                }
            }

            let _ = self.shared.delete(&inverted_key(&self.id, &id.key()));
            if let Some(host) = host_of(&meta.path) {
                let _ = self.shared.decr(&domain_key(&host), 1);
            }

            if first {
                metrics::record_cache_discard();
                first = false;
            }
        }
        Ok(())
    }

    fn maybe_promote(&self, id: &ObjectId) {
        let Some(sketch) = &self.promote else { return };

        let over_threshold = {
            let mut sketch = sketch.lock();
            if sketch.opts.window > std::time::Duration::ZERO
                && sketch.last_reset.elapsed() > sketch.opts.window
            {
                sketch.hk.clear();
                sketch.last_reset = Instant::now();
            }
            sketch.hk.add(id.hash_bytes());
            sketch.hk.query(id.hash_bytes()) >= sketch.opts.min_hits
        };

        if !over_threshold {
            return;
        }

        let migrator = self
            .migrator
            .read()
            .as_ref()
            .and_then(|weak| weak.upgrade());
        let Some(migrator) = migrator else { return };
        let Some(bucket) = self.self_ref.upgrade() else { return };
        let id = id.clone();

        tokio::spawn(async move {
            if let Err(err) = migrator.promote(&id, bucket.as_ref()).await {
                warn!(key = %id.key(), error = %err, "promote failed");
            }
        });
    }
}

#[async_trait]
impl Bucket for StoreBucket {
    fn id(&self) -> &str {
        &self.id
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn weight(&self) -> u32 {
        self.weight
    }

    fn objects(&self) -> u64 {
        self.cache.lock().len() as u64
    }

    async fn lookup(&self, id: &ObjectId) -> Result<Option<Metadata>, CacheError> {
        let meta = self.index.get(id.hash_bytes()).map_err(CacheError::Storage)?;
        metrics::record_cache_lookup(meta.is_some());
        if let Some(meta) = &meta {
            let mut cache = self.cache.lock();
            // position bump only; counters move on touch. A missing
            // entry (async load still running) is backfilled here.
            if cache.get(&id.hash()).is_none() {
                cache.set(id.hash(), Mark::new(meta.last_ref_unix, meta.refs));
            }
        }
        Ok(meta)
    }

    async fn store(&self, meta: &Metadata) -> Result<(), CacheError> {
        let mut meta = meta.clone();
        httpx::strip_internal_headers(&mut meta.headers);

        let id = meta.id();
        let fresh = {
            let mut cache = self.cache.lock();
            if cache.has(&id.hash()) {
                cache.set(id.hash(), Mark::new(meta.last_ref_unix, meta.refs));
                false
            } else {
                cache.set(id.hash(), Mark::new(meta.last_ref_unix, meta.refs));
                true
            }
        };

        self.index
            .set(id.hash_bytes(), &meta)
            .map_err(CacheError::Storage)?;
        metrics::record_cache_store();

        if fresh && let Some(host) = host_of(&meta.path) {
            if let Err(err) = self.shared.incr(&domain_key(&host), 1) {
                warn!(host = %host, error = %err, "domain counter incr failed");
            }
        }
        let _ = self
            .shared
            .set(&inverted_key(&self.id, &id.key()), id.hash_bytes());
        Ok(())
    }

    fn exists(&self, hash: &IdHash) -> bool {
        self.index.exists(hash)
    }

    async fn touch(&self, id: &ObjectId) {
        {
            let mut cache = self.cache.lock();
            let Some(mark) = cache.peek(&id.hash()).copied() else {
                return;
            };
            cache.set(
                id.hash(),
                Mark::new(httpx::now_unix(), mark.refs.saturating_add(1)),
            );
        }
        self.maybe_promote(id);
    }

    async fn remove(&self, id: &ObjectId) -> Result<(), CacheError> {
        self.index.delete(id.hash_bytes()).map_err(CacheError::Storage)
    }

    async fn discard(&self, id: &ObjectId) -> Result<(), CacheError> {
        match self.index.get(id.hash_bytes()).map_err(CacheError::Storage)? {
            Some(meta) => self.discard_rows(meta).await,
            None => Err(CacheError::NotFound),
        }
    }

    async fn discard_with_hash(&self, hash: IdHash) -> Result<(), CacheError> {
        match self.index.get(&hash).map_err(CacheError::Storage)? {
            Some(meta) => self.discard_rows(meta).await,
            None => Err(CacheError::NotFound),
        }
    }

    async fn discard_with_message(&self, id: &ObjectId, msg: &str) -> Result<(), CacheError> {
        info!(bucket = %self.id, key = %id.key(), "discard: {msg}");
        self.discard(id).await
    }

    async fn discard_with_metadata(&self, meta: &Metadata) -> Result<(), CacheError> {
        self.discard_rows(meta.clone()).await
    }

    fn iterate(&self, f: &mut dyn FnMut(Metadata) -> bool) -> Result<(), CacheError> {
        self.index
            .iterate(None, &mut |_, meta| f(meta))
            .map_err(CacheError::Storage)
    }

    async fn write_chunk(
        &self,
        id: &ObjectId,
        index: u32,
    ) -> Result<(ChunkSink, PathBuf), CacheError> {
        let dest = id.wpath_chunk(&self.base, index);
        let sink = self.chunks.open_write(dest.clone()).await?;
        Ok((sink, dest))
    }

    async fn read_chunk(&self, id: &ObjectId, index: u32) -> Result<(Body, PathBuf), CacheError> {
        let dest = id.wpath_chunk(&self.base, index);
        match self.chunks.open_read(dest.clone()).await {
            Ok(body) => Ok((body, dest)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %dest.display(), "chunk missing on read");
                Err(CacheError::Corrupt {
                    key: id.key(),
                    index,
                })
            }
            Err(err) => Err(err.into()),
        }
    }

    fn set_migrator(&self, migrator: Weak<dyn Migrator>) {
        *self.migrator.write() = Some(migrator);
    }

    async fn close(&self) {
        self.index.close();
        metrics::set_bucket_objects(&self.id, self.objects());
    }
}
