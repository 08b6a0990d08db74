use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

use crate::error::CacheError;
use crate::httpx;
use crate::metrics;
use crate::object::{IdHash, ObjectId, ID_HASH_SIZE};
use crate::settings::{BucketSettings, StorageSettings};

use super::bucket::{self, BucketOptions, EmptyBucket, PromoteOptions};
use super::selector::Selector;
use super::sharedkv::{MemSharedKv, StoreSharedKv};
use super::{
    dir_mark_key, inverted_key, migrate, Bucket, Migrator, PurgeControl, SharedKv, Storage, Tier,
};

/// The tier-routing store: one selector per populated tier, an
/// optional in-memory bucket, and the process-wide shared KV.
pub struct TieredStorage {
    hot: Option<Selector>,
    warm: Selector,
    cold: Option<Selector>,
    memory: Option<Arc<dyn Bucket>>,
    all: Vec<Arc<dyn Bucket>>,
    shared: Arc<dyn SharedKv>,
}

impl TieredStorage {
    pub fn open(cfg: &StorageSettings) -> Result<Arc<Self>> {
        let shared: Arc<dyn SharedKv> = if cfg.dir_aware.enabled {
            match &cfg.dir_aware.store_path {
                Some(path) => {
                    std::fs::create_dir_all(path)
                        .with_context(|| format!("creating shared kv dir {}", path.display()))?;
                    Arc::new(StoreSharedKv::open(path)?)
                }
                None => Arc::new(MemSharedKv::new()),
            }
        } else {
            Arc::new(MemSharedKv::new())
        };

        // bucket load rebuilds these from the index rows
        if let Err(err) = shared.drop_prefix(b"if/domain/") {
            warn!(error = %err, "failed to reset domain counters");
        }

        let mut hot = Vec::new();
        let mut warm = Vec::new();
        let mut cold = Vec::new();
        let mut memory: Option<Arc<dyn Bucket>> = None;

        for bucket_cfg in &cfg.buckets {
            let driver = bucket_cfg
                .driver
                .clone()
                .or_else(|| cfg.driver.clone())
                .unwrap_or_default();
            let driver = if bucket_cfg.tier == Tier::InMemory && driver.is_empty() {
                "memory".to_string()
            } else {
                driver
            };
            let opts = merge_options(cfg, bucket_cfg);
            let bucket = bucket::create(&driver, opts, shared.clone())
                .map_err(|err| anyhow!("opening bucket {}: {err}", bucket_cfg.path.display()))?;

            match bucket.tier() {
                Tier::Hot => hot.push(bucket),
                Tier::Warm => warm.push(bucket),
                Tier::Cold => cold.push(bucket),
                Tier::InMemory => {
                    if memory.is_some() {
                        bail!("only one inmemory bucket is allowed");
                    }
                    memory = Some(bucket);
                }
            }
        }

        if warm.is_empty() {
            info!("no warm bucket configured");
            match &memory {
                Some(mem) => warm.push(mem.clone()),
                None => warm.push(Arc::new(EmptyBucket::with_identity("/empty", Tier::Warm, 1))),
            }
        }
        if hot.is_empty() {
            info!("no hot bucket configured");
        }
        if cold.is_empty() {
            info!("no cold bucket configured");
        }

        let mut all: Vec<Arc<dyn Bucket>> = Vec::new();
        all.extend(warm.iter().cloned());
        all.extend(hot.iter().cloned());
        all.extend(cold.iter().cloned());

        let storage = Arc::new(Self {
            hot: (!hot.is_empty()).then(|| Selector::new(hot)),
            warm: Selector::new(warm),
            cold: (!cold.is_empty()).then(|| Selector::new(cold)),
            memory,
            all,
            shared,
        });

        if cfg.migration.enabled {
            Self::attach_migration(&storage);
        }

        Ok(storage)
    }

    /// Wires every bucket's migrator handle to this storage. Buckets
    /// hold a weak reference, so shutdown order stays acyclic.
    fn attach_migration(storage: &Arc<Self>) {
        let weak: std::sync::Weak<dyn Migrator> = Arc::downgrade(storage);
        for bucket in &storage.all {
            bucket.set_migrator(weak.clone());
        }
        if let Some(memory) = &storage.memory {
            memory.set_migrator(weak.clone());
        }
    }

    fn selector(&self, tier: Tier) -> Option<&Selector> {
        match tier {
            Tier::Hot => self.hot.as_ref(),
            Tier::Warm => Some(&self.warm),
            Tier::Cold => self.cold.as_ref(),
            Tier::InMemory => None,
        }
    }

    async fn purge_dir(&self, url: &str, control: PurgeControl) -> Result<(), CacheError> {
        let mut processed = 0usize;

        for bucket in self.buckets() {
            let prefix = inverted_key(bucket.id(), url);
            let mut hits: Vec<(Vec<u8>, IdHash)> = Vec::new();
            let _ = self.shared.iterate_prefix(&prefix, &mut |key, value| {
                if value.len() >= ID_HASH_SIZE {
                    let mut hash = [0u8; ID_HASH_SIZE];
                    hash.copy_from_slice(&value[..ID_HASH_SIZE]);
                    hits.push((key.to_vec(), hash));
                }
                true
            });

            for (key, hash) in hits {
                if bucket.discard_with_hash(hash).await.is_ok() {
                    processed += 1;
                }
                let _ = self.shared.delete(&key);
            }
        }

        // no inverted rows matched; fall back to a full metadata scan
        if processed == 0 {
            for bucket in self.buckets() {
                let mut matches = Vec::new();
                bucket.iterate(&mut |meta| {
                    if meta.path.starts_with(url) {
                        matches.push(meta);
                    }
                    true
                })?;
                for meta in matches {
                    if control.hard || !control.mark_expired {
                        let _ = bucket.discard_with_metadata(&meta).await;
                    } else {
                        let mut meta = meta;
                        meta.expires_at = httpx::now_unix() - 1;
                        let _ = bucket.store(&meta).await;
                    }
                    processed += 1;
                }
            }
        }

        if processed == 0 {
            return Err(CacheError::NotFound);
        }
        Ok(())
    }
}

fn merge_options(cfg: &StorageSettings, bucket: &BucketSettings) -> BucketOptions {
    let promote = (cfg.migration.enabled && cfg.migration.promote.min_hits > 0).then(|| {
        PromoteOptions {
            min_hits: cfg.migration.promote.min_hits,
            window: Duration::from_secs(cfg.migration.promote.window_secs),
        }
    });
    BucketOptions {
        path: bucket.path.clone(),
        tier: bucket.tier,
        weight: bucket.weight,
        db_type: bucket
            .db_type
            .clone()
            .or_else(|| cfg.db_type.clone())
            .unwrap_or_default(),
        db_path: bucket.db_path.clone(),
        slice_size: bucket.slice_size,
        max_object_limit: bucket.max_object_limit,
        async_load: bucket.async_load.unwrap_or(cfg.async_load),
        promote,
    }
}

#[async_trait]
impl Storage for TieredStorage {
    fn select(&self, id: &ObjectId) -> Arc<dyn Bucket> {
        for selector in [self.hot.as_ref(), Some(&self.warm), self.cold.as_ref()]
            .into_iter()
            .flatten()
        {
            if let Some(bucket) = selector.select(&id.hash())
                && bucket.exists(&id.hash())
            {
                return bucket;
            }
        }
        // miss: write target is the warm selection
        self.warm
            .select(&id.hash())
            .unwrap_or_else(|| Arc::new(EmptyBucket::with_identity("/empty", Tier::Warm, 1)))
    }

    fn select_in_tier(&self, id: &ObjectId, tier: Tier) -> Option<Arc<dyn Bucket>> {
        if tier == Tier::InMemory {
            return self.memory.clone();
        }
        self.selector(tier)?.select(&id.hash())
    }

    fn buckets(&self) -> Vec<Arc<dyn Bucket>> {
        self.all.clone()
    }

    fn shared_kv(&self) -> Arc<dyn SharedKv> {
        self.shared.clone()
    }

    async fn purge(&self, url: &str, control: PurgeControl) -> Result<(), CacheError> {
        if control.dir {
            if control.mark_expired {
                // persisted trie marks are layered on by MarkedStorage
                return Ok(());
            }
            metrics::record_purge("dir");
            return self.purge_dir(url, control).await;
        }

        let id = ObjectId::new(url);
        let bucket = self.select(&id);

        if control.hard {
            metrics::record_purge("hard");
            return bucket.discard(&id).await;
        }

        metrics::record_purge("soft");
        match bucket.lookup(&id).await? {
            Some(mut meta) => {
                meta.expires_at = httpx::now_unix() - 1;
                bucket.store(&meta).await
            }
            None => Err(CacheError::NotFound),
        }
    }

    async fn close(&self) {
        for bucket in &self.all {
            bucket.close().await;
        }
        if let Some(memory) = &self.memory {
            memory.close().await;
        }
        self.shared.close();
    }
}

#[async_trait]
impl Migrator for TieredStorage {
    async fn promote(&self, id: &ObjectId, src: &dyn Bucket) -> Result<(), CacheError> {
        let Some(target_tier) = migrate::promote_target(src.tier()) else {
            return Ok(());
        };
        let Some(dest) = self.select_in_tier(id, target_tier) else {
            return Ok(());
        };
        if dest.id() == src.id() {
            return Ok(());
        }
        let result = migrate::copy_object(id, src, dest.as_ref()).await;
        metrics::record_migration("promote", result.is_ok());
        result
    }

    async fn demote(&self, id: &ObjectId, src: &dyn Bucket) -> Result<(), CacheError> {
        let Some(target_tier) = migrate::demote_target(src.tier()) else {
            // off the cold end: the object leaves the cache
            return src.discard(id).await;
        };
        let Some(dest) = self.select_in_tier(id, target_tier) else {
            return src.discard(id).await;
        };
        if dest.id() == src.id() {
            return Ok(());
        }
        let result = migrate::copy_object(id, src, dest.as_ref()).await;
        metrics::record_migration("demote", result.is_ok());
        result
    }
}

/// Persists a directory purge mark: 8-byte little-endian unix time at
/// `dir/<url>`.
pub fn persist_dir_mark(shared: &dyn SharedKv, url: &str, unix: i64) -> Result<()> {
    shared.set(&dir_mark_key(url), &(unix as u64).to_le_bytes())
}
