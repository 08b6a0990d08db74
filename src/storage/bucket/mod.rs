mod core;
mod disk;
mod memory;

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;

use crate::error::CacheError;
use crate::iox::Body;
use crate::object::{IdHash, Metadata, ObjectId};

use super::{Bucket, Migrator, SharedKv, Tier};

pub use disk::open_disk_bucket;
pub use memory::open_memory_bucket;

/// Construction parameters for one bucket, already merged with the
/// storage-level defaults.
#[derive(Debug, Clone)]
pub struct BucketOptions {
    pub path: PathBuf,
    pub tier: Tier,
    pub weight: u32,
    pub db_type: String,
    /// Defaults to `<path>/.indexdb`.
    pub db_path: Option<PathBuf>,
    pub slice_size: u64,
    pub max_object_limit: usize,
    pub async_load: bool,
    pub promote: Option<PromoteOptions>,
}

#[derive(Debug, Clone, Copy)]
pub struct PromoteOptions {
    pub min_hits: u32,
    pub window: Duration,
}

impl BucketOptions {
    pub fn index_path(&self) -> PathBuf {
        self.db_path
            .clone()
            .unwrap_or_else(|| self.path.join(".indexdb"))
    }
}

/// Opens a bucket by driver name.
pub fn create(
    driver: &str,
    opts: BucketOptions,
    shared: Arc<dyn SharedKv>,
) -> Result<Arc<dyn Bucket>, CacheError> {
    match driver {
        "" | "native" => Ok(open_disk_bucket(opts, shared)?),
        "memory" => Ok(open_memory_bucket(opts, shared)?),
        "empty" => Ok(Arc::new(EmptyBucket::with_identity("/empty", opts.tier, 1))),
        other => Err(CacheError::Storage(anyhow::anyhow!(
            "unknown bucket driver {other:?}"
        ))),
    }
}

pub(crate) type BlobMap = Arc<RwLock<HashMap<PathBuf, Bytes>>>;

/// A chunk in flight. Bytes become visible at the final path only when
/// the sink commits: disk writes go to a temp file renamed on commit,
/// the memory tier swaps the finished blob in one map insert.
pub struct ChunkSink {
    kind: SinkKind,
}

enum SinkKind {
    Disk {
        file: tokio::fs::File,
        tmp: PathBuf,
        dest: PathBuf,
    },
    Memory {
        buf: Vec<u8>,
        dest: PathBuf,
        blobs: BlobMap,
    },
}

impl ChunkSink {
    pub(crate) fn disk(file: tokio::fs::File, tmp: PathBuf, dest: PathBuf) -> Self {
        Self {
            kind: SinkKind::Disk { file, tmp, dest },
        }
    }

    pub(crate) fn memory(dest: PathBuf, blobs: BlobMap) -> Self {
        Self {
            kind: SinkKind::Memory {
                buf: Vec::new(),
                dest,
                blobs,
            },
        }
    }

    pub async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        match &mut self.kind {
            SinkKind::Disk { file, .. } => file.write_all(data).await,
            SinkKind::Memory { buf, .. } => {
                buf.extend_from_slice(data);
                Ok(())
            }
        }
    }

    pub async fn commit(self) -> io::Result<()> {
        match self.kind {
            SinkKind::Disk { mut file, tmp, dest } => {
                file.flush().await?;
                drop(file);
                tokio::fs::rename(&tmp, &dest).await
            }
            SinkKind::Memory { buf, dest, blobs } => {
                blobs.write().insert(dest, Bytes::from(buf));
                Ok(())
            }
        }
    }

    pub async fn abort(self) {
        if let SinkKind::Disk { file, tmp, .. } = self.kind {
            drop(file);
            let _ = tokio::fs::remove_file(&tmp).await;
        }
    }
}

/// No-op bucket: the fallback when a tier has nothing configured, and
/// a stand-in for tests that only need bucket identity.
pub struct EmptyBucket {
    id: String,
    tier: Tier,
    weight: u32,
}

impl EmptyBucket {
    pub fn with_identity(id: &str, tier: Tier, weight: u32) -> Self {
        Self {
            id: id.to_string(),
            tier,
            weight,
        }
    }
}

#[async_trait]
impl Bucket for EmptyBucket {
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
        0
    }

    async fn lookup(&self, _id: &ObjectId) -> Result<Option<Metadata>, CacheError> {
        Ok(None)
    }

    async fn store(&self, _meta: &Metadata) -> Result<(), CacheError> {
        Ok(())
    }

    fn exists(&self, _hash: &IdHash) -> bool {
        false
    }

    async fn touch(&self, _id: &ObjectId) {}

    async fn remove(&self, _id: &ObjectId) -> Result<(), CacheError> {
        Ok(())
    }

    async fn discard(&self, _id: &ObjectId) -> Result<(), CacheError> {
        Err(CacheError::NotFound)
    }

    async fn discard_with_hash(&self, _hash: IdHash) -> Result<(), CacheError> {
        Err(CacheError::NotFound)
    }

    async fn discard_with_message(&self, _id: &ObjectId, _msg: &str) -> Result<(), CacheError> {
        Err(CacheError::NotFound)
    }

    async fn discard_with_metadata(&self, _meta: &Metadata) -> Result<(), CacheError> {
        Err(CacheError::NotFound)
    }

    fn iterate(&self, _f: &mut dyn FnMut(Metadata) -> bool) -> Result<(), CacheError> {
        Ok(())
    }

    async fn write_chunk(
        &self,
        id: &ObjectId,
        index: u32,
    ) -> Result<(ChunkSink, PathBuf), CacheError> {
        let _ = (id, index);
        Err(CacheError::Storage(anyhow::anyhow!(
            "empty bucket cannot store chunks"
        )))
    }

    async fn read_chunk(&self, _id: &ObjectId, _index: u32) -> Result<(Body, PathBuf), CacheError> {
        Err(CacheError::NotFound)
    }

    fn set_migrator(&self, _migrator: Weak<dyn Migrator>) {}

    async fn close(&self) {}
}

/// Temp-file suffix stamped with the wall clock, `.tmpYYYYMMDDhhmmss`.
pub(crate) fn tmp_suffix() -> String {
    let now = time::OffsetDateTime::now_utc();
    format!(
        ".tmp{:04}{:02}{:02}{:02}{:02}{:02}",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

pub(crate) fn tmp_path_for(dest: &Path) -> PathBuf {
    let mut path = dest.to_path_buf().into_os_string();
    path.push(tmp_suffix());
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmp_suffix_shape() {
        let suffix = tmp_suffix();
        assert!(suffix.starts_with(".tmp"));
        assert_eq!(suffix.len(), ".tmp".len() + 14);
    }

    #[tokio::test]
    async fn memory_sink_commits_atomically() {
        let blobs: BlobMap = Default::default();
        let dest = PathBuf::from("/a/bb/hash-000000");
        let mut sink = ChunkSink::memory(dest.clone(), blobs.clone());
        sink.write_all(b"hello ").await.unwrap();
        assert!(blobs.read().is_empty());
        sink.write_all(b"world").await.unwrap();
        sink.commit().await.unwrap();
        assert_eq!(blobs.read().get(&dest).unwrap().as_ref(), b"hello world");
    }

    #[tokio::test]
    async fn disk_sink_renames_on_commit() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("chunk-000000");
        let tmp = tmp_path_for(&dest);
        let file = tokio::fs::File::create(&tmp).await.unwrap();
        let mut sink = ChunkSink::disk(file, tmp.clone(), dest.clone());
        sink.write_all(b"data").await.unwrap();
        assert!(!dest.exists());
        sink.commit().await.unwrap();
        assert!(dest.exists());
        assert!(!tmp.exists());
        assert_eq!(std::fs::read(&dest).unwrap(), b"data");
    }

    #[tokio::test]
    async fn disk_sink_abort_removes_tmp() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("chunk-000001");
        let tmp = tmp_path_for(&dest);
        let file = tokio::fs::File::create(&tmp).await.unwrap();
        let mut sink = ChunkSink::disk(file, tmp.clone(), dest.clone());
        sink.write_all(b"partial").await.unwrap();
        sink.abort().await;
        assert!(!tmp.exists());
        assert!(!dest.exists());
    }
}
