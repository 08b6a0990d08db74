use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::CacheError;
use crate::iox::{bytes_body, Body};
use crate::storage::{indexdb, Bucket, SharedKv, Tier};

use super::core::{ChunkIo, StoreBucket};
use super::{BlobMap, BucketOptions, ChunkSink};

/// Opens the in-memory bucket: chunk blobs in a map, a memory index,
/// bucket id `/`.
pub fn open_memory_bucket(
    mut opts: BucketOptions,
    shared: Arc<dyn SharedKv>,
) -> Result<Arc<dyn Bucket>, CacheError> {
    opts.tier = Tier::InMemory;
    let index = indexdb::create("memory", std::path::Path::new("/"))
        .map_err(CacheError::Storage)?;
    let blobs: BlobMap = Default::default();
    let bucket = StoreBucket::build(
        &opts,
        "/".to_string(),
        PathBuf::from("/"),
        index,
        shared,
        Box::new(MemChunks { blobs }),
    );
    Ok(bucket)
}

struct MemChunks {
    blobs: BlobMap,
}

#[async_trait]
impl ChunkIo for MemChunks {
    async fn open_write(&self, dest: PathBuf) -> std::io::Result<ChunkSink> {
        Ok(ChunkSink::memory(dest, self.blobs.clone()))
    }

    async fn open_read(&self, dest: PathBuf) -> std::io::Result<Body> {
        match self.blobs.read().get(&dest) {
            Some(blob) => Ok(bytes_body(blob.clone())),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotFound)),
        }
    }

    async fn remove(&self, dest: PathBuf) -> std::io::Result<()> {
        self.blobs.write().remove(&dest);
        Ok(())
    }
}
