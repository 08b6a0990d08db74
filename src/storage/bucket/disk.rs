use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;

use crate::error::CacheError;
use crate::iox::Body;
use crate::storage::{indexdb, Bucket, SharedKv};

use super::core::{ChunkIo, StoreBucket};
use super::{tmp_path_for, BucketOptions, ChunkSink};

#[cfg(target_os = "linux")]
const O_NOATIME: i32 = 0o1000000;

/// Opens a disk bucket rooted at `opts.path`, creating the work
/// directory and its index database.
pub fn open_disk_bucket(
    opts: BucketOptions,
    shared: Arc<dyn SharedKv>,
) -> Result<Arc<dyn Bucket>, CacheError> {
    std::fs::create_dir_all(&opts.path)
        .with_context(|| format!("creating bucket dir {}", opts.path.display()))
        .map_err(CacheError::Storage)?;
    let db_path = opts.index_path();
    std::fs::create_dir_all(&db_path)
        .with_context(|| format!("creating index dir {}", db_path.display()))
        .map_err(CacheError::Storage)?;

    let index = indexdb::create(&opts.db_type, &db_path).map_err(CacheError::Storage)?;
    let id = opts.path.to_string_lossy().to_string();
    let base = opts.path.clone();
    let bucket = StoreBucket::build(&opts, id, base, index, shared, Box::new(DiskChunks));
    Ok(bucket)
}

struct DiskChunks;

#[async_trait]
impl ChunkIo for DiskChunks {
    async fn open_write(&self, dest: PathBuf) -> std::io::Result<ChunkSink> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = tmp_path_for(&dest);
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&tmp)
            .await?;
        Ok(ChunkSink::disk(file, tmp, dest))
    }

    async fn open_read(&self, dest: PathBuf) -> std::io::Result<Body> {
        let mut options = std::fs::OpenOptions::new();
        options.read(true);
        #[cfg(target_os = "linux")]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.custom_flags(O_NOATIME);
        }
        let file = tokio::fs::OpenOptions::from(options).open(&dest).await;
        let file = match file {
            Ok(file) => file,
            #[cfg(target_os = "linux")]
            Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
                // O_NOATIME needs file ownership; retry plainly
                tokio::fs::File::open(&dest).await?
            }
            Err(err) => return Err(err),
        };
        Ok(Box::new(file))
    }

    async fn remove(&self, dest: PathBuf) -> std::io::Result<()> {
        tokio::fs::remove_file(&dest).await
    }
}
