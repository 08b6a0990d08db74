use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::CacheError;
use crate::object::{IdHash, ObjectId};
use crate::storage::Bucket;

use super::upstream::{UpstreamRequest, UpstreamResponse};
use super::Caching;

const TOUCH_QUEUE: usize = 10_000;
const TOUCH_TIMEOUT: Duration = Duration::from_secs(1);

/// One stage of the caching pipeline.
///
/// `lookup` runs during the pre-cache phase and short-circuits the
/// chain on the first `false` (miss). `pre_request` shapes the
/// outbound origin request; `post_request` reacts to its response.
#[async_trait]
pub trait Processor: Send + Sync {
    async fn lookup(&self, c: &mut Caching) -> Result<bool, CacheError> {
        let _ = c;
        Ok(true)
    }

    async fn pre_request(
        &self,
        c: &mut Caching,
        req: &mut UpstreamRequest,
    ) -> Result<(), CacheError> {
        let _ = (c, req);
        Ok(())
    }

    async fn post_request(
        &self,
        c: &mut Caching,
        resp: &mut UpstreamResponse,
    ) -> Result<(), CacheError> {
        let _ = (c, resp);
        Ok(())
    }
}

struct TouchJob {
    bucket: Arc<dyn Bucket>,
    id: ObjectId,
}

/// Fixed-order processor chain plus the background touch worker.
///
/// Touches are bounded and drop-on-full; a per-object in-flight set
/// keeps one hot object from flooding the queue.
pub struct ProcessorChain {
    processors: Vec<Box<dyn Processor>>,
    touch_tx: mpsc::Sender<TouchJob>,
    touching: Arc<Mutex<HashSet<IdHash>>>,
}

impl ProcessorChain {
    pub fn new(processors: Vec<Box<dyn Processor>>) -> Arc<Self> {
        let (touch_tx, touch_rx) = mpsc::channel(TOUCH_QUEUE);
        let touching: Arc<Mutex<HashSet<IdHash>>> = Arc::new(Mutex::new(HashSet::new()));
        let chain = Arc::new(Self {
            processors,
            touch_tx,
            touching: touching.clone(),
        });
        tokio::spawn(touch_worker(touch_rx, touching));
        chain
    }

    pub async fn lookup(&self, c: &mut Caching) -> Result<bool, CacheError> {
        for processor in &self.processors {
            c.hit = processor.lookup(c).await?;
            if !c.hit {
                return Ok(false);
            }
        }
        Ok(true)
    }

    pub async fn pre_request(
        &self,
        c: &mut Caching,
        req: &mut UpstreamRequest,
    ) -> Result<(), CacheError> {
        for processor in &self.processors {
            processor.pre_request(c, req).await?;
        }
        Ok(())
    }

    pub async fn post_request(
        &self,
        c: &mut Caching,
        resp: &mut UpstreamResponse,
    ) -> Result<(), CacheError> {
        for processor in &self.processors {
            processor.post_request(c, resp).await?;
        }
        Ok(())
    }

    /// Queues a touch for a cache hit; never blocks the response path.
    pub fn submit_touch(&self, bucket: Arc<dyn Bucket>, id: ObjectId) {
        let hash = id.hash();
        {
            let mut touching = self.touching.lock();
            if !touching.insert(hash) {
                // a touch for this object is already queued
                return;
            }
        }
        if self
            .touch_tx
            .try_send(TouchJob { bucket, id: id.clone() })
            .is_err()
        {
            self.touching.lock().remove(&hash);
            warn!(key = %id.key(), "touch queue full, dropping touch");
        }
    }
}

async fn touch_worker(mut rx: mpsc::Receiver<TouchJob>, touching: Arc<Mutex<HashSet<IdHash>>>) {
    while let Some(job) = rx.recv().await {
        let hash = job.id.hash();
        if tokio::time::timeout(TOUCH_TIMEOUT, job.bucket.touch(&job.id))
            .await
            .is_err()
        {
            warn!(key = %job.id.key(), "touch timed out");
        }
        touching.lock().remove(&hash);
    }
}
