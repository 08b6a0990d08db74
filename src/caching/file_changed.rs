use async_trait::async_trait;
use http::header::{ETAG, LAST_MODIFIED};
use http::StatusCode;
use tracing::info;

use crate::error::CacheError;
use crate::httpx;
use crate::object::{Bitmap, Metadata};

use super::processor::Processor;
use super::upstream::UpstreamResponse;
use super::Caching;

/// Detects an origin object replaced underneath the cache: a response
/// whose validators disagree with the stored ones drops the stale
/// chunks and rebuilds metadata from the fresh response.
pub struct FileChangedProcessor;

fn validator_changed(cached: &http::HeaderMap, fresh: &http::HeaderMap) -> bool {
    for name in [ETAG, LAST_MODIFIED] {
        if let (Some(old), Some(new)) = (cached.get(&name), fresh.get(&name))
            && old != new
        {
            return true;
        }
    }
    false
}

#[async_trait]
impl Processor for FileChangedProcessor {
    async fn post_request(
        &self,
        c: &mut Caching,
        resp: &mut UpstreamResponse,
    ) -> Result<(), CacheError> {
        if resp.status != StatusCode::OK && resp.status != StatusCode::PARTIAL_CONTENT {
            return Ok(());
        }
        let Some(md) = c.md_snapshot() else {
            return Ok(());
        };
        if md.is_vary_index() || md.chunks.is_empty() {
            return Ok(());
        }
        if !validator_changed(&md.headers, &resp.headers) {
            return Ok(());
        }

        info!(key = %c.id.key(), "origin object changed, rebuilding cache entry");
        c.file_changed = true;
        let _ = c.bucket.discard_with_metadata(&md).await;

        let total = httpx::range::parse_content_range(&resp.headers)
            .map(|r| r.total)
            .unwrap_or(0);
        let now = httpx::now_unix();
        let mut fresh = Metadata::new(&c.id, 200, total, md.block_size, now);
        fresh.expires_at = md.expires_at;
        fresh.chunks = Bitmap::new();
        c.set_target(c.id.clone(), fresh);
        Ok(())
    }
}
