use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use http::StatusCode;
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::httpx::{range::single_range, PREFETCH_KEY};
use crate::iox;

use super::processor::Processor;
use super::upstream::{UpstreamRequest, UpstreamResponse};
use super::Caching;

/// Prefetch mode: a truthy `X-Prefetch` fetches the whole object so
/// the cache fills completely, while the client still receives only
/// the window it asked for.
pub struct PrefetchProcessor;

#[async_trait]
impl Processor for PrefetchProcessor {
    async fn pre_request(
        &self,
        c: &mut Caching,
        req: &mut UpstreamRequest,
    ) -> Result<(), CacheError> {
        if req.headers.contains_key(PREFETCH_KEY) {
            if let Some(raw) = req.headers.get(RANGE).and_then(|v| v.to_str().ok()) {
                c.prefetch_range = Some(raw.to_string());
                req.headers.remove(RANGE);
            }
            c.prefetch = true;
            req.headers.remove(PREFETCH_KEY);
            debug!(url = %req.url, "prefetch request");
        }
        Ok(())
    }

    async fn post_request(
        &self,
        c: &mut Caching,
        resp: &mut UpstreamResponse,
    ) -> Result<(), CacheError> {
        if !c.prefetch || resp.status != StatusCode::OK {
            return Ok(());
        }

        let size = match resp
            .headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
        {
            Some(size) => size,
            None => {
                warn!("prefetch response without content-length, maybe chunked");
                return Ok(());
            }
        };

        if let Some(raw) = c.prefetch_range.clone()
            && let Ok(rng) = single_range(Some(&raw), size)
        {
            let body = std::mem::replace(&mut resp.body, iox::empty_body());
            resp.body = iox::window(body, rng.start, rng.length());
            resp.status = StatusCode::PARTIAL_CONTENT;
            if let Ok(value) = rng.content_range(size).parse() {
                resp.headers.insert(CONTENT_RANGE, value);
            }
            if let Ok(value) = rng.length().to_string().parse() {
                resp.headers.insert(CONTENT_LENGTH, value);
            }
        }
        Ok(())
    }
}
