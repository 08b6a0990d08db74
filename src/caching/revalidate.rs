use async_trait::async_trait;
use http::header::{ETAG, IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, RANGE};
use http::{HeaderMap, StatusCode};
use tracing::{debug, warn};

use crate::error::CacheError;
use crate::httpx::{self, has_condition_header};

use super::processor::Processor;
use super::upstream::{UpstreamRequest, UpstreamResponse};
use super::{CacheStatus, Caching};

/// Freshness gate: fresh entries hit, stale-but-revalidatable entries
/// turn into conditional requests, dead entries are discarded.
pub struct RevalidateProcessor;

/// `soft_ttl = resp_unix + floor(hard_ttl × rate)`; the stale-while-
/// revalidate window opens here and closes at `expires_at`.
fn soft_ttl(resp_unix: i64, expires_at: i64, rate: f64) -> i64 {
    let hard_ttl = expires_at - resp_unix;
    if hard_ttl <= 0 {
        return expires_at;
    }
    resp_unix + (hard_ttl as f64 * rate) as i64
}

/// Linear probability ramp across `[soft, hard)`.
fn should_trigger_refresh(now: i64, soft: i64, hard: i64) -> bool {
    if now < soft || now >= hard {
        return false;
    }
    let window = (hard - soft) as f64;
    if window <= 0.0 {
        return false;
    }
    let probability = (now - soft) as f64 / window;
    rand::random::<f64>() < probability
}

#[async_trait]
impl Processor for RevalidateProcessor {
    async fn lookup(&self, c: &mut Caching) -> Result<bool, CacheError> {
        let Some(md) = c.md_snapshot() else {
            return Ok(false);
        };

        let now = httpx::now_unix();
        let hard = md.expires_at;

        if c.opts.fuzzy_refresh {
            let rate = c.opts.effective_fuzzy_rate();
            let soft = soft_ttl(md.resp_unix, md.expires_at, rate);
            if now >= soft && now < hard {
                if should_trigger_refresh(now, soft, hard)
                    && md.has_complete()
                    && has_condition_header(&md.headers)
                {
                    debug!(key = %c.id.key(), soft, hard, "fuzzy refresh triggered");
                    c.fuzzy_refresh = true;
                }
                // serve stale while the background refresh runs
                return Ok(true);
            }
        }

        if !md.has_expired(now) {
            return Ok(true);
        }

        if md.has_complete() && (has_condition_header(&md.headers) || md.code >= 300) {
            c.revalidate = true;
            c.cache_status = CacheStatus::RevalidateHit;
            return Ok(false);
        }

        // expired with nothing to revalidate against: plain miss
        c.revalidate = false;
        c.cache_status = CacheStatus::Miss;
        if let Err(err) = c
            .bucket
            .discard_with_message(&c.id, "revalidate cache with expired")
            .await
        {
            if !matches!(err, CacheError::NotFound) {
                warn!(key = %c.id.key(), error = %err, "expired cache discard failed");
            }
        }
        // the refill must not inherit chunk bits whose files just left
        c.with_target(|t| {
            t.md.chunks = crate::object::Bitmap::new();
            t.md.virtual_keys.clear();
        });
        Ok(false)
    }

    async fn pre_request(
        &self,
        c: &mut Caching,
        req: &mut UpstreamRequest,
    ) -> Result<(), CacheError> {
        if !c.revalidate {
            return Ok(());
        }
        let Some(md) = c.md_snapshot() else {
            return Ok(());
        };

        let mut conditional = false;
        if let Some(etag) = md.headers.get(ETAG) {
            req.headers.insert(IF_NONE_MATCH, etag.clone());
            conditional = true;
        }
        if let Some(lm) = md.headers.get(LAST_MODIFIED) {
            req.headers.insert(IF_MODIFIED_SINCE, lm.clone());
            conditional = true;
        }
        if md.code >= 300 {
            conditional = true;
        }

        if !conditional {
            warn!(key = %c.id.key(), "no ETag/Last-Modified to revalidate with, dropping cache");
            let _ = c
                .bucket
                .discard_with_message(&c.id, "refresh cache no condition header")
                .await;
            return Ok(());
        }

        if let Some(raw) = req.headers.get(RANGE).and_then(|v| v.to_str().ok()) {
            c.revalidate_range = Some(raw.to_string());
        }
        Ok(())
    }

    async fn post_request(
        &self,
        c: &mut Caching,
        resp: &mut UpstreamResponse,
    ) -> Result<(), CacheError> {
        if c.revalidate && resp.status != StatusCode::NOT_MODIFIED {
            // origin changed; the stored object is stale garbage now
            c.revalidate = false;
            c.cache_status = CacheStatus::RevalidateMiss;
            c.with_target(|t| {
                t.md.chunks = crate::object::Bitmap::new();
            });
            let _ = c
                .bucket
                .discard_with_message(&c.id, "revalidate not 304")
                .await;
        }
        Ok(())
    }
}

/// Applies a 304's freshness to the cached metadata and persists it;
/// chunks, size, and block size stay untouched.
pub async fn freshness(c: &mut Caching, resp_headers: &HeaderMap) -> bool {
    let cache_time = httpx::parse_cache_time(resp_headers, time::OffsetDateTime::now_utc());
    if !cache_time.cacheable {
        return false;
    }

    let now = httpx::now_unix();
    c.with_target(|t| {
        t.md.expires_at = now + cache_time.ttl_secs;
        t.md.resp_unix = now;
        t.md.last_ref_unix = now;
        merge_freshness_headers(&mut t.md.headers, resp_headers);
    });
    c.cacheable = true;

    if let Some(md) = c.md_snapshot()
        && let Err(err) = c.bucket.store(&md).await
    {
        warn!(key = %c.id.key(), error = %err, "freshness store failed");
    }
    true
}

pub fn merge_freshness_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for name in [LAST_MODIFIED, ETAG, http::header::CACHE_CONTROL] {
        if let Some(value) = src.get(&name) {
            dst.insert(name.clone(), value.clone());
        }
    }
}
