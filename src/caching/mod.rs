pub mod chunk_writer;
pub mod file_changed;
pub mod fill_range;
pub mod prefetch;
pub mod processor;
pub mod revalidate;
pub mod state;
pub mod upstream;
pub mod vary;

use std::collections::HashMap;
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use http::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::event::{CacheCompleted, Event, EventBus, CACHE_COMPLETED};
use crate::httpx::{
    self, range::single_range, range::ByteRange, CACHE_STATUS_KEY, FLAG_ON,
    INTERNAL_CACHE_ERR_CODE, INTERNAL_FILL_RANGE_PERCENT, INTERNAL_STORE_URL,
};
use crate::iox::{self, Body, MultiReader};
use crate::metrics;
use crate::object::{Flags, IdHash, Metadata, ObjectId};
use crate::settings::CachingSettings;
use crate::storage::{Bucket, Storage, Tier};

use chunk_writer::{save_chunks, FlushHandler};
use processor::ProcessorChain;
use upstream::{Upstream, UpstreamRequest, UpstreamResponse};

/// Cache outcome surfaced in `X-Cache`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Miss,
    Hit,
    PartHit,
    PartMiss,
    RevalidateHit,
    RevalidateMiss,
    Bypass,
}

impl CacheStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheStatus::Miss => "MISS",
            CacheStatus::Hit => "HIT",
            CacheStatus::PartHit => "PART_HIT",
            CacheStatus::PartMiss => "PART_MISS",
            CacheStatus::RevalidateHit => "REVALIDATE_HIT",
            CacheStatus::RevalidateMiss => "REVALIDATE_MISS",
            CacheStatus::Bypass => "BYPASS",
        }
    }
}

/// The metadata (and its id) a request is currently filling or
/// serving. Shared with the chunk writer's flush handler, which must
/// observe a vary upgrade swapping the target underneath it.
pub struct CacheTarget {
    pub id: ObjectId,
    pub md: Metadata,
    /// Set when a processor rejects the fill after the writer was
    /// armed (vary limit); flushes become no-ops.
    pub disarmed: bool,
}

pub type SharedTarget = Arc<Mutex<CacheTarget>>;

/// Per-request pipeline state.
pub struct Caching {
    pub id: ObjectId,
    pub bucket: Arc<dyn Bucket>,
    pub target: Option<SharedTarget>,
    pub rootmd: Option<Metadata>,

    pub hit: bool,
    pub cacheable: bool,
    pub prefetch: bool,
    pub revalidate: bool,
    pub file_changed: bool,
    pub no_content_len: bool,
    pub fuzzy_refresh: bool,
    pub cache_status: CacheStatus,

    pub method: Method,
    /// Canonical cache-key URL.
    pub store_url: String,
    /// URL the upstream request goes to.
    pub request_url: String,
    pub req_headers: HeaderMap,
    pub raw_range: Option<String>,
    pub prefetch_range: Option<String>,
    pub revalidate_range: Option<String>,
    pub fill_percent: u64,
    pub cache_error_codes: bool,

    pub opts: Arc<CachingSettings>,
}

impl Caching {
    pub fn md_snapshot(&self) -> Option<Metadata> {
        self.target.as_ref().map(|t| t.lock().md.clone())
    }

    pub fn with_target<R>(&self, f: impl FnOnce(&mut CacheTarget) -> R) -> Option<R> {
        self.target.as_ref().map(|t| f(&mut t.lock()))
    }

    /// Installs (or replaces) the fill/serve target, keeping `self.id`
    /// and the writer's view in sync.
    pub fn set_target(&mut self, id: ObjectId, md: Metadata) {
        self.id = id.clone();
        match &self.target {
            Some(target) => {
                let mut target = target.lock();
                target.id = id;
                target.md = md;
                target.disarmed = false;
            }
            None => {
                self.target = Some(Arc::new(Mutex::new(CacheTarget {
                    id,
                    md,
                    disarmed: false,
                })));
            }
        }
    }

    pub fn has_no_cache(&self) -> bool {
        self.req_headers
            .get_all(http::header::CACHE_CONTROL)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .any(|v| v.to_ascii_lowercase().contains("no-cache"))
    }
}

enum Flight {
    Primary(FlightGuard),
    Follower(watch::Receiver<bool>),
}

type FlightMap = Arc<Mutex<HashMap<IdHash, watch::Receiver<bool>>>>;

/// Releases the collapsed-request flight on drop, waking followers.
pub struct FlightGuard {
    hash: IdHash,
    flights: FlightMap,
    tx: watch::Sender<bool>,
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        let _ = self.tx.send(true);
        self.flights.lock().remove(&self.hash);
    }
}

/// The caching data plane: turns one GET/HEAD request into a response
/// assembled from cached chunks, upstream sub-requests, or both, while
/// persisting whatever new bytes stream past.
pub struct CachingLayer {
    storage: Arc<dyn Storage>,
    upstream: Arc<dyn Upstream>,
    opts: Arc<CachingSettings>,
    chain: Arc<ProcessorChain>,
    events: Arc<EventBus>,
    flights: FlightMap,
    refreshing: Arc<Mutex<HashSet<IdHash>>>,
}

impl CachingLayer {
    pub fn new(
        storage: Arc<dyn Storage>,
        upstream: Arc<dyn Upstream>,
        opts: CachingSettings,
        events: Arc<EventBus>,
    ) -> Arc<Self> {
        let opts = Arc::new(opts);
        let chain = ProcessorChain::new(vec![
            Box::new(state::StateProcessor),
            Box::new(prefetch::PrefetchProcessor),
            Box::new(vary::VaryProcessor::new(
                opts.vary_limit,
                opts.vary_ignore_key.clone(),
            )),
            Box::new(revalidate::RevalidateProcessor),
            Box::new(file_changed::FileChangedProcessor),
            Box::new(fill_range::FillRangeProcessor),
        ]);
        Arc::new(Self {
            storage,
            upstream,
            opts,
            chain,
            events,
            flights: Default::default(),
            refreshing: Default::default(),
        })
    }

    /// Entry point for one client request. Only GET and HEAD engage
    /// the cache; anything else proxies straight through.
    pub async fn handle(&self, req: Request<()>) -> Result<Response<Body>, CacheError> {
        if req.method() != Method::GET && req.method() != Method::HEAD {
            let upstream_req = UpstreamRequest::new(
                req.method().clone(),
                request_url(&req),
                req.headers().clone(),
            );
            let resp = self.upstream.fetch(upstream_req).await?;
            return Ok(into_response(resp));
        }

        let mut c = self.pre_cache(&req).await;

        let lookup = self.chain.lookup(&mut c).await;
        match lookup {
            Err(err) => {
                warn!(key = %c.id.key(), error = %err, "pre-cache lookup failed, BYPASS");
                c.cache_status = CacheStatus::Bypass;
                let resp = self.do_proxy(&mut c, None).await?;
                let mut resp = into_response(resp);
                self.post_cache(&mut c, &mut resp).await;
                Ok(resp)
            }
            Ok(true) => {
                c.cache_status = CacheStatus::Hit;
                let raw_range = c.raw_range.clone();
                let mut resp = self.serve_from_chunks(&mut c, raw_range).await?;
                self.post_cache(&mut c, &mut resp).await;
                self.maybe_fuzzy_refresh(&c);
                Ok(resp)
            }
            Ok(false) => {
                let flight = if self.opts.collapsed_request && !c.revalidate {
                    Some(self.acquire_flight(&c).await)
                } else {
                    None
                };

                match flight {
                    Some(Flight::Follower(mut rx)) => {
                        let waited = tokio::time::timeout(
                            self.opts.collapsed_wait_timeout(),
                            rx.changed(),
                        )
                        .await;
                        if waited.is_ok() {
                            metrics::record_collapsed_wait("released");
                            // the primary finished its fill; retry the cache
                            let mut retry = self.pre_cache(&req).await;
                            if self.chain.lookup(&mut retry).await.unwrap_or(false) {
                                retry.cache_status = CacheStatus::Hit;
                                let raw_range = retry.raw_range.clone();
                                let mut resp =
                                    self.serve_from_chunks(&mut retry, raw_range).await?;
                                self.post_cache(&mut retry, &mut resp).await;
                                return Ok(resp);
                            }
                            c = retry;
                        } else {
                            metrics::record_collapsed_wait("timeout");
                        }
                        self.miss(&mut c, None).await
                    }
                    Some(Flight::Primary(guard)) => self.miss(&mut c, Some(guard)).await,
                    None => self.miss(&mut c, None).await,
                }
            }
        }
    }

    async fn pre_cache(&self, req: &Request<()>) -> Caching {
        let store_url = store_url(req, self.opts.include_query_in_cache_key);
        let id = ObjectId::new(store_url.clone());
        let bucket = self.storage.select(&id);
        let md = match bucket.lookup(&id).await {
            Ok(md) => md,
            Err(err) => {
                warn!(key = %id.key(), error = %err, "index lookup failed");
                None
            }
        };

        let fill_percent = req
            .headers()
            .get(INTERNAL_FILL_RANGE_PERCENT)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|pct| *pct <= 100)
            .unwrap_or(self.opts.fill_range_percent);
        let cache_error_codes = self.opts.cache_error_codes
            || req
                .headers()
                .get(INTERNAL_CACHE_ERR_CODE)
                .is_some_and(|v| v.as_bytes() == FLAG_ON.as_bytes());

        let mut c = Caching {
            id: id.clone(),
            bucket,
            target: None,
            rootmd: None,
            hit: false,
            cacheable: false,
            prefetch: false,
            revalidate: false,
            file_changed: false,
            no_content_len: false,
            fuzzy_refresh: false,
            cache_status: CacheStatus::Miss,
            method: req.method().clone(),
            store_url,
            request_url: request_url(req),
            req_headers: req.headers().clone(),
            raw_range: req
                .headers()
                .get(RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string),
            prefetch_range: None,
            revalidate_range: None,
            fill_percent,
            cache_error_codes,
            opts: self.opts.clone(),
        };
        if let Some(md) = md {
            c.set_target(id, md);
        }
        c
    }

    async fn miss(
        &self,
        c: &mut Caching,
        flight: Option<FlightGuard>,
    ) -> Result<Response<Body>, CacheError> {
        let resp = self.do_proxy(c, flight).await?;

        // a 304 answer to our conditional request re-enters the cached
        // path with refreshed metadata
        if resp.status == StatusCode::NOT_MODIFIED && c.revalidate {
            c.revalidate = false;
            c.cache_status = CacheStatus::RevalidateHit;
            revalidate::freshness(c, &resp.headers).await;
            let raw_range = c.revalidate_range.clone();
            let mut resp = self.serve_from_chunks(c, raw_range).await?;
            self.post_cache(c, &mut resp).await;
            return Ok(resp);
        }

        let mut resp = into_response(resp);
        self.post_cache(c, &mut resp).await;
        Ok(resp)
    }

    async fn acquire_flight(&self, c: &Caching) -> Flight {
        let hash = c.id.hash();
        let mut flights = self.flights.lock();
        if let Some(rx) = flights.get(&hash) {
            return Flight::Follower(rx.clone());
        }
        let (tx, rx) = watch::channel(false);
        flights.insert(hash, rx);
        Flight::Primary(FlightGuard {
            hash,
            flights: self.flights.clone(),
            tx,
        })
    }

    /// Lazy assembly: compose present chunk runs with upstream
    /// sub-requests for the gaps.
    async fn serve_from_chunks(
        &self,
        c: &mut Caching,
        raw_range: Option<String>,
    ) -> Result<Response<Body>, CacheError> {
        let md = c.md_snapshot().ok_or(CacheError::NotFound)?;
        let has_range = raw_range.is_some();

        let rng = match single_range(raw_range.as_deref(), md.size) {
            Ok(rng) => rng,
            Err(CacheError::InvalidRange) => {
                let mut resp = Response::builder()
                    .status(StatusCode::RANGE_NOT_SATISFIABLE)
                    .body(iox::empty_body())
                    .expect("static response");
                resp.headers_mut().insert(
                    CONTENT_RANGE,
                    format!("bytes */{}", md.size).parse().expect("valid header"),
                );
                return Ok(resp);
            }
            Err(err) => return Err(err),
        };

        let block_size = md.block_size.max(1);
        let first = (rng.start / block_size) as u32;
        let last = (rng.end / block_size) as u32;

        // a revalidated response keeps its REVALIDATE_* outcome even
        // though the bytes come from the same lazy assembly
        if c.cache_status != CacheStatus::RevalidateHit {
            let present = (first..=last).filter(|i| md.chunks.test(*i)).count() as u32;
            let span = last - first + 1;
            c.cache_status = if present == span {
                CacheStatus::Hit
            } else if present == 0 {
                CacheStatus::PartMiss
            } else {
                CacheStatus::PartHit
            };
        }

        c.with_target(|t| t.md.last_ref_unix = httpx::now_unix());

        if c.method == Method::HEAD {
            return Ok(build_cached_response(&md, has_range, rng));
        }

        let mut parts: Vec<Body> = Vec::new();
        let mut i = first;
        while i <= last {
            if md.chunks.test(i) {
                match c.bucket.read_chunk(&c.id, i).await {
                    Ok((body, _)) => parts.push(body),
                    Err(CacheError::Corrupt { key, index }) => {
                        warn!(key = %key, index, "cached chunk unreadable, discarding object");
                        let _ = c.bucket.discard_with_metadata(&md).await;
                        return Err(CacheError::Corrupt { key, index });
                    }
                    Err(err) => return Err(err),
                }
                i += 1;
            } else {
                let mut j = i;
                while j <= last && !md.chunks.test(j) {
                    j += 1;
                }
                let sub_start = i as u64 * block_size;
                let sub_end = (j as u64 * block_size).min(md.size.max(1)) - 1;
                let body = self.sub_request(c, sub_start, sub_end).await?;
                parts.push(body);
                i = j;
            }
        }

        let body: Body = Box::new(MultiReader::new(parts));
        let body = iox::limit(
            iox::skip(body, rng.start - first as u64 * block_size),
            rng.length(),
        );

        let mut resp = build_cached_response(&md, has_range, rng);
        *resp.body_mut() = body;
        Ok(resp)
    }

    /// Fetches one aligned gap from the origin, teeing the stream
    /// through the chunk writer so the gap lands on disk.
    async fn sub_request(
        &self,
        c: &Caching,
        sub_start: u64,
        sub_end: u64,
    ) -> Result<Body, CacheError> {
        let mut headers = c.req_headers.clone();
        httpx::strip_internal_headers(&mut headers);
        headers.remove(http::header::IF_NONE_MATCH);
        headers.remove(http::header::IF_MODIFIED_SINCE);
        headers.insert(
            RANGE,
            format!("bytes={sub_start}-{sub_end}")
                .parse()
                .expect("valid range header"),
        );

        debug!(key = %c.id.key(), sub_start, sub_end, "upstream sub-request");
        let resp = self
            .upstream
            .fetch(UpstreamRequest::new(
                Method::GET,
                c.request_url.clone(),
                headers,
            ))
            .await?;

        if resp.status != StatusCode::PARTIAL_CONTENT {
            warn!(status = %resp.status, "sub-request did not return 206");
            return Err(CacheError::upstream(resp.status));
        }

        let target = c.target.clone().ok_or(CacheError::NotFound)?;
        let total = target.lock().md.size;
        let filler = CacheFiller {
            target,
            bucket: c.bucket.clone(),
            opts: self.opts.clone(),
            events: self.events.clone(),
            chunked: false,
            total,
            _flight: None,
        };
        let block_size = c.md_snapshot().map(|md| md.block_size).unwrap_or(1);
        Ok(save_chunks(resp.body, block_size, sub_start, 8, filler))
    }

    /// Full miss / revalidation proxy: shapes the origin request
    /// through the chain, classifies the response, and arms the cache
    /// fill.
    async fn do_proxy(
        &self,
        c: &mut Caching,
        flight: Option<FlightGuard>,
    ) -> Result<UpstreamResponse, CacheError> {
        let mut headers = c.req_headers.clone();
        headers.remove(CACHE_STATUS_KEY);
        let mut req = UpstreamRequest::new(c.method.clone(), c.request_url.clone(), headers);
        self.chain.pre_request(c, &mut req).await?;

        let mut resp = self.upstream.fetch(req).await?;
        debug!(
            url = %c.request_url,
            status = %resp.status,
            content_range = ?resp.headers.get(CONTENT_RANGE),
            "upstream response"
        );

        // redirects pass through uncached
        if resp.status == StatusCode::MOVED_PERMANENTLY || resp.status == StatusCode::FOUND {
            return Ok(resp);
        }
        if resp.status == StatusCode::RANGE_NOT_SATISFIABLE {
            return Err(CacheError::upstream(resp.status));
        }

        let not_modified = resp.status == StatusCode::NOT_MODIFIED;
        let resp_range = httpx::range::parse_content_range(&resp.headers);
        if resp_range.is_none() && !not_modified {
            c.no_content_len = true;
        }
        let total = resp_range.map(|r| r.total).unwrap_or(0);
        let range_start = resp_range.map(|r| r.start).unwrap_or(0);

        let now = httpx::now_unix();
        if c.target.is_none() {
            let md = Metadata::new(&c.id, 200, total, self.opts.slice_size, now);
            c.set_target(c.id.clone(), md);
        }

        let cache_time =
            httpx::parse_cache_time(&resp.headers, time::OffsetDateTime::now_utc());
        c.cacheable = cache_time.cacheable;
        c.with_target(|t| {
            t.md.expires_at = now + cache_time.ttl_secs;
            t.md.resp_unix = now;
            t.md.last_ref_unix = now;
        });

        if not_modified {
            return Ok(resp);
        }

        httpx::remove_hop_by_hop_headers(&mut resp.headers);

        let code = if resp.status == StatusCode::PARTIAL_CONTENT {
            StatusCode::OK
        } else {
            resp.status
        };
        c.with_target(|t| {
            t.md.code = code.as_u16();
            t.md.size = total;
        });

        if code.as_u16() >= 400 {
            let flag_on = c.cache_error_codes
                || resp
                    .headers
                    .get(INTERNAL_CACHE_ERR_CODE)
                    .is_some_and(|v| v.as_bytes() == FLAG_ON.as_bytes());
            if !flag_on {
                c.cacheable = false;
                c.with_target(|t| t.md.headers = resp.headers.clone());
            }
        }

        let mut flight = flight;
        if c.cacheable {
            let target = c.target.clone().expect("target installed above");
            let chunked = total == 0;
            let block_size = target.lock().md.block_size;
            let filler = CacheFiller {
                target,
                bucket: c.bucket.clone(),
                opts: self.opts.clone(),
                events: self.events.clone(),
                chunked,
                total,
                _flight: flight.take(),
            };
            resp.body = save_chunks(resp.body, block_size, range_start, 8, filler);
        }

        self.chain.post_request(c, &mut resp).await?;

        if c.no_content_len && code == StatusCode::OK {
            c.with_target(|t| t.md.flags.insert(Flags::CHUNKED_CACHE));
        }

        // refresh the persisted header view from this response; range
        // framing headers are per-response, never per-object
        c.with_target(|t| {
            httpx::copy_headers(&mut t.md.headers, &resp.headers);
            t.md.headers.remove(CONTENT_RANGE);
            t.md.headers.remove(CONTENT_LENGTH);
            httpx::strip_internal_headers(&mut t.md.headers);
        });

        Ok(resp)
    }

    /// Post-cache phase: cache outcome headers, freshness headers,
    /// deferred persistence, and the async touch.
    async fn post_cache(&self, c: &mut Caching, resp: &mut Response<Body>) {
        let headers = resp.headers_mut();
        headers.insert(
            CACHE_STATUS_KEY,
            c.cache_status.as_str().parse().expect("valid header"),
        );
        if let Some(md) = c.md_snapshot() {
            let age = (httpx::now_unix() - md.resp_unix).max(0);
            if let Ok(value) = age.to_string().parse() {
                headers.insert(http::header::AGE, value);
            }
            if let Ok(value) = httpx::format_http_date(md.resp_unix).parse() {
                headers.insert(http::header::DATE, value);
            }
            if let Ok(value) = httpx::format_http_date(md.expires_at).parse() {
                headers.insert(http::header::EXPIRES, value);
            }
        }
        metrics::record_cache_status(c.cache_status.as_str());

        if c.cacheable {
            if c.method == Method::HEAD
                && let Some(md) = c.md_snapshot()
                && let Err(err) = c.bucket.store(&md).await
            {
                warn!(key = %c.id.key(), error = %err, "HEAD metadata store failed");
            }
            if let Some(rootmd) = &c.rootmd
                && let Err(err) = c.bucket.store(rootmd).await
            {
                warn!(key = %rootmd.id().key(), error = %err, "vary index store failed");
            }
        }

        // prefetch clients only want the fill; drain so the writer
        // completes, and hand back an empty body
        if c.prefetch {
            let mut body = std::mem::replace(resp.body_mut(), iox::empty_body());
            let mut sink = [0u8; 16 * 1024];
            while let Ok(n) = body.read(&mut sink).await {
                if n == 0 {
                    break;
                }
            }
        }

        if c.hit {
            self.chain.submit_touch(c.bucket.clone(), c.id.clone());
        }
    }

    /// Stale-while-revalidate: one background conditional fetch per
    /// object, 30-second deadline.
    fn maybe_fuzzy_refresh(&self, c: &Caching) {
        if !c.fuzzy_refresh {
            return;
        }
        let hash = c.id.hash();
        {
            let mut refreshing = self.refreshing.lock();
            if !refreshing.insert(hash) {
                debug!(key = %c.id.key(), "refresh already in flight");
                return;
            }
        }

        let Some(md) = c.md_snapshot() else {
            self.refreshing.lock().remove(&hash);
            return;
        };
        let upstream = self.upstream.clone();
        let bucket = c.bucket.clone();
        let refreshing = self.refreshing.clone();
        let url = c.request_url.clone();
        let id = c.id.clone();
        let mut headers = c.req_headers.clone();
        httpx::strip_internal_headers(&mut headers);
        headers.remove(RANGE);
        if let Some(etag) = md.headers.get(http::header::ETAG) {
            headers.insert(http::header::IF_NONE_MATCH, etag.clone());
        }
        if let Some(lm) = md.headers.get(http::header::LAST_MODIFIED) {
            headers.insert(http::header::IF_MODIFIED_SINCE, lm.clone());
        }

        tokio::spawn(async move {
            let request = UpstreamRequest::new(Method::GET, url, headers);
            let result = tokio::time::timeout(
                std::time::Duration::from_secs(30),
                upstream.fetch(request),
            )
            .await;
            match result {
                Ok(Ok(resp)) if resp.status == StatusCode::NOT_MODIFIED => {
                    let now = httpx::now_unix();
                    let cache_time =
                        httpx::parse_cache_time(&resp.headers, time::OffsetDateTime::now_utc());
                    if cache_time.cacheable {
                        let mut md = md;
                        md.expires_at = now + cache_time.ttl_secs;
                        md.resp_unix = now;
                        md.last_ref_unix = now;
                        revalidate::merge_freshness_headers(&mut md.headers, &resp.headers);
                        if let Err(err) = bucket.store(&md).await {
                            warn!(key = %id.key(), error = %err, "refresh store failed");
                        } else {
                            info!(key = %id.key(), "background refresh extended freshness");
                        }
                    }
                }
                Ok(Ok(_resp)) => {
                    // origin changed underneath the stale window
                    let _ = bucket
                        .discard_with_message(&id, "background refresh saw changed origin")
                        .await;
                }
                Ok(Err(err)) => {
                    warn!(key = %id.key(), error = %err, "background refresh failed");
                }
                Err(_) => {
                    warn!(key = %id.key(), "background refresh timed out");
                }
            }
            refreshing.lock().remove(&hash);
        });
    }
}

/// Flushes completed blocks from the chunk writer into the bucket and
/// finalizes the object at end of stream.
struct CacheFiller {
    target: SharedTarget,
    bucket: Arc<dyn Bucket>,
    opts: Arc<CachingSettings>,
    events: Arc<EventBus>,
    chunked: bool,
    total: u64,
    _flight: Option<FlightGuard>,
}

#[async_trait]
impl FlushHandler for CacheFiller {
    async fn on_block(
        &mut self,
        buf: Vec<u8>,
        index: u32,
        pos: u64,
        _eof: bool,
    ) -> anyhow::Result<()> {
        let (id, skip) = {
            let mut target = self.target.lock();
            if target.disarmed {
                return Ok(());
            }
            if self.chunked {
                target.md.size = pos;
                if let Ok(value) = pos.to_string().parse() {
                    target.md.headers.insert(CONTENT_LENGTH, value);
                }
            }
            let partial = buf.len() as u64 != target.md.block_size && pos != self.total;
            (target.id.clone(), !self.chunked && partial)
        };
        if skip {
            // truncated mid-object block; only the true tail may be short
            debug!(key = %id.key(), index, "skipping incomplete block");
            return Ok(());
        }

        let (mut sink, wpath) = self.bucket.write_chunk(&id, index).await?;
        sink.write_all(&buf).await?;
        sink.commit().await?;
        debug!(path = %wpath.display(), index, "chunk flushed");

        let snapshot = {
            let mut target = self.target.lock();
            target.md.chunks.set(index);
            target.md.clone()
        };
        if !self.opts.async_flush_chunk
            && let Err(err) = self.bucket.store(&snapshot).await
        {
            warn!(key = %id.key(), error = %err, "chunk index store failed");
        }
        Ok(())
    }

    async fn on_error(&mut self, err: anyhow::Error) {
        let snapshot = self.target.lock().md.clone();
        warn!(key = %snapshot.id().key(), error = %err, "flush failed, discarding partial object");
        let _ = self.bucket.discard_with_metadata(&snapshot).await;
    }

    async fn on_close(&mut self, eof: bool) {
        let (id, snapshot) = {
            let target = self.target.lock();
            if target.disarmed {
                return;
            }
            (target.id.clone(), target.md.clone())
        };

        if !eof && self.chunked {
            let _ = self
                .bucket
                .discard_with_message(&id, "incomplete chunked file discard")
                .await;
            return;
        }

        if eof && (self.opts.async_flush_chunk || self.chunked) {
            if let Err(err) = self.bucket.store(&snapshot).await {
                warn!(key = %id.key(), error = %err, "final metadata store failed");
            }
        }

        if eof && snapshot.has_complete() && self.bucket.tier() != Tier::InMemory {
            let wpath = id.wpath(Path::new(self.bucket.id()));
            let store_path = wpath
                .parent()
                .map(|p| p.to_string_lossy().to_string())
                .unwrap_or_default();
            self.events.publish(
                CACHE_COMPLETED,
                Event::CacheCompleted(CacheCompleted {
                    store_url: id.key(),
                    store_key: id.hash_hex(),
                    store_path,
                    last_modified: snapshot
                        .headers
                        .get(http::header::LAST_MODIFIED)
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string(),
                    content_length: snapshot.size as i64,
                    chunk_count: snapshot.chunks.count(),
                    chunk_size: snapshot.block_size,
                    report_ratio: 0,
                }),
            );
        }
    }
}

fn into_response(resp: UpstreamResponse) -> Response<Body> {
    let mut out = Response::builder()
        .status(resp.status)
        .body(resp.body)
        .expect("response build");
    *out.headers_mut() = resp.headers;
    out
}

fn build_cached_response(md: &Metadata, has_range: bool, rng: ByteRange) -> Response<Body> {
    let status = if has_range && md.code == 200 {
        StatusCode::PARTIAL_CONTENT
    } else {
        StatusCode::from_u16(md.code).unwrap_or(StatusCode::OK)
    };
    let mut resp = Response::builder()
        .status(status)
        .body(iox::empty_body())
        .expect("response build");

    let headers = resp.headers_mut();
    let mut cached = md.headers.clone();
    httpx::strip_internal_headers(&mut cached);
    *headers = cached;

    if status == StatusCode::PARTIAL_CONTENT {
        if let Ok(value) = rng.content_range(md.size).parse() {
            headers.insert(CONTENT_RANGE, value);
        }
        if let Ok(value) = rng.length().to_string().parse() {
            headers.insert(CONTENT_LENGTH, value);
        }
    } else if let Ok(value) = md.size.to_string().parse() {
        headers.insert(CONTENT_LENGTH, value);
    }
    resp
}

/// Canonical cache-key URL for a request; what PURGE must hash to
/// address the same object the pipeline stored.
pub fn store_url_of(req: &Request<()>, include_query: bool) -> String {
    store_url(req, include_query)
}

fn store_url(req: &Request<()>, include_query: bool) -> String {
    if let Some(value) = req
        .headers()
        .get(INTERNAL_STORE_URL)
        .and_then(|v| v.to_str().ok())
    {
        return value.to_string();
    }

    let uri = req.uri();
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = authority_of(req);
    let mut url = format!("{scheme}://{host}{}", uri.path());
    if include_query
        && let Some(query) = uri.query()
    {
        let mut pairs: Vec<&str> = query
            .split('&')
            .filter(|pair| !pair.is_empty() && !pair.ends_with('='))
            .collect();
        pairs.sort_unstable();
        if !pairs.is_empty() {
            url.push('?');
            url.push_str(&pairs.join("&"));
        }
    }
    url
}

fn request_url(req: &Request<()>) -> String {
    let uri = req.uri();
    let scheme = uri.scheme_str().unwrap_or("http");
    let host = authority_of(req);
    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("{scheme}://{host}{path_and_query}")
}

fn authority_of(req: &Request<()>) -> String {
    req.uri()
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            req.headers()
                .get(http::header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(uri: &str) -> Request<()> {
        Request::builder().method(Method::GET).uri(uri).body(()).unwrap()
    }

    #[test]
    fn store_url_sorts_and_prunes_query() {
        let req = get("http://example.com/path?b=2&a=1&empty=&c=3");
        assert_eq!(
            store_url(&req, true),
            "http://example.com/path?a=1&b=2&c=3"
        );
        assert_eq!(store_url(&req, false), "http://example.com/path");
    }

    #[test]
    fn internal_store_url_overrides_cache_key() {
        let mut req = get("http://example.com/real");
        req.headers_mut().insert(
            INTERNAL_STORE_URL,
            "http://example.com/canonical".parse().unwrap(),
        );
        assert_eq!(store_url(&req, true), "http://example.com/canonical");
        // the upstream still sees the real url
        assert_eq!(request_url(&req), "http://example.com/real");
    }

    #[test]
    fn cached_response_carries_range_headers() {
        let id = ObjectId::new("http://example.com/x");
        let mut md = Metadata::new(&id, 200, 2_097_152, 1_048_576, 0);
        md.headers
            .insert(http::header::ETAG, "\"abc\"".parse().unwrap());

        let rng = ByteRange {
            start: 524_288,
            end: 1_572_863,
        };
        let resp = build_cached_response(&md, true, rng);
        assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
        assert_eq!(
            resp.headers().get(CONTENT_RANGE).unwrap(),
            "bytes 524288-1572863/2097152"
        );
        assert_eq!(resp.headers().get(CONTENT_LENGTH).unwrap(), "1048576");
        assert_eq!(resp.headers().get(http::header::ETAG).unwrap(), "\"abc\"");

        let full = build_cached_response(&md, false, ByteRange { start: 0, end: 2_097_151 });
        assert_eq!(full.status(), StatusCode::OK);
        assert_eq!(full.headers().get(CONTENT_LENGTH).unwrap(), "2097152");
    }

    #[test]
    fn cache_status_strings_are_canonical() {
        assert_eq!(CacheStatus::Hit.as_str(), "HIT");
        assert_eq!(CacheStatus::PartHit.as_str(), "PART_HIT");
        assert_eq!(CacheStatus::RevalidateMiss.as_str(), "REVALIDATE_MISS");
        assert_eq!(CacheStatus::Bypass.as_str(), "BYPASS");
    }
}
