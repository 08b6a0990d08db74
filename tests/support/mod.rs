#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::header::{
    CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, ETAG, IF_NONE_MATCH, RANGE, VARY,
};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use tavern::caching::upstream::{Upstream, UpstreamRequest, UpstreamResponse};
use tavern::caching::CachingLayer;
use tavern::error::CacheError;
use tavern::event::EventBus;
use tavern::iox::{bytes_body, Body};
use tavern::settings::{BucketSettings, CachingSettings, StorageSettings};
use tavern::storage::{Storage, TieredStorage, Tier};

/// Scripted origin implementing the upstream transport in-process.
pub struct MockOrigin {
    pub body: Mutex<Bytes>,
    pub etag: Mutex<String>,
    pub max_age: Mutex<u64>,
    pub vary: Mutex<Option<String>>,
    pub delay: Mutex<Option<Duration>>,
    /// Omit Content-Length from full responses, like a chunked origin.
    pub chunked: Mutex<bool>,
    pub requests: Mutex<Vec<UpstreamRequest>>,
}

impl MockOrigin {
    pub fn new(body: impl Into<Bytes>, etag: &str, max_age: u64) -> Arc<Self> {
        Arc::new(Self {
            body: Mutex::new(body.into()),
            etag: Mutex::new(etag.to_string()),
            max_age: Mutex::new(max_age),
            vary: Mutex::new(None),
            delay: Mutex::new(None),
            chunked: Mutex::new(false),
            requests: Mutex::new(Vec::new()),
        })
    }

    pub fn set_body(&self, body: impl Into<Bytes>, etag: &str) {
        *self.body.lock() = body.into();
        *self.etag.lock() = etag.to_string();
    }

    pub fn set_vary(&self, vary: &str) {
        *self.vary.lock() = Some(vary.to_string());
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn last_request(&self) -> Option<UpstreamRequest> {
        self.requests.lock().last().cloned()
    }

    fn base_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(ETAG, self.etag.lock().parse().unwrap());
        headers.insert(
            CACHE_CONTROL,
            format!("max-age={}", self.max_age.lock()).parse().unwrap(),
        );
        if let Some(vary) = self.vary.lock().clone() {
            headers.insert(VARY, vary.parse().unwrap());
        }
        headers
    }
}

#[async_trait]
impl Upstream for MockOrigin {
    async fn fetch(&self, req: UpstreamRequest) -> Result<UpstreamResponse, CacheError> {
        self.requests.lock().push(req.clone());
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let etag = self.etag.lock().clone();
        if let Some(inm) = req.headers.get(IF_NONE_MATCH).and_then(|v| v.to_str().ok())
            && inm == etag
        {
            return Ok(UpstreamResponse {
                status: StatusCode::NOT_MODIFIED,
                headers: self.base_headers(),
                body: tavern::iox::empty_body(),
            });
        }

        let body = self.body.lock().clone();
        let total = body.len() as u64;
        let mut headers = self.base_headers();

        if let Some(raw) = req.headers.get(RANGE).and_then(|v| v.to_str().ok()) {
            let raw = raw.strip_prefix("bytes=").unwrap_or(raw);
            let (start, end) = raw.split_once('-').unwrap();
            let start: u64 = start.parse().unwrap();
            let end: u64 = end
                .parse::<u64>()
                .map(|end| end.min(total - 1))
                .unwrap_or(total - 1);
            let slice = body.slice(start as usize..=end as usize);
            headers.insert(
                CONTENT_RANGE,
                format!("bytes {start}-{end}/{total}").parse().unwrap(),
            );
            headers.insert(CONTENT_LENGTH, slice.len().to_string().parse().unwrap());
            return Ok(UpstreamResponse {
                status: StatusCode::PARTIAL_CONTENT,
                headers,
                body: bytes_body(slice),
            });
        }

        if !*self.chunked.lock() {
            headers.insert(CONTENT_LENGTH, total.to_string().parse().unwrap());
        }
        Ok(UpstreamResponse {
            status: StatusCode::OK,
            headers,
            body: bytes_body(body),
        })
    }
}

pub fn warm_only_storage(dir: &Path, block_size: u64) -> Arc<dyn Storage> {
    let cfg = StorageSettings {
        db_type: Some("memory".to_string()),
        buckets: vec![bucket(dir.join("warm"), Tier::Warm, block_size, 10_000)],
        ..Default::default()
    };
    TieredStorage::open(&cfg).unwrap()
}

pub fn bucket(
    path: std::path::PathBuf,
    tier: Tier,
    slice_size: u64,
    max_object_limit: usize,
) -> BucketSettings {
    BucketSettings {
        path,
        tier,
        driver: None,
        db_type: None,
        db_path: None,
        slice_size,
        max_object_limit,
        weight: 100,
        async_load: None,
    }
}

pub fn caching_opts(block_size: u64) -> CachingSettings {
    CachingSettings {
        slice_size: block_size,
        // keep ranges exact unless a test opts in
        fill_range_percent: 0,
        ..Default::default()
    }
}

pub fn layer(
    storage: Arc<dyn Storage>,
    origin: Arc<MockOrigin>,
    opts: CachingSettings,
) -> Arc<CachingLayer> {
    CachingLayer::new(storage, origin, opts, Arc::new(EventBus::new()))
}

pub fn layer_with_events(
    storage: Arc<dyn Storage>,
    origin: Arc<MockOrigin>,
    opts: CachingSettings,
    events: Arc<EventBus>,
) -> Arc<CachingLayer> {
    CachingLayer::new(storage, origin, opts, events)
}

pub fn get(url: &str) -> Request<()> {
    Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(())
        .unwrap()
}

pub fn get_with(url: &str, headers: &[(&str, &str)]) -> Request<()> {
    let mut builder = Request::builder().method(Method::GET).uri(url);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(()).unwrap()
}

pub fn head(url: &str) -> Request<()> {
    Request::builder()
        .method(Method::HEAD)
        .uri(url)
        .body(())
        .unwrap()
}

pub async fn read_body(resp: &mut Response<Body>) -> Vec<u8> {
    let mut out = Vec::new();
    resp.body_mut().read_to_end(&mut out).await.unwrap();
    out
}

pub fn x_cache(resp: &Response<Body>) -> String {
    resp.headers()
        .get("x-cache")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string()
}

/// Lets background flush/touch/migration workers drain.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(200)).await;
}
