use std::net::SocketAddr;

use anyhow::{Context, Result};
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
    TextEncoder,
};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpListener,
};

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static CACHE_STATUS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_status_total", "Requests by X-Cache outcome");
    let vec = IntCounterVec::new(opts, &["status"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_status_total");
    vec
});

static CACHE_LOOKUP_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_lookup_total", "Index lookups by result");
    let vec = IntCounterVec::new(opts, &["result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_lookup_total");
    vec
});

static CACHE_STORE_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_store_total", "Metadata store calls")
        .expect("create cache_store_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_store_total");
    counter
});

static CACHE_DISCARD_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new("cache_discard_total", "Objects discarded")
        .expect("create cache_discard_total");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("register cache_discard_total");
    counter
});

static CACHE_EVICT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("cache_evict_total", "LFU evictions by outcome");
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register cache_evict_total");
    vec
});

static MIGRATION_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("migration_total", "Tier migrations by direction and result");
    let vec = IntCounterVec::new(opts, &["direction", "result"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register migration_total");
    vec
});

static PURGE_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("purge_total", "PURGE operations by mode");
    let vec = IntCounterVec::new(opts, &["mode"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register purge_total");
    vec
});

static UPSTREAM_REQUESTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new("upstream_requests_total", "Upstream fetches by kind");
    let vec = IntCounterVec::new(opts, &["kind"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_requests_total");
    vec
});

static COLLAPSED_WAITS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let opts = Opts::new(
        "collapsed_waits_total",
        "Collapsed-request follower waits by outcome",
    );
    let vec = IntCounterVec::new(opts, &["outcome"]).expect("create counter vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register collapsed_waits_total");
    vec
});

static BUCKET_OBJECTS: Lazy<IntGaugeVec> = Lazy::new(|| {
    let opts = Opts::new("bucket_objects", "Approximate object count per bucket");
    let vec = IntGaugeVec::new(opts, &["bucket"]).expect("create gauge vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register bucket_objects");
    vec
});

static UPSTREAM_LATENCY_SECONDS: Lazy<HistogramVec> = Lazy::new(|| {
    let opts = HistogramOpts::new("upstream_request_duration_seconds", "Upstream fetch latency")
        .buckets(vec![0.005, 0.025, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]);
    let vec = HistogramVec::new(opts, &["kind"]).expect("create histogram vec");
    REGISTRY
        .register(Box::new(vec.clone()))
        .expect("register upstream_request_duration_seconds");
    vec
});

pub fn record_cache_status(status: &str) {
    CACHE_STATUS_TOTAL.with_label_values(&[status]).inc();
}

pub fn record_cache_lookup(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    CACHE_LOOKUP_TOTAL.with_label_values(&[result]).inc();
}

pub fn record_cache_store() {
    CACHE_STORE_TOTAL.inc();
}

pub fn record_cache_discard() {
    CACHE_DISCARD_TOTAL.inc();
}

pub fn record_eviction(outcome: &str) {
    CACHE_EVICT_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_migration(direction: &str, ok: bool) {
    let result = if ok { "ok" } else { "error" };
    MIGRATION_TOTAL.with_label_values(&[direction, result]).inc();
}

pub fn record_purge(mode: &str) {
    PURGE_TOTAL.with_label_values(&[mode]).inc();
}

pub fn record_upstream_request(kind: &str, elapsed: std::time::Duration) {
    UPSTREAM_REQUESTS_TOTAL.with_label_values(&[kind]).inc();
    UPSTREAM_LATENCY_SECONDS
        .with_label_values(&[kind])
        .observe(elapsed.as_secs_f64());
}

pub fn record_collapsed_wait(outcome: &str) {
    COLLAPSED_WAITS_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn set_bucket_objects(bucket: &str, objects: u64) {
    BUCKET_OBJECTS
        .with_label_values(&[bucket])
        .set(objects as i64);
}

pub fn gather() -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    encoder
        .encode(&REGISTRY.gather(), &mut buffer)
        .context("encoding metrics")?;
    Ok(buffer)
}

/// Serves `GET /metrics` on a plain TCP listener.
pub async fn serve(addr: SocketAddr, path: String) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding metrics listener on {addr}"))?;
    loop {
        let (socket, _) = listener.accept().await?;
        let path = path.clone();
        tokio::spawn(async move {
            let mut reader = BufReader::new(socket);
            let mut request_line = String::new();
            if reader.read_line(&mut request_line).await.is_err() {
                return;
            }
            let ok = request_line.starts_with(&format!("GET {path} "));
            let mut socket = reader.into_inner();
            let response = if ok {
                match gather() {
                    Ok(body) => {
                        let head = format!(
                            "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                            body.len()
                        );
                        let mut out = head.into_bytes();
                        out.extend_from_slice(&body);
                        out
                    }
                    Err(_) => b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\nConnection: close\r\n\r\n".to_vec(),
                }
            } else {
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    .to_vec()
            };
            let _ = socket.write_all(&response).await;
        });
    }
}
