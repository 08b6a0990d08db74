mod support;

use std::sync::Arc;
use std::time::Duration;

use http::{Method, StatusCode};
use tavern::event::{Event, EventBus, CACHE_COMPLETED};
use tavern::object::ObjectId;
use tavern::storage::PurgeControl;
use tempfile::TempDir;

use support::*;

const BLOCK: u64 = 1024;

fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

#[tokio::test]
async fn simple_miss_then_hit() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 10);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/foo")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(x_cache(&resp), "MISS");
    assert_eq!(read_body(&mut resp).await, body);
    assert_eq!(origin.request_count(), 1);
    settle().await;

    let mut resp = layer.handle(get("http://origin.test/foo")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(x_cache(&resp), "HIT");
    assert_eq!(read_body(&mut resp).await, body);
    assert_eq!(origin.request_count(), 1, "hit must not touch the origin");
    assert!(resp.headers().contains_key(http::header::AGE));
    assert!(resp.headers().contains_key(http::header::EXPIRES));

    // one full block cached
    let id = ObjectId::new("http://origin.test/foo");
    let bucket = storage.select(&id);
    let md = bucket.lookup(&id).await.unwrap().unwrap();
    assert_eq!(md.chunks.count(), 1);
    assert_eq!(md.block_size, BLOCK);
    assert!(md.has_complete());
}

#[tokio::test]
async fn range_partial_hit_reads_cached_and_missing_chunks() {
    let dir = TempDir::new().unwrap();
    let body = payload(2 * BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    // seed chunk 0 only
    let mut resp = layer
        .handle(get_with("http://origin.test/big", &[("range", "bytes=0-1023")]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(read_body(&mut resp).await, &body[..BLOCK as usize]);
    settle().await;

    let id = ObjectId::new("http://origin.test/big");
    let bucket = storage.select(&id);
    let md = bucket.lookup(&id).await.unwrap().unwrap();
    assert!(md.chunks.test(0));
    assert!(!md.chunks.test(1));
    assert_eq!(md.size, 2 * BLOCK);

    // spans the cached chunk 0 and the missing chunk 1
    let mut resp = layer
        .handle(get_with("http://origin.test/big", &[("range", "bytes=512-1535")]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(x_cache(&resp), "PART_HIT");
    assert_eq!(
        resp.headers().get(http::header::CONTENT_RANGE).unwrap(),
        "bytes 512-1535/2048"
    );
    assert_eq!(
        resp.headers().get(http::header::CONTENT_LENGTH).unwrap(),
        "1024"
    );
    assert_eq!(read_body(&mut resp).await, &body[512..1536]);

    // the sub-request asked for exactly the missing block
    let sub = origin.last_request().unwrap();
    assert_eq!(
        sub.headers.get(http::header::RANGE).unwrap(),
        "bytes=1024-2047"
    );
    settle().await;

    let md = bucket.lookup(&id).await.unwrap().unwrap();
    assert!(md.has_complete(), "refilled object should be complete");
}

#[tokio::test]
async fn range_past_eof_is_416() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage, origin, caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/small")).await.unwrap();
    read_body(&mut resp).await;
    settle().await;

    let resp = layer
        .handle(get_with("http://origin.test/small", &[("range", "bytes=9999-")]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::RANGE_NOT_SATISFIABLE);
    assert_eq!(
        resp.headers().get(http::header::CONTENT_RANGE).unwrap(),
        "bytes */1024"
    );
}

#[tokio::test]
async fn last_byte_range_is_served() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage, origin, caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/last")).await.unwrap();
    read_body(&mut resp).await;
    settle().await;

    let mut resp = layer
        .handle(get_with("http://origin.test/last", &[("range", "bytes=1023-")]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(read_body(&mut resp).await, &body[1023..]);
}

#[tokio::test]
async fn revalidate_304_extends_freshness() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 1);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/fresh")).await.unwrap();
    read_body(&mut resp).await;
    settle().await;

    let id = ObjectId::new("http://origin.test/fresh");
    let bucket = storage.select(&id);
    let stale = bucket.lookup(&id).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let mut resp = layer.handle(get("http://origin.test/fresh")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(x_cache(&resp), "REVALIDATE_HIT");
    assert_eq!(read_body(&mut resp).await, body);

    let conditional = origin.last_request().unwrap();
    assert_eq!(
        conditional.headers.get(http::header::IF_NONE_MATCH).unwrap(),
        "\"abc\""
    );
    settle().await;

    let refreshed = bucket.lookup(&id).await.unwrap().unwrap();
    assert!(refreshed.expires_at > stale.expires_at);
    assert_eq!(refreshed.chunks, stale.chunks);
    assert_eq!(refreshed.size, stale.size);
    assert_eq!(refreshed.block_size, stale.block_size);
}

#[tokio::test]
async fn revalidate_miss_replaces_changed_object() {
    let dir = TempDir::new().unwrap();
    let old_body = payload(BLOCK as usize);
    let origin = MockOrigin::new(old_body.clone(), "\"v1\"", 1);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/changed")).await.unwrap();
    read_body(&mut resp).await;
    settle().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    let new_body: Vec<u8> = payload(BLOCK as usize).iter().map(|b| b ^ 0xff).collect();
    origin.set_body(new_body.clone(), "\"v2\"");

    let mut resp = layer.handle(get("http://origin.test/changed")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(x_cache(&resp), "REVALIDATE_MISS");
    assert_eq!(read_body(&mut resp).await, new_body);
    settle().await;

    let mut resp = layer.handle(get("http://origin.test/changed")).await.unwrap();
    assert_eq!(x_cache(&resp), "HIT");
    assert_eq!(read_body(&mut resp).await, new_body);
}

#[tokio::test]
async fn head_serves_metadata_without_body() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage, origin.clone(), caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/h")).await.unwrap();
    read_body(&mut resp).await;
    settle().await;

    let mut resp = layer.handle(head("http://origin.test/h")).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(x_cache(&resp), "HIT");
    assert_eq!(
        resp.headers().get(http::header::CONTENT_LENGTH).unwrap(),
        "1024"
    );
    assert!(read_body(&mut resp).await.is_empty());
    assert_eq!(origin.request_count(), 1);
}

#[tokio::test]
async fn collapsed_requests_share_one_upstream_fetch() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    origin.set_delay(Duration::from_millis(200));
    let storage = warm_only_storage(dir.path(), BLOCK);

    let mut opts = caching_opts(BLOCK);
    opts.collapsed_request = true;
    opts.collapsed_request_wait_timeout_ms = 5_000;
    let layer = layer(storage, origin.clone(), opts);

    let mut tasks = Vec::new();
    for _ in 0..5 {
        let layer = layer.clone();
        tasks.push(tokio::spawn(async move {
            let mut resp = layer.handle(get("http://origin.test/one")).await.unwrap();
            read_body(&mut resp).await
        }));
    }
    for task in tasks {
        assert_eq!(task.await.unwrap(), body);
    }
    assert_eq!(
        origin.request_count(),
        1,
        "followers must ride the primary's fetch"
    );
}

#[tokio::test]
async fn vary_builds_variant_children() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    origin.set_vary("Accept-Encoding");
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    let mut resp = layer
        .handle(get_with("http://origin.test/v", &[("accept-encoding", "gzip")]))
        .await
        .unwrap();
    assert_eq!(x_cache(&resp), "MISS");
    read_body(&mut resp).await;
    settle().await;

    // the root is now a pure index entry pointing at the gzip child
    let root_id = ObjectId::new("http://origin.test/v");
    let bucket = storage.select(&root_id);
    let root = bucket.lookup(&root_id).await.unwrap().unwrap();
    assert!(root.is_vary_index());
    assert_eq!(root.virtual_keys.len(), 1);
    assert_eq!(root.size, 0);
    assert!(root.chunks.is_empty());

    let mut resp = layer
        .handle(get_with("http://origin.test/v", &[("accept-encoding", "gzip")]))
        .await
        .unwrap();
    assert_eq!(x_cache(&resp), "HIT");
    assert_eq!(read_body(&mut resp).await, body);
    assert_eq!(origin.request_count(), 1);

    // a different variant key misses and fetches its own copy
    let mut resp = layer
        .handle(get_with("http://origin.test/v", &[("accept-encoding", "br")]))
        .await
        .unwrap();
    assert_eq!(x_cache(&resp), "MISS");
    read_body(&mut resp).await;
    settle().await;
    assert_eq!(origin.request_count(), 2);

    let root = bucket.lookup(&root_id).await.unwrap().unwrap();
    assert_eq!(root.virtual_keys.len(), 2);
}

#[tokio::test]
async fn vary_limit_rejects_extra_variants_but_still_serves() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    origin.set_vary("Accept-Encoding");
    let storage = warm_only_storage(dir.path(), BLOCK);

    let mut opts = caching_opts(BLOCK);
    opts.vary_limit = 1;
    let layer = layer(storage.clone(), origin.clone(), opts);

    let mut resp = layer
        .handle(get_with("http://origin.test/vl", &[("accept-encoding", "gzip")]))
        .await
        .unwrap();
    read_body(&mut resp).await;
    settle().await;

    // a second variant exceeds the cap: served, never cached
    let mut resp = layer
        .handle(get_with("http://origin.test/vl", &[("accept-encoding", "br")]))
        .await
        .unwrap();
    assert_eq!(read_body(&mut resp).await, body);
    settle().await;

    let root_id = ObjectId::new("http://origin.test/vl");
    let bucket = storage.select(&root_id);
    let root = bucket.lookup(&root_id).await.unwrap().unwrap();
    assert_eq!(root.virtual_keys.len(), 1);

    // the rejected variant keeps missing
    let mut resp = layer
        .handle(get_with("http://origin.test/vl", &[("accept-encoding", "br")]))
        .await
        .unwrap();
    assert_eq!(x_cache(&resp), "MISS");
    read_body(&mut resp).await;
}

#[tokio::test]
async fn no_cache_header_bypasses_variant_lookup() {
    let dir = TempDir::new().unwrap();
    let body = payload(64);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage, origin.clone(), caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/nc")).await.unwrap();
    read_body(&mut resp).await;
    settle().await;

    let mut resp = layer
        .handle(get_with(
            "http://origin.test/nc",
            &[("cache-control", "no-cache")],
        ))
        .await
        .unwrap();
    assert_eq!(x_cache(&resp), "MISS");
    read_body(&mut resp).await;
    assert_eq!(origin.request_count(), 2);
}

#[tokio::test]
async fn prefetch_fills_whole_object_and_serves_window() {
    let dir = TempDir::new().unwrap();
    let body = payload(3 * BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    let resp = layer
        .handle(get_with(
            "http://origin.test/pf",
            &[("x-prefetch", "1"), ("range", "bytes=0-9")],
        ))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    settle().await;

    // the fetch was for the whole object
    let fetched = origin.last_request().unwrap();
    assert!(fetched.headers.get(http::header::RANGE).is_none());

    let id = ObjectId::new("http://origin.test/pf");
    let bucket = storage.select(&id);
    let md = bucket.lookup(&id).await.unwrap().unwrap();
    assert!(md.has_complete());
    assert_eq!(md.chunks.count(), 3);
}

#[tokio::test]
async fn uncacheable_response_is_not_stored() {
    let dir = TempDir::new().unwrap();
    let origin = MockOrigin::new(payload(16), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    // max-age=0 means the response carries no usable freshness
    *origin.max_age.lock() = 0;
    let mut resp = layer.handle(get("http://origin.test/err")).await.unwrap();
    assert_eq!(x_cache(&resp), "MISS");
    read_body(&mut resp).await;
    settle().await;

    let id = ObjectId::new("http://origin.test/err");
    let bucket = storage.select(&id);
    let md = bucket.lookup(&id).await.unwrap();
    assert!(md.is_none(), "uncacheable response must not be stored");
}

#[tokio::test]
async fn purge_hard_removes_and_next_get_misses() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/p")).await.unwrap();
    read_body(&mut resp).await;
    settle().await;

    storage
        .purge(
            "http://origin.test/p",
            PurgeControl {
                hard: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let id = ObjectId::new("http://origin.test/p");
    assert!(storage.select(&id).lookup(&id).await.unwrap().is_none());

    let mut resp = layer.handle(get("http://origin.test/p")).await.unwrap();
    assert_eq!(x_cache(&resp), "MISS");
    read_body(&mut resp).await;
    assert_eq!(origin.request_count(), 2);
}

#[tokio::test]
async fn purge_mark_expired_forces_revalidation() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 600);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/soft")).await.unwrap();
    read_body(&mut resp).await;
    settle().await;

    storage
        .purge("http://origin.test/soft", PurgeControl::default())
        .await
        .unwrap();

    let mut resp = layer.handle(get("http://origin.test/soft")).await.unwrap();
    assert_eq!(x_cache(&resp), "REVALIDATE_HIT");
    assert_eq!(read_body(&mut resp).await, body);
    // the origin saw the conditional request
    assert_eq!(origin.request_count(), 2);
}

#[tokio::test]
async fn dir_purge_with_mark_expired_only_touches_the_prefix() {
    let dir = TempDir::new().unwrap();
    let body = payload(BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 600);
    let tiered = warm_only_storage(dir.path(), BLOCK);
    let storage: Arc<dyn tavern::storage::Storage> =
        tavern::storage::MarkedStorage::wrap(tiered);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    for path in ["/a/1", "/a/2", "/b/1"] {
        let mut resp = layer
            .handle(get(&format!("http://origin.test{path}")))
            .await
            .unwrap();
        read_body(&mut resp).await;
    }
    settle().await;
    assert_eq!(origin.request_count(), 3);

    storage
        .purge(
            "http://origin.test/a/",
            PurgeControl {
                dir: true,
                mark_expired: true,
                ..Default::default()
            },
        )
        .await
        .unwrap();

    // marked entries revalidate against the origin
    let resp = layer.handle(get("http://origin.test/a/1")).await.unwrap();
    assert_eq!(x_cache(&resp), "REVALIDATE_HIT");
    let resp = layer.handle(get("http://origin.test/a/2")).await.unwrap();
    assert_eq!(x_cache(&resp), "REVALIDATE_HIT");
    assert_eq!(origin.request_count(), 5);

    // outside the prefix stays a direct hit
    let resp = layer.handle(get("http://origin.test/b/1")).await.unwrap();
    assert_eq!(x_cache(&resp), "HIT");
    assert_eq!(origin.request_count(), 5);
}

#[tokio::test]
async fn cache_completed_event_fires_once_complete() {
    let dir = TempDir::new().unwrap();
    let body = payload(2 * BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let events = Arc::new(EventBus::new());
    let mut rx = events.subscribe(CACHE_COMPLETED);
    let layer = layer_with_events(storage, origin, caching_opts(BLOCK), events);

    let mut resp = layer.handle(get("http://origin.test/done")).await.unwrap();
    read_body(&mut resp).await;

    let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    let Event::CacheCompleted(payload) = event;
    assert_eq!(payload.store_url, "http://origin.test/done");
    assert_eq!(payload.chunk_count, 2);
    assert_eq!(payload.chunk_size, BLOCK);
    assert_eq!(payload.content_length, 2 * BLOCK as i64);
    assert_eq!(payload.report_ratio, 0);
}

#[tokio::test]
async fn fill_range_widens_the_upstream_fetch() {
    let dir = TempDir::new().unwrap();
    let body = payload(4 * BLOCK as usize);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 1);
    let storage = warm_only_storage(dir.path(), BLOCK);

    let mut opts = caching_opts(BLOCK);
    opts.fill_range_percent = 100;
    let layer = layer(storage.clone(), origin.clone(), opts);

    // seed metadata so the widener knows the object size
    let mut resp = layer
        .handle(get_with("http://origin.test/fr", &[("range", "bytes=0-1023")]))
        .await
        .unwrap();
    read_body(&mut resp).await;
    settle().await;

    tokio::time::sleep(Duration::from_millis(1500)).await;

    // expired entry revalidates; a small range request gets widened
    let mut resp = layer
        .handle(get_with("http://origin.test/fr", &[("range", "bytes=0-99")]))
        .await
        .unwrap();
    read_body(&mut resp).await;
    settle().await;

    let widened = origin
        .requests
        .lock()
        .iter()
        .filter_map(|req| {
            req.headers
                .get(http::header::RANGE)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .any(|range| range == format!("bytes=0-{}", 4 * BLOCK - 1));
    assert!(widened, "expected a widened upstream range");
}

#[tokio::test]
async fn one_byte_blocks_still_roundtrip() {
    let dir = TempDir::new().unwrap();
    let body = payload(8);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), 1);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(1));

    let mut resp = layer.handle(get("http://origin.test/tiny")).await.unwrap();
    assert_eq!(read_body(&mut resp).await, body);
    settle().await;

    let id = ObjectId::new("http://origin.test/tiny");
    let md = storage.select(&id).lookup(&id).await.unwrap().unwrap();
    assert_eq!(md.block_size, 1);
    assert_eq!(md.chunks.count(), 8);
    assert!(md.has_complete());

    let mut resp = layer
        .handle(get_with("http://origin.test/tiny", &[("range", "bytes=3-5")]))
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::PARTIAL_CONTENT);
    assert_eq!(x_cache(&resp), "HIT");
    assert_eq!(read_body(&mut resp).await, &body[3..6]);
    assert_eq!(origin.request_count(), 1);
}

#[tokio::test]
async fn chunked_response_accumulates_size_until_eof() {
    let dir = TempDir::new().unwrap();
    let body = payload(2 * BLOCK as usize + 100);
    let origin = MockOrigin::new(body.clone(), "\"abc\"", 60);
    *origin.chunked.lock() = true;
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    let mut resp = layer.handle(get("http://origin.test/chunked")).await.unwrap();
    assert_eq!(x_cache(&resp), "MISS");
    assert_eq!(read_body(&mut resp).await, body);
    settle().await;

    let id = ObjectId::new("http://origin.test/chunked");
    let bucket = storage.select(&id);
    let md = bucket.lookup(&id).await.unwrap().unwrap();
    assert!(md.is_chunked());
    assert_eq!(md.size, body.len() as u64);
    assert!(md.has_complete());

    // the finalized object serves like any sized one
    let mut resp = layer.handle(get("http://origin.test/chunked")).await.unwrap();
    assert_eq!(x_cache(&resp), "HIT");
    assert_eq!(read_body(&mut resp).await, body);
    assert_eq!(origin.request_count(), 1);
}

#[tokio::test]
async fn other_methods_bypass_the_cache() {
    let dir = TempDir::new().unwrap();
    let origin = MockOrigin::new(payload(32), "\"abc\"", 60);
    let storage = warm_only_storage(dir.path(), BLOCK);
    let layer = layer(storage.clone(), origin.clone(), caching_opts(BLOCK));

    let req = http::Request::builder()
        .method(Method::POST)
        .uri("http://origin.test/post")
        .body(())
        .unwrap();
    let resp = layer.handle(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().get("x-cache").is_none());

    let id = ObjectId::new("http://origin.test/post");
    assert!(storage.select(&id).lookup(&id).await.unwrap().is_none());
}
