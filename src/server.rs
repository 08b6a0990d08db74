use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context as _, Result};
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, Request, Response, StatusCode};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::caching::CachingLayer;
use crate::iox::Body;
use crate::storage::{PurgeControl, Storage};

/// Thin HTTP/1.1 front door for the caching pipeline.
///
/// One request per connection; GET/HEAD enter the pipeline, PURGE
/// hits the storage directly, everything else proxies through. The
/// hardened listener with graceful restart lives outside this crate.
pub async fn run(
    addr: SocketAddr,
    layer: Arc<CachingLayer>,
    storage: Arc<dyn Storage>,
) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding listener on {addr}"))?;
    info!(address = %addr, "listener started");

    loop {
        let (socket, peer) = listener.accept().await?;
        let layer = layer.clone();
        let storage = storage.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_connection(socket, layer, storage).await {
                debug!(peer = %peer, error = %err, "connection ended with error");
            }
        });
    }
}

async fn serve_connection(
    socket: TcpStream,
    layer: Arc<CachingLayer>,
    storage: Arc<dyn Storage>,
) -> Result<()> {
    let started = Instant::now();
    let mut reader = BufReader::new(socket);

    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;
    let mut parts = request_line.trim_end().splitn(3, ' ');
    let method: Method = parts
        .next()
        .unwrap_or_default()
        .parse()
        .map_err(|_| anyhow::anyhow!("bad method"))?;
    let target = parts.next().unwrap_or("/").to_string();

    let mut headers = HeaderMap::new();
    loop {
        let mut line = String::new();
        let n = reader.read_line(&mut line).await?;
        let line = line.trim_end();
        if n == 0 || line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':')
            && let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.trim()),
                HeaderValue::from_str(value.trim()),
            )
        {
            headers.append(name, value);
        }
    }

    let mut builder = Request::builder().method(method.clone()).uri(target.clone());
    if let Some(map) = builder.headers_mut() {
        *map = headers.clone();
    }
    let request = builder.body(()).context("assembling request")?;

    let response = if method.as_str() == "PURGE" {
        purge_response(&request, storage).await
    } else {
        match layer.handle(request).await {
            Ok(resp) => resp,
            Err(err) => {
                warn!(target = %target, error = %err, "pipeline error");
                status_response(err.status())
            }
        }
    };

    info!(
        method = %method,
        target = %target,
        status = response.status().as_u16(),
        cache = response
            .headers()
            .get(crate::httpx::CACHE_STATUS_KEY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("-"),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "request"
    );

    let mut socket = reader.into_inner();
    write_response(&mut socket, response).await?;
    socket.shutdown().await.ok();
    Ok(())
}

async fn purge_response(req: &Request<()>, storage: Arc<dyn Storage>) -> Response<Body> {
    let control = PurgeControl {
        hard: flag(req, "x-purge-hard"),
        dir: flag(req, "x-purge-dir"),
        mark_expired: flag(req, "x-purge-mark-expired"),
    };
    let url = crate::caching::store_url_of(req, true);
    match storage.purge(&url, control).await {
        Ok(()) => status_response(StatusCode::OK),
        Err(err) => status_response(err.status()),
    }
}

fn flag(req: &Request<()>, name: &str) -> bool {
    req.headers()
        .get(name)
        .is_some_and(|v| v.as_bytes() == b"1")
}

fn status_response(status: StatusCode) -> Response<Body> {
    Response::builder()
        .status(status)
        .body(crate::iox::empty_body())
        .expect("static response")
}

async fn write_response(socket: &mut TcpStream, response: Response<Body>) -> Result<()> {
    let (parts, mut body) = response.into_parts();
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        parts.status.as_u16(),
        parts.status.canonical_reason().unwrap_or("")
    );
    for (name, value) in parts.headers.iter() {
        if name == http::header::TRANSFER_ENCODING || name == http::header::CONNECTION {
            continue;
        }
        if let Ok(value) = value.to_str() {
            head.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    head.push_str("Connection: close\r\n\r\n");
    socket.write_all(head.as_bytes()).await?;

    tokio::io::copy(&mut body, socket).await?;
    socket.flush().await?;
    Ok(())
}
