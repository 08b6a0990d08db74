use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, Method, StatusCode, Uri};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader, ReadBuf};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::error::CacheError;
use crate::iox::Body;
use crate::metrics;

/// An outbound origin request the pipeline is about to issue.
#[derive(Debug, Clone)]
pub struct UpstreamRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
}

impl UpstreamRequest {
    pub fn new(method: Method, url: impl Into<String>, headers: HeaderMap) -> Self {
        Self {
            method,
            url: url.into(),
            headers,
        }
    }
}

pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Body,
}

/// The origin transport the pipeline consumes. Production is a plain
/// HTTP/1.1 client; tests substitute in-process origins.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn fetch(&self, req: UpstreamRequest) -> Result<UpstreamResponse, CacheError>;
}

/// One-connection-per-request HTTP/1.1 client over tokio TCP.
///
/// Requests go out with `Connection: close`; bodies are delimited by
/// Content-Length, chunked coding, or connection close. Every fetch
/// carries a total deadline that also bounds body reads.
pub struct HttpUpstream {
    connect_timeout: Duration,
    timeout: Duration,
}

impl HttpUpstream {
    pub fn new(connect_timeout: Duration, total_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            timeout: total_timeout,
        }
    }
}

#[async_trait]
impl Upstream for HttpUpstream {
    async fn fetch(&self, req: UpstreamRequest) -> Result<UpstreamResponse, CacheError> {
        let started = Instant::now();
        let uri: Uri = req
            .url
            .parse()
            .map_err(|_| CacheError::Storage(anyhow::anyhow!("invalid upstream url {}", req.url)))?;
        let host = uri
            .host()
            .ok_or_else(|| CacheError::Storage(anyhow::anyhow!("upstream url missing host")))?
            .to_string();
        let port = uri.port_u16().unwrap_or(80);
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        let stream = timeout(self.connect_timeout, TcpStream::connect((host.clone(), port)))
            .await
            .map_err(|_| CacheError::Cancelled)?
            .map_err(|err| CacheError::Storage(anyhow::anyhow!("connect {host}:{port}: {err}")))?;

        let deadline = started + self.timeout;
        let mut stream = stream;

        let mut head = format!("{} {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n", req.method, path, host);
        for (name, value) in req.headers.iter() {
            if name == http::header::HOST || name == http::header::CONNECTION {
                continue;
            }
            if let Ok(value) = value.to_str() {
                head.push_str(&format!("{}: {}\r\n", name, value));
            }
        }
        head.push_str("\r\n");

        timeout(self.timeout, stream.write_all(head.as_bytes()))
            .await
            .map_err(|_| CacheError::Cancelled)?
            .map_err(CacheError::from)?;

        let mut reader = BufReader::new(stream);
        let (status, headers) = timeout(self.timeout, read_head(&mut reader))
            .await
            .map_err(|_| CacheError::Cancelled)??;

        debug!(url = %req.url, status = %status, "upstream response");
        metrics::record_upstream_request("proxy", started.elapsed());

        let body = delimited_body(reader, req.method == Method::HEAD, status, &headers);
        let body = Box::new(DeadlineBody::new(body, deadline));
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

async fn read_head(
    reader: &mut BufReader<TcpStream>,
) -> Result<(StatusCode, HeaderMap), CacheError> {
    let mut line = String::new();
    reader.read_line(&mut line).await?;
    let mut parts = line.trim_end().splitn(3, ' ');
    let _version = parts.next().unwrap_or_default();
    let status = parts
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| CacheError::Storage(anyhow::anyhow!("malformed status line {line:?}")))?;

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
    Ok((status, headers))
}

fn delimited_body(
    reader: BufReader<TcpStream>,
    head_request: bool,
    status: StatusCode,
    headers: &HeaderMap,
) -> Body {
    if head_request
        || status == StatusCode::NO_CONTENT
        || status == StatusCode::NOT_MODIFIED
        || status.is_informational()
    {
        return crate::iox::empty_body();
    }

    let chunked = headers
        .get(http::header::TRANSFER_ENCODING)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"));
    if chunked {
        return Box::new(ChunkedBody::new(reader));
    }

    let length = headers
        .get(http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());
    match length {
        Some(length) => crate::iox::limit(Box::new(reader), length),
        // close-delimited
        None => Box::new(reader),
    }
}

/// Decodes an HTTP/1.1 chunked body, yielding only chunk payloads.
///
/// A poll-driven state machine over the buffered connection: size
/// lines are assembled byte-wise from the reader's internal buffer, so
/// a `Pending` mid-line loses nothing.
struct ChunkedBody {
    reader: BufReader<TcpStream>,
    state: ChunkState,
    line: Vec<u8>,
}

enum ChunkState {
    Header,
    Payload { remaining: u64 },
    Done,
}

impl ChunkedBody {
    fn new(reader: BufReader<TcpStream>) -> Self {
        Self {
            reader,
            state: ChunkState::Header,
            line: Vec::new(),
        }
    }
}

impl AsyncRead for ChunkedBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            match &mut this.state {
                ChunkState::Done => return Poll::Ready(Ok(())),
                ChunkState::Header => {
                    let available = match Pin::new(&mut this.reader).poll_fill_buf(cx) {
                        Poll::Ready(Ok(available)) => available,
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                        Poll::Pending => return Poll::Pending,
                    };
                    if available.is_empty() {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    match available.iter().position(|&b| b == b'\n') {
                        Some(nl) => {
                            this.line.extend_from_slice(&available[..nl]);
                            Pin::new(&mut this.reader).consume(nl + 1);
                            let line = String::from_utf8_lossy(&this.line).trim().to_string();
                            this.line.clear();
                            if line.is_empty() {
                                // CRLF trailing the previous payload
                                continue;
                            }
                            let size_part = line.split(';').next().unwrap_or_default();
                            let size = u64::from_str_radix(size_part, 16).map_err(|_| {
                                io::Error::new(io::ErrorKind::InvalidData, "bad chunk size")
                            })?;
                            this.state = if size == 0 {
                                ChunkState::Done
                            } else {
                                ChunkState::Payload { remaining: size }
                            };
                        }
                        None => {
                            let taken = available.len();
                            this.line.extend_from_slice(available);
                            Pin::new(&mut this.reader).consume(taken);
                        }
                    }
                }
                ChunkState::Payload { remaining } => {
                    let available = match Pin::new(&mut this.reader).poll_fill_buf(cx) {
                        Poll::Ready(Ok(available)) => available,
                        Poll::Ready(Err(err)) => return Poll::Ready(Err(err)),
                        Poll::Pending => return Poll::Pending,
                    };
                    if available.is_empty() {
                        return Poll::Ready(Err(io::ErrorKind::UnexpectedEof.into()));
                    }
                    let take = available
                        .len()
                        .min(*remaining as usize)
                        .min(buf.remaining());
                    buf.put_slice(&available[..take]);
                    Pin::new(&mut this.reader).consume(take);
                    *remaining -= take as u64;
                    if *remaining == 0 {
                        this.state = ChunkState::Header;
                    }
                    return Poll::Ready(Ok(()));
                }
            }
        }
    }
}

/// Errors body reads past a fixed deadline.
struct DeadlineBody {
    inner: Body,
    sleep: Pin<Box<tokio::time::Sleep>>,
}

impl DeadlineBody {
    fn new(inner: Body, deadline: Instant) -> Self {
        Self {
            inner,
            sleep: Box::pin(tokio::time::sleep_until(deadline.into())),
        }
    }
}

impl AsyncRead for DeadlineBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.sleep.as_mut().poll(cx).is_ready() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "upstream deadline exceeded",
            )));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}
