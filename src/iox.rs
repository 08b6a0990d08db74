use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};

/// Streaming response body: an ordered byte source composed from chunk
/// files, in-memory blobs, and upstream sub-request readers.
pub type Body = Box<dyn AsyncRead + Send + Unpin>;

pub fn empty_body() -> Body {
    Box::new(io::Cursor::new(Vec::new()))
}

pub fn bytes_body(bytes: Bytes) -> Body {
    Box::new(io::Cursor::new(bytes))
}

/// Limits a reader to its first `limit` bytes.
pub fn limit(reader: Body, limit: u64) -> Body {
    Box::new(reader.take(limit))
}

/// Discards the first `skip` bytes before yielding the rest.
pub fn skip(reader: Body, skip: u64) -> Body {
    Box::new(SkipReader {
        inner: reader,
        remaining: skip,
        scratch: [0u8; 8192],
    })
}

struct SkipReader {
    inner: Body,
    remaining: u64,
    scratch: [u8; 8192],
}

impl AsyncRead for SkipReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.remaining > 0 {
            let want = (this.remaining as usize).min(this.scratch.len());
            let mut scratch = ReadBuf::new(&mut this.scratch[..want]);
            match Pin::new(&mut this.inner).poll_read(cx, &mut scratch) {
                Poll::Ready(Ok(())) => {
                    let filled = scratch.filled().len();
                    if filled == 0 {
                        // EOF inside the skip window
                        return Poll::Ready(Ok(()));
                    }
                    this.remaining -= filled as u64;
                }
                other => return other,
            }
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

/// Serves `[start, start+len)` of the underlying stream, then keeps
/// draining it to EOF before reporting end-of-stream.
///
/// Used by prefetch: the client only wants its window, but the rest of
/// the object must still flow through the chunk writer.
pub fn window(reader: Body, start: u64, len: u64) -> Body {
    Box::new(WindowReader {
        inner: reader,
        skip_remaining: start,
        window_remaining: len,
        scratch: [0u8; 8192],
    })
}

struct WindowReader {
    inner: Body,
    skip_remaining: u64,
    window_remaining: u64,
    scratch: [u8; 8192],
}

impl AsyncRead for WindowReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if this.skip_remaining > 0 || this.window_remaining == 0 {
                // discard head bytes, or drain the tail after the window
                let want = if this.skip_remaining > 0 {
                    (this.skip_remaining as usize).min(this.scratch.len())
                } else {
                    this.scratch.len()
                };
                let mut scratch = ReadBuf::new(&mut this.scratch[..want]);
                match Pin::new(&mut this.inner).poll_read(cx, &mut scratch) {
                    Poll::Ready(Ok(())) => {
                        let filled = scratch.filled().len();
                        if filled == 0 {
                            return Poll::Ready(Ok(()));
                        }
                        this.skip_remaining =
                            this.skip_remaining.saturating_sub(filled as u64);
                    }
                    other => return other,
                }
                continue;
            }

            let want = (this.window_remaining as usize).min(buf.remaining());
            let mut scratch = ReadBuf::new(&mut this.scratch[..want.min(this.scratch.len())]);
            return match Pin::new(&mut this.inner).poll_read(cx, &mut scratch) {
                Poll::Ready(Ok(())) => {
                    let filled = scratch.filled().len();
                    if filled == 0 {
                        this.window_remaining = 0;
                        return Poll::Ready(Ok(()));
                    }
                    buf.put_slice(scratch.filled());
                    this.window_remaining -= filled as u64;
                    Poll::Ready(Ok(()))
                }
                other => other,
            };
        }
    }
}

/// Reads a sequence of bodies back to back, like one stream.
pub struct MultiReader {
    parts: Vec<Body>,
    current: usize,
}

impl MultiReader {
    pub fn new(parts: Vec<Body>) -> Self {
        Self { parts, current: 0 }
    }
}

impl AsyncRead for MultiReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        while this.current < this.parts.len() {
            let before = buf.filled().len();
            match Pin::new(&mut this.parts[this.current]).poll_read(cx, buf) {
                Poll::Ready(Ok(())) => {
                    if buf.filled().len() == before {
                        this.current += 1;
                        continue;
                    }
                    return Poll::Ready(Ok(()));
                }
                other => return other,
            }
        }
        Poll::Ready(Ok(()))
    }
}
