use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::mpsc;

use crate::iox::Body;

const DEFAULT_FLUSH_CAPACITY: usize = 8;
const READ_BUF: usize = 64 * 1024;

/// Receives block-aligned buffers drained from an upstream body.
///
/// `on_block` calls for one stream arrive strictly in increasing index
/// order. `pos` is the absolute byte position just past the delivered
/// block (`start_at` + bytes received so far); `eof` marks the tail
/// block. An `on_block` error aborts the stream after `on_error`.
#[async_trait]
pub trait FlushHandler: Send + 'static {
    async fn on_block(
        &mut self,
        buf: Vec<u8>,
        index: u32,
        pos: u64,
        eof: bool,
    ) -> anyhow::Result<()>;
    async fn on_error(&mut self, err: anyhow::Error);
    async fn on_close(&mut self, eof: bool);
}

enum FlushMsg {
    Block {
        buf: Vec<u8>,
        index: u32,
        pos: u64,
        eof: bool,
    },
    Failed(anyhow::Error),
    Close {
        eof: bool,
    },
}

/// Wraps an upstream body so that reading it through also persists
/// block-aligned chunks.
///
/// The returned body yields exactly the upstream bytes. A driver task
/// forwards bytes downstream while accumulating blocks; completed
/// blocks go to a bounded flush channel drained by a worker invoking
/// the handler. The bounded channel gives flush backpressure; the
/// bounded client channel couples draining to the reader.
pub fn save_chunks<H: FlushHandler>(
    body: Body,
    block_size: u64,
    start_at: u64,
    capacity: usize,
    handler: H,
) -> Body {
    let capacity = if capacity == 0 {
        DEFAULT_FLUSH_CAPACITY
    } else {
        capacity
    };
    let (flush_tx, flush_rx) = mpsc::channel::<FlushMsg>(capacity);
    let (client_tx, client_rx) = mpsc::channel::<io::Result<Bytes>>(8);

    tokio::spawn(flush_worker(flush_rx, handler));
    tokio::spawn(drive(body, block_size, start_at, flush_tx, client_tx));

    Box::new(ChannelBody {
        rx: client_rx,
        current: Bytes::new(),
    })
}

async fn flush_worker<H: FlushHandler>(mut rx: mpsc::Receiver<FlushMsg>, mut handler: H) {
    while let Some(msg) = rx.recv().await {
        match msg {
            FlushMsg::Block {
                buf,
                index,
                pos,
                eof,
            } => {
                if let Err(err) = handler.on_block(buf, index, pos, eof).await {
                    handler.on_error(err).await;
                    // dropping the receiver fails the driver's next send
                    return;
                }
            }
            FlushMsg::Failed(err) => {
                handler.on_error(err).await;
                return;
            }
            FlushMsg::Close { eof } => {
                handler.on_close(eof).await;
                return;
            }
        }
    }
}

async fn drive(
    mut body: Body,
    block_size: u64,
    start_at: u64,
    flush_tx: mpsc::Sender<FlushMsg>,
    client_tx: mpsc::Sender<io::Result<Bytes>>,
) {
    let block_size = block_size.max(1);
    let mut block: Vec<u8> = Vec::with_capacity(block_size as usize);
    let mut block_start = start_at;
    let mut received = 0u64;
    let mut buf = vec![0u8; READ_BUF];

    loop {
        let n = match body.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(err) => {
                let _ = client_tx
                    .send(Err(io::Error::new(err.kind(), err.to_string())))
                    .await;
                let _ = flush_tx.send(FlushMsg::Failed(err.into())).await;
                return;
            }
        };

        if client_tx
            .send(Ok(Bytes::copy_from_slice(&buf[..n])))
            .await
            .is_err()
        {
            // downstream reader is gone; stop filling
            let _ = flush_tx.send(FlushMsg::Close { eof: false }).await;
            return;
        }
        received += n as u64;

        let mut rest = &buf[..n];
        while !rest.is_empty() {
            // bytes until the next aligned boundary
            let room = block_size - (block_start + block.len() as u64) % block_size;
            let room = if room == 0 { block_size } else { room };
            let take = rest.len().min(room as usize);
            block.extend_from_slice(&rest[..take]);
            rest = &rest[take..];

            if (block_start + block.len() as u64) % block_size == 0 {
                let index = (block_start / block_size) as u32;
                let pos = start_at + received - rest.len() as u64;
                let full = std::mem::replace(&mut block, Vec::with_capacity(block_size as usize));
                block_start += full.len() as u64;
                if flush_tx
                    .send(FlushMsg::Block {
                        buf: full,
                        index,
                        pos,
                        eof: false,
                    })
                    .await
                    .is_err()
                {
                    let _ = client_tx
                        .send(Err(io::Error::other("chunk flush aborted")))
                        .await;
                    return;
                }
            }
        }
    }

    if !block.is_empty() {
        let index = (block_start / block_size) as u32;
        let pos = start_at + received;
        let tail = std::mem::take(&mut block);
        if flush_tx
            .send(FlushMsg::Block {
                buf: tail,
                index,
                pos,
                eof: true,
            })
            .await
            .is_err()
        {
            let _ = client_tx
                .send(Err(io::Error::other("chunk flush aborted")))
                .await;
            return;
        }
    }
    let _ = flush_tx.send(FlushMsg::Close { eof: true }).await;
}

struct ChannelBody {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    current: Bytes,
}

impl AsyncRead for ChannelBody {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.current.is_empty() {
                let take = this.current.len().min(buf.remaining());
                buf.put_slice(&this.current.split_to(take));
                return Poll::Ready(Ok(()));
            }
            match this.rx.poll_recv(cx) {
                Poll::Ready(Some(Ok(bytes))) => this.current = bytes,
                Poll::Ready(Some(Err(err))) => return Poll::Ready(Err(err)),
                Poll::Ready(None) => return Poll::Ready(Ok(())),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use parking_lot::Mutex;
    use tokio::io::AsyncReadExt;

    use crate::iox::bytes_body;

    #[derive(Default, Clone)]
    struct Recorder {
        blocks: Arc<Mutex<Vec<(usize, u32, u64, bool)>>>,
        closed: Arc<Mutex<Option<bool>>>,
        errors: Arc<Mutex<Vec<String>>>,
        fail_at: Option<u32>,
    }

    #[async_trait]
    impl FlushHandler for Recorder {
        async fn on_block(
            &mut self,
            buf: Vec<u8>,
            index: u32,
            pos: u64,
            eof: bool,
        ) -> anyhow::Result<()> {
            if self.fail_at == Some(index) {
                anyhow::bail!("flush failed at {index}");
            }
            self.blocks.lock().push((buf.len(), index, pos, eof));
            Ok(())
        }

        async fn on_error(&mut self, err: anyhow::Error) {
            self.errors.lock().push(err.to_string());
        }

        async fn on_close(&mut self, eof: bool) {
            *self.closed.lock() = Some(eof);
        }
    }

    async fn drain(mut body: Body) -> Vec<u8> {
        let mut out = Vec::new();
        body.read_to_end(&mut out).await.unwrap();
        out
    }

    #[tokio::test]
    async fn blocks_flush_in_order_with_tail_eof() {
        let payload: Vec<u8> = (0..2500u32).map(|i| i as u8).collect();
        let recorder = Recorder::default();
        let body = save_chunks(
            bytes_body(Bytes::from(payload.clone())),
            1000,
            0,
            8,
            recorder.clone(),
        );

        let out = drain(body).await;
        assert_eq!(out, payload);

        // give the flusher a beat to finish
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let blocks = recorder.blocks.lock().clone();
        assert_eq!(
            blocks,
            vec![
                (1000, 0, 1000, false),
                (1000, 1, 2000, false),
                (500, 2, 2500, true),
            ]
        );
        assert_eq!(*recorder.closed.lock(), Some(true));
        assert!(recorder.errors.lock().is_empty());
    }

    #[tokio::test]
    async fn aligned_stream_closes_with_eof_and_no_tail() {
        let payload = vec![7u8; 2000];
        let recorder = Recorder::default();
        let body = save_chunks(bytes_body(Bytes::from(payload)), 1000, 0, 8, recorder.clone());
        drain(body).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let blocks = recorder.blocks.lock().clone();
        assert_eq!(blocks.len(), 2);
        assert!(blocks.iter().all(|(len, _, _, eof)| *len == 1000 && !eof));
        assert_eq!(*recorder.closed.lock(), Some(true));
    }

    #[tokio::test]
    async fn start_offset_shifts_indices() {
        // a sub-request for bytes 2000.. of a 1000-block object
        let payload = vec![1u8; 1500];
        let recorder = Recorder::default();
        let body = save_chunks(bytes_body(Bytes::from(payload)), 1000, 2000, 8, recorder.clone());
        drain(body).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let blocks = recorder.blocks.lock().clone();
        assert_eq!(blocks, vec![(1000, 2, 3000, false), (500, 3, 3500, true)]);
    }

    #[tokio::test]
    async fn flush_failure_aborts_the_stream() {
        let payload = vec![0u8; 4000];
        let recorder = Recorder {
            fail_at: Some(1),
            ..Default::default()
        };
        let body = save_chunks(bytes_body(Bytes::from(payload)), 1000, 0, 1, recorder.clone());

        let mut body = body;
        let mut out = Vec::new();
        let result = body.read_to_end(&mut out).await;
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        assert!(!recorder.errors.lock().is_empty());
        // the client stream either errored or ended short of the payload
        assert!(result.is_err() || out.len() < 4000);
        assert_eq!(*recorder.closed.lock(), None);
    }

    #[tokio::test]
    async fn capacity_one_still_delivers_everything() {
        let payload: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();
        let recorder = Recorder::default();
        let body = save_chunks(
            bytes_body(Bytes::from(payload.clone())),
            512,
            0,
            1,
            recorder.clone(),
        );
        let out = drain(body).await;
        assert_eq!(out, payload);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let blocks = recorder.blocks.lock().clone();
        let total: usize = blocks.iter().map(|(len, _, _, _)| len).sum();
        assert_eq!(total, 5000);
        let indices: Vec<u32> = blocks.iter().map(|(_, index, _, _)| *index).collect();
        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(indices, sorted);
    }
}
