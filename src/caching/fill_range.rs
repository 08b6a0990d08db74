use async_trait::async_trait;
use http::header::RANGE;
use tracing::debug;

use crate::error::CacheError;
use crate::httpx::range::single_range;

use super::processor::Processor;
use super::upstream::UpstreamRequest;
use super::Caching;

/// Widens an inbound Range rightward so a fetch pulls at least the
/// configured percentage of the object, aligned to block boundaries.
/// Never contracts, never crosses EOF. Percent 0 disables.
pub struct FillRangeProcessor;

fn widened_end(start: u64, end: u64, size: u64, block_size: u64, percent: u64) -> u64 {
    let requested = end - start + 1;
    let target = (size * percent).div_ceil(100);
    let length = requested.max(target);
    let extended = start + length - 1;
    // align rightward to the block edge, clip at EOF
    let aligned = ((extended + 1).div_ceil(block_size) * block_size).max(1) - 1;
    aligned.min(size - 1).max(end)
}

#[async_trait]
impl Processor for FillRangeProcessor {
    async fn pre_request(
        &self,
        c: &mut Caching,
        req: &mut UpstreamRequest,
    ) -> Result<(), CacheError> {
        if c.fill_percent == 0 || c.prefetch {
            return Ok(());
        }
        let Some(raw) = req.headers.get(RANGE).and_then(|v| v.to_str().ok()) else {
            return Ok(());
        };
        let Some(md) = c.md_snapshot() else {
            return Ok(());
        };
        if md.size == 0 {
            return Ok(());
        }

        let Ok(rng) = single_range(Some(raw), md.size) else {
            return Ok(());
        };
        let end = widened_end(
            rng.start,
            rng.end,
            md.size,
            md.block_size.max(1),
            c.fill_percent,
        );
        if end != rng.end {
            debug!(key = %c.id.key(), from = rng.end, to = end, "fill-range widened");
            req.headers.insert(
                RANGE,
                format!("bytes={}-{end}", rng.start)
                    .parse()
                    .expect("valid range header"),
            );
        }
        Ok(())
    }
}
