use async_trait::async_trait;
use http::header::VARY;
use http::HeaderMap;
use tracing::{debug, info, warn};

use crate::error::CacheError;
use crate::httpx::{
    self,
    vary::{clean_from, vary_data},
};
use crate::object::{Bitmap, Flags, Metadata, ObjectId};

use super::processor::Processor;
use super::upstream::UpstreamResponse;
use super::Caching;

/// Two-level vary caching: a root index entry fans out to variant
/// children keyed by the request headers the origin's `Vary` names.
pub struct VaryProcessor {
    max_limit: usize,
    ignore: Vec<String>,
}

impl VaryProcessor {
    pub fn new(max_limit: usize, ignore: Vec<String>) -> Self {
        let ignore = ignore
            .into_iter()
            .map(|key| key.to_ascii_lowercase())
            .collect();
        Self { max_limit, ignore }
    }

    fn clean(&self, headers: &HeaderMap) -> Vec<String> {
        clean_from(headers)
            .into_iter()
            .filter(|key| !self.ignore.contains(key))
            .collect()
    }

    fn variant_id(&self, c: &Caching, data: &str) -> ObjectId {
        ObjectId::with_variant(c.store_url.clone(), data)
    }
}

#[async_trait]
impl Processor for VaryProcessor {
    async fn lookup(&self, c: &mut Caching) -> Result<bool, CacheError> {
        // no-cache disables variant lookup and forces revalidation
        if c.has_no_cache() {
            return Ok(false);
        }
        let Some(md) = c.md_snapshot() else {
            return Ok(true);
        };
        if !md.is_vary_index() {
            return Ok(true);
        }

        let vary_keys = self.clean(&md.headers);
        let data = vary_data(&vary_keys, &c.req_headers);
        let vid = self.variant_id(c, &data);

        match c.bucket.lookup(&vid).await {
            Ok(Some(vmd)) => {
                debug!(key = %vid.key(), "vary child hit");
                c.rootmd = Some(md);
                c.set_target(vid, vmd);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn post_request(
        &self,
        c: &mut Caching,
        resp: &mut UpstreamResponse,
    ) -> Result<(), CacheError> {
        let Some(md) = c.md_snapshot() else {
            return Ok(());
        };
        if md.is_vary_cache() {
            return Ok(());
        }

        let meta_vary = self.clean(&md.headers);
        let resp_vary = self.clean(&resp.headers);

        // origin says nothing about vary and neither does the cache
        if resp_vary.is_empty() && meta_vary.is_empty() {
            return Ok(());
        }

        let mut root = md.clone();
        let data;

        if resp_vary.is_empty() {
            // cached vary info exists; the origin just omitted the
            // header on this response
            data = vary_data(&meta_vary, &c.req_headers);
        } else if !meta_vary.is_empty() {
            if meta_vary == resp_vary {
                data = vary_data(&meta_vary, &c.req_headers);
                let vid = self.variant_id(c, &data);
                if let Ok(Some(existing)) = c.bucket.lookup(&vid).await {
                    debug!(key = %vid.key(), "vary header match, reusing variant");
                    c.rootmd = Some(root);
                    c.set_target(vid, existing);
                    return Ok(());
                }
            } else {
                // origin changed its vary key set; the family restarts
                info!(key = %c.id.key(), "vary header changed, rebuilding vary cache");
                if let Err(err) = c.bucket.discard(&c.id).await
                    && !matches!(err, CacheError::NotFound)
                {
                    warn!(key = %c.id.key(), error = %err, "stale vary family discard failed");
                }
                root.virtual_keys.clear();
                data = vary_data(&resp_vary, &c.req_headers);
            }
        } else {
            // first vary response for a plain cached object
            if md.chunks.count() > 0 {
                let _ = c
                    .bucket
                    .discard_with_message(&c.id, "upgrading cache to vary structure")
                    .await;
            }
            root.virtual_keys.clear();
            data = vary_data(&resp_vary, &c.req_headers);
        }

        if !root.virtual_keys.contains(&data) {
            if root.virtual_keys.len() >= self.max_limit {
                warn!(
                    key = %c.id.key(),
                    variants = root.virtual_keys.len(),
                    "vary variant limit exceeded, not caching this variant"
                );
                c.cacheable = false;
                c.with_target(|t| t.disarmed = true);
                return Ok(());
            }
            root.virtual_keys.push(data.clone());
        }

        // the root becomes (or stays) a pure index entry
        let mut merged_vary = meta_vary;
        for key in resp_vary {
            if !merged_vary.contains(&key) {
                merged_vary.push(key);
            }
        }
        merged_vary.sort();
        root.flags = Flags::VARY_INDEX;
        root.size = 0;
        root.chunks = Bitmap::new();
        root.parts = Bitmap::new();
        root.headers = HeaderMap::new();
        for key in &merged_vary {
            if let Ok(value) = key.parse() {
                root.headers.append(VARY, value);
            }
        }

        let vid = self.variant_id(c, &data);
        let total = httpx::range::parse_content_range(&resp.headers)
            .map(|r| r.total)
            .unwrap_or(0);
        let mut child = Metadata::new(&vid, resp.status.as_u16(), total, md.block_size, 0);
        child.flags = Flags::VARY_CACHE;
        child.headers = resp.headers.clone();
        child.resp_unix = root.resp_unix;
        child.last_ref_unix = root.last_ref_unix;
        child.expires_at = root.expires_at;

        debug!(root = %c.id.key(), child = %vid.key(), "vary upgrade");
        c.rootmd = Some(root);
        c.set_target(vid, child);
        Ok(())
    }
}
