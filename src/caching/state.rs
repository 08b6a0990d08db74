use async_trait::async_trait;

use crate::error::CacheError;

use super::processor::Processor;
use super::Caching;

/// First gate of the chain: no index row, no hit.
pub struct StateProcessor;

#[async_trait]
impl Processor for StateProcessor {
    async fn lookup(&self, c: &mut Caching) -> Result<bool, CacheError> {
        Ok(c.target.is_some())
    }
}
