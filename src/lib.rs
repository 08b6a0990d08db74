pub mod algorithm;
pub mod caching;
pub mod cli;
pub mod error;
pub mod event;
pub mod httpx;
pub mod iox;
pub mod logging;
pub mod metrics;
pub mod object;
pub mod pathtrie;
pub mod server;
pub mod settings;
pub mod storage;

use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use crate::caching::upstream::HttpUpstream;
use crate::caching::CachingLayer;
use crate::event::EventBus;
use crate::settings::Settings;
use crate::storage::{MarkedStorage, Storage, TieredStorage};

pub async fn run(settings: Settings) -> Result<()> {
    if let Some(addr) = settings.metrics_listen {
        tokio::spawn(async move {
            info!(address = %addr, "metrics endpoint starting");
            if let Err(err) = metrics::serve(addr, "/metrics".to_string()).await {
                tracing::error!(error = %err, "metrics endpoint failed");
            }
        });
    }

    let storage = build_storage(&settings)?;
    let upstream = Arc::new(HttpUpstream::new(
        settings.upstream_connect_timeout(),
        settings.upstream_timeout(),
    ));
    let events = Arc::new(EventBus::new());
    let layer = CachingLayer::new(
        storage.clone(),
        upstream,
        settings.middleware.caching.clone(),
        events,
    );

    server::run(settings.listen, layer, storage).await
}

/// Builds the tiered store, layering directory purge marks on top
/// when directory-aware purge is enabled.
pub fn build_storage(settings: &Settings) -> Result<Arc<dyn Storage>> {
    let tiered = TieredStorage::open(&settings.storage)?;
    if settings.storage.dir_aware.enabled {
        Ok(MarkedStorage::wrap(tiered))
    } else {
        Ok(tiered)
    }
}
