use std::collections::HashMap;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

/// Topic for completed cache fills.
pub const CACHE_COMPLETED: &str = "cache.completed";

/// Payload emitted once per object when every chunk is present.
///
/// `report_ratio`: -1 disables verification reports, 0 defers to the
/// subscriber's default, 1..=100 is a sampling percentage.
#[derive(Debug, Clone)]
pub struct CacheCompleted {
    pub store_url: String,
    pub store_key: String,
    pub store_path: String,
    pub last_modified: String,
    pub content_length: i64,
    pub chunk_count: usize,
    pub chunk_size: u64,
    pub report_ratio: i32,
}

#[derive(Debug, Clone)]
pub enum Event {
    CacheCompleted(CacheCompleted),
}

/// Named-topic publish/subscribe. Subscribers receive events on their
/// own channel; delivery is best-effort and never blocks the emitter.
///
/// Created at init and passed to publishers by handle, not reached for
/// as a process global.
#[derive(Default)]
pub struct EventBus {
    topics: RwLock<HashMap<String, Vec<mpsc::UnboundedSender<Event>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, topic: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.topics
            .write()
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        rx
    }

    pub fn publish(&self, topic: &str, event: Event) {
        let mut topics = self.topics.write();
        let Some(subscribers) = topics.get_mut(topic) else {
            debug!(topic, "event published with no subscribers");
            return;
        };
        // sending also prunes subscribers whose receiver is gone
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|subs| subs.len())
            .unwrap_or(0)
    }
}
