//! Per-collection fan-out of change events to subscribers.
//!
//! Uses tokio broadcast channels: one send reaches every subscriber.
//! Each subscriber buffers up to `capacity` events; a subscriber that
//! falls further behind observes a lag and its subscription ends.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};

use crate::document::WatchEvent;

/// Broadcast channel for a single collection.
pub struct CollectionChannel {
    sender: broadcast::Sender<WatchEvent>,
}

impl CollectionChannel {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WatchEvent> {
        self.sender.subscribe()
    }

    /// Publish to every current subscriber; returns how many received it.
    pub fn publish(&self, event: WatchEvent) -> usize {
        // Sending fails only when nobody is subscribed.
        self.sender.send(event).unwrap_or(0)
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Maps collection names to their broadcast channels.
pub struct ChannelRegistry {
    channels: RwLock<HashMap<String, Arc<CollectionChannel>>>,
    default_capacity: usize,
}

impl ChannelRegistry {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            default_capacity,
        }
    }

    /// Get or create the channel for `collection`.
    pub async fn get_or_create(&self, collection: &str) -> Arc<CollectionChannel> {
        {
            let channels = self.channels.read().await;
            if let Some(channel) = channels.get(collection) {
                return channel.clone();
            }
        }

        let mut channels = self.channels.write().await;
        // Another task may have created it between the two locks.
        if let Some(channel) = channels.get(collection) {
            return channel.clone();
        }
        let channel = Arc::new(CollectionChannel::new(self.default_capacity));
        channels.insert(collection.to_string(), channel.clone());
        channel
    }

    pub async fn get(&self, collection: &str) -> Option<Arc<CollectionChannel>> {
        self.channels.read().await.get(collection).cloned()
    }

    /// Publish to a collection's subscribers, if it has a channel.
    pub async fn publish(&self, collection: &str, event: WatchEvent) -> usize {
        match self.get(collection).await {
            Some(channel) => channel.publish(event),
            None => 0,
        }
    }
}
