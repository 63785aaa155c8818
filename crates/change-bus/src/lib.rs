//! In-process topic bus for change notifications.
//!
//! Producers (the realtime socket, tests) publish opaque payloads under a topic;
//! consumers subscribe per topic and decode on their side. A topic's channel is
//! created lazily on first use and dropped again once nobody listens.

use std::collections::HashMap;

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::trace;

pub const DEFAULT_TOPIC_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub topic: String,
    pub payload: Bytes,
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no subscribers on topic {0}")]
    NoSubscribers(String),
}

pub type BusResult<T> = Result<T, BusError>;

pub trait Bus: Send + Sync {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;

    /// Publishes to every current subscriber of `topic` and returns how many
    /// receivers the message reached.
    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize>;

    fn subscriber_count(&self, topic: &str) -> usize;
}

/// Broadcast-backed bus living in the current process.
#[derive(Debug)]
pub struct LocalBus {
    capacity: usize,
    topics: parking_lot::RwLock<HashMap<String, broadcast::Sender<BusMessage>>>,
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_TOPIC_CAPACITY)
    }
}

impl LocalBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            topics: parking_lot::RwLock::new(HashMap::new()),
        }
    }

    /// Drops topic channels that no longer have receivers.
    pub fn prune(&self) -> usize {
        let mut guard = self.topics.write();
        let before = guard.len();
        guard.retain(|_, sender| sender.receiver_count() > 0);
        before - guard.len()
    }

    pub fn topic_count(&self) -> usize {
        self.topics.read().len()
    }

    fn sender_for(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        if let Some(sender) = self.topics.read().get(topic) {
            return sender.clone();
        }
        let mut guard = self.topics.write();
        guard
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }
}

impl Bus for LocalBus {
    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender_for(topic).subscribe()
    }

    fn publish(&self, topic: &str, payload: Bytes) -> BusResult<usize> {
        let sender = match self.topics.read().get(topic) {
            Some(sender) => sender.clone(),
            None => return Err(BusError::NoSubscribers(topic.to_string())),
        };
        match sender.send(BusMessage {
            topic: topic.to_string(),
            payload,
        }) {
            Ok(reached) => Ok(reached),
            Err(_) => {
                self.topics.write().remove(topic);
                trace!(target: "change_bus", topic, "dropped idle topic");
                Err(BusError::NoSubscribers(topic.to_string()))
            }
        }
    }

    fn subscriber_count(&self, topic: &str) -> usize {
        self.topics
            .read()
            .get(topic)
            .map(|sender| sender.receiver_count())
            .unwrap_or(0)
    }
}
