use std::sync::Arc;

use bytes::Bytes;
use change_bus::{Bus, BusError};

use crate::model::{ConversationId, Message};
use crate::FeedError;

pub const ENVELOPE_INSERT: &str = "insert";

/// Bus topic carrying inserts for one conversation.
pub fn conversation_topic(conversation: &ConversationId) -> String {
    format!("room:messages:{conversation}")
}

/// Publishes inserted rows onto the change bus as `{"type","payload"}` envelopes.
pub struct ChangePublisher<B: Bus> {
    bus: Arc<B>,
}

impl<B: Bus> ChangePublisher<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self { bus }
    }

    /// Returns how many subscribers saw the insert; zero when nobody listens.
    pub fn publish_insert(&self, message: &Message) -> Result<usize, FeedError> {
        let envelope = serde_json::to_vec(&serde_json::json!({
            "type": ENVELOPE_INSERT,
            "payload": message,
        }))
        .map_err(|err| FeedError::Payload(err.to_string()))?;
        match self
            .bus
            .publish(&conversation_topic(&message.contact_id), Bytes::from(envelope))
        {
            Ok(reached) => Ok(reached),
            Err(BusError::NoSubscribers(_)) => Ok(0),
        }
    }
}

impl<B: Bus> Clone for ChangePublisher<B> {
    fn clone(&self) -> Self {
        Self {
            bus: Arc::clone(&self.bus),
        }
    }
}
