use std::sync::Arc;

use async_trait::async_trait;
use change_bus::{Bus, BusMessage};
use serde::Deserialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::gateway::LiveFeed;
use crate::model::{ConversationId, Message};
use crate::publisher::{conversation_topic, ChangePublisher, ENVELOPE_INSERT};
use crate::FeedError;

/// Receives decoded inserts for a subscribed conversation.
pub trait InsertHandler: Send + Sync + 'static {
    fn on_insert(&self, message: Message);
}

impl<F> InsertHandler for F
where
    F: Fn(Message) + Send + Sync + 'static,
{
    fn on_insert(&self, message: Message) {
        self(message)
    }
}

type StopHook = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    payload: serde_json::Value,
}

/// An attached but not yet started subscription.
pub struct LiveSubscription {
    conversation: ConversationId,
    rx: broadcast::Receiver<BusMessage>,
    on_stop: Option<StopHook>,
}

impl LiveSubscription {
    pub fn new(conversation: ConversationId, rx: broadcast::Receiver<BusMessage>) -> Self {
        Self {
            conversation,
            rx,
            on_stop: None,
        }
    }

    /// Runs `hook` once when the subscription is stopped or dropped.
    pub fn with_stop_hook(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_stop = Some(Box::new(hook));
        self
    }

    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Spawns the worker that decodes envelopes and hands inserts for this
    /// conversation to `handler`.
    pub fn start<H: InsertHandler>(self, handler: H) -> SubscriptionHandle {
        let LiveSubscription {
            conversation,
            mut rx,
            on_stop,
        } = self;
        let target = conversation.clone();
        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(msg) => match decode_insert(&msg.payload) {
                        Ok(Some(message)) if message.contact_id == target => {
                            trace!(target: "backend::feed", conversation = %target, id = message.id, "insert received");
                            handler.on_insert(message);
                        }
                        Ok(Some(message)) => {
                            debug!(
                                target: "backend::feed",
                                conversation = %target,
                                other = %message.contact_id,
                                "ignoring insert for another conversation"
                            );
                        }
                        Ok(None) => {}
                        Err(err) => {
                            warn!(target: "backend::feed", conversation = %target, error = %err, "failed to decode insert");
                        }
                    },
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(target: "backend::feed", conversation = %target, skipped, "insert feed lagged");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
            debug!(target: "backend::feed", conversation = %target, "insert feed closed");
        });
        SubscriptionHandle {
            conversation,
            task: Some(task),
            on_stop,
        }
    }
}

fn decode_insert(payload: &[u8]) -> Result<Option<Message>, FeedError> {
    let envelope: Envelope =
        serde_json::from_slice(payload).map_err(|err| FeedError::Payload(err.to_string()))?;
    if envelope.kind != ENVELOPE_INSERT {
        return Ok(None);
    }
    serde_json::from_value(envelope.payload)
        .map(Some)
        .map_err(|err| FeedError::Payload(err.to_string()))
}

/// A running subscription. Dropping it detaches as well.
pub struct SubscriptionHandle {
    conversation: ConversationId,
    task: Option<JoinHandle<()>>,
    on_stop: Option<StopHook>,
}

impl SubscriptionHandle {
    pub fn conversation(&self) -> &ConversationId {
        &self.conversation
    }

    /// Detaches and waits for the worker to wind down. No insert reaches the
    /// handler after this returns.
    pub async fn stop(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
            let _ = task.await;
        }
        if let Some(hook) = self.on_stop.take() {
            hook();
        }
        debug!(target: "backend::feed", conversation = %self.conversation, "subscription stopped");
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
        if let Some(hook) = self.on_stop.take() {
            hook();
        }
    }
}

/// [`LiveFeed`] served straight from an in-process bus.
pub struct BusFeed<B: Bus> {
    bus: Arc<B>,
}

impl<B: Bus> BusFeed<B> {
    pub fn new(bus: Arc<B>) -> Self {
        Self { bus }
    }

    pub fn publisher(&self) -> ChangePublisher<B> {
        ChangePublisher::new(Arc::clone(&self.bus))
    }
}

#[async_trait]
impl<B: Bus + 'static> LiveFeed for BusFeed<B> {
    async fn subscribe(
        &self,
        conversation: &ConversationId,
    ) -> Result<LiveSubscription, FeedError> {
        let rx = self.bus.subscribe(&conversation_topic(conversation));
        Ok(LiveSubscription::new(conversation.clone(), rx))
    }
}
