//! Realtime insert feed over the backend's Phoenix-style websocket.
//!
//! Each subscription opens its own socket, joins `realtime:room:messages:<id>`
//! with a `postgres_changes` INSERT filter on `contact_id`, and republishes
//! every inserted row onto the local change bus. The subscription worker in
//! [`crate::subscriber`] reads from there.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use change_bus::Bus;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::time::{interval_at, Duration, Instant};
use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};
use tracing::{debug, trace, warn};
use url::Url;

use crate::gateway::LiveFeed;
use crate::model::{ConversationId, Message};
use crate::publisher::{conversation_topic, ChangePublisher};
use crate::subscriber::LiveSubscription;
use crate::FeedError;

pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const PROTOCOL_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct Frame {
    pub topic: String,
    pub event: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(rename = "ref", default)]
    pub reference: Option<String>,
}

pub struct RealtimeClient<B: Bus> {
    endpoint: Url,
    anon_key: String,
    access_token: Option<String>,
    publisher: ChangePublisher<B>,
    bus: Arc<B>,
    refs: Arc<AtomicU64>,
}

impl<B: Bus + 'static> RealtimeClient<B> {
    pub fn new(base_url: &Url, anon_key: impl Into<String>, bus: Arc<B>) -> Result<Self, FeedError> {
        let anon_key = anon_key.into();
        Ok(Self {
            endpoint: websocket_url(base_url, &anon_key)?,
            anon_key,
            access_token: None,
            publisher: ChangePublisher::new(Arc::clone(&bus)),
            bus,
            refs: Arc::new(AtomicU64::new(1)),
        })
    }

    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    fn next_ref(&self) -> String {
        self.refs.fetch_add(1, Ordering::Relaxed).to_string()
    }
}

/// `http(s)://host/..` becomes `ws(s)://host/../realtime/v1/websocket?apikey=..&vsn=..`.
pub fn websocket_url(base_url: &Url, anon_key: &str) -> Result<Url, FeedError> {
    let scheme = match base_url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(FeedError::Connect(format!("unsupported scheme {other}"))),
    };
    let mut base = base_url.clone();
    if !base.path().ends_with('/') {
        let path = format!("{}/", base.path());
        base.set_path(&path);
    }
    let mut url = base
        .join("realtime/v1/websocket")
        .map_err(|err| FeedError::Connect(err.to_string()))?;
    url.set_scheme(scheme)
        .map_err(|_| FeedError::Connect(format!("cannot switch {base_url} to {scheme}")))?;
    url.query_pairs_mut()
        .append_pair("apikey", anon_key)
        .append_pair("vsn", PROTOCOL_VERSION);
    Ok(url)
}

fn channel_topic(conversation: &ConversationId) -> String {
    format!("realtime:{}", conversation_topic(conversation))
}

pub(crate) fn join_frame(conversation: &ConversationId, token: &str, reference: String) -> Frame {
    Frame {
        topic: channel_topic(conversation),
        event: "phx_join".into(),
        payload: json!({
            "config": {
                "broadcast": { "self": false },
                "presence": { "key": "" },
                "postgres_changes": [{
                    "event": "INSERT",
                    "schema": "public",
                    "table": "messages",
                    "filter": format!("contact_id=eq.{conversation}"),
                }],
            },
            "access_token": token,
        }),
        reference: Some(reference),
    }
}

pub(crate) fn leave_frame(conversation: &ConversationId, reference: String) -> Frame {
    Frame {
        topic: channel_topic(conversation),
        event: "phx_leave".into(),
        payload: json!({}),
        reference: Some(reference),
    }
}

pub(crate) fn heartbeat_frame(reference: String) -> Frame {
    Frame {
        topic: "phoenix".into(),
        event: "heartbeat".into(),
        payload: json!({}),
        reference: Some(reference),
    }
}

/// Pulls an inserted row out of either the `postgres_changes` event or the
/// older bare `INSERT` event.
pub(crate) fn extract_insert(frame: &Frame) -> Result<Option<Message>, FeedError> {
    let record = match frame.event.as_str() {
        "postgres_changes" => {
            let data = &frame.payload["data"];
            let kind = data["type"].as_str().or_else(|| data["eventType"].as_str());
            if kind != Some("INSERT") {
                return Ok(None);
            }
            data["record"].clone()
        }
        "INSERT" => frame.payload["record"].clone(),
        _ => return Ok(None),
    };
    if record.is_null() {
        return Err(FeedError::Payload("insert without record".into()));
    }
    serde_json::from_value(record)
        .map(Some)
        .map_err(|err| FeedError::Payload(err.to_string()))
}

#[async_trait]
impl<B: Bus + 'static> LiveFeed for RealtimeClient<B> {
    async fn subscribe(
        &self,
        conversation: &ConversationId,
    ) -> Result<LiveSubscription, FeedError> {
        // Attach to the bus before the socket so no early insert is lost.
        let rx = self.bus.subscribe(&conversation_topic(conversation));
        let (ws_stream, _) = connect_async(self.endpoint.as_str())
            .await
            .map_err(|err| FeedError::Connect(err.to_string()))?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();
        let (tx, mut rx_out) = mpsc::unbounded_channel::<Frame>();

        let token = self.access_token.as_deref().unwrap_or(&self.anon_key);
        tx.send(join_frame(conversation, token, self.next_ref()))
            .map_err(|_| FeedError::Closed)?;

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx_out.recv().await {
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(err) => {
                        warn!(target: "backend::realtime", error = %err, "failed to encode frame");
                        continue;
                    }
                };
                if ws_sender.send(WsMessage::Text(text)).await.is_err() {
                    break;
                }
            }
            let _ = ws_sender.send(WsMessage::Close(None)).await;
        });

        let publisher = self.publisher.clone();
        let conv = conversation.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = ws_receiver.next().await {
                match msg {
                    Ok(WsMessage::Text(text)) => {
                        let frame: Frame = match serde_json::from_str(&text) {
                            Ok(frame) => frame,
                            Err(err) => {
                                warn!(target: "backend::realtime", error = %err, "undecodable frame");
                                continue;
                            }
                        };
                        if frame.event == "phx_reply" {
                            let status = frame.payload["status"].as_str().unwrap_or("unknown");
                            if status == "ok" {
                                trace!(target: "backend::realtime", topic = %frame.topic, "reply ok");
                            } else {
                                warn!(
                                    target: "backend::realtime",
                                    topic = %frame.topic,
                                    status,
                                    response = %frame.payload["response"],
                                    "channel reply"
                                );
                            }
                            continue;
                        }
                        match extract_insert(&frame) {
                            Ok(Some(message)) => {
                                if let Err(err) = publisher.publish_insert(&message) {
                                    warn!(target: "backend::realtime", error = %err, "failed to republish insert");
                                }
                            }
                            Ok(None) => {
                                trace!(target: "backend::realtime", event = %frame.event, "ignoring frame");
                            }
                            Err(err) => {
                                warn!(target: "backend::realtime", error = %err, "bad insert payload");
                            }
                        }
                    }
                    Ok(WsMessage::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            debug!(target: "backend::realtime", conversation = %conv, "socket closed");
        });

        let tx_heartbeat = tx.clone();
        let refs = Arc::clone(&self.refs);
        let heartbeat = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
            loop {
                ticker.tick().await;
                let reference = refs.fetch_add(1, Ordering::Relaxed).to_string();
                if tx_heartbeat.send(heartbeat_frame(reference)).is_err() {
                    break;
                }
            }
        });

        debug!(target: "backend::realtime", conversation = %conversation, "joined insert channel");
        let leave = leave_frame(conversation, self.next_ref());
        let conv = conversation.clone();
        Ok(LiveSubscription::new(conversation.clone(), rx).with_stop_hook(move || {
            heartbeat.abort();
            reader.abort();
            // Dropping the last sender lets the writer flush the leave and close.
            let _ = tx.send(leave);
            drop(tx);
            drop(writer);
            debug!(target: "backend::realtime", conversation = %conv, "left insert channel");
        }))
    }
}
