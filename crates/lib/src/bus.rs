//! Message bus between channels and the executor.
//!
//! Two unbounded FIFO queues: channels publish [`InboundMessage`]s that the executor loop
//! consumes, and the executor publishes [`OutboundMessage`]s that the gateway dispatcher
//! routes back to the originating channel. Publishing never waits on a consumer; consuming
//! suspends until an envelope is available. Nothing is persisted: the durable unit of work is
//! the order file on disk, not the envelope.
//!
//! Once inbound intake is closed (gateway shutdown), a published inbound message is not queued;
//! it is answered on the outbound queue with the closing notice instead.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::OnceLock;
use tokio::sync::{mpsc, Mutex};

/// Reference to media attached to an inbound message (file id, URL or local path).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaRef {
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Session key for a message: the resolved user when the channel authenticated one, else
/// `channel:chat_id`. The authenticated form does not depend on the channel, which is what
/// gives one user the same session on every channel.
pub fn session_key(channel: &str, chat_id: &str, user_id: Option<&str>) -> String {
    match user_id.map(str::trim).filter(|u| !u.is_empty()) {
        Some(user_id) => format!("user:{}", user_id),
        None => format!("{}:{}", channel, chat_id),
    }
}

/// A message received from a channel. Built once by the channel and not mutated afterwards.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    channel: String,
    sender_id: String,
    chat_id: String,
    content: String,
    media: Option<MediaRef>,
    metadata: HashMap<String, serde_json::Value>,
    user_id: Option<String>,
    session_key: String,
}

impl InboundMessage {
    /// Build an inbound envelope; `user_id` is the identity the channel resolved for the sender, if any.
    pub fn new(
        channel: impl Into<String>,
        sender_id: impl Into<String>,
        chat_id: impl Into<String>,
        content: impl Into<String>,
        user_id: Option<String>,
    ) -> Self {
        let channel = channel.into();
        let chat_id = chat_id.into();
        let session_key = session_key(&channel, &chat_id, user_id.as_deref());
        Self {
            channel,
            sender_id: sender_id.into(),
            chat_id,
            content: content.into(),
            media: None,
            metadata: HashMap::new(),
            user_id,
            session_key,
        }
    }

    pub fn with_media(mut self, media: MediaRef) -> Self {
        self.media = Some(media);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn sender_id(&self) -> &str {
        &self.sender_id
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn media(&self) -> Option<&MediaRef> {
        self.media.as_ref()
    }

    pub fn metadata(&self) -> &HashMap<String, serde_json::Value> {
        &self.metadata
    }

    pub fn user_id(&self) -> Option<&str> {
        self.user_id.as_deref()
    }

    pub fn session_key(&self) -> &str {
        &self.session_key
    }
}

/// A reply for a channel conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub channel: String,
    pub chat_id: String,
    pub content: String,
}

impl OutboundMessage {
    pub fn new(channel: impl Into<String>, chat_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            chat_id: chat_id.into(),
            content: content.into(),
        }
    }

    /// Reply addressed to the conversation an inbound message came from.
    pub fn reply_to(msg: &InboundMessage, content: impl Into<String>) -> Self {
        Self::new(msg.channel(), msg.chat_id(), content)
    }
}

/// Inbound and outbound queues. Any number of producers; one consumer per direction.
pub struct MessageBus {
    inbound_tx: mpsc::UnboundedSender<InboundMessage>,
    inbound_rx: Mutex<mpsc::UnboundedReceiver<InboundMessage>>,
    outbound_tx: mpsc::UnboundedSender<OutboundMessage>,
    outbound_rx: Mutex<mpsc::UnboundedReceiver<OutboundMessage>>,
    /// Set once when intake closes; the reply given to refused messages.
    closed_notice: OnceLock<String>,
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageBus {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        Self {
            inbound_tx,
            inbound_rx: Mutex::new(inbound_rx),
            outbound_tx,
            outbound_rx: Mutex::new(outbound_rx),
            closed_notice: OnceLock::new(),
        }
    }

    /// Queue a message from a channel. Never waits. Returns false when intake is closed; the
    /// sender then gets the closing notice instead.
    pub fn publish_inbound(&self, msg: InboundMessage) -> bool {
        if let Some(notice) = self.closed_notice.get() {
            log::debug!("inbound closed; refusing message from {}:{}", msg.channel(), msg.chat_id());
            self.publish_outbound(OutboundMessage::reply_to(&msg, notice.clone()));
            return false;
        }
        // The bus owns both halves, so the receiver cannot be gone while `self` lives.
        let _ = self.inbound_tx.send(msg);
        true
    }

    /// Stop accepting inbound messages. Messages already queued stay consumable. Later calls
    /// keep the first notice.
    pub fn close_inbound(&self, notice: impl Into<String>) {
        if self.closed_notice.set(notice.into()).is_ok() {
            log::info!("inbound intake closed");
        }
    }

    pub fn is_inbound_closed(&self) -> bool {
        self.closed_notice.get().is_some()
    }

    /// Next inbound message; suspends until one is available.
    pub async fn consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.recv().await
    }

    /// Inbound message if one is already queued (used to drain on shutdown).
    pub async fn try_consume_inbound(&self) -> Option<InboundMessage> {
        self.inbound_rx.lock().await.try_recv().ok()
    }

    /// Queue a reply for a channel. Never waits.
    pub fn publish_outbound(&self, msg: OutboundMessage) {
        let _ = self.outbound_tx.send(msg);
    }

    /// Next outbound message; suspends until one is available.
    pub async fn consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.recv().await
    }

    /// Outbound message if one is already queued (used to drain on shutdown).
    pub async fn try_consume_outbound(&self) -> Option<OutboundMessage> {
        self.outbound_rx.lock().await.try_recv().ok()
    }
}
