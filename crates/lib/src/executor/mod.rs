//! Executors turn inbound messages into replies.
//!
//! The gateway runs one executor loop that calls [`serve`] for each inbound message in
//! order. Every failure comes back as an [`ExecResult`] and is turned into a user-visible
//! reply here, so nothing below this boundary can stop the loop.

mod bridge;
pub mod order;
pub mod worker;

pub use bridge::FsBridgeExecutor;
pub use order::{new_order_id, session_of, session_prefix, Order, OrderState, OrdersTree};

use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::session::{SessionMessage, SessionStore};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

/// Per-order failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("empty payload")]
    EmptyPayload,
    #[error("timed out after {}s waiting for a response", .0.as_secs())]
    Timeout(Duration),
    #[error("order I/O failed: {0}")]
    Io(String),
}

impl ExecError {
    /// Short machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            ExecError::EmptyPayload => "empty_payload",
            ExecError::Timeout(_) => "timeout",
            ExecError::Io(_) => "io",
        }
    }
}

/// What the executor needs from an inbound message.
#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub order_id: String,
    pub session_key: String,
    pub channel: String,
    pub chat_id: String,
    pub sender_id: String,
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl OrderRequest {
    pub fn from_inbound(msg: &InboundMessage) -> Self {
        Self {
            order_id: new_order_id(msg.session_key()),
            session_key: msg.session_key().to_string(),
            channel: msg.channel().to_string(),
            chat_id: msg.chat_id().to_string(),
            sender_id: msg.sender_id().to_string(),
            payload: msg.content().to_string(),
            created_at: Utc::now(),
        }
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub success: bool,
    pub response_text: String,
    pub error: Option<ExecError>,
}

impl ExecResult {
    pub fn ok(response_text: impl Into<String>) -> Self {
        Self {
            success: true,
            response_text: response_text.into(),
            error: None,
        }
    }

    pub fn failed(error: ExecError) -> Self {
        Self {
            success: false,
            response_text: String::new(),
            error: Some(error),
        }
    }
}

/// A backend that executes orders.
#[async_trait]
pub trait Executor: Send + Sync {
    fn name(&self) -> &str;

    /// Run one order to completion, failure or timeout. Never panics on I/O errors.
    async fn execute(&self, order: &OrderRequest) -> ExecResult;
}

/// Configured executor backends.
pub enum Backend {
    FsBridge(FsBridgeExecutor),
}

#[async_trait]
impl Executor for Backend {
    fn name(&self) -> &str {
        match self {
            Backend::FsBridge(e) => e.name(),
        }
    }

    async fn execute(&self, order: &OrderRequest) -> ExecResult {
        match self {
            Backend::FsBridge(e) => e.execute(order).await,
        }
    }
}

/// Reply text for a result. Failures get a notice instead of silence.
pub fn reply_text(result: &ExecResult) -> String {
    match (&result.error, result.success) {
        (None, true) if !result.response_text.trim().is_empty() => result.response_text.clone(),
        (None, true) => "Done (no output).".to_string(),
        (Some(ExecError::EmptyPayload), _) => "Nothing to do: the message was empty.".to_string(),
        (Some(ExecError::Timeout(d)), _) => format!(
            "No response after {}s. The order was dropped; send a new message to try again.",
            d.as_secs()
        ),
        (Some(ExecError::Io(_)), _) | (None, false) => {
            "Sorry, the order could not be processed. Please try again.".to_string()
        }
    }
}

/// Execute one inbound message and publish exactly one reply for it.
pub async fn serve(executor: &dyn Executor, sessions: &SessionStore, bus: &MessageBus, msg: InboundMessage) {
    let key = msg.session_key().to_string();
    sessions
        .append(&key, SessionMessage::user(msg.channel(), msg.content()))
        .await;

    let request = OrderRequest::from_inbound(&msg);
    let result = executor.execute(&request).await;
    if let Some(ref e) = result.error {
        log::warn!(
            "{} failed for {} [{}]: {}",
            executor.name(),
            request.order_id,
            e.code(),
            e
        );
    }

    let text = reply_text(&result);
    let entry = if result.success {
        SessionMessage::assistant(msg.channel(), text.clone())
    } else {
        SessionMessage::system(msg.channel(), text.clone())
    };
    sessions.append(&key, entry).await;
    bus.publish_outbound(OutboundMessage::reply_to(&msg, text));
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        fn name(&self) -> &str {
            "echo"
        }

        async fn execute(&self, order: &OrderRequest) -> ExecResult {
            if order.payload == "slow" {
                return ExecResult::failed(ExecError::Timeout(Duration::from_secs(3)));
            }
            ExecResult::ok(format!("echo: {}", order.payload))
        }
    }

    #[test]
    fn request_order_ids_share_the_session_but_not_the_request() {
        let msg = InboundMessage::new("telegram", "7", "42", "hi", Some("u-1".to_string()));
        let req = OrderRequest::from_inbound(&msg);
        assert_eq!(req.session_key, "user:u-1");
        assert_eq!(session_of(&req.order_id), session_prefix("user:u-1"));
        assert_ne!(OrderRequest::from_inbound(&msg).order_id, req.order_id);
        assert_eq!(req.chat_id, "42");
    }

    #[test]
    fn failures_become_notices() {
        assert_eq!(reply_text(&ExecResult::ok("hello")), "hello");
        assert!(reply_text(&ExecResult::failed(ExecError::Timeout(Duration::from_secs(180)))).contains("180s"));
        assert!(!reply_text(&ExecResult::failed(ExecError::Io("disk full".into()))).contains("disk full"));
        assert_eq!(ExecError::Timeout(Duration::from_secs(1)).code(), "timeout");
    }

    #[tokio::test]
    async fn serve_publishes_one_reply_and_records_history() {
        let bus = MessageBus::new();
        let sessions = SessionStore::new();
        serve(&Echo, &sessions, &bus, InboundMessage::new("web", "u", "c", "ping", None)).await;
        serve(&Echo, &sessions, &bus, InboundMessage::new("web", "u", "c", "slow", None)).await;

        let first = bus.try_consume_outbound().await.expect("first reply");
        assert_eq!(first, OutboundMessage::new("web", "c", "echo: ping"));
        let second = bus.try_consume_outbound().await.expect("second reply");
        assert!(second.content.contains("3s"));
        assert!(bus.try_consume_outbound().await.is_none());

        let history = sessions.get("web:c").await.expect("session");
        assert_eq!(history.messages.len(), 4);
    }
}
