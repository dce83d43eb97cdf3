//! Communication channels (Telegram, web socket).
//!
//! Each channel turns platform events into [`InboundMessage`](crate::bus::InboundMessage)s on
//! the bus and delivers [`OutboundMessage`](crate::bus::OutboundMessage)s handed to it by the
//! gateway dispatcher. Channels resolve senders through the identity store where they can,
//! which is what makes the session key channel-independent.

mod registry;
mod telegram;
pub mod web;

pub use registry::{ChannelHandle, ChannelRegistry};
pub use telegram::{TelegramChannel, TelegramUpdate};
pub use web::WebChannel;

/// Delivery and lifecycle errors. The dispatcher logs these and carries on.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChannelError {
    /// No live connection for this chat id (gated channels only).
    #[error("{channel}: no live connection for chat {chat_id}")]
    NotConnected { channel: String, chat_id: String },
    #[error("{0}: channel not started")]
    NotStarted(String),
    /// The platform rejected the message.
    #[error("delivery failed: {0}")]
    Delivery(String),
    /// Network or socket failure.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Platform name used for Telegram identity links.
pub const TELEGRAM_PLATFORM: &str = "telegram";
