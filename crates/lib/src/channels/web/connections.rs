//! Live socket per user. Registering a second connection for a user replaces the first.

use super::protocol::ServerFrame;
use std::collections::HashMap;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

/// Instruction for a socket task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Frame(ServerFrame),
    /// Another connection took over: tell the client and close.
    Replaced,
}

/// Sending half held in the table for one socket.
#[derive(Debug, Clone)]
pub struct Connection {
    pub conn_id: Uuid,
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Connection {
    /// New connection and the receiver its socket task drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    /// False once the socket task is gone.
    pub fn push(&self, out: Outgoing) -> bool {
        self.tx.send(out).is_ok()
    }
}

/// chat id (user id) -> current connection.
#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<HashMap<String, Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `conn` current for `chat_id`; the displaced connection (if any) is told to close.
    /// Returns true when a connection was displaced.
    pub async fn register(&self, chat_id: &str, conn: Connection) -> bool {
        let old = self.inner.lock().await.insert(chat_id.to_string(), conn);
        match old {
            Some(old) => {
                old.push(Outgoing::Replaced);
                true
            }
            None => false,
        }
    }

    /// Remove `chat_id` only if `conn_id` is still the current connection.
    pub async fn unregister(&self, chat_id: &str, conn_id: Uuid) -> bool {
        let mut g = self.inner.lock().await;
        match g.get(chat_id) {
            Some(c) if c.conn_id == conn_id => {
                g.remove(chat_id);
                true
            }
            _ => false,
        }
    }

    /// Queue a frame for the current connection of `chat_id`. False when there is none.
    pub async fn send(&self, chat_id: &str, frame: ServerFrame) -> bool {
        let mut g = self.inner.lock().await;
        match g.get(chat_id) {
            Some(c) if c.push(Outgoing::Frame(frame.clone())) => true,
            Some(_) => {
                // Socket task ended without unregistering yet.
                g.remove(chat_id);
                false
            }
            None => false,
        }
    }

    pub async fn is_connected(&self, chat_id: &str) -> bool {
        self.inner.lock().await.contains_key(chat_id)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.is_empty()
    }
}
