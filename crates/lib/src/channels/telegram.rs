//! Telegram channel: long-poll getUpdates and sendMessage via Bot API.

use super::{ChannelError, ChannelHandle, TELEGRAM_PLATFORM};
use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::identity::IdentityStore;
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub const TELEGRAM_API_BASE: &str = "https://api.telegram.org";
const LONG_POLL_TIMEOUT: u64 = 30;
const RETRY_DELAY: Duration = Duration::from_secs(2);
/// Telegram rejects texts over 4096 chars; leave room for entities.
const MAX_CHUNK: usize = 4000;

#[derive(Debug, Deserialize)]
struct GetUpdatesResponse {
    ok: bool,
    #[serde(default)]
    result: Vec<TelegramUpdate>,
}

#[derive(Debug, Deserialize)]
struct SendMessageResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Telegram update payload (getUpdates result item).
#[derive(Debug, Deserialize)]
pub struct TelegramUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramMessage {
    pub chat: TelegramChat,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct TelegramChat {
    pub id: i64,
}

#[derive(Debug, Deserialize)]
pub struct TelegramUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

struct Inner {
    token: String,
    api_base: String,
    authorized: HashSet<i64>,
    identity: Option<IdentityStore>,
    client: reqwest::Client,
}

/// Telegram channel connector: long-polls for updates and sends replies via sendMessage.
pub struct TelegramChannel {
    inner: Arc<Inner>,
    running: AtomicBool,
    stop_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl TelegramChannel {
    /// `api_base` defaults to the public Bot API. Senders are accepted when their Telegram user
    /// id is in `authorized` or linked to a user in `identity`.
    pub fn new(
        token: impl Into<String>,
        api_base: Option<String>,
        authorized: impl IntoIterator<Item = i64>,
        identity: Option<IdentityStore>,
    ) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                token: token.into(),
                api_base: api_base
                    .map(|b| b.trim_end_matches('/').to_string())
                    .unwrap_or_else(|| TELEGRAM_API_BASE.to_string()),
                authorized: authorized.into_iter().collect(),
                identity,
                client: reqwest::Client::new(),
            }),
            running: AtomicBool::new(false),
            stop_tx,
            task: Mutex::new(None),
        }
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn method_url(&self, method: &str) -> String {
        format!("{}/bot{}/{}", self.api_base, self.token, method)
    }

    /// Call Telegram getUpdates (long poll). Returns (updates, next_offset).
    async fn get_updates(&self, offset: Option<i64>) -> Result<(Vec<TelegramUpdate>, Option<i64>), String> {
        let mut query = vec![("timeout", LONG_POLL_TIMEOUT.to_string())];
        if let Some(off) = offset {
            query.push(("offset", off.to_string()));
        }
        let res = self
            .client
            .get(self.method_url("getUpdates"))
            .query(&query)
            .timeout(Duration::from_secs(LONG_POLL_TIMEOUT + 10))
            .send()
            .await
            .map_err(|e| e.to_string())?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(format!("getUpdates failed: {} {}", status, body));
        }
        let data: GetUpdatesResponse = res.json().await.map_err(|e| e.to_string())?;
        if !data.ok {
            return Err("getUpdates returned ok: false".to_string());
        }
        let next_offset = data
            .result
            .iter()
            .map(|u| u.update_id)
            .max()
            .map(|id| id + 1)
            .or(offset);
        Ok((data.result, next_offset))
    }

    /// Build the inbound envelope for an update, or None when it is not an accepted text message.
    async fn to_inbound(&self, update: &TelegramUpdate) -> Option<InboundMessage> {
        let msg = update.message.as_ref()?;
        let text = msg.text.as_deref().map(str::trim).filter(|t| !t.is_empty())?;
        let from = msg.from.as_ref()?;
        let sender_id = from.id.to_string();

        let user_id = match self.identity {
            Some(ref store) => match store.resolve_external(TELEGRAM_PLATFORM, &sender_id).await {
                Ok(u) => u,
                Err(e) => {
                    log::warn!("telegram: identity lookup for {} failed: {}", sender_id, e);
                    None
                }
            },
            None => None,
        };
        if user_id.is_none() && !self.authorized.contains(&from.id) {
            log::warn!("telegram: ignoring message from unauthorized user {}", from.id);
            return None;
        }

        let mut inbound = InboundMessage::new(TELEGRAM_PLATFORM, sender_id, msg.chat.id.to_string(), text, user_id)
            .with_metadata("updateId", update.update_id);
        if let Some(ref username) = from.username {
            inbound = inbound.with_metadata("username", username.as_str());
        }
        Some(inbound)
    }

    async fn send_chunk(&self, chat_id: &str, text: &str, html: bool) -> Result<(), ChannelError> {
        let mut body = serde_json::json!({ "chat_id": chat_id, "text": text });
        if html {
            body["parse_mode"] = serde_json::Value::String("HTML".to_string());
        }
        let res = self
            .client
            .post(self.method_url("sendMessage"))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let status = res.status();
        let text = res.text().await.unwrap_or_default();
        let parsed: Option<SendMessageResponse> = serde_json::from_str(&text).ok();
        match parsed {
            Some(r) if status.is_success() && r.ok => Ok(()),
            Some(r) => Err(ChannelError::Delivery(format!(
                "sendMessage failed: {} {}",
                status,
                r.description.unwrap_or_default()
            ))),
            None => Err(ChannelError::Delivery(format!("sendMessage failed: {} {}", status, text))),
        }
    }

    /// Send a text message, split into chunks; each chunk tries HTML first, then plain text.
    async fn send_message(&self, chat_id: &str, text: &str) -> Result<(), ChannelError> {
        for chunk in chunk_text(text, MAX_CHUNK) {
            if let Err(e) = self.send_chunk(chat_id, &chunk, true).await {
                if matches!(e, ChannelError::Transport(_)) {
                    return Err(e);
                }
                log::debug!("telegram: HTML send rejected ({}), retrying as plain text", e);
                self.send_chunk(chat_id, &chunk, false).await?;
            }
        }
        Ok(())
    }
}

/// Split `text` into pieces of at most `max` chars, preferring to break at a newline in the
/// second half of a piece.
pub fn chunk_text(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest: Vec<char> = text.chars().collect();
    while rest.len() > max {
        let window = &rest[..max];
        let split_at = window
            .iter()
            .rposition(|c| *c == '\n')
            .filter(|i| *i >= max / 2)
            .unwrap_or(max);
        chunks.push(rest[..split_at].iter().collect());
        let mut tail = &rest[split_at..];
        while tail.first() == Some(&'\n') {
            tail = &tail[1..];
        }
        rest = tail.to_vec();
    }
    if !rest.is_empty() || chunks.is_empty() {
        chunks.push(rest.into_iter().collect());
    }
    chunks
}

async fn run_get_updates_loop(inner: Arc<Inner>, bus: Arc<MessageBus>, mut stop_rx: watch::Receiver<bool>) {
    let mut offset: Option<i64> = None;
    loop {
        if *stop_rx.borrow() {
            break;
        }
        let polled = tokio::select! {
            _ = stop_rx.changed() => break,
            r = inner.get_updates(offset) => r,
        };
        match polled {
            Ok((updates, next)) => {
                offset = next;
                for u in updates {
                    if let Some(inbound) = inner.to_inbound(&u).await {
                        log::debug!("telegram: inbound from chat {}", inbound.chat_id());
                        bus.publish_inbound(inbound);
                    }
                }
            }
            Err(e) => {
                log::debug!("telegram getUpdates error: {}", e);
                tokio::select! {
                    _ = stop_rx.changed() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }
    }
    log::info!("telegram channel: getUpdates loop stopped");
}

#[async_trait]
impl ChannelHandle for TelegramChannel {
    fn name(&self) -> &str {
        TELEGRAM_PLATFORM
    }

    async fn start(&self, bus: Arc<MessageBus>) -> Result<(), ChannelError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.stop_tx.send_replace(false);
        log::info!("telegram channel: starting getUpdates long-poll loop");
        let handle = tokio::spawn(run_get_updates_loop(
            self.inner.clone(),
            bus,
            self.stop_tx.subscribe(),
        ));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.stop_tx.send_replace(true);
        if let Some(handle) = self.task.lock().await.take() {
            let _ = handle.await;
        }
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        if !self.running() {
            return Err(ChannelError::NotStarted(TELEGRAM_PLATFORM.to_string()));
        }
        self.inner.send_message(&msg.chat_id, &msg.content).await
    }
}
