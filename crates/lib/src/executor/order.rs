//! Order files and the on-disk orders tree.
//!
//! ```text
//! <work_dir>/
//!   orders/             {id}.json (pending), {id}.json.processing (claimed)
//!   orders-archive/     {id}-{timestamp}.json (terminal)
//!   orders-corrupted/   unparseable order files
//!   responses/          {id}.md (result artifact)
//!   outbox/             processing-{id}.json, heartbeat-{id}-{elapsed}.json
//! ```
//!
//! An order id is `{session}.{discriminator}`: the session part is derived from the session
//! key, the discriminator is fresh per request. A result written for an earlier request of
//! the same session therefore never answers a later one.
//!
//! Every state transition is a single rename (or an atomic write of a fresh file), so
//! readers never observe a half-written order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Value of the `type` field in every order file.
pub const ORDER_TYPE: &str = "order";
/// Value of the `command` field for free-form chat payloads.
pub const GENERAL_COMMAND: &str = "general";

const PENDING_EXT: &str = ".json";
const CLAIMED_EXT: &str = ".json.processing";
const RESPONSE_EXT: &str = ".md";
/// Separates the session part of an order id from its discriminator. Never produced by the slug.
const DISCRIMINATOR_SEP: char = '.';

/// Session part of every order id for `session_key`: a filename-safe slug plus a short hash,
/// so that distinct keys that slug the same way still get distinct ids.
pub fn session_prefix(session_key: &str) -> String {
    let slug: String = session_key
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .take(64)
        .collect();
    let digest = Sha256::digest(session_key.as_bytes());
    let hash: String = digest.iter().take(4).map(|b| format!("{:02x}", b)).collect();
    format!("{}-{}", slug, hash)
}

/// Fresh order id for one request in `session_key`'s session. Ids of one session sort by
/// creation time.
pub fn new_order_id(session_key: &str) -> String {
    let nonce = uuid::Uuid::new_v4().simple().to_string();
    format!(
        "{}{}{}-{}",
        session_prefix(session_key),
        DISCRIMINATOR_SEP,
        Utc::now().format("%Y%m%dT%H%M%S%6f"),
        &nonce[..8]
    )
}

/// Session part of `order_id`. Ids written without a discriminator are their own session.
pub fn session_of(order_id: &str) -> &str {
    order_id
        .split_once(DISCRIMINATOR_SEP)
        .map_or(order_id, |(session, _)| session)
}

/// The JSON document exchanged with the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    #[serde(rename = "type", default = "default_order_type")]
    pub kind: String,
    /// Originating channel.
    #[serde(default)]
    pub from: String,
    #[serde(default)]
    pub target: String,
    #[serde(default = "default_command")]
    pub command: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub acknowledged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acknowledged_by: Option<String>,
    pub order_id: String,
    #[serde(default)]
    pub session_key: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub chat_id: String,
    #[serde(default)]
    pub sender_id: String,
    /// Terminal outcome recorded on archived orders ("completed", "timeout", "failed", "requeued").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    /// Fields added by other writers; kept so rewriting an order does not drop them.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_order_type() -> String {
    ORDER_TYPE.to_string()
}

fn default_command() -> String {
    GENERAL_COMMAND.to_string()
}

impl Order {
    /// Mark acknowledged by `by`, stamped now.
    pub fn acknowledge(&mut self, by: &str, outcome: &str) {
        self.acknowledged = true;
        self.acknowledged_at = Some(Utc::now());
        self.acknowledged_by = Some(by.to_string());
        self.outcome = Some(outcome.to_string());
    }

    pub fn to_json(&self) -> std::io::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    pub fn from_json(bytes: &[u8]) -> std::io::Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

/// Where an order currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderState {
    Pending,
    Claimed,
    /// No live file: archived, timed out, or never written.
    Absent,
}

/// Paths of the orders tree rooted at the work directory.
#[derive(Debug, Clone)]
pub struct OrdersTree {
    root: PathBuf,
}

impl OrdersTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn orders_dir(&self) -> PathBuf {
        self.root.join("orders")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("orders-archive")
    }

    pub fn corrupted_dir(&self) -> PathBuf {
        self.root.join("orders-corrupted")
    }

    pub fn responses_dir(&self) -> PathBuf {
        self.root.join("responses")
    }

    pub fn outbox_dir(&self) -> PathBuf {
        self.root.join("outbox")
    }

    pub fn pending_path(&self, order_id: &str) -> PathBuf {
        self.orders_dir().join(format!("{}{}", order_id, PENDING_EXT))
    }

    pub fn claimed_path(&self, order_id: &str) -> PathBuf {
        self.orders_dir().join(format!("{}{}", order_id, CLAIMED_EXT))
    }

    pub fn response_path(&self, order_id: &str) -> PathBuf {
        self.responses_dir().join(format!("{}{}", order_id, RESPONSE_EXT))
    }

    pub fn processing_marker(&self, order_id: &str) -> PathBuf {
        self.outbox_dir().join(format!("processing-{}.json", order_id))
    }

    pub fn heartbeat_marker(&self, order_id: &str, elapsed_secs: u64) -> PathBuf {
        self.outbox_dir()
            .join(format!("heartbeat-{}-{}.json", order_id, elapsed_secs))
    }

    /// Fresh archive path; the timestamp suffix keeps every terminal order of a session.
    pub fn archive_path(&self, order_id: &str) -> PathBuf {
        let stamp = Utc::now().format("%Y%m%dT%H%M%S%.6fZ");
        self.archive_dir().join(format!("{}-{}.json", order_id, stamp))
    }

    /// Create every directory of the tree.
    pub async fn ensure_dirs(&self) -> std::io::Result<()> {
        for dir in [
            self.orders_dir(),
            self.archive_dir(),
            self.corrupted_dir(),
            self.responses_dir(),
            self.outbox_dir(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    pub async fn state(&self, order_id: &str) -> OrderState {
        if exists(&self.pending_path(order_id)).await {
            OrderState::Pending
        } else if exists(&self.claimed_path(order_id)).await {
            OrderState::Claimed
        } else {
            OrderState::Absent
        }
    }

    /// Liveness markers currently present for `order_id`.
    pub async fn liveness_markers(&self, order_id: &str) -> Vec<PathBuf> {
        let mut found = Vec::new();
        let processing = self.processing_marker(order_id);
        if exists(&processing).await {
            found.push(processing);
        }
        let prefix = format!("heartbeat-{}-", order_id);
        if let Ok(mut entries) = tokio::fs::read_dir(self.outbox_dir()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                let is_ours = name
                    .strip_prefix(&prefix)
                    .and_then(|rest| rest.strip_suffix(".json"))
                    .map(|elapsed| !elapsed.is_empty() && elapsed.chars().all(|c| c.is_ascii_digit()))
                    .unwrap_or(false);
                if is_ours {
                    found.push(entry.path());
                }
            }
        }
        found
    }

    /// Delete the processing marker and every heartbeat for `order_id`.
    pub async fn clear_liveness(&self, order_id: &str) {
        for path in self.liveness_markers(order_id).await {
            remove_if_exists(&path).await;
        }
    }

    /// Live orders of `session` (as returned by [`session_of`]), with their state.
    pub async fn session_orders(&self, session: &str) -> Vec<(String, OrderState)> {
        let mut found = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(self.orders_dir()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if let Some((id, state)) = order_id_from_file_name(name) {
                    if session_of(id) == session {
                        found.push((id.to_string(), state));
                    }
                }
            }
        }
        found.sort_by(|a, b| a.0.cmp(&b.0));
        found
    }

    /// Result artifacts present for any order of `session`.
    pub async fn session_responses(&self, session: &str) -> Vec<PathBuf> {
        let mut found = Vec::new();
        if let Ok(mut entries) = tokio::fs::read_dir(self.responses_dir()).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let name = entry.file_name();
                let Some(name) = name.to_str() else { continue };
                if name.starts_with('.') {
                    continue;
                }
                if let Some(id) = name.strip_suffix(RESPONSE_EXT) {
                    if session_of(id) == session {
                        found.push(entry.path());
                    }
                }
            }
        }
        found
    }

    /// Archive an order document under a fresh name.
    pub async fn archive(&self, order: &Order) -> std::io::Result<PathBuf> {
        let path = self.archive_path(&order.order_id);
        write_atomic(&path, &order.to_json()?).await?;
        Ok(path)
    }
}

/// Order id encoded in a pending or claimed file name.
pub fn order_id_from_file_name(name: &str) -> Option<(&str, OrderState)> {
    if name.starts_with('.') {
        return None;
    }
    if let Some(id) = name.strip_suffix(CLAIMED_EXT) {
        return Some((id, OrderState::Claimed));
    }
    name.strip_suffix(PENDING_EXT).map(|id| (id, OrderState::Pending))
}

pub(crate) async fn exists(path: &Path) -> bool {
    tokio::fs::metadata(path).await.is_ok()
}

pub(crate) async fn remove_if_exists(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            log::debug!("could not remove {}: {}", path.display(), e);
        }
    }
}

/// Write `bytes` to a hidden temp file beside `path`, then rename it into place.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(parent).await?;
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("file");
    let tmp = parent.join(format!(".{}.tmp-{}", name, uuid::Uuid::new_v4()));
    if let Err(e) = tokio::fs::write(&tmp, bytes).await {
        remove_if_exists(&tmp).await;
        return Err(e);
    }
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        remove_if_exists(&tmp).await;
        return Err(e);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_tree() -> OrdersTree {
        OrdersTree::new(std::env::temp_dir().join(format!("caduceus-orders-{}", uuid::Uuid::new_v4())))
    }

    fn sample(order_id: &str) -> Order {
        Order {
            kind: ORDER_TYPE.to_string(),
            from: "web".to_string(),
            target: "worker".to_string(),
            command: GENERAL_COMMAND.to_string(),
            payload: "hello".to_string(),
            timestamp: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            order_id: order_id.to_string(),
            session_key: "user:1".to_string(),
            channel: "web".to_string(),
            chat_id: "1".to_string(),
            sender_id: "1".to_string(),
            outcome: None,
            extra: serde_json::Map::new(),
        }
    }

    #[test]
    fn session_prefixes_are_stable_and_filename_safe() {
        let a = session_prefix("telegram:42");
        assert_eq!(a, session_prefix("telegram:42"));
        assert!(a.starts_with("telegram-42-"));
        assert!(a.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        // Same slug, different keys.
        assert_ne!(session_prefix("telegram:42"), session_prefix("telegram/42"));
        assert!(!session_prefix("../../etc/passwd").contains('/'));
    }

    #[test]
    fn order_ids_are_unique_per_request_within_a_session() {
        let first = new_order_id("telegram:42");
        let second = new_order_id("telegram:42");
        assert_ne!(first, second);
        assert_eq!(session_of(&first), session_prefix("telegram:42"));
        assert_eq!(session_of(&second), session_prefix("telegram:42"));
        assert!(!first.contains('/'));
        assert_eq!(session_of("legacy-id"), "legacy-id");
    }

    #[test]
    fn file_names_map_to_states() {
        assert_eq!(order_id_from_file_name("abc.json"), Some(("abc", OrderState::Pending)));
        assert_eq!(
            order_id_from_file_name("abc.json.processing"),
            Some(("abc", OrderState::Claimed))
        );
        assert_eq!(order_id_from_file_name(".abc.json.tmp-1"), None);
        assert_eq!(order_id_from_file_name("notes.txt"), None);
    }

    #[test]
    fn unknown_fields_survive_a_rewrite() {
        let json = r#"{"type":"order","payload":"p","timestamp":"2026-01-01T00:00:00Z","order_id":"x","priority":3}"#;
        let order = Order::from_json(json.as_bytes()).expect("parse");
        assert_eq!(order.command, GENERAL_COMMAND);
        assert!(!order.acknowledged);
        let back: serde_json::Value = serde_json::from_slice(&order.to_json().expect("json")).expect("value");
        assert_eq!(back["priority"], 3);
        assert!(back.get("acknowledged_at").is_none());
    }

    #[tokio::test]
    async fn state_and_liveness_markers() {
        let tree = temp_tree();
        tree.ensure_dirs().await.expect("dirs");
        let id = new_order_id("web:1");
        assert_eq!(tree.state(&id).await, OrderState::Absent);

        write_atomic(&tree.pending_path(&id), &sample(&id).to_json().expect("json"))
            .await
            .expect("write");
        assert_eq!(tree.state(&id).await, OrderState::Pending);
        tokio::fs::rename(tree.pending_path(&id), tree.claimed_path(&id))
            .await
            .expect("claim");
        assert_eq!(tree.state(&id).await, OrderState::Claimed);

        write_atomic(&tree.processing_marker(&id), b"{}").await.expect("marker");
        write_atomic(&tree.heartbeat_marker(&id, 60), b"{}").await.expect("hb");
        let other = new_order_id("web:2");
        write_atomic(&tree.heartbeat_marker(&other, 60), b"{}").await.expect("other hb");
        assert_eq!(tree.liveness_markers(&id).await.len(), 2);

        tree.clear_liveness(&id).await;
        assert!(tree.liveness_markers(&id).await.is_empty());
        assert_eq!(tree.liveness_markers(&other).await.len(), 1);

        let entries: Vec<_> = std::fs::read_dir(tree.orders_dir())
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".tmp-"))
            .collect();
        assert!(entries.is_empty(), "temp files left behind");
        let _ = std::fs::remove_dir_all(tree.root());
    }

    #[tokio::test]
    async fn session_listings_only_see_their_session() {
        let tree = temp_tree();
        tree.ensure_dirs().await.expect("dirs");
        let older = new_order_id("web:1");
        let newer = new_order_id("web:1");
        let stranger = new_order_id("web:1:x");
        for id in [&older, &newer, &stranger] {
            write_atomic(&tree.pending_path(id), &sample(id).to_json().expect("json"))
                .await
                .expect("write");
        }
        tokio::fs::rename(tree.pending_path(&older), tree.claimed_path(&older))
            .await
            .expect("claim");
        write_atomic(&tree.response_path(&older), b"late").await.expect("response");
        write_atomic(&tree.response_path(&stranger), b"other").await.expect("response");

        let session = session_prefix("web:1");
        let mut live = tree.session_orders(&session).await;
        live.sort_by_key(|(_, state)| *state == OrderState::Pending);
        assert_eq!(
            live,
            vec![(older.clone(), OrderState::Claimed), (newer, OrderState::Pending)]
        );
        assert_eq!(tree.session_responses(&session).await, vec![tree.response_path(&older)]);
        let _ = std::fs::remove_dir_all(tree.root());
    }
}
