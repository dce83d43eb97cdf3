//! Web socket frames.
//!
//! Client to server: an optional first `{"type":"connect","token":...}` frame (when the
//! upgrade request carried no cookie or bearer token), then `{"type":"message","content":...}`
//! frames. `type` defaults to "message", so `{"content": "..."}` works too.
//!
//! Server to client: `{"type": "system" | "message" | "error", "content", ...}`.

use serde::{Deserialize, Serialize};

/// Frame from the browser.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientFrame {
    #[serde(rename = "type", default = "default_client_type")]
    pub typ: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

fn default_client_type() -> String {
    "message".to_string()
}

impl ClientFrame {
    pub fn is_connect(&self) -> bool {
        self.typ == "connect"
    }
}

/// Frame to the browser.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFrame {
    #[serde(rename = "type")]
    pub typ: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
}

impl ServerFrame {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            typ: "system".to_string(),
            content: content.into(),
            chat_id: None,
            timestamp: None,
        }
    }

    /// Welcome frame sent once the connection is authenticated.
    pub fn welcome(username: &str, chat_id: &str) -> Self {
        Self {
            chat_id: Some(chat_id.to_string()),
            ..Self::system(format!("Connected as {}", username))
        }
    }

    pub fn message(content: impl Into<String>) -> Self {
        Self {
            typ: "message".to_string(),
            content: content.into(),
            chat_id: None,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            typ: "error".to_string(),
            content: content.into(),
            chat_id: None,
            timestamp: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"type":"error","content":"encoding failed"}"#.to_string())
    }
}

/// System text sent to a connection that was taken over.
pub const SESSION_REPLACED: &str = "Session replaced by new connection";
/// Error text for unauthenticated sockets.
pub const UNAUTHORIZED: &str = "Unauthorized - please login";

/// POST /login body.
#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// POST /login success body.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub token: String,
    pub user_id: String,
    pub username: String,
    pub expires_in: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_frames_default_to_message() {
        let f: ClientFrame = serde_json::from_str(r#"{"content":"hi"}"#).expect("frame");
        assert!(!f.is_connect());
        assert_eq!(f.content.as_deref(), Some("hi"));
        let c: ClientFrame = serde_json::from_str(r#"{"type":"connect","token":"abc"}"#).expect("frame");
        assert!(c.is_connect());
        assert_eq!(c.token.as_deref(), Some("abc"));
    }

    #[test]
    fn welcome_frame_shape() {
        let v: serde_json::Value = serde_json::from_str(&ServerFrame::welcome("alice", "u-1").to_json()).expect("json");
        assert_eq!(v["type"], "system");
        assert_eq!(v["content"], "Connected as alice");
        assert_eq!(v["chatId"], "u-1");
        assert!(v.get("timestamp").is_none());
    }
}
