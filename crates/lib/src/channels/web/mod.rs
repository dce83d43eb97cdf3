//! Web channel: login endpoint plus an authenticated WebSocket chat.
//!
//! Routes: `GET /` (health), `POST /login`, `GET /logout`, `GET /ws`. A socket is
//! authenticated by the `caduceus_token` cookie or an `Authorization: Bearer` header on the
//! upgrade request, or else by a `connect` frame sent first. The chat id of a web
//! conversation is the user id, so each user has at most one live socket: a new one takes
//! over and the old one is closed with a system frame.

mod connections;
pub mod protocol;

pub use connections::{Connection, ConnectionTable, Outgoing};
pub use protocol::{ClientFrame, LoginRequest, LoginResponse, ServerFrame};

use super::{ChannelError, ChannelHandle};
use crate::bus::{InboundMessage, MessageBus, OutboundMessage};
use crate::config::WebChannelConfig;
use crate::events::EventLog;
use crate::identity::{IdentityError, IdentityStore};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        ConnectInfo, State,
    },
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

pub const WEB_CHANNEL: &str = "web";
pub const TOKEN_COOKIE: &str = "caduceus_token";
/// How long an unauthenticated socket may take to send its connect frame.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SERVER_STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct WebInner {
    bind: String,
    port: u16,
    secure_cookies: bool,
    identity: IdentityStore,
    events: EventLog,
    connections: ConnectionTable,
}

#[derive(Clone)]
struct WebState {
    inner: Arc<WebInner>,
    bus: Arc<MessageBus>,
    shutdown: watch::Receiver<bool>,
}

/// Web channel connector. Owns its HTTP listener.
pub struct WebChannel {
    inner: Arc<WebInner>,
    running: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl WebChannel {
    pub fn new(config: &WebChannelConfig, identity: IdentityStore, events: EventLog) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: Arc::new(WebInner {
                bind: config.bind.trim().to_string(),
                port: config.port,
                secure_cookies: config.secure_cookies,
                identity,
                events,
                connections: ConnectionTable::new(),
            }),
            running: AtomicBool::new(false),
            shutdown_tx,
            task: Mutex::new(None),
            local_addr: Mutex::new(None),
        }
    }

    /// Address the listener is bound to (useful with port 0).
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().await
    }

    /// Number of live sockets.
    pub async fn connection_count(&self) -> usize {
        self.inner.connections.len().await
    }
}

fn router(state: WebState) -> Router {
    Router::new()
        .route("/", get(health_http))
        .route("/login", post(login))
        .route("/logout", get(logout))
        .route("/ws", get(ws_handler))
        .with_state(state)
}

#[async_trait]
impl ChannelHandle for WebChannel {
    fn name(&self) -> &str {
        WEB_CHANNEL
    }

    async fn start(&self, bus: Arc<MessageBus>) -> Result<(), ChannelError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let bind_addr = format!("{}:{}", self.inner.bind, self.inner.port);
        let listener = match tokio::net::TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(ChannelError::Transport(format!("binding to {}: {}", bind_addr, e)));
            }
        };
        let addr = listener.local_addr().ok();
        *self.local_addr.lock().await = addr;
        self.shutdown_tx.send_replace(false);

        let state = WebState {
            inner: self.inner.clone(),
            bus,
            shutdown: self.shutdown_tx.subscribe(),
        };
        let mut shutdown = self.shutdown_tx.subscribe();
        let app = router(state).into_make_service_with_connect_info::<SocketAddr>();
        let handle = tokio::spawn(async move {
            let result = axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    while !*shutdown.borrow() {
                        if shutdown.changed().await.is_err() {
                            break;
                        }
                    }
                })
                .await;
            if let Err(e) = result {
                log::error!("web channel server exited: {}", e);
            }
        });
        *self.task.lock().await = Some(handle);
        log::info!(
            "web channel listening on {}",
            addr.map(|a| a.to_string()).unwrap_or(bind_addr)
        );
        Ok(())
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown_tx.send_replace(true);
        if let Some(mut handle) = self.task.lock().await.take() {
            if tokio::time::timeout(SERVER_STOP_TIMEOUT, &mut handle).await.is_err() {
                log::warn!("web channel server did not stop in time; aborting");
                handle.abort();
            }
        }
        *self.local_addr.lock().await = None;
        log::info!("web channel stopped");
    }

    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        if !self.running.load(Ordering::SeqCst) {
            return Err(ChannelError::NotStarted(WEB_CHANNEL.to_string()));
        }
        if self
            .inner
            .connections
            .send(&msg.chat_id, ServerFrame::message(msg.content.clone()))
            .await
        {
            Ok(())
        } else {
            Err(ChannelError::NotConnected {
                channel: WEB_CHANNEL.to_string(),
                chat_id: msg.chat_id.clone(),
            })
        }
    }
}

/// Token from the `caduceus_token` cookie or an `Authorization: Bearer` header.
fn request_token(headers: &HeaderMap) -> Option<String> {
    let from_cookie = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == TOKEN_COOKIE)
        .map(|(_, value)| value.trim().to_string());
    from_cookie
        .or_else(|| {
            headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(|t| t.trim().to_string())
        })
        .filter(|t| !t.is_empty())
}

fn token_cookie(value: &str, max_age: i64, secure: bool) -> String {
    let mut cookie = format!(
        "{}={}; Path=/; Max-Age={}; HttpOnly; SameSite=Lax",
        TOKEN_COOKIE, value, max_age
    );
    if secure {
        cookie.push_str("; Secure");
    }
    cookie
}

/// Authenticated user for a socket: (user id, username).
async fn authenticate(inner: &WebInner, token: &str) -> Option<(String, String)> {
    match inner.identity.verify_token(token).await {
        Ok(user_id) => match inner.identity.get_user(&user_id).await {
            Ok(Some(user)) => Some((user.user_id, user.username)),
            _ => None,
        },
        Err(e) => {
            log::debug!("web: token rejected: {}", e);
            None
        }
    }
}

/// GET / returns a simple health JSON (for health checks).
async fn health_http(State(state): State<WebState>) -> Json<serde_json::Value> {
    let connections = state.inner.connections.len().await;
    Json(json!({
        "status": "ok",
        "channel": WEB_CHANNEL,
        "connections": connections,
    }))
}

/// POST /login: JSON credentials in, token out (body and HttpOnly cookie).
async fn login(
    State(state): State<WebState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(req): Json<LoginRequest>,
) -> Response {
    let inner = &state.inner;
    let username = req.username.trim().to_string();
    let user_id = match inner.identity.verify_credentials(&username, &req.password).await {
        Ok(id) => id,
        Err(e) => {
            if !matches!(e, IdentityError::Auth) {
                log::error!("web login for {} failed: {}", username, e);
            }
            inner
                .events
                .record(
                    "web_login_failed",
                    json!({ "username": username, "remote": remote.to_string() }),
                )
                .await;
            return (StatusCode::UNAUTHORIZED, Json(json!({ "error": "Invalid credentials" }))).into_response();
        }
    };
    let token = match inner.identity.issue_token(&user_id).await {
        Ok(t) => t,
        Err(e) => {
            log::error!("web login: issuing token failed: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "authentication unavailable" })),
            )
                .into_response();
        }
    };
    inner
        .events
        .record(
            "web_login_success",
            json!({ "userId": user_id, "username": username, "remote": remote.to_string() }),
        )
        .await;

    let expires_in = inner.identity.token_ttl().map(|d| d.num_seconds()).unwrap_or(0);
    let cookie = token_cookie(&token, expires_in, inner.secure_cookies);
    let body = LoginResponse {
        token,
        user_id,
        username,
        expires_in,
    };
    let mut response = Json(body).into_response();
    match HeaderValue::from_str(&cookie) {
        Ok(v) => {
            response.headers_mut().insert(header::SET_COOKIE, v);
        }
        Err(e) => log::warn!("web login: cookie header rejected: {}", e),
    }
    response
}

/// GET /logout clears the token cookie.
async fn logout(State(state): State<WebState>) -> Response {
    let mut response = Json(json!({ "ok": true })).into_response();
    if let Ok(v) = HeaderValue::from_str(&token_cookie("", 0, state.inner.secure_cookies)) {
        response.headers_mut().insert(header::SET_COOKIE, v);
    }
    response
}

/// GET /ws upgrades to WebSocket.
async fn ws_handler(
    State(state): State<WebState>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = request_token(&headers);
    ws.on_upgrade(move |socket| handle_socket(socket, state, token, remote))
}

async fn send_frame(socket: &mut WebSocket, frame: &ServerFrame) -> bool {
    socket.send(Message::Text(frame.to_json())).await.is_ok()
}

/// Wait for the first frame and authenticate it as `{"type":"connect","token":...}`.
async fn connect_frame_token(socket: &mut WebSocket) -> Option<String> {
    let first = tokio::time::timeout(CONNECT_TIMEOUT, async {
        loop {
            match socket.recv().await {
                Some(Ok(Message::Text(text))) => return Some(text),
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return None,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await
    .ok()
    .flatten()?;
    let frame: ClientFrame = serde_json::from_str(&first).ok()?;
    if !frame.is_connect() {
        return None;
    }
    frame.token.filter(|t| !t.trim().is_empty())
}

async fn handle_socket(mut socket: WebSocket, state: WebState, header_token: Option<String>, remote: SocketAddr) {
    let inner = state.inner.clone();
    let token = match header_token {
        Some(t) => Some(t),
        None => connect_frame_token(&mut socket).await,
    };
    let user = match token {
        Some(ref t) => authenticate(&inner, t).await,
        None => None,
    };
    let Some((user_id, username)) = user else {
        log::warn!("web: socket auth failed for {}", remote);
        inner
            .events
            .record("web_ws_auth_failed", json!({ "remote": remote.to_string() }))
            .await;
        let _ = send_frame(&mut socket, &ServerFrame::error(protocol::UNAUTHORIZED)).await;
        let _ = socket.send(Message::Close(None)).await;
        return;
    };
    let chat_id = user_id.clone();

    let (conn, mut rx) = Connection::new();
    let conn_id = conn.conn_id;
    if inner.connections.register(&chat_id, conn).await {
        log::info!("web: {} reconnected; closing previous socket", username);
        inner
            .events
            .record(
                "web_ws_replaced",
                json!({ "userId": user_id, "username": username, "remote": remote.to_string() }),
            )
            .await;
    }
    inner
        .events
        .record(
            "web_ws_connected",
            json!({ "userId": user_id, "username": username, "remote": remote.to_string() }),
        )
        .await;
    log::info!("web: {} connected from {}", username, remote);

    let mut shutdown = state.shutdown.clone();
    if send_frame(&mut socket, &ServerFrame::welcome(&username, &chat_id)).await {
        loop {
            tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    let _ = send_frame(&mut socket, &ServerFrame::system("Server shutting down")).await;
                    let _ = socket.send(Message::Close(None)).await;
                    break;
                }
                out = rx.recv() => {
                    match out {
                        Some(Outgoing::Frame(frame)) => {
                            if !send_frame(&mut socket, &frame).await {
                                break;
                            }
                        }
                        Some(Outgoing::Replaced) | None => {
                            let _ = send_frame(&mut socket, &ServerFrame::system(protocol::SESSION_REPLACED)).await;
                            let _ = socket.send(Message::Close(None)).await;
                            break;
                        }
                    }
                }
                msg = socket.recv() => {
                    let Some(Ok(msg)) = msg else { break };
                    let text = match msg {
                        Message::Text(text) => text,
                        Message::Close(_) => break,
                        _ => continue,
                    };
                    let frame: ClientFrame = match serde_json::from_str(&text) {
                        Ok(f) => f,
                        Err(_) => {
                            let _ = send_frame(&mut socket, &ServerFrame::error("invalid frame")).await;
                            continue;
                        }
                    };
                    if frame.is_connect() {
                        continue;
                    }
                    let content = frame.content.unwrap_or_default();
                    let content = content.trim();
                    if content.is_empty() {
                        continue;
                    }
                    let inbound = InboundMessage::new(WEB_CHANNEL, user_id.clone(), chat_id.clone(), content, Some(user_id.clone()))
                        .with_metadata("username", username.as_str());
                    state.bus.publish_inbound(inbound);
                }
            }
        }
    }

    inner.connections.unregister(&chat_id, conn_id).await;
    inner
        .events
        .record("web_ws_disconnected", json!({ "userId": user_id, "username": username }))
        .await;
    log::info!("web: {} disconnected", username);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_from_cookie_or_bearer() {
        let mut headers = HeaderMap::new();
        assert_eq!(request_token(&headers), None);

        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer abc.def"));
        assert_eq!(request_token(&headers).as_deref(), Some("abc.def"));

        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; caduceus_token=tok.sig; other=1"),
        );
        assert_eq!(request_token(&headers).as_deref(), Some("tok.sig"));
    }

    #[test]
    fn cookie_attributes() {
        let c = token_cookie("t", 86400, false);
        assert!(c.starts_with("caduceus_token=t;"));
        assert!(c.contains("HttpOnly"));
        assert!(c.contains("SameSite=Lax"));
        assert!(c.contains("Max-Age=86400"));
        assert!(!c.contains("Secure"));
        assert!(token_cookie("t", 1, true).ends_with("; Secure"));
    }
}
