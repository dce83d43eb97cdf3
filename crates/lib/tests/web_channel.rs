//! Integration test: the web channel over real sockets. Login, socket authentication by
//! cookie and by connect frame, takeover of an older connection, and reply delivery.

use caduceus::bus::{MessageBus, OutboundMessage};
use caduceus::channels::{ChannelError, ChannelHandle, WebChannel};
use caduceus::config::WebChannelConfig;
use caduceus::events::EventLog;
use caduceus::identity::{IdentityStore, TokenSigner};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;

type Socket = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

struct Harness {
    dir: PathBuf,
    channel: WebChannel,
    bus: Arc<MessageBus>,
    addr: SocketAddr,
    user_id: String,
}

impl Harness {
    async fn start() -> Self {
        let dir = std::env::temp_dir().join(format!("caduceus-web-test-{}", uuid::Uuid::new_v4()));
        let store = IdentityStore::open_with_params(
            dir.join("users.json"),
            Some(argon2::Params::new(1024, 1, 1, None).expect("params")),
        )
        .await
        .expect("store")
        .with_signer(TokenSigner::new("web-test-secret", chrono::Duration::hours(1)).expect("signer"));
        let user_id = store.create_user("alice", "wonderland").await.expect("create");

        let config = WebChannelConfig {
            enabled: true,
            bind: "127.0.0.1".to_string(),
            port: 0,
            secure_cookies: false,
        };
        let channel = WebChannel::new(&config, store, EventLog::new(dir.join("events.jsonl")));
        let bus = Arc::new(MessageBus::new());
        channel.start(bus.clone()).await.expect("start");
        let addr = channel.local_addr().await.expect("bound");
        Self {
            dir,
            channel,
            bus,
            addr,
            user_id,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn login(&self, password: &str) -> reqwest::Response {
        reqwest::Client::new()
            .post(self.url("/login"))
            .json(&serde_json::json!({ "username": "alice", "password": password }))
            .send()
            .await
            .expect("login request")
    }

    async fn token(&self) -> String {
        let res = self.login("wonderland").await;
        assert!(res.status().is_success());
        let body: serde_json::Value = res.json().await.expect("json");
        body["token"].as_str().expect("token").to_string()
    }

    async fn connect(&self, cookie: Option<&str>) -> Socket {
        let mut req = format!("ws://{}/ws", self.addr)
            .into_client_request()
            .expect("request");
        if let Some(token) = cookie {
            req.headers_mut().insert(
                "Cookie",
                format!("caduceus_token={}", token).parse().expect("header"),
            );
        }
        let (ws, _) = tokio_tungstenite::connect_async(req).await.expect("connect");
        ws
    }

    async fn stop(self) {
        self.channel.stop().await;
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

async fn next_json(ws: &mut Socket) -> Option<serde_json::Value> {
    let next = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(msg) = ws.next().await {
            match msg {
                Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    })
    .await;
    next.ok().flatten()
}

#[tokio::test]
async fn login_sets_cookie_and_rejects_bad_password() {
    let h = Harness::start().await;

    let bad = h.login("not-it").await;
    assert_eq!(bad.status(), reqwest::StatusCode::UNAUTHORIZED);
    let body: serde_json::Value = bad.json().await.expect("json");
    assert_eq!(body["error"], "Invalid credentials");

    let ok = h.login("wonderland").await;
    assert!(ok.status().is_success());
    let cookie = ok
        .headers()
        .get(reqwest::header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .expect("set-cookie")
        .to_string();
    assert!(cookie.starts_with("caduceus_token="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    let body: serde_json::Value = ok.json().await.expect("json");
    assert_eq!(body["userId"], h.user_id.as_str());
    assert_eq!(body["expiresIn"], 3600);

    let logout = reqwest::get(h.url("/logout")).await.expect("logout");
    let cleared = logout
        .headers()
        .get(reqwest::header::SET_COOKIE)
        .and_then(|v| v.to_str().ok())
        .expect("set-cookie")
        .to_string();
    assert!(cleared.contains("Max-Age=0"));

    let events = std::fs::read_to_string(h.dir.join("events.jsonl")).expect("events");
    assert!(events.contains("web_login_failed"));
    assert!(events.contains("web_login_success"));
    h.stop().await;
}

#[tokio::test]
async fn cookie_authenticated_socket_round_trip() {
    let h = Harness::start().await;
    let token = h.token().await;

    let mut ws = h.connect(Some(&token)).await;
    let welcome = next_json(&mut ws).await.expect("welcome");
    assert_eq!(welcome["type"], "system");
    assert_eq!(welcome["content"], "Connected as alice");
    assert_eq!(welcome["chatId"], h.user_id.as_str());

    ws.send(Message::Text(r#"{"type":"message","content":"  deploy it  "}"#.to_string()))
        .await
        .expect("send");
    let inbound = tokio::time::timeout(Duration::from_secs(5), h.bus.consume_inbound())
        .await
        .expect("inbound in time")
        .expect("inbound");
    assert_eq!(inbound.channel(), "web");
    assert_eq!(inbound.content(), "deploy it");
    assert_eq!(inbound.chat_id(), h.user_id);
    assert_eq!(inbound.session_key(), format!("user:{}", h.user_id));

    h.channel
        .send(&OutboundMessage::reply_to(&inbound, "deployed"))
        .await
        .expect("deliver");
    let reply = next_json(&mut ws).await.expect("reply");
    assert_eq!(reply["type"], "message");
    assert_eq!(reply["content"], "deployed");
    assert!(reply["timestamp"].is_string());

    h.stop().await;
}

#[tokio::test]
async fn connect_frame_authenticates_and_bad_tokens_are_refused() {
    let h = Harness::start().await;

    let mut rejected = h.connect(None).await;
    rejected
        .send(Message::Text(r#"{"type":"connect","token":"forged.token"}"#.to_string()))
        .await
        .expect("send");
    let err = next_json(&mut rejected).await.expect("error frame");
    assert_eq!(err["type"], "error");
    assert_eq!(err["content"], "Unauthorized - please login");
    assert!(next_json(&mut rejected).await.is_none());

    let token = h.token().await;
    let mut ws = h.connect(None).await;
    ws.send(Message::Text(
        serde_json::json!({ "type": "connect", "token": token }).to_string(),
    ))
    .await
    .expect("send");
    let welcome = next_json(&mut ws).await.expect("welcome");
    assert_eq!(welcome["content"], "Connected as alice");
    assert_eq!(h.channel.connection_count().await, 1);

    h.stop().await;
}

#[tokio::test]
async fn newer_connection_takes_over() {
    let h = Harness::start().await;
    let token = h.token().await;

    let mut first = h.connect(Some(&token)).await;
    next_json(&mut first).await.expect("welcome");
    let mut second = h.connect(Some(&token)).await;
    next_json(&mut second).await.expect("welcome");

    let notice = next_json(&mut first).await.expect("replaced notice");
    assert_eq!(notice["type"], "system");
    assert_eq!(notice["content"], "Session replaced by new connection");
    assert!(next_json(&mut first).await.is_none());

    // Replies go to the surviving connection only.
    h.channel
        .send(&OutboundMessage::new("web", h.user_id.clone(), "still here"))
        .await
        .expect("deliver");
    let reply = next_json(&mut second).await.expect("reply");
    assert_eq!(reply["content"], "still here");
    assert_eq!(h.channel.connection_count().await, 1);

    h.stop().await;
}

#[tokio::test]
async fn delivery_to_offline_user_fails() {
    let h = Harness::start().await;
    let err = h
        .channel
        .send(&OutboundMessage::new("web", "nobody", "hello?"))
        .await
        .expect_err("no connection");
    assert!(matches!(err, ChannelError::NotConnected { .. }));
    h.stop().await;
}
