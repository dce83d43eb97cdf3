//! Gateway construction, run loop and graceful shutdown.

use crate::bus::{MessageBus, OutboundMessage};
use crate::channels::{ChannelHandle, ChannelRegistry, TelegramChannel, WebChannel};
use crate::config::{self, Config};
use crate::events::EventLog;
use crate::executor::{self, Backend, Executor, FsBridgeExecutor};
use crate::identity::{IdentityStore, TokenSigner};
use crate::session::SessionStore;
use anyhow::{Context, Result};
use serde_json::json;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;

/// Reply for messages still queued when the executor loop stops.
const SHUTTING_DOWN_NOTICE: &str = "The gateway is shutting down; your message was not processed. Please resend it later.";

/// Shared state for the gateway (bus, channels, executor, sessions).
pub struct Gateway {
    bus: Arc<MessageBus>,
    channels: ChannelRegistry,
    executor: Arc<dyn Executor>,
    sessions: SessionStore,
    events: EventLog,
}

impl Gateway {
    /// Gateway around `executor` with no channels yet.
    pub fn new(executor: Arc<dyn Executor>) -> Self {
        Self {
            bus: Arc::new(MessageBus::new()),
            channels: ChannelRegistry::new(),
            executor,
            sessions: SessionStore::new(),
            events: EventLog::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    pub async fn add_channel(&self, handle: Arc<dyn ChannelHandle>) {
        self.channels.register(handle).await;
    }

    pub fn bus(&self) -> Arc<MessageBus> {
        self.bus.clone()
    }

    pub fn channels(&self) -> &ChannelRegistry {
        &self.channels
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn executor_name(&self) -> &str {
        self.executor.name()
    }

    /// Build everything the config enables: identity store, filesystem executor, Telegram
    /// (when a bot token resolves) and the web channel (when enabled).
    pub async fn from_config(config: &Config, config_path: &Path) -> Result<Self> {
        let work_dir = config::resolve_work_dir(config, config_path);
        let store_path = config::resolve_store_path(config, config_path);
        let events = EventLog::in_work_dir(&work_dir);

        let mut identity = IdentityStore::open(&store_path)
            .await
            .with_context(|| format!("opening identity store {}", store_path.display()))?;
        let secret = config::resolve_auth_secret(config);
        if let Some(ref secret) = secret {
            let ttl = config::resolve_token_ttl(config)?;
            let signer = TokenSigner::new(secret, ttl).context("configuring token signer")?;
            identity = identity.with_signer(signer);
        }

        let bridge = FsBridgeExecutor::new(&work_dir, &config.executor).with_events(events.clone());
        bridge
            .tree()
            .ensure_dirs()
            .await
            .with_context(|| format!("creating orders tree under {}", work_dir.display()))?;
        log::info!("orders tree at {}", work_dir.display());

        let gateway = Self::new(Arc::new(Backend::FsBridge(bridge))).with_events(events.clone());

        if let Some(token) = config::resolve_telegram_token(config) {
            let tg = &config.channels.telegram;
            if tg.authorized_users.is_empty() {
                log::warn!("telegram: authorizedUsers is empty; only linked identities can send orders");
            }
            let telegram = TelegramChannel::new(
                token,
                config::resolve_telegram_api_base(config),
                tg.authorized_users.iter().copied(),
                Some(identity.clone()),
            );
            gateway.add_channel(Arc::new(telegram)).await;
        }

        let web = &config.channels.web;
        if web.enabled {
            if secret.is_none() {
                anyhow::bail!(
                    "web channel needs a token secret (set auth.secret or CADUCEUS_AUTH_SECRET)"
                );
            }
            if !is_loopback_bind(&web.bind) && !web.secure_cookies {
                log::warn!(
                    "web channel bound to {} without secureCookies; tokens travel in clear text unless TLS terminates in front",
                    web.bind
                );
            }
            gateway
                .add_channel(Arc::new(WebChannel::new(web, identity.clone(), events)))
                .await;
        }

        if gateway.channels.names().await.is_empty() {
            anyhow::bail!(
                "no channels enabled (set channels.telegram.botToken / TELEGRAM_BOT_TOKEN or channels.web.enabled)"
            );
        }
        Ok(gateway)
    }

    /// Run until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Start channels and loops, run until `shutdown` completes, then stop in order: inbound
    /// intake (new messages get a notice), executor loop (in-flight work finishes),
    /// dispatcher (queued replies are delivered), channels.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let names = self.channels.names().await;
        let failed = self.channels.start_all(self.bus.clone()).await;
        if !names.is_empty() && failed.len() == names.len() {
            self.channels.stop_all().await;
            anyhow::bail!("no channel could be started ({})", failed.join(", "));
        }
        log::info!(
            "gateway running: channels [{}], executor {}",
            names.join(", "),
            self.executor.name()
        );
        self.events
            .record(
                "gateway_started",
                json!({ "channels": names, "failedChannels": failed, "executor": self.executor.name() }),
            )
            .await;

        let (exec_stop_tx, exec_stop_rx) = watch::channel(false);
        let (dispatch_stop_tx, dispatch_stop_rx) = watch::channel(false);
        let exec_task = tokio::spawn(executor_loop(
            self.bus.clone(),
            self.executor.clone(),
            self.sessions.clone(),
            exec_stop_rx,
        ));
        let dispatch_task = tokio::spawn(outbound_dispatcher(
            self.bus.clone(),
            self.channels.clone(),
            dispatch_stop_rx,
        ));

        shutdown.await;
        log::info!("shutdown requested; finishing in-flight work");
        self.bus.close_inbound(SHUTTING_DOWN_NOTICE);

        let _ = exec_stop_tx.send(true);
        if let Err(e) = exec_task.await {
            log::error!("executor loop ended abnormally: {}", e);
        }
        let mut unprocessed = 0usize;
        while let Some(msg) = self.bus.try_consume_inbound().await {
            unprocessed += 1;
            self.bus
                .publish_outbound(OutboundMessage::reply_to(&msg, SHUTTING_DOWN_NOTICE));
        }
        if unprocessed > 0 {
            log::warn!("{} queued message(s) not processed due to shutdown", unprocessed);
        }

        let _ = dispatch_stop_tx.send(true);
        if let Err(e) = dispatch_task.await {
            log::error!("outbound dispatcher ended abnormally: {}", e);
        }

        self.channels.stop_all().await;
        let mut undelivered = 0usize;
        while self.bus.try_consume_outbound().await.is_some() {
            undelivered += 1;
        }
        if undelivered > 0 {
            log::warn!("{} reply(ies) could not be delivered before channels stopped", undelivered);
        }
        self.events
            .record(
                "gateway_stopped",
                json!({ "unprocessed": unprocessed, "undelivered": undelivered }),
            )
            .await;
        log::info!("gateway stopped");
        Ok(())
    }
}

fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "localhost"
        || b.parse::<std::net::IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

/// Sequential: one message at a time, so messages of one chat are executed in arrival order.
async fn executor_loop(
    bus: Arc<MessageBus>,
    executor: Arc<dyn Executor>,
    sessions: SessionStore,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let msg = tokio::select! {
            biased;

            _ = stop.changed() => break,
            msg = bus.consume_inbound() => msg,
        };
        let Some(msg) = msg else { break };
        log::info!(
            "processing [{}:{}] {}",
            msg.channel(),
            msg.chat_id(),
            msg.content().chars().take(80).collect::<String>()
        );
        executor::serve(executor.as_ref(), &sessions, &bus, msg).await;
    }
    log::debug!("executor loop stopped");
}

async fn dispatch(channels: &ChannelRegistry, msg: OutboundMessage) {
    match channels.deliver(&msg).await {
        Ok(()) => log::debug!("dispatched to {}:{}", msg.channel, msg.chat_id),
        Err(e) => log::error!("dispatch to {}:{} failed: {}", msg.channel, msg.chat_id, e),
    }
}

/// Route outbound messages to channels; on stop, deliver whatever is already queued.
async fn outbound_dispatcher(bus: Arc<MessageBus>, channels: ChannelRegistry, mut stop: watch::Receiver<bool>) {
    loop {
        let msg = tokio::select! {
            biased;

            _ = stop.changed() => break,
            msg = bus.consume_outbound() => msg,
        };
        match msg {
            Some(msg) => dispatch(&channels, msg).await,
            None => break,
        }
    }
    while let Some(msg) = bus.try_consume_outbound().await {
        dispatch(&channels, msg).await;
    }
    log::debug!("outbound dispatcher stopped");
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InboundMessage;
    use crate::channels::ChannelError;
    use crate::executor::{ExecResult, OrderRequest};
    use async_trait::async_trait;
    use std::time::Duration;
    use tokio::sync::Mutex;

    struct Upper;

    #[async_trait]
    impl Executor for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        async fn execute(&self, order: &OrderRequest) -> ExecResult {
            tokio::time::sleep(Duration::from_millis(20)).await;
            ExecResult::ok(order.payload.to_uppercase())
        }
    }

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<OutboundMessage>>,
    }

    #[async_trait]
    impl ChannelHandle for Recorder {
        fn name(&self) -> &str {
            "fake"
        }

        async fn start(&self, _bus: Arc<MessageBus>) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn stop(&self) {}

        async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
            self.sent.lock().await.push(msg.clone());
            Ok(())
        }
    }

    #[test]
    fn loopback_binds() {
        assert!(is_loopback_bind("127.0.0.1"));
        assert!(is_loopback_bind("::1"));
        assert!(is_loopback_bind("localhost"));
        assert!(!is_loopback_bind("0.0.0.0"));
    }

    #[tokio::test]
    async fn in_flight_work_finishes_before_shutdown() {
        let gateway = Gateway::new(Arc::new(Upper));
        let recorder = Arc::new(Recorder::default());
        gateway.add_channel(recorder.clone()).await;
        let bus = gateway.bus();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(gateway.run_until(async {
            let _ = rx.await;
        }));

        bus.publish_inbound(InboundMessage::new("fake", "s", "c", "first", None));
        bus.publish_inbound(InboundMessage::new("fake", "s", "c", "second", None));
        tokio::time::sleep(Duration::from_millis(5)).await;
        let _ = tx.send(());
        run.await.expect("join").expect("run");

        let sent = recorder.sent.lock().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].content, "FIRST");
        // The second message was queued when shutdown began: it gets a notice, not silence.
        assert!(sent[1].content == "SECOND" || sent[1].content == SHUTTING_DOWN_NOTICE);
    }

    struct Slow;

    #[async_trait]
    impl Executor for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        async fn execute(&self, order: &OrderRequest) -> ExecResult {
            tokio::time::sleep(Duration::from_millis(200)).await;
            ExecResult::ok(order.payload.to_uppercase())
        }
    }

    #[tokio::test]
    async fn messages_arriving_during_shutdown_get_a_notice() {
        let gateway = Gateway::new(Arc::new(Slow));
        let recorder = Arc::new(Recorder::default());
        gateway.add_channel(recorder.clone()).await;
        let bus = gateway.bus();

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        let run = tokio::spawn(gateway.run_until(async {
            let _ = rx.await;
        }));

        assert!(bus.publish_inbound(InboundMessage::new("fake", "s", "c", "first", None)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let _ = tx.send(());
        for _ in 0..100 {
            if bus.is_inbound_closed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        // "first" is still executing; a message now is refused but answered.
        assert!(!bus.publish_inbound(InboundMessage::new("fake", "s", "c", "late", None)));
        run.await.expect("join").expect("run");

        let sent = recorder.sent.lock().await;
        let contents: Vec<&str> = sent.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec![SHUTTING_DOWN_NOTICE, "FIRST"]);
    }

    #[tokio::test]
    async fn gateway_without_startable_channels_fails() {
        struct Broken;

        #[async_trait]
        impl ChannelHandle for Broken {
            fn name(&self) -> &str {
                "broken"
            }

            async fn start(&self, _bus: Arc<MessageBus>) -> Result<(), ChannelError> {
                Err(ChannelError::Transport("port in use".to_string()))
            }

            async fn stop(&self) {}

            async fn send(&self, _msg: &OutboundMessage) -> Result<(), ChannelError> {
                Ok(())
            }
        }

        let gateway = Gateway::new(Arc::new(Upper));
        gateway.add_channel(Arc::new(Broken)).await;
        assert!(gateway.run_until(std::future::pending::<()>()).await.is_err());
    }
}
