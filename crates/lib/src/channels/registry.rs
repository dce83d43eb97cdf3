//! Channel registry: register and look up channels by name.

use super::ChannelError;
use crate::bus::{MessageBus, OutboundMessage};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Handle to a channel connector.
#[async_trait]
pub trait ChannelHandle: Send + Sync {
    /// Channel name (e.g. "telegram"); outbound messages are routed by it.
    fn name(&self) -> &str;

    /// Begin listening and publishing inbound messages to `bus`. Calling it on a running channel does nothing.
    async fn start(&self, bus: Arc<MessageBus>) -> Result<(), ChannelError>;

    /// Disconnect and stop background tasks. Safe to call more than once.
    async fn stop(&self);

    /// Deliver one message to `msg.chat_id`.
    async fn send(&self, msg: &OutboundMessage) -> Result<(), ChannelError>;
}

/// Registry of channel names to handles. Shared across the gateway.
#[derive(Clone)]
pub struct ChannelRegistry {
    inner: Arc<RwLock<HashMap<String, Arc<dyn ChannelHandle>>>>,
}

impl Default for ChannelRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register under the handle's name, stopping any channel it replaces.
    pub async fn register(&self, handle: Arc<dyn ChannelHandle>) {
        let old = {
            let mut g = self.inner.write().await;
            g.insert(handle.name().to_string(), handle)
        };
        if let Some(old) = old {
            old.stop().await;
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn ChannelHandle>> {
        let g = self.inner.read().await;
        g.get(name).cloned()
    }

    pub async fn names(&self) -> Vec<String> {
        let g = self.inner.read().await;
        let mut names: Vec<String> = g.keys().cloned().collect();
        names.sort();
        names
    }

    /// Start every channel. Returns the names that failed to start.
    pub async fn start_all(&self, bus: Arc<MessageBus>) -> Vec<String> {
        let handles: Vec<_> = self.inner.read().await.values().cloned().collect();
        let mut failed = Vec::new();
        for h in handles {
            match h.start(bus.clone()).await {
                Ok(()) => log::info!("channel {} started", h.name()),
                Err(e) => {
                    log::error!("channel {} failed to start: {}", h.name(), e);
                    failed.push(h.name().to_string());
                }
            }
        }
        failed
    }

    pub async fn stop_all(&self) {
        let handles: Vec<_> = self.inner.read().await.values().cloned().collect();
        for h in handles {
            h.stop().await;
            log::info!("channel {} stopped", h.name());
        }
    }

    /// Route a message to its channel.
    pub async fn deliver(&self, msg: &OutboundMessage) -> Result<(), ChannelError> {
        let handle = self
            .get(&msg.channel)
            .await
            .ok_or_else(|| ChannelError::NotStarted(msg.channel.clone()))?;
        handle.send(msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        name: String,
        stops: AtomicUsize,
        sent: AtomicUsize,
    }

    impl Counting {
        fn new(name: &str) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                stops: AtomicUsize::new(0),
                sent: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl ChannelHandle for Counting {
        fn name(&self) -> &str {
            &self.name
        }

        async fn start(&self, _bus: Arc<MessageBus>) -> Result<(), ChannelError> {
            Ok(())
        }

        async fn stop(&self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }

        async fn send(&self, _msg: &OutboundMessage) -> Result<(), ChannelError> {
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn replacing_a_channel_stops_the_old_one() {
        let reg = ChannelRegistry::new();
        let first = Counting::new("web");
        reg.register(first.clone()).await;
        reg.register(Counting::new("web")).await;
        assert_eq!(first.stops.load(Ordering::SeqCst), 1);
        assert_eq!(reg.names().await, vec!["web".to_string()]);
    }

    #[tokio::test]
    async fn deliver_routes_by_channel_name() {
        let reg = ChannelRegistry::new();
        let web = Counting::new("web");
        reg.register(web.clone()).await;
        reg.deliver(&OutboundMessage::new("web", "c", "hi")).await.expect("deliver");
        assert_eq!(web.sent.load(Ordering::SeqCst), 1);
        assert_eq!(
            reg.deliver(&OutboundMessage::new("sms", "c", "hi")).await,
            Err(ChannelError::NotStarted("sms".to_string()))
        );
    }
}
