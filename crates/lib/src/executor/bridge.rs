//! Filesystem bridge executor: hands orders to an external worker through the orders tree.
//!
//! One call to [`FsBridgeExecutor::execute`] writes the order, announces it in the outbox,
//! then polls for `responses/{id}.md` until it appears or the timeout passes. The executor
//! never deletes a claimed order; a claim that outlives its wait is left for the operator.
//! Its late result is discarded when the session's next order is written.

use super::order::{
    remove_if_exists, session_of, write_atomic, Order, OrderState, OrdersTree, GENERAL_COMMAND,
    ORDER_TYPE,
};
use super::{ExecError, ExecResult, Executor, OrderRequest};
use crate::config::ExecutorConfig;
use crate::events::EventLog;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::time::Instant;

/// `acknowledged_by` used when the gateway closes an order the worker left behind.
const GATEWAY_ACK: &str = "gateway";
/// Target recorded in written orders.
const WORKER_TARGET: &str = "worker";
const PREVIEW_CHARS: usize = 80;

pub struct FsBridgeExecutor {
    tree: OrdersTree,
    timeout: Duration,
    poll_interval: Duration,
    heartbeat_interval: Duration,
    events: EventLog,
}

impl FsBridgeExecutor {
    pub fn new(work_dir: impl AsRef<Path>, config: &ExecutorConfig) -> Self {
        Self {
            tree: OrdersTree::new(work_dir.as_ref()),
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
            heartbeat_interval: config.heartbeat_interval(),
            events: EventLog::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventLog) -> Self {
        self.events = events;
        self
    }

    /// Override the configured timeout (whole seconds in config).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tree(&self) -> &OrdersTree {
        &self.tree
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    async fn write_order(&self, req: &OrderRequest) -> std::io::Result<()> {
        self.tree.ensure_dirs().await?;
        let session = session_of(&req.order_id);
        for path in self.tree.session_responses(session).await {
            log::info!("discarding late result {}", path.display());
            remove_if_exists(&path).await;
        }
        // Last write wins: an earlier order of the session still waiting is dropped.
        for (id, state) in self.tree.session_orders(session).await {
            if state == OrderState::Pending && id != req.order_id {
                match self.archive_pending(&id, "superseded").await {
                    Ok(true) => log::info!("order {} superseded by {}", id, req.order_id),
                    Ok(false) => {}
                    Err(e) => log::warn!("could not supersede order {}: {}", id, e),
                }
            }
        }
        let order = Order {
            kind: ORDER_TYPE.to_string(),
            from: req.channel.clone(),
            target: WORKER_TARGET.to_string(),
            command: GENERAL_COMMAND.to_string(),
            payload: req.payload.clone(),
            timestamp: req.created_at,
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            order_id: req.order_id.clone(),
            session_key: req.session_key.clone(),
            channel: req.channel.clone(),
            chat_id: req.chat_id.clone(),
            sender_id: req.sender_id.clone(),
            outcome: None,
            extra: serde_json::Map::new(),
        };
        write_atomic(&self.tree.pending_path(&req.order_id), &order.to_json()?).await
    }

    async fn write_notification(&self, path: &Path, req: &OrderRequest, message: String, elapsed: u64) {
        let body = json!({
            "type": "notification",
            "severity": "info",
            "order_id": req.order_id,
            "channel": req.channel,
            "chat_id": req.chat_id,
            "message": message,
            "elapsed_secs": elapsed,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let bytes = match serde_json::to_vec_pretty(&body) {
            Ok(b) => b,
            Err(_) => return,
        };
        if let Err(e) = write_atomic(path, &bytes).await {
            log::debug!("liveness marker {} not written: {}", path.display(), e);
        }
    }

    /// Close out the order after a result arrived: archive whatever the worker did not.
    async fn finish_completed(&self, order_id: &str) {
        for path in [self.tree.pending_path(order_id), self.tree.claimed_path(order_id)] {
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                Err(_) => continue,
            };
            match Order::from_json(&bytes) {
                Ok(mut order) => {
                    order.acknowledge(GATEWAY_ACK, "completed");
                    if let Err(e) = self.tree.archive(&order).await {
                        log::warn!("archiving completed order {} failed: {}", order_id, e);
                        continue;
                    }
                }
                Err(e) => log::warn!("completed order {} unreadable, discarding: {}", order_id, e),
            }
            remove_if_exists(&path).await;
        }
    }

    /// Move a pending order to the archive tagged with `outcome`. False if it was not pending.
    async fn archive_pending(&self, order_id: &str, outcome: &str) -> std::io::Result<bool> {
        let pending = self.tree.pending_path(order_id);
        let archived = self.tree.archive_path(order_id);
        match tokio::fs::rename(&pending, &archived).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e),
        }
        // Rename first so a worker cannot claim it mid-archive; then tag the copy.
        if let Ok(bytes) = tokio::fs::read(&archived).await {
            if let Ok(mut order) = Order::from_json(&bytes) {
                order.outcome = Some(outcome.to_string());
                if let Ok(json) = order.to_json() {
                    if let Err(e) = write_atomic(&archived, &json).await {
                        log::debug!("tagging {} order {} failed: {}", outcome, order_id, e);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Timeout: move a still-pending order to the archive; leave a claimed one in place.
    async fn expire(&self, order_id: &str) {
        match self.archive_pending(order_id, "timeout").await {
            Ok(true) => {}
            Ok(false) => {
                if self.tree.state(order_id).await == OrderState::Claimed {
                    log::warn!(
                        "order {} is still claimed after timeout; the worker may have died (see `caduceus orders orphans`)",
                        order_id
                    );
                }
            }
            Err(e) => log::warn!("could not archive timed-out order {}: {}", order_id, e),
        }
        self.tree.clear_liveness(order_id).await;
    }
}

fn preview(text: &str) -> String {
    let mut s: String = text.chars().take(PREVIEW_CHARS).collect();
    if text.chars().count() > PREVIEW_CHARS {
        s.push('…');
    }
    s
}

#[async_trait]
impl Executor for FsBridgeExecutor {
    fn name(&self) -> &str {
        "fs-bridge"
    }

    async fn execute(&self, req: &OrderRequest) -> ExecResult {
        if req.payload.trim().is_empty() {
            return ExecResult::failed(ExecError::EmptyPayload);
        }
        let order_id = req.order_id.as_str();

        if let Err(e) = self.write_order(req).await {
            log::error!("writing order {} failed: {}", order_id, e);
            self.events
                .record("order_failed", json!({ "orderId": order_id, "error": e.to_string() }))
                .await;
            return ExecResult::failed(ExecError::Io(e.to_string()));
        }
        log::info!("order {} written ({})", order_id, preview(&req.payload));
        self.events
            .record(
                "order_written",
                json!({ "orderId": order_id, "sessionKey": req.session_key, "channel": req.channel }),
            )
            .await;
        self.write_notification(
            &self.tree.processing_marker(order_id),
            req,
            format!("Processing your order...\n\n{}", preview(&req.payload)),
            0,
        )
        .await;

        let response_path = self.tree.response_path(order_id);
        let started = Instant::now();
        let mut last_heartbeat = started;
        loop {
            match tokio::fs::read_to_string(&response_path).await {
                Ok(text) => {
                    remove_if_exists(&response_path).await;
                    self.tree.clear_liveness(order_id).await;
                    self.finish_completed(order_id).await;
                    let elapsed = started.elapsed().as_secs();
                    log::info!("order {} completed after {}s", order_id, elapsed);
                    self.events
                        .record("order_completed", json!({ "orderId": order_id, "elapsedSecs": elapsed }))
                        .await;
                    return ExecResult::ok(text);
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    log::error!("reading result for order {} failed: {}", order_id, e);
                    self.tree.clear_liveness(order_id).await;
                    self.events
                        .record("order_failed", json!({ "orderId": order_id, "error": e.to_string() }))
                        .await;
                    return ExecResult::failed(ExecError::Io(e.to_string()));
                }
            }

            let elapsed = started.elapsed();
            if elapsed >= self.timeout {
                break;
            }
            if !self.heartbeat_interval.is_zero()
                && elapsed >= self.heartbeat_interval
                && last_heartbeat.elapsed() >= self.heartbeat_interval
            {
                let secs = elapsed.as_secs();
                self.write_notification(
                    &self.tree.heartbeat_marker(order_id, secs),
                    req,
                    format!("Still working... ({}m elapsed)\n\n{}", secs / 60, preview(&req.payload)),
                    secs,
                )
                .await;
                last_heartbeat = Instant::now();
            }
            tokio::time::sleep(self.poll_interval.min(self.timeout - elapsed)).await;
        }

        log::warn!("order {} timed out after {}s", order_id, self.timeout.as_secs());
        self.expire(order_id).await;
        self.events
            .record("order_timeout", json!({ "orderId": order_id, "timeoutSecs": self.timeout.as_secs() }))
            .await;
        ExecResult::failed(ExecError::Timeout(self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::InboundMessage;

    fn executor(timeout_ms: u64) -> FsBridgeExecutor {
        let dir = std::env::temp_dir().join(format!("caduceus-bridge-{}", uuid::Uuid::new_v4()));
        let config = ExecutorConfig {
            timeout_secs: 0,
            poll_interval_ms: 10,
            heartbeat_interval_secs: 60,
            orphan_grace_secs: 300,
        };
        let mut exec = FsBridgeExecutor::new(&dir, &config);
        exec.timeout = Duration::from_millis(timeout_ms);
        exec
    }

    #[tokio::test]
    async fn empty_payload_is_rejected_without_writing() {
        let exec = executor(100);
        let req = OrderRequest::from_inbound(&InboundMessage::new("web", "u", "c", "   ", None));
        let result = exec.execute(&req).await;
        assert!(!result.success);
        assert_eq!(result.error, Some(ExecError::EmptyPayload));
        assert!(!exec.tree().orders_dir().exists());
    }

    #[tokio::test]
    async fn pending_order_is_archived_on_timeout() {
        let exec = executor(50);
        let req = OrderRequest::from_inbound(&InboundMessage::new("telegram", "7", "42", "ping", None));
        let result = exec.execute(&req).await;
        assert_eq!(result.error, Some(ExecError::Timeout(Duration::from_millis(50))));
        assert_eq!(exec.tree().state(&req.order_id).await, OrderState::Absent);
        assert!(exec.tree().liveness_markers(&req.order_id).await.is_empty());

        let archived: Vec<_> = std::fs::read_dir(exec.tree().archive_dir())
            .expect("archive dir")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(archived.len(), 1);
        let order = Order::from_json(&std::fs::read(archived[0].path()).expect("read")).expect("parse");
        assert_eq!(order.outcome.as_deref(), Some("timeout"));
        assert!(!order.acknowledged);
        let _ = std::fs::remove_dir_all(exec.tree().root());
    }

    #[tokio::test]
    async fn claimed_order_is_left_for_the_operator() {
        let exec = executor(80);
        let req = OrderRequest::from_inbound(&InboundMessage::new("telegram", "7", "42", "ping", None));
        let tree = exec.tree().clone();
        let id = req.order_id.clone();
        let claimer = tokio::spawn(async move {
            for _ in 0..50 {
                if tokio::fs::rename(tree.pending_path(&id), tree.claimed_path(&id)).await.is_ok() {
                    return true;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            false
        });
        let result = exec.execute(&req).await;
        assert!(claimer.await.expect("join"));
        assert!(matches!(result.error, Some(ExecError::Timeout(_))));
        assert_eq!(exec.tree().state(&req.order_id).await, OrderState::Claimed);
        let _ = std::fs::remove_dir_all(exec.tree().root());
    }

    #[tokio::test]
    async fn new_order_supersedes_waiting_order_and_drops_late_results() {
        let exec = executor(50);
        let msg = InboundMessage::new("web", "u", "c", "first", Some("u".to_string()));
        let stale = OrderRequest::from_inbound(&msg);
        exec.write_order(&stale).await.expect("write");
        write_atomic(&exec.tree().response_path(&stale.order_id), b"late")
            .await
            .expect("late result");

        let fresh = OrderRequest::from_inbound(&msg);
        exec.write_order(&fresh).await.expect("write");

        let tree = exec.tree();
        assert_eq!(tree.state(&stale.order_id).await, OrderState::Absent);
        assert_eq!(tree.state(&fresh.order_id).await, OrderState::Pending);
        assert!(tree.session_responses(session_of(&fresh.order_id)).await.is_empty());
        let archived: Vec<_> = std::fs::read_dir(tree.archive_dir())
            .expect("archive dir")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(archived.len(), 1);
        let order = Order::from_json(&std::fs::read(archived[0].path()).expect("read")).expect("parse");
        assert_eq!(order.order_id, stale.order_id);
        assert_eq!(order.outcome.as_deref(), Some("superseded"));
        let _ = std::fs::remove_dir_all(tree.root());
    }
}
