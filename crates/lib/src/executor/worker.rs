//! Worker side of the orders tree, plus operator tooling for stale claims.
//!
//! A worker loop looks like:
//!
//! ```text
//! for order in worker.pending_orders().await? {
//!     let Some(claim) = worker.claim(&order.order_id).await? else { continue };
//!     match run(&claim.order).await {
//!         Ok(text) => worker.complete(claim, &text).await?,
//!         Err(_) => worker.release(claim).await?,
//!     }
//! }
//! ```
//!
//! Claims are advisory and assume a single worker. A worker that dies while holding a claim
//! leaves `{id}.json.processing` behind; [`find_orphaned_claims`] reports those and
//! [`requeue`] puts one back in the pending state. Nothing requeues automatically.

use super::order::{
    order_id_from_file_name, remove_if_exists, session_of, write_atomic, Order, OrderState, OrdersTree,
};
use chrono::Utc;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

/// An order this worker has claimed.
#[derive(Debug)]
pub struct ClaimedOrder {
    pub order: Order,
    path: PathBuf,
}

impl ClaimedOrder {
    pub fn claim_path(&self) -> &Path {
        &self.path
    }
}

/// Worker-side view of the orders tree.
pub struct Worker {
    tree: OrdersTree,
    name: String,
}

impl Worker {
    /// `name` is recorded as `acknowledged_by` on completed orders.
    pub fn new(work_dir: impl AsRef<Path>, name: impl Into<String>) -> Self {
        Self {
            tree: OrdersTree::new(work_dir.as_ref()),
            name: name.into(),
        }
    }

    pub fn tree(&self) -> &OrdersTree {
        &self.tree
    }

    /// Unacknowledged pending orders, oldest first. Unparseable files are moved to
    /// `orders-corrupted/` so they are not retried forever.
    pub async fn pending_orders(&self) -> std::io::Result<Vec<Order>> {
        let mut entries = match tokio::fs::read_dir(self.tree.orders_dir()).await {
            Ok(e) => e,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let mut orders = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if !matches!(order_id_from_file_name(name), Some((_, OrderState::Pending))) {
                continue;
            }
            let path = entry.path();
            let bytes = match tokio::fs::read(&path).await {
                Ok(b) => b,
                // Claimed or expired between listing and reading.
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => return Err(e),
            };
            match Order::from_json(&bytes) {
                Ok(order) if order.acknowledged => {
                    log::debug!("skipping acknowledged order {}", order.order_id);
                }
                Ok(order) => orders.push(order),
                Err(e) => {
                    log::warn!("order file {} is corrupted ({}); quarantining", path.display(), e);
                    tokio::fs::create_dir_all(self.tree.corrupted_dir()).await?;
                    let target = self.tree.corrupted_dir().join(name);
                    if let Err(e) = tokio::fs::rename(&path, &target).await {
                        log::warn!("could not quarantine {}: {}", path.display(), e);
                    }
                }
            }
        }
        orders.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(orders)
    }

    /// Claim a pending order by renaming it. `None` if it is no longer pending.
    pub async fn claim(&self, order_id: &str) -> std::io::Result<Option<ClaimedOrder>> {
        let pending = self.tree.pending_path(order_id);
        let claimed = self.tree.claimed_path(order_id);
        match tokio::fs::rename(&pending, &claimed).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e),
        }
        let bytes = tokio::fs::read(&claimed).await?;
        match Order::from_json(&bytes) {
            Ok(order) => {
                log::info!("claimed order {}", order_id);
                Ok(Some(ClaimedOrder { order, path: claimed }))
            }
            Err(e) => {
                // Overwritten with garbage between scan and claim.
                let target = self.tree.corrupted_dir().join(format!("{}.json", order_id));
                tokio::fs::create_dir_all(self.tree.corrupted_dir()).await?;
                tokio::fs::rename(&claimed, &target).await?;
                log::warn!("claimed order {} was corrupted ({}); quarantined", order_id, e);
                Ok(None)
            }
        }
    }

    /// Record that work on `claim` is still running.
    pub async fn heartbeat(&self, claim: &ClaimedOrder, elapsed: Duration) -> std::io::Result<()> {
        let secs = elapsed.as_secs();
        let body = json!({
            "type": "heartbeat",
            "order_id": claim.order.order_id,
            "from": self.name,
            "elapsed_secs": secs,
            "timestamp": Utc::now().to_rfc3339(),
        });
        let bytes = serde_json::to_vec_pretty(&body)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        write_atomic(&self.tree.heartbeat_marker(&claim.order.order_id, secs), &bytes).await
    }

    /// Finish `claim`: archive it acknowledged, then publish the result artifact.
    /// The archive goes first so that the claim is already gone when a waiter sees the result.
    pub async fn complete(&self, claim: ClaimedOrder, response_text: &str) -> std::io::Result<PathBuf> {
        let ClaimedOrder { mut order, path } = claim;
        order.acknowledge(&self.name, "completed");
        let archived = self.tree.archive(&order).await?;
        remove_if_exists(&path).await;
        write_atomic(&self.tree.response_path(&order.order_id), response_text.as_bytes()).await?;
        log::info!("completed order {}", order.order_id);
        Ok(archived)
    }

    /// Give a claim back after a failed attempt so it can be retried.
    pub async fn release(&self, claim: ClaimedOrder) -> std::io::Result<()> {
        let order_id = claim.order.order_id.clone();
        restore_claim(&self.tree, &order_id, &claim.path).await?;
        log::info!("released order {}", order_id);
        Ok(())
    }
}

/// Put a claim back to pending, unless another order of the same session is already pending,
/// in which case the claim is archived as superseded. Returns true when restored.
async fn restore_claim(tree: &OrdersTree, order_id: &str, claimed: &Path) -> std::io::Result<bool> {
    let pending = tree.pending_path(order_id);
    let superseded = tree
        .session_orders(session_of(order_id))
        .await
        .iter()
        .any(|(id, state)| *state == OrderState::Pending && id != order_id);
    if superseded {
        let bytes = tokio::fs::read(claimed).await?;
        if let Ok(mut order) = Order::from_json(&bytes) {
            order.outcome = Some("superseded".to_string());
            tree.archive(&order).await?;
        }
        remove_if_exists(claimed).await;
        return Ok(false);
    }
    tokio::fs::rename(claimed, &pending).await?;
    Ok(true)
}

/// A claim with no recent activity.
#[derive(Debug, Clone)]
pub struct OrphanedClaim {
    pub order_id: String,
    pub claim_path: PathBuf,
    /// Newest of the claim file and its liveness markers.
    pub last_activity: SystemTime,
    pub idle: Duration,
    /// Parsed order, if the claim file is readable.
    pub order: Option<Order>,
}

async fn modified(path: &Path) -> Option<SystemTime> {
    tokio::fs::metadata(path).await.ok()?.modified().ok()
}

/// Claims whose last activity is older than `grace`.
pub async fn find_orphaned_claims(tree: &OrdersTree, grace: Duration) -> std::io::Result<Vec<OrphanedClaim>> {
    let mut entries = match tokio::fs::read_dir(tree.orders_dir()).await {
        Ok(e) => e,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let now = SystemTime::now();
    let mut orphans = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some((order_id, OrderState::Claimed)) = order_id_from_file_name(name) else {
            continue;
        };
        let claim_path = entry.path();
        let Some(mut last_activity) = modified(&claim_path).await else { continue };
        for marker in tree.liveness_markers(order_id).await {
            if let Some(t) = modified(&marker).await {
                last_activity = last_activity.max(t);
            }
        }
        let idle = now.duration_since(last_activity).unwrap_or_default();
        if idle < grace {
            continue;
        }
        let order = match tokio::fs::read(&claim_path).await {
            Ok(bytes) => Order::from_json(&bytes).ok(),
            Err(_) => None,
        };
        orphans.push(OrphanedClaim {
            order_id: order_id.to_string(),
            claim_path,
            last_activity,
            idle,
            order,
        });
    }
    orphans.sort_by(|a, b| a.last_activity.cmp(&b.last_activity));
    Ok(orphans)
}

/// Result of an operator requeue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Requeue {
    /// The claim is pending again.
    Restored,
    /// A newer order for the session was pending; the stale claim was archived.
    Superseded,
    /// No claim with that id.
    NotClaimed,
}

/// Return a stale claim to the pending state and clear its liveness markers.
pub async fn requeue(tree: &OrdersTree, order_id: &str) -> std::io::Result<Requeue> {
    let claimed = tree.claimed_path(order_id);
    if tokio::fs::metadata(&claimed).await.is_err() {
        return Ok(Requeue::NotClaimed);
    }
    let restored = restore_claim(tree, order_id, &claimed).await?;
    tree.clear_liveness(order_id).await;
    Ok(if restored {
        log::info!("requeued order {}", order_id);
        Requeue::Restored
    } else {
        log::info!("order {} superseded by a newer pending order", order_id);
        Requeue::Superseded
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::order::{new_order_id, GENERAL_COMMAND, ORDER_TYPE};

    fn temp_worker() -> Worker {
        Worker::new(
            std::env::temp_dir().join(format!("caduceus-worker-{}", uuid::Uuid::new_v4())),
            "test-worker",
        )
    }

    fn order(session_key: &str, payload: &str) -> Order {
        Order {
            kind: ORDER_TYPE.to_string(),
            from: "web".to_string(),
            target: "worker".to_string(),
            command: GENERAL_COMMAND.to_string(),
            payload: payload.to_string(),
            timestamp: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
            acknowledged_by: None,
            order_id: new_order_id(session_key),
            session_key: session_key.to_string(),
            channel: "web".to_string(),
            chat_id: "c".to_string(),
            sender_id: "s".to_string(),
            outcome: None,
            extra: serde_json::Map::new(),
        }
    }

    async fn put_pending(tree: &OrdersTree, order: &Order) {
        write_atomic(&tree.pending_path(&order.order_id), &order.to_json().expect("json"))
            .await
            .expect("write");
    }

    #[tokio::test]
    async fn scan_skips_acknowledged_and_quarantines_garbage() {
        let worker = temp_worker();
        let tree = worker.tree().clone();
        tree.ensure_dirs().await.expect("dirs");
        put_pending(&tree, &order("web:a", "one")).await;
        let mut done = order("web:b", "two");
        done.acknowledged = true;
        put_pending(&tree, &done).await;
        tokio::fs::write(tree.orders_dir().join("broken.json"), b"{not json")
            .await
            .expect("garbage");

        let pending = worker.pending_orders().await.expect("scan");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, "one");
        assert!(tree.corrupted_dir().join("broken.json").exists());
        assert!(!tree.orders_dir().join("broken.json").exists());
        let _ = std::fs::remove_dir_all(tree.root());
    }

    #[tokio::test]
    async fn claim_complete_archives_and_writes_result() {
        let worker = temp_worker();
        let tree = worker.tree().clone();
        tree.ensure_dirs().await.expect("dirs");
        let o = order("user:alice", "status?");
        put_pending(&tree, &o).await;

        let claim = worker.claim(&o.order_id).await.expect("claim").expect("claimed");
        assert_eq!(tree.state(&o.order_id).await, OrderState::Claimed);
        assert!(worker.claim(&o.order_id).await.expect("second claim").is_none());

        worker.heartbeat(&claim, Duration::from_secs(60)).await.expect("heartbeat");
        worker.complete(claim, "all good").await.expect("complete");

        assert_eq!(tree.state(&o.order_id).await, OrderState::Absent);
        assert_eq!(
            std::fs::read_to_string(tree.response_path(&o.order_id)).expect("response"),
            "all good"
        );
        let archived: Vec<_> = std::fs::read_dir(tree.archive_dir())
            .expect("archive")
            .filter_map(|e| e.ok())
            .collect();
        assert_eq!(archived.len(), 1);
        let a = Order::from_json(&std::fs::read(archived[0].path()).expect("read")).expect("parse");
        assert!(a.acknowledged);
        assert_eq!(a.acknowledged_by.as_deref(), Some("test-worker"));
        assert!(a.acknowledged_at.is_some());
        let _ = std::fs::remove_dir_all(tree.root());
    }

    #[tokio::test]
    async fn release_returns_claim_to_pending() {
        let worker = temp_worker();
        let tree = worker.tree().clone();
        tree.ensure_dirs().await.expect("dirs");
        let o = order("web:x", "retry me");
        put_pending(&tree, &o).await;
        let claim = worker.claim(&o.order_id).await.expect("claim").expect("claimed");
        worker.release(claim).await.expect("release");
        assert_eq!(tree.state(&o.order_id).await, OrderState::Pending);
        let _ = std::fs::remove_dir_all(tree.root());
    }

    #[tokio::test]
    async fn stale_claims_are_reported_and_requeued() {
        let worker = temp_worker();
        let tree = worker.tree().clone();
        tree.ensure_dirs().await.expect("dirs");
        let o = order("telegram:9", "long job");
        put_pending(&tree, &o).await;
        let _claim = worker.claim(&o.order_id).await.expect("claim").expect("claimed");

        assert!(find_orphaned_claims(&tree, Duration::from_secs(3600))
            .await
            .expect("scan")
            .is_empty());
        let orphans = find_orphaned_claims(&tree, Duration::ZERO).await.expect("scan");
        assert_eq!(orphans.len(), 1);
        assert_eq!(orphans[0].order_id, o.order_id);
        assert_eq!(orphans[0].order.as_ref().map(|o| o.payload.as_str()), Some("long job"));

        assert_eq!(requeue(&tree, &o.order_id).await.expect("requeue"), Requeue::Restored);
        assert_eq!(tree.state(&o.order_id).await, OrderState::Pending);
        assert_eq!(requeue(&tree, &o.order_id).await.expect("requeue"), Requeue::NotClaimed);
        let _ = std::fs::remove_dir_all(tree.root());
    }

    #[tokio::test]
    async fn requeue_defers_to_a_newer_pending_order() {
        let worker = temp_worker();
        let tree = worker.tree().clone();
        tree.ensure_dirs().await.expect("dirs");
        let o = order("telegram:9", "old");
        put_pending(&tree, &o).await;
        let _claim = worker.claim(&o.order_id).await.expect("claim").expect("claimed");
        put_pending(&tree, &order("telegram:9", "new")).await;

        assert_eq!(requeue(&tree, &o.order_id).await.expect("requeue"), Requeue::Superseded);
        let pending = worker.pending_orders().await.expect("scan");
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, "new");
        let _ = std::fs::remove_dir_all(tree.root());
    }
}
