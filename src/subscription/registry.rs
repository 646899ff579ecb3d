use crate::core::{DbError, Result, TypedValue};
use crate::tree::xpath::XPath;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{RwLock, mpsc, oneshot};
use tracing::debug;

pub type SubscriptionId = u32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionKind {
    ModuleChange,
    SubtreeChange,
    Rpc,
    Action,
    EventNotification,
    OperationalData,
    ModuleInstall,
    FeatureEnable,
}

/// Which commit phases a change subscriber wants to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifEventFilter {
    Verify,
    Notify,
    Both,
}

impl NotifEventFilter {
    pub fn wants_verify(&self) -> bool {
        matches!(self, Self::Verify | Self::Both)
    }

    pub fn wants_notify(&self) -> bool {
        matches!(self, Self::Notify | Self::Both)
    }
}

/// Message delivered to a subscriber's address.
///
/// Verify and provider requests carry a reply channel; everything else is
/// fire-and-forget.
#[derive(Debug)]
pub enum SubscriberEvent {
    Verify {
        commit_id: u32,
        subscription: SubscriptionId,
        module: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Notify {
        commit_id: u32,
        subscription: SubscriptionId,
        module: String,
    },
    Rpc {
        xpath: String,
        input: Vec<TypedValue>,
        reply: oneshot::Sender<Result<Vec<TypedValue>>>,
    },
    Action {
        xpath: String,
        input: Vec<TypedValue>,
        reply: oneshot::Sender<Result<Vec<TypedValue>>>,
    },
    EventNotification {
        xpath: String,
        values: Vec<TypedValue>,
        timestamp: i64,
    },
    /// Operational-data provider request for one state subtree.
    DataRequested {
        xpath: String,
        reply: oneshot::Sender<Result<Vec<TypedValue>>>,
    },
    ModuleInstall {
        module: String,
        revision: Option<String>,
        installed: bool,
    },
    FeatureEnable {
        module: String,
        feature: String,
        enabled: bool,
    },
}

/// One registered subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub module: String,
    /// Schema path narrowing the interest; None covers the whole module.
    pub xpath: Option<XPath>,
    pub kind: SubscriptionKind,
    pub priority: u32,
    pub event_filter: NotifEventFilter,
    /// Subscribing marks the subtree enabled in running.
    pub enables_running: bool,
    pub address: mpsc::UnboundedSender<SubscriberEvent>,
}

impl Subscription {
    pub fn deliver(&self, event: SubscriberEvent) -> Result<()> {
        self.address
            .send(event)
            .map_err(|_| DbError::Disconnect(format!("subscriber {} is gone", self.id)))
    }
}

/// In-memory index of subscribers keyed by module.
pub struct SubscriptionRegistry {
    by_module: RwLock<HashMap<String, Vec<Arc<Subscription>>>>,
    next_id: AtomicU32,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self {
            by_module: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe(
        &self,
        module: &str,
        xpath: Option<XPath>,
        kind: SubscriptionKind,
        priority: u32,
        event_filter: NotifEventFilter,
        enables_running: bool,
        address: mpsc::UnboundedSender<SubscriberEvent>,
    ) -> Arc<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let subscription = Arc::new(Subscription {
            id,
            module: module.to_string(),
            xpath,
            kind,
            priority,
            event_filter,
            enables_running,
            address,
        });
        self.by_module
            .write()
            .await
            .entry(module.to_string())
            .or_default()
            .push(Arc::clone(&subscription));
        debug!(subscription = id, %module, ?kind, "subscription registered");
        subscription
    }

    /// Remove a subscription, returning its descriptor.
    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<Arc<Subscription>> {
        let mut by_module = self.by_module.write().await;
        for subs in by_module.values_mut() {
            if let Some(position) = subs.iter().position(|s| s.id == id) {
                return Ok(subs.remove(position));
            }
        }
        Err(DbError::NotFound(format!("subscription {}", id)))
    }

    /// Subscriptions of one kind on one module, sorted by descending
    /// priority. The sort is stable, so equal priorities keep registration
    /// order within a commit.
    pub async fn snapshot(&self, module: &str, kind: SubscriptionKind) -> Vec<Arc<Subscription>> {
        let by_module = self.by_module.read().await;
        let mut snapshot: Vec<Arc<Subscription>> = by_module
            .get(module)
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.kind == kind)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        snapshot.sort_by(|a, b| b.priority.cmp(&a.priority));
        snapshot
    }

    /// Change subscriptions (module + subtree kinds) for a commit, sorted by
    /// descending priority.
    pub async fn change_snapshot(&self, module: &str) -> Vec<Arc<Subscription>> {
        let by_module = self.by_module.read().await;
        let mut snapshot: Vec<Arc<Subscription>> = by_module
            .get(module)
            .map(|subs| {
                subs.iter()
                    .filter(|s| {
                        matches!(
                            s.kind,
                            SubscriptionKind::ModuleChange | SubscriptionKind::SubtreeChange
                        )
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        snapshot.sort_by(|a, b| b.priority.cmp(&a.priority));
        snapshot
    }

    /// All subscriptions of a kind across modules (module install / feature
    /// enable broadcasts).
    pub async fn all_of_kind(&self, kind: SubscriptionKind) -> Vec<Arc<Subscription>> {
        let by_module = self.by_module.read().await;
        by_module
            .values()
            .flatten()
            .filter(|s| s.kind == kind)
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn snapshot_sorts_by_descending_priority() {
        let registry = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        for priority in [5u32, 20, 10] {
            registry
                .subscribe(
                    "m",
                    None,
                    SubscriptionKind::ModuleChange,
                    priority,
                    NotifEventFilter::Both,
                    false,
                    tx.clone(),
                )
                .await;
        }
        let snapshot = registry.change_snapshot("m").await;
        let priorities: Vec<u32> = snapshot.iter().map(|s| s.priority).collect();
        assert_eq!(priorities, vec![20, 10, 5]);
    }

    #[tokio::test]
    async fn unsubscribe_removes_entry() {
        let registry = SubscriptionRegistry::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let sub = registry
            .subscribe(
                "m",
                None,
                SubscriptionKind::Rpc,
                0,
                NotifEventFilter::Both,
                false,
                tx,
            )
            .await;
        registry.unsubscribe(sub.id).await.unwrap();
        assert!(registry.snapshot("m", SubscriptionKind::Rpc).await.is_empty());
        assert!(matches!(
            registry.unsubscribe(sub.id).await,
            Err(DbError::NotFound(_))
        ));
    }
}
