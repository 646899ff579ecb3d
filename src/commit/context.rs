use crate::core::{ChangeOper, Datastore, DbError, Result, SessionId, TypedValue};
use crate::schema::ModuleSchema;
use crate::subscription::SubscriptionId;
use crate::tree::diff::DiffEntry;
use crate::tree::node::DataTree;
use crate::tree::xpath::XPath;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

const ID_ATTEMPTS: usize = 16;

/// One change reported to a subscriber iterating a commit.
#[derive(Debug, Clone)]
pub struct Change {
    pub oper: ChangeOper,
    pub old_value: Option<TypedValue>,
    pub new_value: Option<TypedValue>,
}

/// Retained post-commit state, kept until every notified subscriber has
/// acknowledged (or a forced release).
pub struct CommitContext {
    pub id: u32,
    pub session_id: SessionId,
    pub datastore: Datastore,
    pub schemas: HashMap<String, Arc<ModuleSchema>>,
    pub prev_trees: HashMap<String, DataTree>,
    pub new_trees: HashMap<String, DataTree>,
    pub diffs: HashMap<String, Vec<DiffEntry>>,
    pub notified: Vec<SubscriptionId>,
    waiters: AtomicUsize,
}

impl CommitContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: u32,
        session_id: SessionId,
        datastore: Datastore,
        schemas: HashMap<String, Arc<ModuleSchema>>,
        prev_trees: HashMap<String, DataTree>,
        new_trees: HashMap<String, DataTree>,
        diffs: HashMap<String, Vec<DiffEntry>>,
        notified: Vec<SubscriptionId>,
    ) -> Self {
        let waiters = AtomicUsize::new(notified.len());
        Self {
            id,
            session_id,
            datastore,
            schemas,
            prev_trees,
            new_trees,
            diffs,
            notified,
            waiters,
        }
    }

    pub fn waiters(&self) -> usize {
        self.waiters.load(Ordering::SeqCst)
    }

    /// Iterate the retained diff, optionally narrowed to a schema subtree.
    pub fn changes(&self, xpath: Option<&XPath>) -> Result<Vec<Change>> {
        let mut result = Vec::new();
        for (module, diff) in &self.diffs {
            let schema = &self.schemas[module];
            let filter_node = match xpath {
                Some(path) => {
                    if path.module() != module.as_str() {
                        continue;
                    }
                    Some(path.resolve_schema(schema)?)
                }
                None => None,
            };
            for entry in diff {
                let matches = match filter_node {
                    None => true,
                    Some(node) => {
                        schema.is_self_or_ancestor(node, entry.schema)
                            || (schema.is_self_or_ancestor(entry.schema, node)
                                && matches!(
                                    entry.oper,
                                    ChangeOper::Created | ChangeOper::Deleted
                                )
                                && entry.subtree_schemas.contains(&node))
                    }
                };
                if matches {
                    result.push(Change {
                        oper: entry.oper,
                        old_value: entry.old_value.clone(),
                        new_value: entry.new_value.clone(),
                    });
                }
            }
        }
        Ok(result)
    }
}

/// Registry of live commit contexts keyed by id.
pub struct CommitRegistry {
    table: RwLock<HashMap<u32, Arc<CommitContext>>>,
}

impl Default for CommitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CommitRegistry {
    pub fn new() -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
        }
    }

    /// Pick a fresh random id; collisions with live contexts re-roll, a
    /// bounded number of times.
    pub async fn allocate_id(&self) -> Result<u32> {
        let table = self.table.read().await;
        for _ in 0..ID_ATTEMPTS {
            let id: u32 = rand::random();
            if id != 0 && !table.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(DbError::Internal(
            "could not allocate a commit id".to_string(),
        ))
    }

    pub async fn register(&self, context: Arc<CommitContext>) {
        debug!(commit = context.id, waiters = context.waiters(), "commit context retained");
        self.table.write().await.insert(context.id, context);
    }

    pub async fn get(&self, id: u32) -> Result<Arc<CommitContext>> {
        self.table
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("commit context {}", id)))
    }

    /// One subscriber finished with the context; the last acknowledgment
    /// frees it.
    pub async fn acknowledge(&self, id: u32) -> Result<()> {
        let context = self.get(id).await?;
        let remaining = context.waiters.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        if remaining == 0 {
            self.table.write().await.remove(&id);
            debug!(commit = id, "commit context released");
        }
        Ok(())
    }

    /// Forced release regardless of outstanding acknowledgments.
    pub async fn release(&self, id: u32) -> Result<()> {
        self.table
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| DbError::NotFound(format!("commit context {}", id)))
    }

    pub async fn live_ids(&self) -> Vec<u32> {
        self.table.read().await.keys().copied().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_context(id: u32, notified: Vec<SubscriptionId>) -> CommitContext {
        CommitContext::new(
            id,
            1,
            Datastore::Running,
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            HashMap::new(),
            notified,
        )
    }

    #[tokio::test]
    async fn ids_are_unique_and_nonzero() {
        let registry = CommitRegistry::new();
        let a = registry.allocate_id().await.unwrap();
        let b = registry.allocate_id().await.unwrap();
        assert_ne!(a, 0);
        assert_ne!(b, 0);
    }

    #[tokio::test]
    async fn context_released_after_all_acks() {
        let registry = CommitRegistry::new();
        let context = Arc::new(empty_context(7, vec![10, 11]));
        registry.register(context).await;

        registry.acknowledge(7).await.unwrap();
        assert!(registry.get(7).await.is_ok());
        registry.acknowledge(7).await.unwrap();
        assert!(matches!(registry.get(7).await, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn forced_release_drops_context() {
        let registry = CommitRegistry::new();
        registry
            .register(Arc::new(empty_context(9, vec![1, 2, 3])))
            .await;
        registry.release(9).await.unwrap();
        assert!(registry.get(9).await.is_err());
    }
}
