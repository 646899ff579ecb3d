use crate::core::{DbError, Result};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepKind {
    /// Plain `import`; the target only has to be installed.
    Import,
    /// Augment/deviation style edge; the target must be loaded before this
    /// module validates.
    Extension,
}

#[derive(Debug, Clone)]
pub struct DepEdge {
    pub name: String,
    pub kind: DepKind,
}

#[derive(Debug, Clone)]
pub struct DepEntry {
    pub name: String,
    pub revision: Option<String>,
    pub filepath: Option<PathBuf>,
    pub deps: Vec<DepEdge>,
    /// Schema paths of `config false` subtrees, for the operational-data broker.
    pub op_data_subtrees: Vec<String>,
}

/// Ordered index of installed modules and their dependency edges.
///
/// Iteration order is topological (dependencies first) so `lock_all` and
/// transitive loading can walk it without re-sorting.
pub struct ModuleDepIndex {
    entries: RwLock<Vec<DepEntry>>,
}

impl Default for ModuleDepIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl ModuleDepIndex {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
        }
    }

    /// Insert an entry. Re-inserting an already-present (name, revision) is a
    /// no-op returning Ok.
    pub async fn insert(&self, entry: DepEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        if entries
            .iter()
            .any(|e| e.name == entry.name && e.revision == entry.revision)
        {
            return Ok(());
        }
        entries.push(entry);
        Ok(())
    }

    pub async fn remove(&self, name: &str, revision: Option<&str>) -> Result<()> {
        let mut entries = self.entries.write().await;
        let before = entries.len();
        entries.retain(|e| {
            !(e.name == name && (revision.is_none() || e.revision.as_deref() == revision))
        });
        if entries.len() == before {
            return Err(DbError::NotFound(format!("module '{}' not in index", name)));
        }
        Ok(())
    }

    pub async fn info(&self, name: &str, revision: Option<&str>) -> Result<DepEntry> {
        let entries = self.entries.read().await;
        entries
            .iter()
            .find(|e| e.name == name && (revision.is_none() || e.revision.as_deref() == revision))
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("module '{}' not in index", name)))
    }

    pub async fn contains(&self, name: &str) -> bool {
        let entries = self.entries.read().await;
        entries.iter().any(|e| e.name == name)
    }

    /// Module names in load order: every dependency precedes its dependents.
    /// A dependency cycle is an index corruption and surfaces as Internal.
    pub async fn load_order(&self) -> Result<Vec<String>> {
        let entries = self.entries.read().await;
        let known: HashMap<&str, &DepEntry> =
            entries.iter().map(|e| (e.name.as_str(), e)).collect();

        let mut ordered = Vec::with_capacity(entries.len());
        let mut done: HashSet<&str> = HashSet::new();
        let mut in_progress: HashSet<&str> = HashSet::new();

        fn visit<'a>(
            name: &'a str,
            known: &HashMap<&'a str, &'a DepEntry>,
            done: &mut HashSet<&'a str>,
            in_progress: &mut HashSet<&'a str>,
            ordered: &mut Vec<String>,
        ) -> Result<()> {
            if done.contains(name) {
                return Ok(());
            }
            if !in_progress.insert(name) {
                return Err(DbError::Internal(format!(
                    "dependency cycle through module '{}'",
                    name
                )));
            }
            if let Some(entry) = known.get(name) {
                for dep in &entry.deps {
                    if known.contains_key(dep.name.as_str()) {
                        visit(dep.name.as_str(), known, done, in_progress, ordered)?;
                    }
                }
                ordered.push(name.to_string());
            }
            in_progress.remove(name);
            done.insert(name);
            Ok(())
        }

        for entry in entries.iter() {
            visit(
                entry.name.as_str(),
                &known,
                &mut done,
                &mut in_progress,
                &mut ordered,
            )?;
        }
        Ok(ordered)
    }

    /// Names of modules the given one transitively requires, extension
    /// targets included, dependencies first.
    pub async fn transitive_deps(&self, name: &str) -> Result<Vec<String>> {
        let order = self.load_order().await?;
        let entries = self.entries.read().await;
        let by_name: HashMap<&str, &DepEntry> =
            entries.iter().map(|e| (e.name.as_str(), e)).collect();

        let mut wanted: HashSet<String> = HashSet::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if !wanted.insert(current.clone()) {
                continue;
            }
            if let Some(entry) = by_name.get(current.as_str()) {
                for dep in &entry.deps {
                    stack.push(dep.name.clone());
                }
            }
        }
        wanted.remove(name);
        Ok(order.into_iter().filter(|m| wanted.contains(m)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(name: &str, deps: &[(&str, DepKind)]) -> DepEntry {
        DepEntry {
            name: name.to_string(),
            revision: None,
            filepath: None,
            deps: deps
                .iter()
                .map(|(n, k)| DepEdge {
                    name: n.to_string(),
                    kind: *k,
                })
                .collect(),
            op_data_subtrees: Vec::new(),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let index = ModuleDepIndex::new();
        index.insert(entry("a", &[])).await.unwrap();
        index.insert(entry("a", &[])).await.unwrap();
        assert_eq!(index.load_order().await.unwrap(), vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn load_order_puts_dependencies_first() {
        let index = ModuleDepIndex::new();
        index
            .insert(entry("app", &[("base", DepKind::Import), ("ext", DepKind::Extension)]))
            .await
            .unwrap();
        index.insert(entry("base", &[])).await.unwrap();
        index.insert(entry("ext", &[("base", DepKind::Import)])).await.unwrap();

        let order = index.load_order().await.unwrap();
        let pos = |m: &str| order.iter().position(|x| x == m).unwrap();
        assert!(pos("base") < pos("app"));
        assert!(pos("ext") < pos("app"));
        assert!(pos("base") < pos("ext"));
    }

    #[tokio::test]
    async fn cycle_is_internal_error() {
        let index = ModuleDepIndex::new();
        index.insert(entry("a", &[("b", DepKind::Import)])).await.unwrap();
        index.insert(entry("b", &[("a", DepKind::Import)])).await.unwrap();
        assert!(matches!(
            index.load_order().await,
            Err(DbError::Internal(_))
        ));
    }

    #[tokio::test]
    async fn transitive_deps_resolved() {
        let index = ModuleDepIndex::new();
        index.insert(entry("a", &[("b", DepKind::Extension)])).await.unwrap();
        index.insert(entry("b", &[("c", DepKind::Import)])).await.unwrap();
        index.insert(entry("c", &[])).await.unwrap();

        let deps = index.transitive_deps("a").await.unwrap();
        assert_eq!(deps, vec!["c".to_string(), "b".to_string()]);
    }
}
