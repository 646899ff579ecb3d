use crate::core::{DbError, Result};
use crate::schema::dependency::{DepEdge, DepEntry, ModuleDepIndex};
use crate::schema::model::ModuleSchema;
use crate::store::settings::SettingsStore;
use crate::tree::xpath::XPath;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// A loader result: the schema plus the dependency edges discovered while
/// parsing it, so the registry can pull in extension targets first.
pub struct LoadedSchema {
    pub schema: ModuleSchema,
    pub deps: Vec<DepEdge>,
}

/// Collaborator that resolves (module, revision) to a parsed schema.
/// YANG/YIN parsing itself is outside the engine.
pub trait SchemaLoader: Send + Sync {
    fn load(&self, name: &str, revision: Option<&str>) -> Result<LoadedSchema>;
}

/// The process-wide set of installed schemas.
///
/// Shared `Arc<ModuleSchema>` values guarantee every session sees one
/// feature/enablement state per module.
pub struct SchemaRegistry {
    modules: RwLock<HashMap<String, Arc<ModuleSchema>>>,
    /// Names of modules uninstalled during this process lifetime. Lookups
    /// answer UnknownModel; re-enabling requires a restart by contract.
    disabled: RwLock<HashSet<String>>,
    loader: Option<Arc<dyn SchemaLoader>>,
}

impl SchemaRegistry {
    pub fn new(loader: Option<Arc<dyn SchemaLoader>>) -> Self {
        Self {
            modules: RwLock::new(HashMap::new()),
            disabled: RwLock::new(HashSet::new()),
            loader,
        }
    }

    /// Install a schema and its dependency entry, then apply persisted
    /// settings (features, enabled subtrees).
    pub async fn install(
        &self,
        schema: ModuleSchema,
        deps: Vec<DepEdge>,
        index: &ModuleDepIndex,
        settings: &dyn SettingsStore,
    ) -> Result<Arc<ModuleSchema>> {
        if self.disabled.read().await.contains(&schema.name) {
            return Err(DbError::Unsupported(format!(
                "module '{}' was uninstalled; re-installing requires a restart",
                schema.name
            )));
        }

        let op_data_subtrees = schema
            .op_data_roots()
            .into_iter()
            .map(|id| schema.path_of(id))
            .collect();
        let entry = DepEntry {
            name: schema.name.clone(),
            revision: schema.revision.clone(),
            filepath: schema.filepath.clone(),
            deps,
            op_data_subtrees,
        };
        index.insert(entry).await?;

        let shared = Arc::new(schema);
        self.apply_persisted(&shared, settings);
        self.modules
            .write()
            .await
            .insert(shared.name.clone(), Arc::clone(&shared));
        debug!(module = %shared.name, "schema installed");
        Ok(shared)
    }

    fn apply_persisted(&self, schema: &Arc<ModuleSchema>, settings: &dyn SettingsStore) {
        let persisted = match settings.load(&schema.name) {
            Ok(persisted) => persisted,
            Err(err) => {
                warn!(module = %schema.name, %err, "persisted settings unreadable, starting clean");
                return;
            }
        };
        for feature in &persisted.enabled_features {
            schema.set_feature(feature, true);
        }
        for xpath in &persisted.enabled_subtrees {
            match XPath::parse(xpath).and_then(|p| p.resolve_schema(schema)) {
                Ok(node) => schema.enable_subtree(node),
                Err(err) => {
                    warn!(module = %schema.name, xpath, %err, "stale enabled-subtree entry ignored")
                }
            }
        }
    }

    /// Keyed lookup. A disabled module answers UnknownModel; a cache miss
    /// consults the loader when one is installed.
    pub async fn get(&self, name: &str, revision: Option<&str>) -> Result<Arc<ModuleSchema>> {
        if self.disabled.read().await.contains(name) {
            return Err(DbError::UnknownModel(format!(
                "module '{}' is disabled",
                name
            )));
        }
        if let Some(schema) = self.modules.read().await.get(name) {
            if let Some(rev) = revision {
                if schema.revision.as_deref() != Some(rev) {
                    return Err(DbError::UnknownModel(format!(
                        "module '{}' revision '{}' not installed",
                        name, rev
                    )));
                }
            }
            return Ok(Arc::clone(schema));
        }
        Err(DbError::UnknownModel(format!(
            "module '{}' not installed",
            name
        )))
    }

    /// Lookup with load-on-miss: pulls the module and, transitively, every
    /// dependency the loader reports, installing dependencies first.
    pub async fn get_or_load(
        &self,
        name: &str,
        revision: Option<&str>,
        index: &ModuleDepIndex,
        settings: &dyn SettingsStore,
    ) -> Result<Arc<ModuleSchema>> {
        if let Ok(found) = self.get(name, revision).await {
            return Ok(found);
        }
        let loader = self
            .loader
            .as_ref()
            .ok_or_else(|| DbError::UnknownModel(format!("module '{}' not installed", name)))?
            .clone();

        // Discover the closure first, then install dependencies-first.
        let mut discovered: Vec<LoadedSchema> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let mut pending: Vec<(String, Option<String>)> =
            vec![(name.to_string(), revision.map(str::to_string))];
        while let Some((module, rev)) = pending.pop() {
            if !seen.insert(module.clone()) || self.modules.read().await.contains_key(&module) {
                continue;
            }
            let loaded = loader.load(&module, rev.as_deref())?;
            for dep in &loaded.deps {
                pending.push((dep.name.clone(), None));
            }
            discovered.push(loaded);
        }

        while !discovered.is_empty() {
            let installed_now = self.modules.read().await;
            let ready = discovered.iter().position(|candidate| {
                candidate.deps.iter().all(|dep| {
                    installed_now.contains_key(&dep.name)
                        || !discovered.iter().any(|other| other.schema.name == dep.name)
                })
            });
            drop(installed_now);
            let Some(position) = ready else {
                return Err(DbError::Internal(format!(
                    "dependency cycle while loading module '{}'",
                    name
                )));
            };
            let LoadedSchema { schema, deps } = discovered.swap_remove(position);
            self.install(schema, deps, index, settings).await?;
        }
        self.get(name, revision).await
    }

    pub async fn installed(&self) -> Vec<String> {
        let mut names: Vec<String> = self.modules.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Uninstall a module. Later lookups return UnknownModel for the rest of
    /// the process lifetime.
    pub async fn module_disable(&self, name: &str, index: &ModuleDepIndex) -> Result<()> {
        let removed = self.modules.write().await.remove(name);
        if removed.is_none() {
            return Err(DbError::UnknownModel(format!(
                "module '{}' not installed",
                name
            )));
        }
        self.disabled.write().await.insert(name.to_string());
        // The index entry may already be gone; that is fine.
        let _ = index.remove(name, None).await;
        Ok(())
    }

    /// Re-enabling an uninstalled module is not supported within one process
    /// lifetime (documented contract, not an oversight).
    pub async fn module_enable(&self, name: &str) -> Result<()> {
        if self.disabled.read().await.contains(name) {
            return Err(DbError::Unsupported(format!(
                "module '{}' can only be re-enabled by a restart",
                name
            )));
        }
        Err(DbError::UnknownModel(format!(
            "module '{}' is not disabled",
            name
        )))
    }

    /// Toggle a feature and persist the new feature set. The in-memory flag
    /// is rolled back if persistence fails.
    pub async fn feature_enable(
        &self,
        module: &str,
        feature: &str,
        enabled: bool,
        settings: &dyn SettingsStore,
    ) -> Result<()> {
        let schema = self.get(module, None).await?;
        let changed = schema.set_feature(feature, enabled);

        let mut persisted = settings.load(module).unwrap_or_default();
        persisted.enabled_features = schema.enabled_features();
        persisted.enabled_features.sort();
        if let Err(err) = settings.save(module, &persisted) {
            if changed {
                schema.set_feature(feature, !enabled);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Enable a subtree for the running datastore and persist the xpath.
    pub async fn subtree_enable(
        &self,
        module: &str,
        xpath: &str,
        settings: &dyn SettingsStore,
    ) -> Result<()> {
        let schema = self.get(module, None).await?;
        let node = XPath::parse(xpath)?.resolve_schema(&schema)?;
        schema.enable_subtree(node);

        let mut persisted = settings.load(module).unwrap_or_default();
        if !persisted.enabled_subtrees.iter().any(|x| x == xpath) {
            persisted.enabled_subtrees.push(xpath.to_string());
        }
        settings.save(module, &persisted)
    }
}
