use crate::core::{DbError, Result};
use crate::store::layout::RepoLayout;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Subscription descriptor that survives restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DurableSubscription {
    pub kind: String,
    pub destination: String,
    pub id: u32,
    pub xpath: Option<String>,
    pub priority: u32,
}

/// Everything persisted per module besides the data trees themselves.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSettings {
    pub enabled_features: Vec<String>,
    pub enabled_subtrees: Vec<String>,
    pub subscriptions: Vec<DurableSubscription>,
}

/// Collaborator contract for the persistent feature/subscription store.
pub trait SettingsStore: Send + Sync {
    /// Missing settings are an empty default, not an error.
    fn load(&self, module: &str) -> Result<ModuleSettings>;
    fn save(&self, module: &str, settings: &ModuleSettings) -> Result<()>;
}

/// JSON files under `<repo>/data/internal/`.
pub struct FileSettingsStore {
    layout: RepoLayout,
}

impl FileSettingsStore {
    pub fn new(layout: RepoLayout) -> Self {
        Self { layout }
    }
}

impl SettingsStore for FileSettingsStore {
    fn load(&self, module: &str) -> Result<ModuleSettings> {
        let path = self.layout.settings_file(module);
        match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map_err(|e| DbError::Internal(format!("settings for '{}': {}", module, e))),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                Ok(ModuleSettings::default())
            }
            Err(err) => Err(err.into()),
        }
    }

    fn save(&self, module: &str, settings: &ModuleSettings) -> Result<()> {
        let path = self.layout.settings_file(module);
        let bytes = serde_json::to_vec_pretty(settings)
            .map_err(|e| DbError::Internal(format!("settings for '{}': {}", module, e)))?;
        std::fs::write(&path, bytes)?;
        Ok(())
    }
}

/// In-memory store for tests; can fail the next save on demand to exercise
/// rollback paths.
pub struct MemorySettingsStore {
    entries: Mutex<HashMap<String, ModuleSettings>>,
    fail_next: AtomicBool,
}

impl Default for MemorySettingsStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySettingsStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            fail_next: AtomicBool::new(false),
        }
    }

    pub fn fail_next_save(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

impl SettingsStore for MemorySettingsStore {
    fn load(&self, module: &str) -> Result<ModuleSettings> {
        Ok(self
            .entries
            .lock()?
            .get(module)
            .cloned()
            .unwrap_or_default())
    }

    fn save(&self, module: &str, settings: &ModuleSettings) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(DbError::Io("injected settings failure".to_string()));
        }
        self.entries
            .lock()?
            .insert(module.to_string(), settings.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let layout = RepoLayout::new(dir.path());
        layout.ensure().unwrap();
        let store = FileSettingsStore::new(layout);

        assert_eq!(store.load("m").unwrap(), ModuleSettings::default());

        let settings = ModuleSettings {
            enabled_features: vec!["f1".into()],
            enabled_subtrees: vec!["/m:c".into()],
            subscriptions: vec![DurableSubscription {
                kind: "module-change".into(),
                destination: "app.1".into(),
                id: 7,
                xpath: None,
                priority: 10,
            }],
        };
        store.save("m", &settings).unwrap();
        assert_eq!(store.load("m").unwrap(), settings);
    }
}
