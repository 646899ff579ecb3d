use crate::core::{Datastore, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Repository path scheme.
///
/// ```text
/// <root>/yang/<module>[@<rev>].yang     schemas
/// <root>/yang/internal/                 internal schemas
/// <root>/data/<module>.<ds>             serialized trees
/// <root>/data/<module>.<ds>.lock        advisory lock markers
/// <root>/data/internal/                 persisted per-module settings
/// <root>/data/notifications/            retained notifications
/// ```
#[derive(Debug, Clone)]
pub struct RepoLayout {
    root: PathBuf,
}

impl RepoLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn yang_dir(&self) -> PathBuf {
        self.root.join("yang")
    }

    pub fn yang_internal_dir(&self) -> PathBuf {
        self.yang_dir().join("internal")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    pub fn data_internal_dir(&self) -> PathBuf {
        self.data_dir().join("internal")
    }

    pub fn notification_dir(&self) -> PathBuf {
        self.data_dir().join("notifications")
    }

    pub fn data_file(&self, module: &str, datastore: Datastore) -> PathBuf {
        self.data_dir()
            .join(format!("{}.{}", module, datastore.file_suffix()))
    }

    pub fn lock_file(&self, module: &str, datastore: Datastore) -> PathBuf {
        self.data_dir()
            .join(format!("{}.{}.lock", module, datastore.file_suffix()))
    }

    pub fn settings_file(&self, module: &str) -> PathBuf {
        self.data_internal_dir().join(format!("{}.json", module))
    }

    /// Create the directory structure if it is not there yet.
    pub fn ensure(&self) -> Result<()> {
        fs::create_dir_all(self.yang_internal_dir())?;
        fs::create_dir_all(self.data_internal_dir())?;
        fs::create_dir_all(self.notification_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_follow_the_scheme() {
        let layout = RepoLayout::new("/repo");
        assert_eq!(
            layout.data_file("example-module", Datastore::Startup),
            PathBuf::from("/repo/data/example-module.startup")
        );
        assert_eq!(
            layout.lock_file("m", Datastore::Running),
            PathBuf::from("/repo/data/m.running.lock")
        );
        assert_eq!(
            layout.settings_file("m"),
            PathBuf::from("/repo/data/internal/m.json")
        );
    }
}
