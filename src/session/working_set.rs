use crate::core::{Datastore, Result};
use crate::schema::SchemaRegistry;
use crate::store::file::{self, DataInfo};
use crate::store::layout::RepoLayout;
use crate::validate;
use std::collections::HashMap;
use std::time::{Duration, SystemTime};
use tracing::debug;

/// Per-(session, datastore) cache of loaded module trees.
pub struct WorkingSet {
    datastore: Datastore,
    entries: HashMap<String, DataInfo>,
}

impl WorkingSet {
    pub fn new(datastore: Datastore) -> Self {
        Self {
            datastore,
            entries: HashMap::new(),
        }
    }

    pub fn datastore(&self) -> Datastore {
        self.datastore
    }

    /// Datastore whose file backs this working set: candidate copies load
    /// from (and are checked for freshness against) running.
    fn backing_datastore(&self) -> Datastore {
        match self.datastore {
            Datastore::Candidate => Datastore::Running,
            other => other,
        }
    }

    pub fn get(&self, module: &str) -> Option<&DataInfo> {
        self.entries.get(module)
    }

    pub fn get_mut(&mut self, module: &str) -> Option<&mut DataInfo> {
        self.entries.get_mut(module)
    }

    pub fn insert(&mut self, info: DataInfo) {
        self.entries.insert(info.schema.name.clone(), info);
    }

    pub fn remove(&mut self, module: &str) -> Option<DataInfo> {
        self.entries.remove(module)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn loaded_modules(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn modified_modules(&self) -> Vec<String> {
        self.entries
            .values()
            .filter(|info| info.modified)
            .map(|info| info.schema.name.clone())
            .collect()
    }

    pub fn has_modifications(&self) -> bool {
        self.entries.values().any(|info| info.modified)
    }

    /// Return the cached entry, loading it from disk on first access.
    ///
    /// A candidate copy is derived from running: disabled subtrees are
    /// pruned, defaults re-materialized, and the entry starts as a read-only
    /// alias until the first edit.
    pub async fn get_or_load(
        &mut self,
        registry: &SchemaRegistry,
        layout: &RepoLayout,
        module: &str,
    ) -> Result<&mut DataInfo> {
        if !self.entries.contains_key(module) {
            let schema = registry.get(module, None).await?;
            let mut info = file::load(layout, &schema, self.backing_datastore())?;
            if self.datastore == Datastore::Candidate {
                validate::prune_disabled(&schema, &mut info.tree);
                validate::materialize_defaults(&schema, &mut info.tree);
                info.read_only_alias = true;
            }
            self.entries.insert(module.to_string(), info);
        }
        Ok(self
            .entries
            .get_mut(module)
            .expect("entry inserted just above"))
    }

    /// Drop entries that are no longer fresh. Returns the dropped module
    /// names; retained modified entries are candidates for the optimized
    /// commit (replay skipped).
    pub fn refresh(
        &mut self,
        layout: &RepoLayout,
        last_commit_time: Option<SystemTime>,
        granularity: Duration,
    ) -> Vec<String> {
        let backing = self.backing_datastore();
        let now = SystemTime::now();
        let mut dropped = Vec::new();
        self.entries.retain(|module, info| {
            let current_mtime = file::file_mtime(layout, module, backing).unwrap_or(None);
            let fresh = is_fresh(info.loaded_at, current_mtime, last_commit_time, granularity, now);
            if !fresh {
                dropped.push(module.clone());
            }
            fresh
        });
        if !dropped.is_empty() {
            debug!(?dropped, datastore = %self.datastore, "stale working copies discarded");
        }
        dropped
    }
}

/// The optimistic freshness predicate.
///
/// A copy is fresh only when it was loaded strictly after both the file's
/// current mtime and the engine's last commit, and the mtime is separated
/// from now by more than the granularity bound. Filesystems that truncate
/// mtime to whole seconds cannot be trusted here, so a zero-nanosecond mtime
/// falls back to always-stale.
fn is_fresh(
    loaded_at: SystemTime,
    current_mtime: Option<SystemTime>,
    last_commit_time: Option<SystemTime>,
    granularity: Duration,
    now: SystemTime,
) -> bool {
    if let Some(mtime) = current_mtime {
        let nanos = mtime
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or(0);
        if nanos == 0 {
            return false;
        }
        if loaded_at <= mtime {
            return false;
        }
        match now.duration_since(mtime) {
            Ok(age) if age > granularity => {}
            _ => return false,
        }
    }
    if let Some(commit_time) = last_commit_time {
        if loaded_at <= commit_time {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: u64, nanos: u32) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::new(secs, nanos)
    }

    #[test]
    fn fresh_copy_passes_all_bounds() {
        assert!(is_fresh(
            ts(1000, 500),
            Some(ts(990, 123)),
            Some(ts(995, 0)),
            Duration::from_secs(1),
            ts(1010, 0),
        ));
    }

    #[test]
    fn copy_older_than_mtime_is_stale() {
        assert!(!is_fresh(
            ts(980, 0),
            Some(ts(990, 123)),
            None,
            Duration::from_secs(1),
            ts(1010, 0),
        ));
    }

    #[test]
    fn copy_predating_last_commit_is_stale() {
        assert!(!is_fresh(
            ts(1000, 500),
            Some(ts(990, 123)),
            Some(ts(1005, 0)),
            Duration::from_secs(1),
            ts(1010, 0),
        ));
    }

    #[test]
    fn recent_mtime_within_granularity_is_stale() {
        assert!(!is_fresh(
            ts(1000, 500),
            Some(ts(999, 900)),
            None,
            Duration::from_secs(1),
            ts(1000, 600),
        ));
    }

    #[test]
    fn truncated_mtime_falls_back_to_stale() {
        // whole-second mtime: the filesystem cannot attest sub-second order
        assert!(!is_fresh(
            ts(1000, 500),
            Some(ts(990, 0)),
            None,
            Duration::from_secs(1),
            ts(1010, 0),
        ));
    }

    #[test]
    fn missing_file_keeps_copy_fresh() {
        assert!(is_fresh(
            ts(1000, 500),
            None,
            Some(ts(995, 0)),
            Duration::from_secs(1),
            ts(1010, 0),
        ));
    }
}
