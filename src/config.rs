use std::path::PathBuf;
use std::time::Duration;

/// Engine construction parameters.
///
/// All environment-derived knobs (repository root, timeouts, pool sizing) are
/// passed in here; the engine itself never reads the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Repository root; data files live under `<root>/data`.
    pub repo_root: PathBuf,

    /// Fixed number of dispatcher workers.
    pub worker_count: usize,

    /// Capacity of the bounded request queue.
    pub queue_capacity: usize,

    /// Ordinary request timeout (reads, edits, subscriptions).
    pub request_timeout: Duration,

    /// Long request timeout (commit, copy-config, RPC, action).
    pub long_request_timeout: Duration,

    /// Per-verifier deadline during commit Phase C.
    pub commit_verify_timeout: Duration,

    /// How long a read waits for operational-data providers.
    pub operational_data_timeout: Duration,

    /// Retained notifications older than this are purged.
    pub notification_age_out: Duration,

    /// Width of one retained-notification file window.
    pub notification_file_window: Duration,

    /// A working copy is only "fresh" if the file mtime is separated from
    /// now by more than this bound.
    pub freshness_granularity: Duration,
}

impl EngineConfig {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
            worker_count: 4,
            queue_capacity: 1024,
            request_timeout: Duration::from_secs(3),
            long_request_timeout: Duration::from_secs(15),
            commit_verify_timeout: Duration::from_secs(10),
            operational_data_timeout: Duration::from_secs(2),
            notification_age_out: Duration::from_secs(60 * 60),
            notification_file_window: Duration::from_secs(10 * 60),
            freshness_granularity: Duration::from_secs(1),
        }
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn long_request_timeout(mut self, timeout: Duration) -> Self {
        self.long_request_timeout = timeout;
        self
    }

    pub fn commit_verify_timeout(mut self, timeout: Duration) -> Self {
        self.commit_verify_timeout = timeout;
        self
    }

    pub fn operational_data_timeout(mut self, timeout: Duration) -> Self {
        self.operational_data_timeout = timeout;
        self
    }

    pub fn notification_age_out(mut self, age_out: Duration) -> Self {
        self.notification_age_out = age_out;
        self
    }

    pub fn notification_file_window(mut self, window: Duration) -> Self {
        self.notification_file_window = window;
        self
    }

    pub fn freshness_granularity(mut self, granularity: Duration) -> Self {
        self.freshness_granularity = granularity;
        self
    }

    /// Validate the configuration before the engine is built.
    pub fn validate(&self) -> Result<(), String> {
        if self.worker_count == 0 {
            return Err("worker_count must be at least 1".to_string());
        }
        if self.queue_capacity == 0 {
            return Err("queue_capacity must be at least 1".to_string());
        }
        if self.notification_file_window > self.notification_age_out {
            return Err("notification_file_window cannot exceed notification_age_out".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(EngineConfig::new("/tmp/repo").validate().is_ok());
    }

    #[test]
    fn zero_workers_rejected() {
        let config = EngineConfig::new("/tmp/repo").worker_count(0);
        assert!(config.validate().is_err());
    }
}
