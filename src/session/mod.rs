pub mod oplog;
pub mod working_set;

pub use oplog::{EditOp, LoggedOp, OpLog};
pub use working_set::WorkingSet;

use crate::core::{Datastore, DbError, ErrorInfo, Result, SessionId, SessionState};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Client identity a session runs under.
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    /// Set when a management daemon acts on behalf of another user.
    pub effective_username: Option<String>,
}

impl Credentials {
    pub fn new(username: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            effective_username: None,
        }
    }

    pub fn on_behalf_of(mut self, username: impl Into<String>) -> Self {
        self.effective_username = Some(username.into());
        self
    }

    /// Identity access-control checks run against.
    pub fn effective(&self) -> &str {
        self.effective_username.as_deref().unwrap_or(&self.username)
    }
}

/// Per-session state: working sets and operation logs per datastore, the
/// request-processing state machine, and the last recorded errors.
pub struct Session {
    pub id: SessionId,
    pub credentials: Credentials,
    pub datastore: Datastore,
    pub state: SessionState,
    pub holds_datastore_lock: bool,
    /// Commit whose retained context this session reads during a
    /// verify/notify callback.
    pub notification_commit_id: Option<u32>,
    working: HashMap<Datastore, WorkingSet>,
    oplogs: HashMap<Datastore, OpLog>,
    errors: Vec<ErrorInfo>,
}

impl Session {
    pub fn new(id: SessionId, credentials: Credentials, datastore: Datastore) -> Self {
        Self {
            id,
            credentials,
            datastore,
            state: SessionState::Idle,
            holds_datastore_lock: false,
            notification_commit_id: None,
            working: HashMap::new(),
            oplogs: HashMap::new(),
            errors: Vec::new(),
        }
    }

    pub fn working_set(&mut self, datastore: Datastore) -> &mut WorkingSet {
        self.working
            .entry(datastore)
            .or_insert_with(|| WorkingSet::new(datastore))
    }

    pub fn working_set_ref(&self, datastore: Datastore) -> Option<&WorkingSet> {
        self.working.get(&datastore)
    }

    pub fn oplog(&mut self, datastore: Datastore) -> &mut OpLog {
        self.oplogs.entry(datastore).or_default()
    }

    pub fn oplog_ref(&self, datastore: Datastore) -> Option<&OpLog> {
        self.oplogs.get(&datastore)
    }

    pub fn has_unsaved_changes(&self, datastore: Datastore) -> bool {
        self.oplogs
            .get(&datastore)
            .map(|log| !log.is_empty())
            .unwrap_or(false)
            || self
                .working
                .get(&datastore)
                .map(|set| set.has_modifications())
                .unwrap_or(false)
    }

    /// Empty the operation log and drop all working copies; the next access
    /// re-loads from disk.
    pub fn discard_changes(&mut self, datastore: Datastore) {
        if let Some(log) = self.oplogs.get_mut(&datastore) {
            log.clear();
        }
        if let Some(set) = self.working.get_mut(&datastore) {
            set.clear();
        }
    }

    pub fn switch_datastore(&mut self, datastore: Datastore) {
        self.datastore = datastore;
    }

    pub fn record_error(&mut self, err: &DbError) {
        self.errors = err.error_infos();
    }

    pub fn record_errors(&mut self, errors: Vec<ErrorInfo>) {
        self.errors = errors;
    }

    pub fn clear_errors(&mut self) {
        self.errors.clear();
    }

    pub fn last_errors(&self) -> &[ErrorInfo] {
        &self.errors
    }
}

/// Engine-wide session table. Each session sits behind its own mutex; the
/// dispatcher serializes request handling through it.
pub struct SessionTable {
    sessions: RwLock<HashMap<SessionId, Arc<Mutex<Session>>>>,
    next_id: AtomicU32,
}

impl Default for SessionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionTable {
    pub fn new() -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub async fn create(
        &self,
        credentials: Credentials,
        datastore: Datastore,
    ) -> (SessionId, Arc<Mutex<Session>>) {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let session = Arc::new(Mutex::new(Session::new(id, credentials, datastore)));
        self.sessions
            .write()
            .await
            .insert(id, Arc::clone(&session));
        debug!(session = id, %datastore, "session started");
        (id, session)
    }

    pub async fn get(&self, id: SessionId) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("session {}", id)))
    }

    pub async fn remove(&self, id: SessionId) -> Result<Arc<Mutex<Session>>> {
        self.sessions
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| DbError::NotFound(format!("session {}", id)))
    }

    pub async fn ids(&self) -> Vec<SessionId> {
        self.sessions.read().await.keys().copied().collect()
    }
}
