use crate::access::AccessControl;
use crate::commit::context::{CommitContext, CommitRegistry};
use crate::core::{Datastore, DbError, ErrorInfo, Result, SessionId};
use crate::lock::{LockKey, LockSet};
use crate::schema::{ModuleDepIndex, ModuleSchema, SchemaRegistry};
use crate::session::Session;
use crate::store::file;
use crate::store::layout::RepoLayout;
use crate::subscription::matcher::any_match;
use crate::subscription::{SubscriptionId, SubscriptionRegistry, SubscriberEvent};
use crate::tree::diff::{DiffEntry, diff_trees};
use crate::tree::node::DataTree;
use crate::validate;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Monotonic + realtime pair taken after the first successful write of a
/// commit.
#[derive(Debug, Clone, Copy)]
pub struct CommitStamp {
    pub monotonic: Instant,
    pub realtime: SystemTime,
}

/// The two-phase (verify/notify) commit orchestrator.
///
/// Callers serialize commits against reads through the engine-wide rw-lock
/// owned by the dispatcher; the engine itself only takes module and file
/// locks.
pub struct CommitEngine {
    layout: RepoLayout,
    schemas: Arc<SchemaRegistry>,
    deps: Arc<ModuleDepIndex>,
    locks: Arc<LockSet>,
    subscriptions: Arc<SubscriptionRegistry>,
    commits: Arc<CommitRegistry>,
    access: Arc<dyn AccessControl>,
    verify_timeout: Duration,
    granularity: Duration,
    last_commit: StdMutex<Option<CommitStamp>>,
}

struct PreparedModule {
    schema: Arc<ModuleSchema>,
    post_tree: DataTree,
}

impl CommitEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        layout: RepoLayout,
        schemas: Arc<SchemaRegistry>,
        deps: Arc<ModuleDepIndex>,
        locks: Arc<LockSet>,
        subscriptions: Arc<SubscriptionRegistry>,
        commits: Arc<CommitRegistry>,
        access: Arc<dyn AccessControl>,
        verify_timeout: Duration,
        granularity: Duration,
    ) -> Self {
        Self {
            layout,
            schemas,
            deps,
            locks,
            subscriptions,
            commits,
            access,
            verify_timeout,
            granularity,
            last_commit: StdMutex::new(None),
        }
    }

    pub fn last_commit_time(&self) -> Option<SystemTime> {
        self.last_commit
            .lock()
            .ok()
            .and_then(|stamp| stamp.map(|s| s.realtime))
    }

    fn stamp_commit(&self) {
        if let Ok(mut stamp) = self.last_commit.lock() {
            *stamp = Some(CommitStamp {
                monotonic: Instant::now(),
                realtime: SystemTime::now(),
            });
        }
    }

    /// Commit a session's pending edits. Returns the commit id, or 0 when
    /// there was nothing to commit.
    ///
    /// A Phase D failure persists nothing further but does not roll back
    /// modules already written; the per-module errors land on the session.
    pub async fn commit(&self, session: &mut Session) -> Result<u32> {
        let source = session.datastore;
        let target = source.persistent_target();
        let user = session.credentials.effective().to_string();

        let mut touched = session.oplog(source).modules();
        for module in session.working_set(source).modified_modules() {
            if !touched.contains(&module) {
                touched.push(module);
            }
        }
        if touched.is_empty() {
            return Ok(0);
        }

        for module in &touched {
            self.access.check_write(&user, module)?;
        }

        // dependency order; modules unknown to the index go last
        let order = self.deps.load_order().await?;
        let mut modules: Vec<String> = order
            .into_iter()
            .filter(|m| touched.contains(m))
            .collect();
        for module in &touched {
            if !modules.contains(module) {
                modules.push(module.clone());
            }
        }

        // Freshness pass: stale copies are dropped here; what survives with
        // modifications becomes the post-commit tree without replay.
        let last_commit_time = self.last_commit_time();
        session
            .working_set(source)
            .refresh(&self.layout, last_commit_time, self.granularity);

        let mut prepared = Vec::with_capacity(modules.len());
        for module in &modules {
            let schema = self.schemas.get(module, None).await?;

            let optimized = session
                .working_set(source)
                .get(module)
                .filter(|info| info.modified)
                .map(|info| info.tree.deep_copy());
            let mut post_tree = match optimized {
                Some(tree) => {
                    debug!(%module, "optimized commit, replay skipped");
                    tree
                }
                None => {
                    let base = file::load(&self.layout, &schema, target)?;
                    let (tree, dropped) =
                        session.oplog(source).replay(module, &base.tree, &schema);
                    if dropped > 0 {
                        warn!(%module, dropped, "conflicting operations dropped during replay");
                    }
                    tree
                }
            };
            validate::materialize_defaults(&schema, &mut post_tree);

            if source == Datastore::Candidate {
                validate::check_enablement(&schema, &post_tree)?;
            }
            let errors = validate::validate_tree(&schema, &post_tree);
            if !errors.is_empty() {
                return Err(DbError::ValidationFailed(errors));
            }
            prepared.push(PreparedModule { schema, post_tree });
        }

        let mut module_errors = Vec::new();
        let commit_id = self
            .commit_prepared(session.id, source, target, prepared, &mut module_errors)
            .await
            .map_err(|err| {
                if !module_errors.is_empty() {
                    session.record_errors(module_errors.clone());
                }
                err
            })?;

        session.oplog(source).clear();
        session.working_set(source).clear();
        session.clear_errors();
        Ok(commit_id)
    }

    /// Copy one datastore's content over another, through the same
    /// verify/notify pipeline. Copies into candidate only touch the
    /// session's working set.
    pub async fn copy_config(
        &self,
        session: &mut Session,
        src: Datastore,
        dst: Datastore,
        module: Option<&str>,
    ) -> Result<u32> {
        if src == dst {
            return Ok(0);
        }
        let user = session.credentials.effective().to_string();

        let modules: Vec<String> = match module {
            Some(module) => vec![module.to_string()],
            None => {
                let order = self.deps.load_order().await?;
                let mut with_data = Vec::new();
                for module in order {
                    let has_data = match src {
                        Datastore::Candidate => session
                            .working_set_ref(Datastore::Candidate)
                            .map(|ws| ws.get(&module).is_some())
                            .unwrap_or(false),
                        other => {
                            file::file_mtime(&self.layout, &module, other)?.is_some()
                        }
                    };
                    if has_data {
                        with_data.push(module);
                    }
                }
                with_data
            }
        };
        if modules.is_empty() {
            return Ok(0);
        }

        let mut prepared = Vec::with_capacity(modules.len());
        for module in &modules {
            self.access.check_read(&user, module)?;
            self.access.check_write(&user, module)?;
            let schema = self.schemas.get(module, None).await?;
            let mut tree = match src {
                Datastore::Candidate => {
                    let ws = session.working_set(Datastore::Candidate);
                    ws.get_or_load(&self.schemas, &self.layout, module)
                        .await?
                        .tree
                        .deep_copy()
                }
                other => file::load(&self.layout, &schema, other)?.tree,
            };
            if dst == Datastore::Running {
                validate::prune_disabled(&schema, &mut tree);
                validate::materialize_defaults(&schema, &mut tree);
            }
            prepared.push(PreparedModule {
                schema,
                post_tree: tree,
            });
        }

        if dst == Datastore::Candidate {
            // candidate is per-session scratch; replace the working copies
            let ws = session.working_set(Datastore::Candidate);
            for PreparedModule { schema, post_tree } in prepared {
                let mut info = file::load(&self.layout, &schema, Datastore::Running)?;
                info.tree = post_tree;
                info.mark_modified();
                ws.insert(info);
            }
            return Ok(0);
        }

        let mut module_errors = Vec::new();
        let commit_id = self
            .commit_prepared(session.id, src, dst, prepared, &mut module_errors)
            .await
            .map_err(|err| {
                if !module_errors.is_empty() {
                    session.record_errors(module_errors.clone());
                }
                err
            })?;
        Ok(commit_id)
    }

    /// Phases A–D over already-computed post-commit trees.
    async fn commit_prepared(
        &self,
        session_id: SessionId,
        source: Datastore,
        target: Datastore,
        prepared: Vec<PreparedModule>,
        module_errors: &mut Vec<ErrorInfo>,
    ) -> Result<u32> {
        // ---- Phase A: context + subscription snapshots --------------------
        let commit_id = self.commits.allocate_id().await?;
        let skip_subscribers = target == Datastore::Startup;
        let mut subs_by_module = HashMap::new();
        if !skip_subscribers {
            for prepared_module in &prepared {
                let module = &prepared_module.schema.name;
                subs_by_module.insert(
                    module.clone(),
                    self.subscriptions.change_snapshot(module).await,
                );
            }
        }

        // ---- Phase B: locks, previous trees -------------------------------
        let mut held: Vec<LockKey> = Vec::new();
        let result = self
            .lock_and_stage(session_id, source, target, &prepared, &mut held)
            .await;
        let prev_trees = match result {
            Ok(prev) => prev,
            Err(err) => {
                self.release_held(&held, session_id).await;
                return Err(err);
            }
        };

        // ---- Phase C: diff + verify ---------------------------------------
        let mut diffs: HashMap<String, Vec<DiffEntry>> = HashMap::new();
        for prepared_module in &prepared {
            let module = &prepared_module.schema.name;
            diffs.insert(
                module.clone(),
                diff_trees(
                    &prepared_module.schema,
                    &prev_trees[module],
                    &prepared_module.post_tree,
                ),
            );
        }

        if !skip_subscribers {
            if let Err(err) = self
                .verify_phase(commit_id, &prepared, &diffs, &subs_by_module)
                .await
            {
                self.release_held(&held, session_id).await;
                return Err(err);
            }
        }

        // ---- Phase D: persist + notify ------------------------------------
        let mut stamped = false;
        for prepared_module in &prepared {
            let module = &prepared_module.schema.name;
            if !module_errors.is_empty() {
                module_errors.push(ErrorInfo::new(
                    "skipped after earlier write failure",
                    format!("/{}:", module),
                ));
                continue;
            }
            match file::write(
                &self.layout,
                &prepared_module.schema,
                target,
                &prepared_module.post_tree,
            ) {
                Ok(_) => {
                    if !stamped {
                        self.stamp_commit();
                        stamped = true;
                    }
                }
                Err(err) => {
                    warn!(%module, %err, "phase D write failed");
                    module_errors.push(ErrorInfo::new(err.to_string(), format!("/{}:", module)));
                }
            }
        }
        if !module_errors.is_empty() {
            self.release_held(&held, session_id).await;
            return Err(DbError::Internal(format!(
                "commit {} failed persisting {} module(s)",
                commit_id,
                module_errors.len()
            )));
        }

        let mut notified: Vec<SubscriptionId> = Vec::new();
        if !skip_subscribers {
            for prepared_module in &prepared {
                let module = &prepared_module.schema.name;
                let diff = &diffs[module];
                if diff.is_empty() {
                    continue;
                }
                for subscription in &subs_by_module[module] {
                    if !subscription.event_filter.wants_notify()
                        || !any_match(&prepared_module.schema, subscription, diff)
                    {
                        continue;
                    }
                    match subscription.deliver(SubscriberEvent::Notify {
                        commit_id,
                        subscription: subscription.id,
                        module: module.clone(),
                    }) {
                        Ok(()) => notified.push(subscription.id),
                        Err(err) => {
                            // notify errors are logged, never rolled back
                            warn!(subscription = subscription.id, %err, "notify delivery failed");
                        }
                    }
                }
            }
        }

        if !notified.is_empty() {
            let mut schemas = HashMap::new();
            let mut new_trees = HashMap::new();
            for prepared_module in &prepared {
                let module = prepared_module.schema.name.clone();
                schemas.insert(module.clone(), Arc::clone(&prepared_module.schema));
                new_trees.insert(module, prepared_module.post_tree.deep_copy());
            }
            let context = CommitContext::new(
                commit_id,
                session_id,
                target,
                schemas,
                prev_trees,
                new_trees,
                diffs,
                notified,
            );
            self.commits.register(Arc::new(context)).await;
        }

        self.release_held(&held, session_id).await;
        info!(commit = commit_id, %target, modules = prepared.len(), "commit persisted");
        Ok(commit_id)
    }

    async fn lock_and_stage(
        &self,
        session_id: SessionId,
        source: Datastore,
        target: Datastore,
        prepared: &[PreparedModule],
        held: &mut Vec<LockKey>,
    ) -> Result<HashMap<String, DataTree>> {
        let mut prev_trees = HashMap::new();
        for prepared_module in prepared {
            let module = &prepared_module.schema.name;

            let module_key = LockKey::Module {
                module: module.clone(),
                datastore: target,
            };
            self.locks
                .lock(module_key.clone(), session_id, true, false)
                .await?;
            held.push(module_key);

            if source == Datastore::Candidate {
                let candidate_key = LockKey::Candidate(module.clone());
                self.locks
                    .lock(candidate_key.clone(), session_id, true, false)
                    .await?;
                held.push(candidate_key);
            }

            // open (create if absent), then take the file write lock
            let path = self.layout.data_file(module, target);
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            let file_key = LockKey::File(path);
            self.locks
                .lock(file_key.clone(), session_id, true, false)
                .await
                .map_err(|_| {
                    DbError::OperationFailed(format!("data file of '{}' is locked", module))
                })?;
            held.push(file_key);

            let prev = file::load(&self.layout, &prepared_module.schema, target)?;
            prev_trees.insert(module.clone(), prev.tree);
        }
        Ok(prev_trees)
    }

    async fn verify_phase(
        &self,
        commit_id: u32,
        prepared: &[PreparedModule],
        diffs: &HashMap<String, Vec<DiffEntry>>,
        subs_by_module: &HashMap<String, Vec<Arc<crate::subscription::Subscription>>>,
    ) -> Result<()> {
        // dispatch every matched verifier first, in priority order
        let mut pending = Vec::new();
        for prepared_module in prepared {
            let module = &prepared_module.schema.name;
            let diff = &diffs[module];
            if diff.is_empty() {
                continue;
            }
            for subscription in &subs_by_module[module] {
                if !subscription.event_filter.wants_verify()
                    || !any_match(&prepared_module.schema, subscription, diff)
                {
                    continue;
                }
                let (tx, rx) = oneshot::channel();
                if subscription
                    .deliver(SubscriberEvent::Verify {
                        commit_id,
                        subscription: subscription.id,
                        module: module.clone(),
                        reply: tx,
                    })
                    .is_err()
                {
                    warn!(subscription = subscription.id, "verifier is gone, skipping");
                    continue;
                }
                pending.push((subscription.id, module.clone(), rx));
            }
        }
        if pending.is_empty() {
            return Ok(());
        }

        // all verifiers share one timeout budget; the joined wait is bounded
        // by a single commit_verify_timeout, not one per verifier
        let deadline = tokio::time::Instant::now() + self.verify_timeout;
        let answers = join_all(pending.into_iter().map(|(id, module, rx)| async move {
            (id, module, tokio::time::timeout_at(deadline, rx).await)
        }))
        .await;

        for (id, module, outcome) in answers {
            match outcome {
                Err(_) => {
                    return Err(DbError::TimedOut(format!(
                        "verifier {} did not answer for '{}'",
                        id, module
                    )));
                }
                Ok(Err(_)) => {
                    warn!(subscription = id, "verifier dropped its reply");
                }
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(veto))) => {
                    return Err(DbError::OperationFailed(format!(
                        "verifier {} rejected commit: {}",
                        id, veto
                    )));
                }
            }
        }
        Ok(())
    }

    async fn release_held(&self, held: &[LockKey], session_id: SessionId) {
        for key in held.iter().rev() {
            let _ = self.locks.unlock(key, session_id).await;
        }
    }
}
