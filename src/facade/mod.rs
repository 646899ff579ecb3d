mod ops;

use crate::access::{AccessControl, Permissive};
use crate::commit::{Change, CommitEngine, CommitRegistry};
use crate::config::EngineConfig;
use crate::core::{
    Datastore, DbError, EditFlags, ErrorInfo, MovePosition, Result, SessionId, TypedValue, Value,
};
use crate::dispatch::queue::RequestQueue;
use crate::dispatch::worker::{QueueItem, Reply, Request, SubscribeSpec, run_worker};
use crate::opdata::OpDataBroker;
use crate::schema::{DepEdge, ModuleDepIndex, ModuleSchema, SchemaLoader, SchemaRegistry};
use crate::session::{Credentials, SessionTable};
use crate::store::layout::RepoLayout;
use crate::store::notifications::{NotificationStore, RetainedNotification};
use crate::store::settings::{FileSettingsStore, SettingsStore};
use crate::subscription::{
    NotifEventFilter, SubscriberEvent, SubscriptionId, SubscriptionKind, SubscriptionRegistry,
};
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::info;

/// The single engine value everything borrows: registries, lock set, commit
/// machinery, session table, and the request queue.
pub struct EngineCore {
    pub(crate) config: EngineConfig,
    pub(crate) layout: RepoLayout,
    pub(crate) schemas: Arc<SchemaRegistry>,
    pub(crate) deps: Arc<ModuleDepIndex>,
    pub(crate) locks: Arc<crate::lock::LockSet>,
    pub(crate) commits: Arc<CommitRegistry>,
    pub(crate) subscriptions: Arc<SubscriptionRegistry>,
    pub(crate) settings: Arc<dyn SettingsStore>,
    pub(crate) notifications: NotificationStore,
    pub(crate) sessions: SessionTable,
    /// Reads take this shared, commits exclusive: no read ever runs
    /// concurrent with a commit.
    pub(crate) engine_rw: RwLock<()>,
    pub(crate) commit_engine: CommitEngine,
    pub(crate) broker: OpDataBroker,
    pub(crate) access: Arc<dyn AccessControl>,
    pub(crate) queue: RequestQueue<QueueItem>,
}

/// The datastore engine handle.
///
/// Opens the repository, owns the worker pool, and hands out connections.
pub struct ConfigDb {
    core: Arc<EngineCore>,
    workers: Vec<JoinHandle<()>>,
}

impl ConfigDb {
    /// Open with default collaborators: no schema loader, allow-all access
    /// control, JSON settings under the repository.
    pub async fn open(config: EngineConfig) -> Result<Self> {
        Self::open_with(config, None, Arc::new(Permissive)).await
    }

    pub async fn open_with(
        config: EngineConfig,
        loader: Option<Arc<dyn SchemaLoader>>,
        access: Arc<dyn AccessControl>,
    ) -> Result<Self> {
        config.validate().map_err(DbError::InitFailed)?;
        let layout = RepoLayout::new(&config.repo_root);
        layout.ensure()?;

        let schemas = Arc::new(SchemaRegistry::new(loader));
        let deps = Arc::new(ModuleDepIndex::new());
        let locks = Arc::new(crate::lock::LockSet::new());
        let commits = Arc::new(CommitRegistry::new());
        let subscriptions = Arc::new(SubscriptionRegistry::new());
        let settings: Arc<dyn SettingsStore> = Arc::new(FileSettingsStore::new(layout.clone()));
        let notifications = NotificationStore::new(
            &layout,
            config.notification_file_window,
            config.notification_age_out,
        );
        let commit_engine = CommitEngine::new(
            layout.clone(),
            Arc::clone(&schemas),
            Arc::clone(&deps),
            Arc::clone(&locks),
            Arc::clone(&subscriptions),
            Arc::clone(&commits),
            Arc::clone(&access),
            config.commit_verify_timeout,
            config.freshness_granularity,
        );
        let broker = OpDataBroker::new(
            Arc::clone(&subscriptions),
            config.operational_data_timeout,
        );

        let core = Arc::new(EngineCore {
            queue: RequestQueue::new(config.queue_capacity),
            layout,
            schemas,
            deps,
            locks,
            commits,
            subscriptions,
            settings,
            notifications,
            sessions: SessionTable::new(),
            engine_rw: RwLock::new(()),
            commit_engine,
            broker,
            access,
            config,
        });

        let workers: Vec<JoinHandle<()>> = (0..core.config.worker_count)
            .map(|index| {
                let core = Arc::clone(&core);
                tokio::spawn(run_worker(core, index))
            })
            .collect();

        info!(repo = %core.layout.root().display(), workers = core.config.worker_count, "engine opened");
        Ok(Self { core, workers })
    }

    pub fn connect(&self) -> Connection {
        Connection {
            core: Arc::clone(&self.core),
        }
    }

    /// Install a schema (with its dependency edges) and broadcast the
    /// install to subscribers.
    pub async fn install_module(
        &self,
        schema: ModuleSchema,
        deps: Vec<DepEdge>,
    ) -> Result<Arc<ModuleSchema>> {
        let _guard = self.core.engine_rw.write().await;
        let installed = self
            .core
            .schemas
            .install(schema, deps, &self.core.deps, &*self.core.settings)
            .await?;
        for subscription in self
            .core
            .subscriptions
            .all_of_kind(SubscriptionKind::ModuleInstall)
            .await
        {
            let _ = subscription.deliver(SubscriberEvent::ModuleInstall {
                module: installed.name.clone(),
                revision: installed.revision.clone(),
                installed: true,
            });
        }
        Ok(installed)
    }

    /// Uninstall a module for the rest of the process lifetime.
    pub async fn uninstall_module(&self, name: &str) -> Result<()> {
        let _guard = self.core.engine_rw.write().await;
        let revision = self
            .core
            .schemas
            .get(name, None)
            .await
            .ok()
            .and_then(|s| s.revision.clone());
        self.core
            .schemas
            .module_disable(name, &self.core.deps)
            .await?;
        for subscription in self
            .core
            .subscriptions
            .all_of_kind(SubscriptionKind::ModuleInstall)
            .await
        {
            let _ = subscription.deliver(SubscriberEvent::ModuleInstall {
                module: name.to_string(),
                revision: revision.clone(),
                installed: false,
            });
        }
        Ok(())
    }

    /// Toggle a feature, persist it, and broadcast the change.
    pub async fn feature_enable(&self, module: &str, feature: &str, enabled: bool) -> Result<()> {
        self.core
            .schemas
            .feature_enable(module, feature, enabled, &*self.core.settings)
            .await?;
        for subscription in self
            .core
            .subscriptions
            .all_of_kind(SubscriptionKind::FeatureEnable)
            .await
        {
            let _ = subscription.deliver(SubscriberEvent::FeatureEnable {
                module: module.to_string(),
                feature: feature.to_string(),
                enabled,
            });
        }
        Ok(())
    }

    /// Enable a subtree for the running datastore.
    pub async fn enable_running_subtree(&self, module: &str, xpath: &str) -> Result<()> {
        self.core
            .schemas
            .subtree_enable(module, xpath, &*self.core.settings)
            .await
    }

    /// Replay retained event notifications.
    pub fn replay_notifications(
        &self,
        xpath_prefix: Option<&str>,
        since: i64,
        until: i64,
    ) -> Result<Vec<RetainedNotification>> {
        self.core.notifications.replay(xpath_prefix, since, until)
    }

    /// Stop the worker pool and drop the engine.
    pub async fn shutdown(self) -> Result<()> {
        for _ in 0..self.workers.len() {
            let _ = self.core.queue.push(QueueItem::Shutdown);
        }
        for worker in self.workers {
            let _ = worker.await;
        }
        Ok(())
    }
}

/// A client connection; sessions are started from here.
pub struct Connection {
    core: Arc<EngineCore>,
}

impl Connection {
    pub async fn session_start(
        &self,
        credentials: Credentials,
        datastore: Datastore,
    ) -> Result<SessionHandle> {
        let (id, _session) = self.core.sessions.create(credentials, datastore).await;
        Ok(SessionHandle {
            core: Arc::clone(&self.core),
            id,
        })
    }
}

/// Handle to one session. Every call is routed through the dispatcher.
pub struct SessionHandle {
    core: Arc<EngineCore>,
    id: SessionId,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.id
    }

    async fn roundtrip<T>(
        &self,
        build: impl FnOnce(Reply<T>) -> Request,
        long: bool,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.core.queue.push(QueueItem::Request {
            session: self.id,
            request: build(tx),
        })?;
        let deadline = if long {
            self.core.config.long_request_timeout
        } else {
            self.core.config.request_timeout
        };
        match tokio::time::timeout(deadline, rx).await {
            Err(_) => Err(DbError::TimedOut("request timed out".to_string())),
            Ok(Err(_)) => Err(DbError::Internal("request dropped by dispatcher".to_string())),
            Ok(Ok(result)) => result,
        }
    }

    pub async fn get_item(&self, xpath: &str) -> Result<TypedValue> {
        self.roundtrip(
            |reply| Request::GetItem {
                xpath: xpath.to_string(),
                reply,
            },
            false,
        )
        .await
    }

    pub async fn get_items(&self, xpath: &str) -> Result<Vec<TypedValue>> {
        self.roundtrip(
            |reply| Request::GetItems {
                xpath: xpath.to_string(),
                reply,
            },
            false,
        )
        .await
    }

    pub async fn set_item(
        &self,
        xpath: &str,
        value: Option<Value>,
        flags: EditFlags,
    ) -> Result<()> {
        self.roundtrip(
            |reply| Request::SetItem {
                xpath: xpath.to_string(),
                value,
                flags,
                reply,
            },
            false,
        )
        .await
    }

    pub async fn delete_item(&self, xpath: &str, flags: EditFlags) -> Result<()> {
        self.roundtrip(
            |reply| Request::DeleteItem {
                xpath: xpath.to_string(),
                flags,
                reply,
            },
            false,
        )
        .await
    }

    pub async fn move_item(
        &self,
        xpath: &str,
        position: MovePosition,
        relative: Option<&str>,
    ) -> Result<()> {
        self.roundtrip(
            |reply| Request::MoveItem {
                xpath: xpath.to_string(),
                position,
                relative: relative.map(str::to_string),
                reply,
            },
            false,
        )
        .await
    }

    pub async fn validate(&self) -> Result<()> {
        self.roundtrip(|reply| Request::Validate { reply }, false).await
    }

    /// Commit pending edits; returns the commit id (0 when nothing was
    /// pending).
    pub async fn commit(&self) -> Result<u32> {
        self.roundtrip(|reply| Request::Commit { reply }, true).await
    }

    pub async fn copy_config(
        &self,
        src: Datastore,
        dst: Datastore,
        module: Option<&str>,
    ) -> Result<u32> {
        self.roundtrip(
            |reply| Request::CopyConfig {
                src,
                dst,
                module: module.map(str::to_string),
                reply,
            },
            true,
        )
        .await
    }

    pub async fn discard_changes(&self) -> Result<()> {
        self.roundtrip(|reply| Request::DiscardChanges { reply }, false)
            .await
    }

    /// Drop stale working copies so later reads see the latest commits.
    pub async fn refresh(&self) -> Result<()> {
        self.roundtrip(|reply| Request::Refresh { reply }, false).await
    }

    pub async fn lock_datastore(&self) -> Result<()> {
        self.roundtrip(|reply| Request::LockDatastore { reply }, false)
            .await
    }

    pub async fn unlock_datastore(&self) -> Result<()> {
        self.roundtrip(|reply| Request::UnlockDatastore { reply }, false)
            .await
    }

    pub async fn lock_module(&self, module: &str) -> Result<()> {
        self.roundtrip(
            |reply| Request::LockModule {
                module: module.to_string(),
                reply,
            },
            false,
        )
        .await
    }

    pub async fn unlock_module(&self, module: &str) -> Result<()> {
        self.roundtrip(
            |reply| Request::UnlockModule {
                module: module.to_string(),
                reply,
            },
            false,
        )
        .await
    }

    /// Subscribe with a caller-supplied delivery address. Several
    /// subscriptions may share one address; events carry the subscription id.
    #[allow(clippy::too_many_arguments)]
    pub async fn subscribe_with_address(
        &self,
        module: &str,
        xpath: Option<&str>,
        kind: SubscriptionKind,
        priority: u32,
        event_filter: NotifEventFilter,
        enables_running: bool,
        address: mpsc::UnboundedSender<SubscriberEvent>,
    ) -> Result<SubscriptionId> {
        let spec = SubscribeSpec {
            module: module.to_string(),
            xpath: xpath.map(str::to_string),
            kind,
            priority,
            event_filter,
            enables_running,
        };
        self.roundtrip(
            |reply| Request::Subscribe {
                spec,
                address,
                reply,
            },
            false,
        )
        .await
    }

    /// Subscribe; events arrive on the returned receiver.
    pub async fn subscribe(
        &self,
        module: &str,
        xpath: Option<&str>,
        kind: SubscriptionKind,
        priority: u32,
        event_filter: NotifEventFilter,
        enables_running: bool,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<SubscriberEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self
            .subscribe_with_address(module, xpath, kind, priority, event_filter, enables_running, tx)
            .await?;
        Ok((id, rx))
    }

    pub async fn subscribe_module_change(
        &self,
        module: &str,
        priority: u32,
        event_filter: NotifEventFilter,
        enables_running: bool,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<SubscriberEvent>)> {
        self.subscribe(
            module,
            None,
            SubscriptionKind::ModuleChange,
            priority,
            event_filter,
            enables_running,
        )
        .await
    }

    pub async fn subscribe_subtree_change(
        &self,
        xpath: &str,
        priority: u32,
        event_filter: NotifEventFilter,
        enables_running: bool,
    ) -> Result<(SubscriptionId, mpsc::UnboundedReceiver<SubscriberEvent>)> {
        let module = crate::tree::xpath::XPath::parse(xpath)?.module().to_string();
        self.subscribe(
            &module,
            Some(xpath),
            SubscriptionKind::SubtreeChange,
            priority,
            event_filter,
            enables_running,
        )
        .await
    }

    pub async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        self.roundtrip(|reply| Request::Unsubscribe { id, reply }, false)
            .await
    }

    pub async fn rpc_send(&self, xpath: &str, input: Vec<TypedValue>) -> Result<Vec<TypedValue>> {
        self.roundtrip(
            |reply| Request::RpcSend {
                xpath: xpath.to_string(),
                input,
                reply,
            },
            true,
        )
        .await
    }

    pub async fn action_send(
        &self,
        xpath: &str,
        input: Vec<TypedValue>,
    ) -> Result<Vec<TypedValue>> {
        self.roundtrip(
            |reply| Request::ActionSend {
                xpath: xpath.to_string(),
                input,
                reply,
            },
            true,
        )
        .await
    }

    pub async fn event_notif_send(&self, xpath: &str, values: Vec<TypedValue>) -> Result<()> {
        self.roundtrip(
            |reply| Request::EventNotifSend {
                xpath: xpath.to_string(),
                values,
                reply,
            },
            false,
        )
        .await
    }

    /// Iterate the changes a commit produced (verify/notify callbacks).
    pub async fn changes(&self, commit_id: u32, xpath: Option<&str>) -> Result<Vec<Change>> {
        self.roundtrip(
            |reply| Request::Changes {
                commit_id,
                xpath: xpath.map(str::to_string),
                reply,
            },
            false,
        )
        .await
    }

    /// Acknowledge a notified commit; the last acknowledgment frees its
    /// retained context.
    pub async fn commit_ack(&self, commit_id: u32) -> Result<()> {
        self.roundtrip(|reply| Request::CommitAck { commit_id, reply }, false)
            .await
    }

    /// Force-release a retained commit context.
    pub async fn commit_release(&self, commit_id: u32) -> Result<()> {
        self.roundtrip(|reply| Request::CommitRelease { commit_id, reply }, false)
            .await
    }

    pub async fn switch_datastore(&self, datastore: Datastore) -> Result<()> {
        self.roundtrip(|reply| Request::SwitchDatastore { datastore, reply }, false)
            .await
    }

    /// Bind a commit id to this session for the duration of a verify/notify
    /// callback; `changes(0, ...)` then reads that commit's context.
    pub async fn bind_notification_commit(&self, commit_id: Option<u32>) -> Result<()> {
        let session = self.core.sessions.get(self.id).await?;
        session.lock().await.notification_commit_id = commit_id;
        Ok(())
    }

    /// Last errors recorded on the session (validation and commit record
    /// several at once).
    pub async fn last_errors(&self) -> Result<Vec<ErrorInfo>> {
        let session = self.core.sessions.get(self.id).await?;
        let session = session.lock().await;
        Ok(session.last_errors().to_vec())
    }

    pub async fn session_stop(self) -> Result<()> {
        self.roundtrip(|reply| Request::SessionStop { reply }, false)
            .await
    }
}
