use crate::commit::Change;
use crate::core::{
    DbError, EditFlags, MovePosition, Result, SessionId, SessionState, TypedValue, Value,
};
use crate::dispatch::worker::SubscribeSpec;
use crate::facade::EngineCore;
use crate::schema::NodeKind;
use crate::session::{EditOp, Session};
use crate::store::notifications::{NotificationStore, RetainedNotification};
use crate::store::settings::DurableSubscription;
use crate::subscription::{SubscriberEvent, SubscriptionId, SubscriptionKind};
use crate::tree::xpath::XPath;
use crate::validate::{self, Direction, ProcedureKind};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

fn kind_name(kind: SubscriptionKind) -> &'static str {
    match kind {
        SubscriptionKind::ModuleChange => "module-change",
        SubscriptionKind::SubtreeChange => "subtree-change",
        SubscriptionKind::Rpc => "rpc",
        SubscriptionKind::Action => "action",
        SubscriptionKind::EventNotification => "event-notification",
        SubscriptionKind::OperationalData => "operational-data",
        SubscriptionKind::ModuleInstall => "module-install",
        SubscriptionKind::FeatureEnable => "feature-enable",
    }
}

impl EngineCore {
    pub(crate) async fn op_get_items(
        &self,
        session: &mut Session,
        xpath: &str,
    ) -> Result<Vec<TypedValue>> {
        let path = XPath::parse(xpath)?;
        let module = path.module().to_string();
        self.access
            .check_read(session.credentials.effective(), &module)?;
        let schema = self.schemas.get(&module, None).await?;

        // state data: ask the providers before answering
        if schema.has_operational_data() && session.state != SessionState::DataLoaded {
            self.broker
                .assemble(session, &self.schemas, &self.layout, &module)
                .await?;
        }

        let datastore = session.datastore;
        let info = session
            .working_set(datastore)
            .get_or_load(&self.schemas, &self.layout, &module)
            .await?;
        let found = path.find(&info.tree, &schema)?;
        let mut values = Vec::with_capacity(found.len());
        for id in found {
            let node = info.tree.node(id);
            let value = match &node.value {
                Some(value) => value.clone(),
                None => match &schema.node(node.schema).kind {
                    NodeKind::Container { presence: true } => Value::PresenceContainer,
                    NodeKind::Container { presence: false } => Value::Container,
                    _ => Value::List,
                },
            };
            values.push(TypedValue {
                xpath: info.tree.path_of(id, &schema),
                origin_default: node.default,
                value,
            });
        }
        Ok(values)
    }

    pub(crate) async fn op_get_item(
        &self,
        session: &mut Session,
        xpath: &str,
    ) -> Result<TypedValue> {
        let mut items = self.op_get_items(session, xpath).await?;
        match items.len() {
            0 => Err(DbError::NotFound(format!("no data at '{}'", xpath))),
            1 => Ok(items.remove(0)),
            _ => Err(DbError::InvalidArg(format!(
                "'{}' denotes {} nodes, use get_items",
                xpath,
                items.len()
            ))),
        }
    }

    pub(crate) async fn op_set_item(
        &self,
        session: &mut Session,
        xpath: &str,
        value: Option<Value>,
        flags: EditFlags,
    ) -> Result<()> {
        let path = XPath::parse(xpath)?;
        let module = path.module().to_string();
        self.access
            .check_write(session.credentials.effective(), &module)?;
        let schema = self.schemas.get(&module, None).await?;

        let datastore = session.datastore;
        {
            let info = session
                .working_set(datastore)
                .get_or_load(&self.schemas, &self.layout, &module)
                .await?;
            crate::tree::edit::apply_set(&mut info.tree, &schema, &path, value.as_ref(), flags)?;
            info.mark_modified();
        }
        session.oplog(datastore).append(EditOp::Set {
            xpath: xpath.to_string(),
            value,
            flags,
        });
        Ok(())
    }

    pub(crate) async fn op_delete_item(
        &self,
        session: &mut Session,
        xpath: &str,
        flags: EditFlags,
    ) -> Result<()> {
        let path = XPath::parse(xpath)?;
        let module = path.module().to_string();
        self.access
            .check_write(session.credentials.effective(), &module)?;
        let schema = self.schemas.get(&module, None).await?;

        let datastore = session.datastore;
        {
            let info = session
                .working_set(datastore)
                .get_or_load(&self.schemas, &self.layout, &module)
                .await?;
            crate::tree::edit::apply_delete(&mut info.tree, &schema, &path, flags)?;
            info.mark_modified();
        }
        session.oplog(datastore).append(EditOp::Delete {
            xpath: xpath.to_string(),
            flags,
        });
        Ok(())
    }

    pub(crate) async fn op_move_item(
        &self,
        session: &mut Session,
        xpath: &str,
        position: MovePosition,
        relative: Option<&str>,
    ) -> Result<()> {
        let path = XPath::parse(xpath)?;
        let module = path.module().to_string();
        self.access
            .check_write(session.credentials.effective(), &module)?;
        let schema = self.schemas.get(&module, None).await?;
        let relative_path = relative.map(XPath::parse).transpose()?;

        let datastore = session.datastore;
        {
            let info = session
                .working_set(datastore)
                .get_or_load(&self.schemas, &self.layout, &module)
                .await?;
            crate::tree::edit::apply_move(
                &mut info.tree,
                &schema,
                &path,
                position,
                relative_path.as_ref(),
            )?;
            info.mark_modified();
        }
        session.oplog(datastore).append(EditOp::Move {
            xpath: xpath.to_string(),
            position,
            relative: relative.map(str::to_string),
        });
        Ok(())
    }

    /// Full validation of every modified module, read-only from the
    /// caller's point of view.
    pub(crate) async fn op_validate(&self, session: &mut Session) -> Result<()> {
        let datastore = session.datastore;
        let mut modules = session.oplog(datastore).modules();
        for module in session.working_set(datastore).modified_modules() {
            if !modules.contains(&module) {
                modules.push(module);
            }
        }

        let mut errors = Vec::new();
        for module in modules {
            let schema = self.schemas.get(&module, None).await?;
            let info = session
                .working_set(datastore)
                .get_or_load(&self.schemas, &self.layout, &module)
                .await?;
            validate::materialize_defaults(&schema, &mut info.tree);
            errors.extend(validate::validate_tree(&schema, &info.tree));
        }
        if errors.is_empty() {
            session.clear_errors();
            Ok(())
        } else {
            Err(DbError::ValidationFailed(errors))
        }
    }

    pub(crate) fn op_refresh(&self, session: &mut Session) -> Result<()> {
        let datastore = session.datastore;
        let last_commit = self.commit_engine.last_commit_time();
        session.working_set(datastore).refresh(
            &self.layout,
            last_commit,
            self.config.freshness_granularity,
        );
        Ok(())
    }

    pub(crate) async fn op_lock_datastore(&self, session: &mut Session) -> Result<()> {
        let datastore = session.datastore;
        if session.has_unsaved_changes(datastore) {
            return Err(DbError::OperationFailed(
                "session has unsaved changes, commit or discard them first".to_string(),
            ));
        }
        let modules = self.deps.load_order().await?;
        self.locks.lock_all(datastore, session.id, &modules).await?;
        session.holds_datastore_lock = true;
        Ok(())
    }

    pub(crate) async fn op_unlock_datastore(&self, session: &mut Session) -> Result<()> {
        let datastore = session.datastore;
        let modules = self.deps.load_order().await?;
        self.locks
            .unlock_all(datastore, session.id, &modules)
            .await?;
        session.holds_datastore_lock = false;
        Ok(())
    }

    pub(crate) async fn op_lock_module(&self, session: &mut Session, module: &str) -> Result<()> {
        self.schemas.get(module, None).await?;
        self.locks
            .lock(
                crate::lock::LockKey::Module {
                    module: module.to_string(),
                    datastore: session.datastore,
                },
                session.id,
                true,
                false,
            )
            .await
    }

    pub(crate) async fn op_unlock_module(
        &self,
        session: &mut Session,
        module: &str,
    ) -> Result<()> {
        self.locks
            .unlock(
                &crate::lock::LockKey::Module {
                    module: module.to_string(),
                    datastore: session.datastore,
                },
                session.id,
            )
            .await
    }

    pub(crate) async fn op_subscribe(
        &self,
        session: &mut Session,
        spec: SubscribeSpec,
        address: mpsc::UnboundedSender<SubscriberEvent>,
    ) -> Result<SubscriptionId> {
        let schema = self.schemas.get(&spec.module, None).await?;
        let xpath = spec.xpath.as_deref().map(XPath::parse).transpose()?;
        if let Some(path) = &xpath {
            path.resolve_schema(&schema)?;
        }

        // subscribing may enable the subtree (or whole module) in running
        if spec.enables_running
            && matches!(
                spec.kind,
                SubscriptionKind::ModuleChange | SubscriptionKind::SubtreeChange
            )
        {
            match &xpath {
                Some(path) => {
                    self.schemas
                        .subtree_enable(&spec.module, &path.to_string(), &*self.settings)
                        .await?;
                }
                None => {
                    for &root in schema.roots() {
                        self.schemas
                            .subtree_enable(&spec.module, &schema.path_of(root), &*self.settings)
                            .await?;
                    }
                }
            }
        }

        let subscription = self
            .subscriptions
            .subscribe(
                &spec.module,
                xpath,
                spec.kind,
                spec.priority,
                spec.event_filter,
                spec.enables_running,
                address,
            )
            .await;

        // durable descriptor for restart recovery
        let mut persisted = self.settings.load(&spec.module).unwrap_or_default();
        persisted.subscriptions.push(DurableSubscription {
            kind: kind_name(spec.kind).to_string(),
            destination: format!("session:{}", session.id),
            id: subscription.id,
            xpath: spec.xpath.clone(),
            priority: spec.priority,
        });
        if let Err(err) = self.settings.save(&spec.module, &persisted) {
            warn!(module = %spec.module, %err, "subscription descriptor not persisted");
        }
        Ok(subscription.id)
    }

    pub(crate) async fn op_unsubscribe(
        &self,
        _session: &mut Session,
        id: SubscriptionId,
    ) -> Result<()> {
        let removed = self.subscriptions.unsubscribe(id).await?;
        let mut persisted = self.settings.load(&removed.module).unwrap_or_default();
        persisted.subscriptions.retain(|s| s.id != id);
        if let Err(err) = self.settings.save(&removed.module, &persisted) {
            warn!(module = %removed.module, %err, "subscription descriptor not removed");
        }
        Ok(())
    }

    /// Shared RPC/action path: validate input, route to the registered
    /// handler, validate output.
    pub(crate) async fn op_rpc_send(
        &self,
        session: &mut Session,
        xpath: &str,
        input: Vec<TypedValue>,
        is_action: bool,
    ) -> Result<Vec<TypedValue>> {
        let path = XPath::parse(xpath)?;
        let module = path.module().to_string();
        self.access
            .check_read(session.credentials.effective(), &module)?;
        let schema = self.schemas.get(&module, None).await?;

        let kind = if is_action {
            ProcedureKind::Action
        } else {
            ProcedureKind::Rpc
        };
        let data_view = if is_action {
            let datastore = session.datastore;
            let info = session
                .working_set(datastore)
                .get_or_load(&self.schemas, &self.layout, &module)
                .await?;
            Some(info.tree.deep_copy())
        } else {
            None
        };

        let completed =
            validate::validate_procedure(&schema, data_view.as_ref(), kind, &path, input, Direction::Input)?;

        let sub_kind = if is_action {
            SubscriptionKind::Action
        } else {
            SubscriptionKind::Rpc
        };
        let proc_node = path.resolve_schema(&schema)?;
        let handlers = self.subscriptions.snapshot(&module, sub_kind).await;
        let handler = handlers
            .iter()
            .find(|s| match &s.xpath {
                None => true,
                Some(x) => x
                    .resolve_schema(&schema)
                    .map(|node| node == proc_node)
                    .unwrap_or(false),
            })
            .ok_or_else(|| {
                DbError::NotFound(format!("no handler subscribed for '{}'", xpath))
            })?;

        let (tx, rx) = oneshot::channel();
        let event = if is_action {
            SubscriberEvent::Action {
                xpath: path.to_string(),
                input: completed,
                reply: tx,
            }
        } else {
            SubscriberEvent::Rpc {
                xpath: path.to_string(),
                input: completed,
                reply: tx,
            }
        };
        handler.deliver(event)?;

        let output = tokio::time::timeout(self.config.long_request_timeout, rx)
            .await
            .map_err(|_| DbError::TimedOut(format!("handler of '{}' did not answer", xpath)))?
            .map_err(|_| DbError::Disconnect(format!("handler of '{}' went away", xpath)))??;

        validate::validate_procedure(
            &schema,
            data_view.as_ref(),
            kind,
            &path,
            output,
            Direction::Output,
        )
    }

    pub(crate) async fn op_event_notif_send(
        &self,
        session: &mut Session,
        xpath: &str,
        values: Vec<TypedValue>,
    ) -> Result<()> {
        let path = XPath::parse(xpath)?;
        let module = path.module().to_string();
        self.access
            .check_read(session.credentials.effective(), &module)?;
        let schema = self.schemas.get(&module, None).await?;

        let data_view = if path.steps.len() > 1 {
            let datastore = session.datastore;
            let info = session
                .working_set(datastore)
                .get_or_load(&self.schemas, &self.layout, &module)
                .await?;
            Some(info.tree.deep_copy())
        } else {
            None
        };
        let completed = validate::validate_procedure(
            &schema,
            data_view.as_ref(),
            ProcedureKind::EventNotification,
            &path,
            values,
            Direction::Input,
        )?;

        let timestamp = NotificationStore::now_timestamp();
        self.notifications.append(&RetainedNotification {
            xpath: path.to_string(),
            values: completed.clone(),
            timestamp,
        })?;
        if let Err(err) = self.notifications.purge_aged(timestamp) {
            warn!(%err, "notification age-out sweep failed");
        }

        let proc_node = path.resolve_schema(&schema)?;
        for subscription in self
            .subscriptions
            .snapshot(&module, SubscriptionKind::EventNotification)
            .await
        {
            let interested = match &subscription.xpath {
                None => true,
                Some(x) => x
                    .resolve_schema(&schema)
                    .map(|node| schema.is_self_or_ancestor(node, proc_node))
                    .unwrap_or(false),
            };
            if !interested {
                continue;
            }
            if let Err(err) = subscription.deliver(SubscriberEvent::EventNotification {
                xpath: path.to_string(),
                values: completed.clone(),
                timestamp,
            }) {
                warn!(subscription = subscription.id, %err, "notification delivery failed");
            }
        }
        Ok(())
    }

    /// Iterate a retained commit context, filtered to a schema subtree.
    pub(crate) async fn op_changes(
        &self,
        session: &mut Session,
        commit_id: u32,
        xpath: Option<&str>,
    ) -> Result<Vec<Change>> {
        let id = if commit_id != 0 {
            commit_id
        } else {
            session.notification_commit_id.ok_or_else(|| {
                DbError::InvalidArg("no commit id given and none bound to the session".to_string())
            })?
        };
        let context = self.commits.get(id).await?;
        let path = xpath.map(XPath::parse).transpose()?;
        context.changes(path.as_ref())
    }

    pub(crate) async fn op_session_stop(&self, id: SessionId) -> Result<()> {
        self.sessions.remove(id).await?;
        self.locks.release_session(id).await;
        Ok(())
    }
}
