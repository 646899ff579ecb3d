use crate::commit::Change;
use crate::core::{
    Datastore, DbError, EditFlags, MovePosition, Result, SessionId, SessionState, TypedValue,
    Value,
};
use crate::facade::EngineCore;
use crate::subscription::{
    NotifEventFilter, SubscriberEvent, SubscriptionId, SubscriptionKind,
};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

pub type Reply<T> = oneshot::Sender<Result<T>>;

/// Parameters of a subscribe request.
#[derive(Debug)]
pub struct SubscribeSpec {
    pub module: String,
    pub xpath: Option<String>,
    pub kind: SubscriptionKind,
    pub priority: u32,
    pub event_filter: NotifEventFilter,
    pub enables_running: bool,
}

/// One client request routed through the dispatcher.
pub enum Request {
    GetItem {
        xpath: String,
        reply: Reply<TypedValue>,
    },
    GetItems {
        xpath: String,
        reply: Reply<Vec<TypedValue>>,
    },
    SetItem {
        xpath: String,
        value: Option<Value>,
        flags: EditFlags,
        reply: Reply<()>,
    },
    DeleteItem {
        xpath: String,
        flags: EditFlags,
        reply: Reply<()>,
    },
    MoveItem {
        xpath: String,
        position: MovePosition,
        relative: Option<String>,
        reply: Reply<()>,
    },
    Validate {
        reply: Reply<()>,
    },
    Commit {
        reply: Reply<u32>,
    },
    CopyConfig {
        src: Datastore,
        dst: Datastore,
        module: Option<String>,
        reply: Reply<u32>,
    },
    DiscardChanges {
        reply: Reply<()>,
    },
    Refresh {
        reply: Reply<()>,
    },
    LockDatastore {
        reply: Reply<()>,
    },
    UnlockDatastore {
        reply: Reply<()>,
    },
    LockModule {
        module: String,
        reply: Reply<()>,
    },
    UnlockModule {
        module: String,
        reply: Reply<()>,
    },
    Subscribe {
        spec: SubscribeSpec,
        address: mpsc::UnboundedSender<SubscriberEvent>,
        reply: Reply<SubscriptionId>,
    },
    Unsubscribe {
        id: SubscriptionId,
        reply: Reply<()>,
    },
    RpcSend {
        xpath: String,
        input: Vec<TypedValue>,
        reply: Reply<Vec<TypedValue>>,
    },
    ActionSend {
        xpath: String,
        input: Vec<TypedValue>,
        reply: Reply<Vec<TypedValue>>,
    },
    EventNotifSend {
        xpath: String,
        values: Vec<TypedValue>,
        reply: Reply<()>,
    },
    Changes {
        commit_id: u32,
        xpath: Option<String>,
        reply: Reply<Vec<Change>>,
    },
    CommitAck {
        commit_id: u32,
        reply: Reply<()>,
    },
    CommitRelease {
        commit_id: u32,
        reply: Reply<()>,
    },
    SwitchDatastore {
        datastore: Datastore,
        reply: Reply<()>,
    },
    SessionStop {
        reply: Reply<()>,
    },
}

/// Queue element: a session-bound request, or the poison pill that stops a
/// worker.
pub enum QueueItem {
    Request {
        session: SessionId,
        request: Request,
    },
    Shutdown,
}

enum LockClass {
    /// Shared engine access; the bulk of the API.
    Read,
    /// Exclusive engine access: commit and copy-config.
    Write,
    /// Commit-context plane; must stay callable while a commit holds the
    /// write guard (verify/notify callbacks iterate changes).
    None,
}

fn lock_class(request: &Request) -> LockClass {
    match request {
        Request::Commit { .. } | Request::CopyConfig { .. } => LockClass::Write,
        Request::Changes { .. }
        | Request::CommitAck { .. }
        | Request::CommitRelease { .. } => LockClass::None,
        _ => LockClass::Read,
    }
}

/// Worker body: dequeue, dispatch, repeat until the poison pill.
pub async fn run_worker(core: Arc<EngineCore>, index: usize) {
    debug!(worker = index, "dispatcher worker started");
    loop {
        match core.queue.pop().await {
            QueueItem::Shutdown => break,
            QueueItem::Request { session, request } => match lock_class(&request) {
                LockClass::Write => {
                    let _guard = core.engine_rw.write().await;
                    handle(&core, session, request).await;
                }
                LockClass::Read => {
                    let _guard = core.engine_rw.read().await;
                    handle(&core, session, request).await;
                }
                LockClass::None => handle(&core, session, request).await,
            },
        }
    }
    debug!(worker = index, "dispatcher worker stopped");
}

async fn handle(core: &Arc<EngineCore>, session_id: SessionId, request: Request) {
    let session = match core.sessions.get(session_id).await {
        Ok(session) => session,
        Err(err) => {
            abort_with(request, err);
            return;
        }
    };
    // the session's own mutex serializes state transitions; no two workers
    // ever dispatch the same session concurrently
    let mut session = session.lock().await;
    session.state = SessionState::Processing;

    match request {
        Request::GetItem { xpath, reply } => {
            let result = core.op_get_item(&mut session, &xpath).await;
            record_and_send(&mut session, reply, result);
        }
        Request::GetItems { xpath, reply } => {
            let result = core.op_get_items(&mut session, &xpath).await;
            record_and_send(&mut session, reply, result);
        }
        Request::SetItem {
            xpath,
            value,
            flags,
            reply,
        } => {
            let result = core.op_set_item(&mut session, &xpath, value, flags).await;
            record_and_send(&mut session, reply, result);
        }
        Request::DeleteItem {
            xpath,
            flags,
            reply,
        } => {
            let result = core.op_delete_item(&mut session, &xpath, flags).await;
            record_and_send(&mut session, reply, result);
        }
        Request::MoveItem {
            xpath,
            position,
            relative,
            reply,
        } => {
            let result = core
                .op_move_item(&mut session, &xpath, position, relative.as_deref())
                .await;
            record_and_send(&mut session, reply, result);
        }
        Request::Validate { reply } => {
            let result = core.op_validate(&mut session).await;
            record_and_send(&mut session, reply, result);
        }
        Request::Commit { reply } => {
            let result = core.commit_engine.commit(&mut session).await;
            record_and_send(&mut session, reply, result);
        }
        Request::CopyConfig {
            src,
            dst,
            module,
            reply,
        } => {
            let result = core
                .commit_engine
                .copy_config(&mut session, src, dst, module.as_deref())
                .await;
            record_and_send(&mut session, reply, result);
        }
        Request::DiscardChanges { reply } => {
            let datastore = session.datastore;
            session.discard_changes(datastore);
            let _ = reply.send(Ok(()));
        }
        Request::Refresh { reply } => {
            let result = core.op_refresh(&mut session);
            record_and_send(&mut session, reply, result);
        }
        Request::LockDatastore { reply } => {
            let result = core.op_lock_datastore(&mut session).await;
            record_and_send(&mut session, reply, result);
        }
        Request::UnlockDatastore { reply } => {
            let result = core.op_unlock_datastore(&mut session).await;
            record_and_send(&mut session, reply, result);
        }
        Request::LockModule { module, reply } => {
            let result = core.op_lock_module(&mut session, &module).await;
            record_and_send(&mut session, reply, result);
        }
        Request::UnlockModule { module, reply } => {
            let result = core.op_unlock_module(&mut session, &module).await;
            record_and_send(&mut session, reply, result);
        }
        Request::Subscribe {
            spec,
            address,
            reply,
        } => {
            let result = core.op_subscribe(&mut session, spec, address).await;
            record_and_send(&mut session, reply, result);
        }
        Request::Unsubscribe { id, reply } => {
            let result = core.op_unsubscribe(&mut session, id).await;
            record_and_send(&mut session, reply, result);
        }
        Request::RpcSend {
            xpath,
            input,
            reply,
        } => {
            let result = core.op_rpc_send(&mut session, &xpath, input, false).await;
            record_and_send(&mut session, reply, result);
        }
        Request::ActionSend {
            xpath,
            input,
            reply,
        } => {
            let result = core.op_rpc_send(&mut session, &xpath, input, true).await;
            record_and_send(&mut session, reply, result);
        }
        Request::EventNotifSend {
            xpath,
            values,
            reply,
        } => {
            let result = core.op_event_notif_send(&mut session, &xpath, values).await;
            record_and_send(&mut session, reply, result);
        }
        Request::Changes {
            commit_id,
            xpath,
            reply,
        } => {
            let result = core
                .op_changes(&mut session, commit_id, xpath.as_deref())
                .await;
            record_and_send(&mut session, reply, result);
        }
        Request::CommitAck { commit_id, reply } => {
            let result = core.commits.acknowledge(commit_id).await;
            record_and_send(&mut session, reply, result);
        }
        Request::CommitRelease { commit_id, reply } => {
            let result = core.commits.release(commit_id).await;
            record_and_send(&mut session, reply, result);
        }
        Request::SwitchDatastore { datastore, reply } => {
            session.switch_datastore(datastore);
            let _ = reply.send(Ok(()));
        }
        Request::SessionStop { reply } => {
            let id = session.id;
            drop(session);
            let result = core.op_session_stop(id).await;
            let _ = reply.send(result);
            return;
        }
    }

    session.state = SessionState::Idle;
}

fn record_and_send<T>(
    session: &mut crate::session::Session,
    reply: Reply<T>,
    result: Result<T>,
) {
    if let Err(err) = &result {
        session.record_error(err);
    }
    let _ = reply.send(result);
}

/// Answer a request whose session could not be resolved.
fn abort_with(request: Request, err: DbError) {
    match request {
        Request::GetItem { reply, .. } => drop(reply.send(Err(err))),
        Request::GetItems { reply, .. } => drop(reply.send(Err(err))),
        Request::SetItem { reply, .. } => drop(reply.send(Err(err))),
        Request::DeleteItem { reply, .. } => drop(reply.send(Err(err))),
        Request::MoveItem { reply, .. } => drop(reply.send(Err(err))),
        Request::Validate { reply } => drop(reply.send(Err(err))),
        Request::Commit { reply } => drop(reply.send(Err(err))),
        Request::CopyConfig { reply, .. } => drop(reply.send(Err(err))),
        Request::DiscardChanges { reply } => drop(reply.send(Err(err))),
        Request::Refresh { reply } => drop(reply.send(Err(err))),
        Request::LockDatastore { reply } => drop(reply.send(Err(err))),
        Request::UnlockDatastore { reply } => drop(reply.send(Err(err))),
        Request::LockModule { reply, .. } => drop(reply.send(Err(err))),
        Request::UnlockModule { reply, .. } => drop(reply.send(Err(err))),
        Request::Subscribe { reply, .. } => drop(reply.send(Err(err))),
        Request::Unsubscribe { reply, .. } => drop(reply.send(Err(err))),
        Request::RpcSend { reply, .. } => drop(reply.send(Err(err))),
        Request::ActionSend { reply, .. } => drop(reply.send(Err(err))),
        Request::EventNotifSend { reply, .. } => drop(reply.send(Err(err))),
        Request::Changes { reply, .. } => drop(reply.send(Err(err))),
        Request::CommitAck { reply, .. } => drop(reply.send(Err(err))),
        Request::CommitRelease { reply, .. } => drop(reply.send(Err(err))),
        Request::SwitchDatastore { reply, .. } => drop(reply.send(Err(err))),
        Request::SessionStop { reply } => drop(reply.send(Err(err))),
    }
}
