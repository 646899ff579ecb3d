// ============================================================================
// rustconfdb Library
// ============================================================================

pub mod access;
pub mod commit;
pub mod config;
pub mod core;
pub mod dispatch;
pub mod facade;
pub mod lock;
pub mod opdata;
pub mod schema;
pub mod session;
pub mod store;
pub mod subscription;
pub mod tree;
pub mod validate;

// Re-export main types for convenience
pub use crate::access::{AccessControl, Permissive};
pub use crate::commit::{Change, CommitRegistry};
pub use crate::config::EngineConfig;
pub use crate::core::{
    ChangeOper, Datastore, DbError, EditFlags, ErrorInfo, MovePosition, Result, SessionId,
    SessionState, TypedValue, Value,
};
pub use crate::facade::{ConfigDb, Connection, SessionHandle};
pub use crate::schema::{
    DepEdge, DepKind, Enablement, LeafType, ModuleSchema, SchemaBuilder, SchemaLoader,
};
pub use crate::session::Credentials;
pub use crate::store::{DurableSubscription, ModuleSettings, RetainedNotification, SettingsStore};
pub use crate::subscription::{
    NotifEventFilter, SubscriberEvent, SubscriptionId, SubscriptionKind,
};
