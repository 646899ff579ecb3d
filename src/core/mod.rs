pub mod error;
pub mod types;
pub mod value;

pub use error::{DbError, ErrorInfo, Result};
pub use types::{ChangeOper, Datastore, EditFlags, MovePosition, SessionId, SessionState};
pub use value::{TypedValue, Value};
