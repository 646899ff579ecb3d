pub mod set;

pub use set::{LockKey, LockKind, LockSet};
