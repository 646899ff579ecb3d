pub mod context;
pub mod engine;

pub use context::{Change, CommitContext, CommitRegistry};
pub use engine::CommitEngine;
