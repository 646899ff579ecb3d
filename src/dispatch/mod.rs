pub mod queue;
pub mod worker;

pub use queue::RequestQueue;
pub use worker::{QueueItem, Request, SubscribeSpec, run_worker};
