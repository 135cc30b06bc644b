//! Execution utilities
//!
//! - Worker pool handle over the tokio runtime
//! - Per-instance ordered dispatch (strand)
//! - One-shot completion slots for cancelable operations

pub mod completion;
pub mod dispatcher;
pub mod threadpool;

pub use completion::Completion;
pub use dispatcher::Dispatcher;
pub use threadpool::Threadpool;
