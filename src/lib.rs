//! A Tokio-based dispatcher that executes at most a configured number of tasks
//! at once, queues overflow in FIFO order, reports every task's outcome to a
//! single callback, and drains in-flight work on shutdown.

mod callback;
mod config;
mod counter;
mod dispatcher;
mod error;
mod queue;
mod task;

pub use callback::OnResult;
pub use config::{DispatcherConfig, DEFAULT_DISPATCHER_NAME, DEFAULT_DRAIN_CHECK_INTERVAL, MIN_CHECK_INTERVAL};
pub use counter::Counter;
pub use dispatcher::{Dispatcher, DispatcherState};
pub use error::{DispatchError, TaskError};
pub use queue::TaskQueue;
pub use task::{Task, TaskFuture, TaskId, TaskResult};
