use crate::task::{Task, TaskResult};

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::{JoinError, JoinSet};
use tracing::{error, trace};

/// The host-supplied function that receives every [`TaskResult`].
pub type OnResult<T> = Arc<dyn Fn(TaskResult<T>) + Send + Sync + 'static>;

/// Runs the result handler off the dispatcher loop.
///
/// Every invocation gets its own blocking-pool thread so a slow handler never stalls
/// the loop, and all invocations share one lock so no two handler bodies overlap.
/// The handler therefore does not need to be thread-safe internally.
pub(crate) struct ResultCallback<T: Task> {
  handler: OnResult<T>,
  exclusive: Arc<Mutex<()>>,
  dispatcher_name: Arc<String>,
}

impl<T: Task> fmt::Debug for ResultCallback<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ResultCallback")
      .field("dispatcher_name", &self.dispatcher_name)
      .field("in_handler", &self.exclusive.is_locked())
      .finish_non_exhaustive()
  }
}

impl<T: Task> ResultCallback<T> {
  pub(crate) fn new(handler: OnResult<T>, dispatcher_name: Arc<String>) -> Self {
    Self {
      handler,
      exclusive: Arc::new(Mutex::new(())),
      dispatcher_name,
    }
  }

  /// Hands `result` to the handler on a fresh blocking thread tracked by `in_flight`.
  pub(crate) fn dispatch(&self, result: TaskResult<T>, in_flight: &mut JoinSet<()>) {
    let handler = self.handler.clone();
    let exclusive = self.exclusive.clone();
    let dispatcher_name = self.dispatcher_name.clone();
    let task_id = result.task_id();

    in_flight.spawn_blocking(move || {
      let _guard = exclusive.lock();
      trace!(dispatcher = %*dispatcher_name, task_id, "Invoking result callback.");
      if panic::catch_unwind(AssertUnwindSafe(|| handler(result))).is_err() {
        error!(
          dispatcher = %*dispatcher_name,
          task_id,
          "Result callback panicked. The dispatcher keeps running."
        );
      }
    });
  }

  /// Logs the join outcome of a finished callback thread.
  pub(crate) fn reap(&self, joined: Result<(), JoinError>) {
    if let Err(join_error) = joined {
      error!(dispatcher = %*self.dispatcher_name, "Result callback thread failed to join: {:?}", join_error);
    }
  }
}
