use thiserror::Error;

/// Errors raised by the dispatcher itself.
///
/// None of these is fatal to a running dispatcher. Per-task failures never show
/// up here; they travel inside the task's [`TaskResult`](crate::TaskResult).
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
  #[error("Pending-task queue is empty")]
  EmptyQueue,

  #[error("Dispatcher loop is already running or has already run")]
  AlreadyRunning,

  #[error("Dispatcher was stopped before its loop started")]
  Stopped,
}

/// The failure side of a task's outcome.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError<E> {
  /// The task ran to completion and reported an error of its own.
  #[error("Task failed: {0}")]
  Failed(E),

  /// The task panicked while executing. Holds the panic message when it was a string.
  #[error("Task panicked during execution: {0}")]
  Panicked(String),
}

impl<E> TaskError<E> {
  /// Returns the task's own error, if this is not a panic.
  pub fn as_failed(&self) -> Option<&E> {
    match self {
      TaskError::Failed(e) => Some(e),
      TaskError::Panicked(_) => None,
    }
  }

  pub fn is_panic(&self) -> bool {
    matches!(self, TaskError::Panicked(_))
  }
}
