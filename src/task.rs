use crate::error::TaskError;

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;

/// Identifier assigned to every submission, unique within one dispatcher.
pub type TaskId = u64;

/// The future a [`Task`] hands back from [`Task::execute`].
pub type TaskFuture<'a, O, E> = BoxFuture<'a, Result<O, E>>;

/// A unit of work the dispatcher can run.
///
/// The only capability the dispatcher relies on is `execute`. Anything else about
/// the task (its payload, where the work goes) is opaque. Mixed kinds of work can be
/// submitted to one dispatcher as `Box<dyn Task<Output = O, Error = E>>`.
///
/// The task stays alive for the whole execution and is handed back inside the
/// [`TaskResult`], so `execute` borrows rather than consumes it.
pub trait Task: Send + Sync + 'static {
  type Output: Send + 'static;
  type Error: fmt::Debug + fmt::Display + Send + 'static;

  fn execute(&self) -> TaskFuture<'_, Self::Output, Self::Error>;
}

impl<T: Task + ?Sized> Task for Box<T> {
  type Output = T::Output;
  type Error = T::Error;

  fn execute(&self) -> TaskFuture<'_, Self::Output, Self::Error> {
    (**self).execute()
  }
}

impl<T: Task + ?Sized> Task for Arc<T> {
  type Output = T::Output;
  type Error = T::Error;

  fn execute(&self) -> TaskFuture<'_, Self::Output, Self::Error> {
    (**self).execute()
  }
}

/// Outcome of one admitted task, delivered once to the result callback.
///
/// `output()` is present iff `error()` is absent.
pub struct TaskResult<T: Task> {
  task_id: TaskId,
  input: T,
  outcome: Result<T::Output, TaskError<T::Error>>,
}

impl<T: Task> TaskResult<T> {
  pub(crate) fn new(task_id: TaskId, input: T, outcome: Result<T::Output, TaskError<T::Error>>) -> Self {
    Self { task_id, input, outcome }
  }

  pub fn task_id(&self) -> TaskId {
    self.task_id
  }

  /// The task that produced this result.
  pub fn input(&self) -> &T {
    &self.input
  }

  pub fn output(&self) -> Option<&T::Output> {
    self.outcome.as_ref().ok()
  }

  pub fn error(&self) -> Option<&TaskError<T::Error>> {
    self.outcome.as_ref().err()
  }

  pub fn is_success(&self) -> bool {
    self.outcome.is_ok()
  }

  pub fn outcome(&self) -> &Result<T::Output, TaskError<T::Error>> {
    &self.outcome
  }

  /// Splits the result into the original task and its outcome.
  pub fn into_parts(self) -> (T, Result<T::Output, TaskError<T::Error>>) {
    (self.input, self.outcome)
  }
}

impl<T: Task> fmt::Debug for TaskResult<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskResult")
      .field("task_id", &self.task_id)
      .field("success", &self.outcome.is_ok())
      .field("error", &self.error())
      .finish_non_exhaustive()
  }
}

/// A task that has been given an id and is waiting in the queue or being executed.
pub(crate) struct Admitted<T> {
  pub(crate) task_id: TaskId,
  pub(crate) task: T,
}

impl<T> fmt::Debug for Admitted<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Admitted")
      .field("task_id", &self.task_id)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Echo(u32);

  impl Task for Echo {
    type Output = u32;
    type Error = String;

    fn execute(&self) -> TaskFuture<'_, u32, String> {
      Box::pin(async move { Ok(self.0) })
    }
  }

  struct Refuse;

  impl Task for Refuse {
    type Output = u32;
    type Error = String;

    fn execute(&self) -> TaskFuture<'_, u32, String> {
      Box::pin(async { Err("refused".to_string()) })
    }
  }

  #[tokio::test]
  async fn test_boxed_tasks_of_different_kinds_share_one_type() {
    let tasks: Vec<Box<dyn Task<Output = u32, Error = String>>> = vec![Box::new(Echo(7)), Box::new(Refuse)];

    assert_eq!(tasks[0].execute().await, Ok(7));
    assert_eq!(tasks[1].execute().await, Err("refused".to_string()));
  }

  #[test]
  fn test_result_accessors_reflect_outcome() {
    let ok = TaskResult::new(1, Echo(3), Ok(3));
    assert!(ok.is_success());
    assert_eq!(ok.output(), Some(&3));
    assert!(ok.error().is_none());
    assert_eq!(ok.input().0, 3);

    let failed = TaskResult::new(2, Refuse, Err(TaskError::Failed("nope".to_string())));
    assert!(!failed.is_success());
    assert!(failed.output().is_none());
    assert_eq!(failed.error().and_then(TaskError::as_failed), Some(&"nope".to_string()));

    let (_task, outcome) = failed.into_parts();
    assert!(outcome.is_err());
  }
}
