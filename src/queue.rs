use crate::error::DispatchError;

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

/// An unbounded, mutex-guarded FIFO queue.
///
/// Each operation locks independently, so a `len()` followed by a `pop()` is not
/// atomic. Code that decides on the length and then pops must be the only caller
/// that pops; the dispatcher loop is that caller for its pending-task queue.
pub struct TaskQueue<T> {
  items: Mutex<VecDeque<T>>,
}

impl<T> TaskQueue<T> {
  pub fn new() -> Self {
    Self {
      items: Mutex::new(VecDeque::new()),
    }
  }

  /// Appends an item to the tail.
  pub fn push(&self, item: T) {
    self.items.lock().push_back(item);
  }

  /// Removes the head item.
  ///
  /// # Errors
  /// Returns `DispatchError::EmptyQueue` if there is nothing to pop.
  pub fn pop(&self) -> Result<T, DispatchError> {
    self.items.lock().pop_front().ok_or(DispatchError::EmptyQueue)
  }

  pub fn len(&self) -> usize {
    self.items.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.lock().is_empty()
  }

  /// Drops every queued item and returns how many there were.
  pub fn clear(&self) -> usize {
    let drained: Vec<T> = self.items.lock().drain(..).collect();
    drained.len()
  }
}

impl<T> Default for TaskQueue<T> {
  fn default() -> Self {
    Self::new()
  }
}

impl<T> fmt::Debug for TaskQueue<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("TaskQueue").field("len", &self.len()).finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::Arc;
  use std::thread;

  #[test]
  fn test_push_pop_preserves_fifo_order() {
    let queue = TaskQueue::new();
    queue.push("a");
    queue.push("b");
    queue.push("c");
    assert_eq!(queue.len(), 3);

    assert_eq!(queue.pop(), Ok("a"));
    assert_eq!(queue.pop(), Ok("b"));
    queue.push("d");
    assert_eq!(queue.pop(), Ok("c"));
    assert_eq!(queue.pop(), Ok("d"));
    assert!(queue.is_empty());
  }

  #[test]
  fn test_pop_on_empty_queue_fails() {
    let queue: TaskQueue<u32> = TaskQueue::default();
    assert_eq!(queue.pop(), Err(DispatchError::EmptyQueue));
  }

  #[test]
  fn test_clear_reports_discarded_items() {
    let queue = TaskQueue::new();
    for i in 0..4 {
      queue.push(i);
    }
    assert_eq!(queue.clear(), 4);
    assert_eq!(queue.len(), 0);
    assert_eq!(queue.clear(), 0);
  }

  #[test]
  fn test_concurrent_pushes_are_all_kept() {
    let queue = Arc::new(TaskQueue::new());
    let handles: Vec<_> = (0..4)
      .map(|producer| {
        let queue = queue.clone();
        thread::spawn(move || {
          for i in 0..250 {
            queue.push((producer, i));
          }
        })
      })
      .collect();
    for handle in handles {
      handle.join().unwrap();
    }
    assert_eq!(queue.len(), 1_000);

    // Items from a single producer come out in the order that producer pushed them.
    let mut last_seen = [None::<i32>; 4];
    while let Ok((producer, i)) = queue.pop() {
      if let Some(previous) = last_seen[producer] {
        assert!(i > previous);
      }
      last_seen[producer] = Some(i);
    }
  }
}
