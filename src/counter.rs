use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

use tracing::error;

/// A thread-safe, never-negative counter.
///
/// Every operation is atomic on its own. Reads from two different counters are
/// independent snapshots and are not consistent with each other.
#[derive(Debug, Default)]
pub struct Counter {
  value: AtomicUsize,
}

impl Counter {
  pub const fn new(initial: usize) -> Self {
    Self {
      value: AtomicUsize::new(initial),
    }
  }

  pub fn inc(&self) {
    self.add(1);
  }

  /// Decrements by one. Decrementing at zero is an invariant breach: it is logged
  /// and the counter stays at zero.
  pub fn dec(&self) {
    let decremented = self
      .value
      .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |current| current.checked_sub(1));
    if decremented.is_err() {
      error!("Counter decremented below zero; clamping at 0.");
    }
  }

  pub fn add(&self, n: usize) {
    self.value.fetch_add(n, AtomicOrdering::SeqCst);
  }

  pub fn set(&self, n: usize) {
    self.value.store(n, AtomicOrdering::SeqCst);
  }

  pub fn get(&self) -> usize {
    self.value.load(AtomicOrdering::SeqCst)
  }
}
