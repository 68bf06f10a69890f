use std::num::NonZeroUsize;
use std::time::Duration;

/// How often the drain phase wakes up to re-check the active-worker count.
pub const DEFAULT_DRAIN_CHECK_INTERVAL: Duration = Duration::from_millis(100);

/// Shortest period used for any polling or liveness timer. Zero periods are raised to this.
pub const MIN_CHECK_INTERVAL: Duration = Duration::from_millis(1);

pub const DEFAULT_DISPATCHER_NAME: &str = "dispatcher";

/// Settings for a [`Dispatcher`](crate::Dispatcher).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherConfig {
  /// Name used in log fields and spans.
  pub name: String,
  /// Maximum number of tasks executing at once. 0 is treated as 1.
  pub max_workers: usize,
  /// Liveness check period while draining on shutdown. Zero is treated as
  /// [`MIN_CHECK_INTERVAL`].
  pub drain_check_interval: Duration,
}

impl DispatcherConfig {
  pub fn new(max_workers: usize) -> Self {
    Self {
      max_workers,
      ..Self::default()
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = name.into();
    self
  }

  pub fn with_max_workers(mut self, max_workers: usize) -> Self {
    self.max_workers = max_workers;
    self
  }

  pub fn with_drain_check_interval(mut self, interval: Duration) -> Self {
    self.drain_check_interval = interval;
    self
  }
}

impl Default for DispatcherConfig {
  fn default() -> Self {
    Self {
      name: DEFAULT_DISPATCHER_NAME.to_string(),
      max_workers: std::thread::available_parallelism().map_or(1, NonZeroUsize::get),
      drain_check_interval: DEFAULT_DRAIN_CHECK_INTERVAL,
    }
  }
}
