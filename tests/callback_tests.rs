use bounded_dispatcher::{Counter, Dispatcher, DispatcherConfig, Task, TaskFuture, TaskResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{sleep, timeout};

// Minimal task for callback tests: returns its id after an optional delay.
struct Job {
  id: usize,
  delay: Duration,
}

impl Job {
  fn new(id: usize, delay_ms: u64) -> Self {
    Self {
      id,
      delay: Duration::from_millis(delay_ms),
    }
  }
}

impl Task for Job {
  type Output = usize;
  type Error = String;

  fn execute(&self) -> TaskFuture<'_, usize, String> {
    Box::pin(async move {
      if !self.delay.is_zero() {
        sleep(self.delay).await;
      }
      Ok(self.id)
    })
  }
}

fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,bounded_dispatcher=debug"));
    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

fn test_dispatcher(
  name: &str,
  max_workers: usize,
  on_result: impl Fn(TaskResult<Job>) + Send + Sync + 'static,
) -> Arc<Dispatcher<Job>> {
  let config = DispatcherConfig::new(max_workers)
    .with_name(name)
    .with_drain_check_interval(Duration::from_millis(10));
  Dispatcher::with_config(config, on_result)
}

async fn eventually(what: &str, condition: impl Fn() -> bool) {
  let waited = timeout(Duration::from_secs(10), async {
    while !condition() {
      sleep(Duration::from_millis(5)).await;
    }
  })
  .await;
  assert!(waited.is_ok(), "Timed out waiting for: {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_callbacks_never_overlap() {
  setup_tracing_for_test();
  let inside = Arc::new(AtomicUsize::new(0));
  let peak_inside = Arc::new(AtomicUsize::new(0));
  let invocations = Arc::new(Counter::new(0));

  let handler = {
    let inside = inside.clone();
    let peak_inside = peak_inside.clone();
    let invocations = invocations.clone();
    move |_result: TaskResult<Job>| {
      let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
      peak_inside.fetch_max(now, Ordering::SeqCst);
      std::thread::sleep(Duration::from_millis(2));
      invocations.inc();
      inside.fetch_sub(1, Ordering::SeqCst);
    }
  };
  let dispatcher = test_dispatcher("test_callbacks_never_overlap", 8, handler);
  dispatcher.start();

  for id in 0..40 {
    dispatcher.add_work(Job::new(id, 0)).await;
  }
  eventually("all tasks done", || dispatcher.tasks_done() == 40).await;
  dispatcher.stop().await;

  assert_eq!(peak_inside.load(Ordering::SeqCst), 1);
  assert_eq!(invocations.get(), 40);
  assert_eq!(invocations.get(), dispatcher.tasks_done());
}

#[tokio::test]
async fn test_callback_panic_does_not_stop_dispatcher() {
  setup_tracing_for_test();
  let invocations = Arc::new(Counter::new(0));
  let total = Arc::new(Counter::new(0));

  let handler = {
    let invocations = invocations.clone();
    let total = total.clone();
    move |result: TaskResult<Job>| {
      invocations.inc();
      let id = result.output().copied().unwrap_or_default();
      if id == 3 {
        panic!("callback refused result {}", id);
      }
      total.add(id);
    }
  };
  let dispatcher = test_dispatcher("test_callback_panic", 2, handler);
  dispatcher.start();

  for id in 1..=5 {
    dispatcher.add_work(Job::new(id, 5)).await;
  }
  eventually("all tasks done", || dispatcher.tasks_done() == 5).await;
  dispatcher.stop().await;

  assert_eq!(invocations.get(), 5);
  assert_eq!(total.get(), 1 + 2 + 4 + 5);
  assert_eq!(dispatcher.error_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_callback_does_not_block_the_loop() {
  setup_tracing_for_test();
  let invocations = Arc::new(Counter::new(0));
  let handler = {
    let invocations = invocations.clone();
    move |_result: TaskResult<Job>| {
      std::thread::sleep(Duration::from_millis(150));
      invocations.inc();
    }
  };
  let dispatcher = test_dispatcher("test_slow_callback", 1, handler);
  dispatcher.start();

  let began = Instant::now();
  for id in 0..4 {
    dispatcher.add_work(Job::new(id, 0)).await;
  }
  eventually("all tasks done", || dispatcher.tasks_done() == 4).await;
  // Four serialized callbacks need at least 600ms; the tasks themselves finish long before.
  assert!(began.elapsed() < Duration::from_millis(450), "loop waited on callbacks");
  assert!(invocations.get() < 4);

  // Stop also waits for the callbacks still queued on the lock.
  dispatcher.stop().await;
  assert_eq!(invocations.get(), 4);
  assert_eq!(invocations.get(), dispatcher.tasks_done());
}
