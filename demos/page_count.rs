use bounded_dispatcher::{Counter, Dispatcher, DispatcherConfig, Task, TaskFuture, TaskResult};
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const NEEDLE: &str = "Go";

/// Pretends to download a page made of `repeats` copies of a fixed line and counts
/// how often `NEEDLE` appears in it.
struct CountOnPage {
  url: String,
  repeats: usize,
}

impl Task for CountOnPage {
  type Output = usize;
  type Error = String;

  fn execute(&self) -> TaskFuture<'_, usize, String> {
    Box::pin(async move {
      tokio::time::sleep(Duration::from_millis(5 + self.repeats as u64)).await;
      let body = "11 Go 22 33".repeat(self.repeats);
      Ok(body.matches(NEEDLE).count())
    })
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  let pages = 500;
  let max_workers = 9;
  let total_found = Arc::new(Counter::new(0));

  let on_result = {
    let total_found = total_found.clone();
    move |result: TaskResult<CountOnPage>| match result.outcome() {
      Ok(found) => {
        info!("Count for {}: {}", result.input().url, found);
        total_found.add(*found);
      }
      Err(e) => info!("Fetching {} failed: {}", result.input().url, e),
    }
  };

  let config = DispatcherConfig::new(max_workers).with_name("page_counter");
  let dispatcher = Dispatcher::with_config(config, on_result);
  let runner = dispatcher.start();

  let mut expected = 0;
  let mut rng = rand::rng();
  for i in 0..pages {
    let repeats = rng.random_range(0..30);
    expected += repeats;
    let task = CountOnPage {
      url: format!("http://pages.local/page{}", i),
      repeats,
    };
    // Keep at most 50 pages waiting; the rest are held back by their own submitter.
    dispatcher.fill_work(task, 50, Duration::from_millis(10));
  }

  while dispatcher.tasks_done() < pages {
    info!(workers = dispatcher.workers(), queued = dispatcher.queued(), "Progress: {}/{}", dispatcher.tasks_done(), pages);
    tokio::time::sleep(Duration::from_millis(200)).await;
  }
  dispatcher.wait_until_no_tasks(Duration::from_millis(10)).await;

  match runner.await {
    Ok(Ok(())) => info!("Dispatcher loop finished."),
    Ok(Err(e)) => info!("Dispatcher loop refused to run: {}", e),
    Err(e) => info!("Dispatcher loop task failed: {:?}", e),
  }
  info!(
    "Found {} of {} expected occurrences, {} errors.",
    total_found.get(),
    expected,
    dispatcher.error_count()
  );
}
