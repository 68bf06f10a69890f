use crate::callback::{OnResult, ResultCallback};
use crate::config::{DispatcherConfig, MIN_CHECK_INTERVAL};
use crate::counter::Counter;
use crate::error::{DispatchError, TaskError};
use crate::queue::TaskQueue;
use crate::task::{Admitted, Task, TaskId, TaskResult};

use std::any::Any;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, AtomicU8, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Lifecycle of a [`Dispatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatcherState {
  /// Constructed, loop not started yet. Submissions wait for the loop.
  Idle,
  /// The loop is admitting, queueing and promoting work.
  Running,
  /// Shutdown began: submissions are dropped, in-flight tasks are drained.
  Stopping,
  /// Drain finished. Terminal.
  Stopped,
}

impl DispatcherState {
  const fn as_u8(self) -> u8 {
    match self {
      DispatcherState::Idle => 0,
      DispatcherState::Running => 1,
      DispatcherState::Stopping => 2,
      DispatcherState::Stopped => 3,
    }
  }

  const fn from_u8(raw: u8) -> Self {
    match raw {
      0 => DispatcherState::Idle,
      1 => DispatcherState::Running,
      2 => DispatcherState::Stopping,
      _ => DispatcherState::Stopped,
    }
  }
}

/// A submission travelling to the loop. `accepted_tx` releases the waiting
/// `add_work` caller once the loop has decided what to do with the task.
struct Submission<T> {
  admitted: Admitted<T>,
  accepted_tx: oneshot::Sender<()>,
}

/// Receiving halves owned by whichever call runs the loop.
struct LoopChannels<T: Task> {
  submissions_rx: mpsc::UnboundedReceiver<Submission<T>>,
  completions_rx: mpsc::UnboundedReceiver<TaskResult<T>>,
}

/// Runs at most `max_workers` tasks at once and queues the rest in arrival order.
///
/// All admission and promotion decisions are made by a single loop ([`run`](Self::run)),
/// one event at a time. The counters and the queue are each synchronized on their
/// own; only the loop composes them (check capacity then increment, check length
/// then pop), which is what keeps the capacity invariant free of lost updates.
pub struct Dispatcher<T: Task> {
  name: Arc<String>,
  max_workers: AtomicUsize,
  drain_check_interval: Duration,
  workers: Counter,
  tasks_done: Counter,
  error_count: Counter,
  queue: TaskQueue<Admitted<T>>,
  on_result: ResultCallback<T>,
  state: AtomicU8,
  next_task_id: AtomicU64,
  submissions_tx: mpsc::UnboundedSender<Submission<T>>,
  completions_tx: mpsc::UnboundedSender<TaskResult<T>>,
  loop_channels: Mutex<Option<LoopChannels<T>>>,
  shutdown_token: CancellationToken,
  stopped_token: CancellationToken,
}

impl<T: Task> fmt::Debug for Dispatcher<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Dispatcher")
      .field("name", &self.name)
      .field("state", &self.state())
      .field("max_workers", &self.max_workers())
      .field("workers", &self.workers())
      .field("queued", &self.queued())
      .field("tasks_done", &self.tasks_done())
      .field("error_count", &self.error_count())
      .finish_non_exhaustive()
  }
}

impl<T: Task> Dispatcher<T> {
  /// Creates a dispatcher with the default configuration and the given capacity.
  /// The loop is not running until [`run`](Self::run) or [`start`](Self::start) is called.
  pub fn new(max_workers: usize, on_result: impl Fn(TaskResult<T>) + Send + Sync + 'static) -> Arc<Self> {
    Self::with_config(DispatcherConfig::new(max_workers), on_result)
  }

  pub fn with_config(config: DispatcherConfig, on_result: impl Fn(TaskResult<T>) + Send + Sync + 'static) -> Arc<Self> {
    let name = Arc::new(config.name);
    let max_workers = clamp_capacity(&name, config.max_workers);
    let drain_check_interval = clamp_interval(&name, "drain_check_interval", config.drain_check_interval);
    let (submissions_tx, submissions_rx) = mpsc::unbounded_channel();
    let (completions_tx, completions_rx) = mpsc::unbounded_channel();
    let handler: OnResult<T> = Arc::new(on_result);

    Arc::new(Self {
      name: name.clone(),
      max_workers: AtomicUsize::new(max_workers),
      drain_check_interval,
      workers: Counter::new(0),
      tasks_done: Counter::new(0),
      error_count: Counter::new(0),
      queue: TaskQueue::new(),
      on_result: ResultCallback::new(handler, name),
      state: AtomicU8::new(DispatcherState::Idle.as_u8()),
      next_task_id: AtomicU64::new(0),
      submissions_tx,
      completions_tx,
      loop_channels: Mutex::new(Some(LoopChannels {
        submissions_rx,
        completions_rx,
      })),
      shutdown_token: CancellationToken::new(),
      stopped_token: CancellationToken::new(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn state(&self) -> DispatcherState {
    DispatcherState::from_u8(self.state.load(AtomicOrdering::SeqCst))
  }

  /// Number of tasks currently executing.
  pub fn workers(&self) -> usize {
    self.workers.get()
  }

  /// Number of tasks that finished, successfully or not.
  pub fn tasks_done(&self) -> usize {
    self.tasks_done.get()
  }

  /// Number of finished tasks whose result carries an error.
  pub fn error_count(&self) -> usize {
    self.error_count.get()
  }

  /// Number of tasks waiting for capacity.
  pub fn queued(&self) -> usize {
    self.queue.len()
  }

  pub fn max_workers(&self) -> usize {
    self.max_workers.load(AtomicOrdering::SeqCst)
  }

  /// Changes the capacity used by later admission and promotion decisions.
  /// Tasks that are already running are never interrupted.
  pub fn set_max_workers(&self, max_workers: usize) {
    let max_workers = clamp_capacity(&self.name, max_workers);
    let previous = self.max_workers.swap(max_workers, AtomicOrdering::SeqCst);
    info!(dispatcher = %*self.name, previous, max_workers, "Capacity changed.");
  }

  /// Spawns [`run`](Self::run) on its own Tokio task.
  pub fn start(self: &Arc<Self>) -> JoinHandle<Result<(), DispatchError>> {
    let dispatcher = Arc::clone(self);
    let span = info_span!("dispatcher_loop", name = %*self.name);
    tokio::spawn(async move { dispatcher.run().await }.instrument(span))
  }

  /// Runs the coordination loop until a [`stop`](Self::stop) has fully drained.
  ///
  /// The caller's task is occupied for the dispatcher's whole lifetime, so this is
  /// normally spawned (see [`start`](Self::start)).
  ///
  /// # Errors
  /// Returns `DispatchError::AlreadyRunning` if the loop was already started, and
  /// `DispatchError::Stopped` if the dispatcher was stopped before it ever ran.
  pub async fn run(&self) -> Result<(), DispatchError> {
    if let Err(current) = self.transition(DispatcherState::Idle, DispatcherState::Running) {
      warn!(dispatcher = %*self.name, state = ?current, "Run: Loop cannot start from this state.");
      return Err(match current {
        DispatcherState::Stopped => DispatchError::Stopped,
        _ => DispatchError::AlreadyRunning,
      });
    }

    let _stop_on_exit = StopOnExit { dispatcher: self };

    let taken = self.loop_channels.lock().take();
    let Some(mut channels) = taken else {
      error!(dispatcher = %*self.name, "Run: Loop channels already taken.");
      return Err(DispatchError::AlreadyRunning);
    };

    info!(dispatcher = %*self.name, max_workers = self.max_workers(), "Dispatcher loop started.");
    let mut callbacks = JoinSet::new();

    loop {
      tokio::select! {
        biased;

        _ = self.shutdown_token.cancelled() => {
          info!(dispatcher = %*self.name, "Shutdown signal received. Entering drain phase.");
          break;
        }

        Some(result) = channels.completions_rx.recv() => {
          self.on_completion(result, &mut callbacks);
          self.promote_queued();
        }

        Some(submission) = channels.submissions_rx.recv() => {
          self.on_admission(submission);
        }

        Some(joined) = callbacks.join_next(), if !callbacks.is_empty() => {
          self.on_result.reap(joined);
        }
      }
    }

    self.state.store(DispatcherState::Stopping.as_u8(), AtomicOrdering::SeqCst);
    self.drain(&mut channels, &mut callbacks).await;
    Ok(())
  }

  /// Hands `task` to the loop and waits until the loop has either started it or
  /// queued it.
  ///
  /// Once shutdown has begun the task is dropped without running and without a
  /// result. Before the loop starts, the call waits for it.
  pub async fn add_work(&self, task: T) {
    if self.shutdown_token.is_cancelled() {
      debug!(dispatcher = %*self.name, "AddWork: Dispatcher is stopping or stopped. Dropping task.");
      return;
    }

    let task_id: TaskId = self.next_task_id.fetch_add(1, AtomicOrdering::Relaxed);
    let (accepted_tx, accepted_rx) = oneshot::channel();
    let submission = Submission {
      admitted: Admitted { task_id, task },
      accepted_tx,
    };

    if self.submissions_tx.send(submission).is_err() {
      debug!(dispatcher = %*self.name, task_id, "AddWork: Loop no longer receives submissions. Dropping task.");
      return;
    }

    match accepted_rx.await {
      Ok(()) => trace!(dispatcher = %*self.name, task_id, "AddWork: Task accepted by loop."),
      Err(_) => debug!(dispatcher = %*self.name, task_id, "AddWork: Task dropped by shutdown before acceptance."),
    }
  }

  /// Submits `task` from a separate Tokio task once the queue has at most
  /// `queue_limit` pending entries, checking every `check_interval`.
  ///
  /// The limit is checked, not reserved: concurrent producers may still push the
  /// queue past it. The deferred task is dropped if shutdown begins first.
  pub fn fill_work(self: &Arc<Self>, task: T, queue_limit: usize, check_interval: Duration) -> JoinHandle<()> {
    let check_interval = clamp_interval(&self.name, "check_interval", check_interval);
    let dispatcher = Arc::clone(self);
    let span = info_span!("deferred_submission", dispatcher = %*self.name, queue_limit);

    tokio::spawn(
      async move {
        let mut ticker = interval(check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
          tokio::select! {
            biased;
            _ = dispatcher.shutdown_token.cancelled() => {
              debug!("FillWork: Shutdown began before the queue drained. Dropping deferred task.");
              return;
            }
            _ = ticker.tick() => {}
          }
          let queued = dispatcher.queued();
          if queued <= queue_limit {
            break;
          }
          trace!(queued, "FillWork: Queue above limit, deferring.");
        }
        dispatcher.add_work(task).await;
      }
      .instrument(span),
    )
  }

  /// Waits until nothing is executing or queued, polling every `poll_interval`,
  /// then stops the dispatcher.
  ///
  /// Meant for producers that know they have submitted everything.
  pub async fn wait_until_no_tasks(&self, poll_interval: Duration) {
    let poll_interval = clamp_interval(&self.name, "poll_interval", poll_interval);
    let mut ticker = interval(poll_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
      ticker.tick().await;
      if self.workers() == 0 && self.queued() == 0 {
        break;
      }
    }
    debug!(dispatcher = %*self.name, "No active or queued tasks left. Stopping.");
    self.stop().await;
  }

  /// Stops the dispatcher and waits until every in-flight task has reported.
  ///
  /// Idempotent: later and concurrent calls wait for the same drain. Stopping a
  /// dispatcher whose loop never started moves it straight to `Stopped`.
  pub async fn stop(&self) {
    // Signalled before STOPPING is published: once a reader sees STOPPING, the
    // loop grants no more capacity.
    self.shutdown_token.cancel();

    match self.transition(DispatcherState::Idle, DispatcherState::Stopped) {
      Ok(_) => {
        info!(dispatcher = %*self.name, "Stopped before the loop started.");
        // Releases any submitter that was waiting for the loop.
        drop(self.loop_channels.lock().take());
        self.stopped_token.cancel();
      }
      Err(current) => {
        if self.transition(DispatcherState::Running, DispatcherState::Stopping).is_ok() {
          info!(dispatcher = %*self.name, workers = self.workers(), queued = self.queued(), "Initiating shutdown.");
        } else {
          trace!(dispatcher = %*self.name, state = ?current, "Shutdown already in progress or completed.");
        }
      }
    }

    self.stopped_token.cancelled().await;
  }

  fn transition(&self, from: DispatcherState, to: DispatcherState) -> Result<DispatcherState, DispatcherState> {
    self
      .state
      .compare_exchange(from.as_u8(), to.as_u8(), AtomicOrdering::SeqCst, AtomicOrdering::SeqCst)
      .map(DispatcherState::from_u8)
      .map_err(DispatcherState::from_u8)
  }

  fn on_completion(&self, result: TaskResult<T>, callbacks: &mut JoinSet<()>) {
    self.workers.dec();
    self.tasks_done.inc();
    match result.error() {
      Some(task_error) => {
        self.error_count.inc();
        debug!(dispatcher = %*self.name, task_id = result.task_id(), error = %task_error, "Task finished with error.");
      }
      None => trace!(dispatcher = %*self.name, task_id = result.task_id(), "Task finished."),
    }
    self.on_result.dispatch(result, callbacks);
  }

  /// Starts queued tasks, oldest first, while there is spare capacity.
  fn promote_queued(&self) {
    while !self.shutdown_token.is_cancelled() && self.workers.get() < self.max_workers() && !self.queue.is_empty() {
      self.workers.inc();
      self.spawn_queue_head();
    }
  }

  fn on_admission(&self, submission: Submission<T>) {
    let Submission { admitted, accepted_tx } = submission;

    if self.shutdown_token.is_cancelled() {
      debug!(dispatcher = %*self.name, task_id = admitted.task_id, "Rejecting submission, shutdown already signalled.");
      return;
    }

    if self.workers.get() >= self.max_workers() {
      trace!(dispatcher = %*self.name, task_id = admitted.task_id, queued = self.queue.len() + 1, "At capacity. Queueing task.");
      self.queue.push(admitted);
    } else {
      self.workers.inc();
      if self.queue.is_empty() {
        self.spawn_worker(admitted);
      } else {
        // Older queued work goes first; the new task takes its place at the tail.
        self.queue.push(admitted);
        self.spawn_queue_head();
      }
    }

    // The submitter may have given up waiting; the decision stands either way.
    let _ = accepted_tx.send(());
  }

  /// Pops the queue head and spawns it. The caller has already counted the worker.
  fn spawn_queue_head(&self) {
    match self.queue.pop() {
      Ok(next) => self.spawn_worker(next),
      Err(e) => {
        error!(dispatcher = %*self.name, "Queue invariant broken, nothing to promote: {}", e);
        self.workers.dec();
      }
    }
  }

  fn spawn_worker(&self, admitted: Admitted<T>) {
    let Admitted { task_id, task } = admitted;
    let completions_tx = self.completions_tx.clone();
    let dispatcher_name = self.name.clone();
    debug!(dispatcher = %*self.name, task_id, workers = self.workers.get(), "Spawning worker.");

    let span = info_span!("dispatched_task", dispatcher = %*self.name, task_id);
    tokio::spawn(
      async move {
        let outcome = match AssertUnwindSafe(async { task.execute().await }).catch_unwind().await {
          Ok(Ok(output)) => Ok(output),
          Ok(Err(task_error)) => Err(TaskError::Failed(task_error)),
          Err(panic_payload) => {
            error!("Task panicked during execution.");
            Err(TaskError::Panicked(panic_message(panic_payload.as_ref())))
          }
        };

        if completions_tx.send(TaskResult::new(task_id, task, outcome)).is_err() {
          warn!(dispatcher = %*dispatcher_name, task_id, "Completion receiver is gone. Task result lost.");
        }
      }
      .instrument(span),
    );
  }

  async fn drain(&self, channels: &mut LoopChannels<T>, callbacks: &mut JoinSet<()>) {
    let discarded = self.queue.clear();
    if discarded > 0 {
      info!(dispatcher = %*self.name, discarded, "Discarded queued tasks that never started.");
    }

    let mut liveness = interval(self.drain_check_interval);
    liveness.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while self.workers.get() > 0 {
      tokio::select! {
        biased;

        Some(result) = channels.completions_rx.recv() => {
          self.on_completion(result, callbacks);
        }

        Some(rejected) = channels.submissions_rx.recv() => {
          debug!(dispatcher = %*self.name, task_id = rejected.admitted.task_id, "Rejecting submission during shutdown.");
        }

        Some(joined) = callbacks.join_next(), if !callbacks.is_empty() => {
          self.on_result.reap(joined);
        }

        _ = liveness.tick() => {
          trace!(dispatcher = %*self.name, workers = self.workers.get(), "Drain liveness check.");
        }
      }
    }

    channels.submissions_rx.close();
    while let Ok(rejected) = channels.submissions_rx.try_recv() {
      debug!(dispatcher = %*self.name, task_id = rejected.admitted.task_id, "Releasing blocked submitter.");
    }

    while let Some(joined) = callbacks.join_next().await {
      self.on_result.reap(joined);
    }

    self.state.store(DispatcherState::Stopped.as_u8(), AtomicOrdering::SeqCst);
    self.stopped_token.cancel();
    info!(
      dispatcher = %*self.name,
      tasks_done = self.tasks_done(),
      error_count = self.error_count(),
      "Dispatcher stopped."
    );
  }
}

/// Held by [`Dispatcher::run`]. If the loop ends without finishing its drain
/// (a panic, or the task running it was aborted), the dispatcher is still moved
/// to `Stopped` so pending and future `stop()` calls resolve.
struct StopOnExit<'a, T: Task> {
  dispatcher: &'a Dispatcher<T>,
}

impl<T: Task> Drop for StopOnExit<'_, T> {
  fn drop(&mut self) {
    let dispatcher = self.dispatcher;
    if dispatcher.stopped_token.is_cancelled() {
      return;
    }
    error!(
      dispatcher = %*dispatcher.name,
      workers = dispatcher.workers(),
      queued = dispatcher.queued(),
      "Dispatcher loop exited before draining. Forcing Stopped."
    );
    dispatcher.shutdown_token.cancel();
    dispatcher.queue.clear();
    dispatcher.state.store(DispatcherState::Stopped.as_u8(), AtomicOrdering::SeqCst);
    dispatcher.stopped_token.cancel();
  }
}

fn clamp_capacity(name: &str, max_workers: usize) -> usize {
  if max_workers == 0 {
    warn!(dispatcher = %name, "A capacity of 0 would never run anything. Using 1.");
    1
  } else {
    max_workers
  }
}

fn clamp_interval(name: &str, what: &'static str, interval: Duration) -> Duration {
  if interval.is_zero() {
    warn!(dispatcher = %name, what, "A zero period cannot drive a timer. Using {:?}.", MIN_CHECK_INTERVAL);
    MIN_CHECK_INTERVAL
  } else {
    interval
  }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}
