use crate::error::PoolError;
use crate::observer::{EngineEvent, ExitReason, Observer};
use crate::stream::{self, recv_or_cancel, send_or_cancel, Delivery, Received, Receiver, Sender};
use crate::task::{Task, TaskResult, TaskStatus};
use crate::wait_group::{WaitGroup, WaitGuard};

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_POOL_ID_COUNTER: AtomicU64 = AtomicU64::new(0);
}

/// Sizing of the pool's result stream.
///
/// With `Bounded(n)`, a worker holding a finished result blocks until a
/// consumer makes room. If more than `n` results are pending and nobody drains
/// the stream while [`WorkerPool::stop`] waits for the workers, shutdown
/// deadlocks until the pool's token is cancelled. Drain concurrently with
/// `stop` (as [`WorkerPool::process_tasks`] does) or use `Unbounded`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCapacity {
  Bounded(usize),
  Unbounded,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
  /// Used in logs and events. Generated as `pool-{n}` when absent.
  pub name: Option<String>,
  pub worker_count: usize,
  pub task_capacity: usize,
  pub result_capacity: ResultCapacity,
}

impl PoolConfig {
  /// Both queues default to twice the worker count.
  pub fn new(worker_count: usize) -> Self {
    let worker_count = worker_count.max(1);
    Self {
      name: None,
      worker_count,
      task_capacity: worker_count * 2,
      result_capacity: ResultCapacity::Bounded(worker_count * 2),
    }
  }

  pub fn with_name(mut self, name: impl Into<String>) -> Self {
    self.name = Some(name.into());
    self
  }

  pub fn with_task_capacity(mut self, capacity: usize) -> Self {
    self.task_capacity = capacity.max(1);
    self
  }

  pub fn with_result_capacity(mut self, capacity: ResultCapacity) -> Self {
    self.result_capacity = match capacity {
      ResultCapacity::Bounded(n) => ResultCapacity::Bounded(n.max(1)),
      ResultCapacity::Unbounded => ResultCapacity::Unbounded,
    };
    self
  }
}

impl Default for PoolConfig {
  fn default() -> Self {
    Self::new(4)
  }
}

struct PoolState {
  /// Set by `start`; `Some` means the workers were launched.
  token: Option<CancellationToken>,
}

/// A fixed-size set of workers consuming a bounded task queue and publishing
/// one [`TaskResult`] per completed [`Task`].
///
/// Shutdown is staged on two separate join barriers: live workers and
/// outstanding (submitted but not yet resulted) tasks.
pub struct WorkerPool<P: Send + 'static, O: Send + 'static> {
  pool_name: Arc<str>,
  worker_count: usize,
  tokio_handle: TokioHandle,
  task_tx: Sender<Task<P>>,
  task_rx: Receiver<Task<P>>,
  result_tx: Sender<TaskResult<O>>,
  result_rx: Receiver<TaskResult<O>>,
  live_workers: WaitGroup,
  outstanding: WaitGroup,
  /// worker id -> id of the task it is currently processing
  active_tasks: Arc<DashMap<usize, u64>>,
  state: Mutex<PoolState>,
  observer: Observer,
}

impl<P: Send + 'static, O: Send + 'static> WorkerPool<P, O> {
  pub fn new(config: PoolConfig, tokio_handle: TokioHandle) -> Arc<Self> {
    Self::with_observer(config, tokio_handle, Observer::new())
  }

  pub fn with_observer(config: PoolConfig, tokio_handle: TokioHandle, observer: Observer) -> Arc<Self> {
    let pool_name: Arc<str> = match config.name {
      Some(name) => Arc::from(name),
      None => Arc::from(format!(
        "pool-{}",
        NEXT_POOL_ID_COUNTER.fetch_add(1, AtomicOrdering::Relaxed)
      )),
    };
    let (task_tx, task_rx) = stream::bounded(config.task_capacity);
    let (result_tx, result_rx) = match config.result_capacity {
      ResultCapacity::Bounded(capacity) => stream::bounded(capacity),
      ResultCapacity::Unbounded => stream::unbounded(),
    };

    debug!(
      %pool_name,
      worker_count = config.worker_count,
      task_capacity = config.task_capacity,
      result_capacity = ?config.result_capacity,
      "Created worker pool."
    );

    Arc::new(Self {
      pool_name,
      worker_count: config.worker_count.max(1),
      tokio_handle,
      task_tx,
      task_rx,
      result_tx,
      result_rx,
      live_workers: WaitGroup::new(),
      outstanding: WaitGroup::new(),
      active_tasks: Arc::new(DashMap::new()),
      state: Mutex::new(PoolState { token: None }),
      observer,
    })
  }

  pub fn name(&self) -> &str {
    &self.pool_name
  }

  pub fn worker_count(&self) -> usize {
    self.worker_count
  }

  pub fn observer(&self) -> &Observer {
    &self.observer
  }

  /// Tasks waiting in the queue, not yet picked up by a worker.
  pub fn queued_task_count(&self) -> usize {
    self.task_tx.len()
  }

  /// Tasks submitted whose result has not been delivered yet.
  pub fn outstanding_task_count(&self) -> usize {
    self.outstanding.count()
  }

  pub fn live_worker_count(&self) -> usize {
    self.live_workers.count()
  }

  /// Tasks currently inside the processing function.
  pub fn active_task_count(&self) -> usize {
    self.active_tasks.len()
  }

  pub fn is_started(&self) -> bool {
    self.state.lock().token.is_some()
  }

  /// Returns `true` once the task queue was closed by [`WorkerPool::stop`].
  pub fn is_closed(&self) -> bool {
    self.task_tx.is_closed()
  }

  /// Returns the result stream. It is closed by [`WorkerPool::stop`] once no
  /// worker can write to it anymore.
  pub fn results(&self) -> Receiver<TaskResult<O>> {
    self.result_rx.clone()
  }

  /// Enqueues a task, waiting while the queue is full.
  ///
  /// Once the pool is started the wait is raced against its cancellation
  /// token.
  ///
  /// # Errors
  /// Returns `PoolError::PoolClosed` if the task queue was already closed;
  /// submitting after `stop` is a usage error and the task is not processed.
  /// Returns `PoolError::Cancelled` if the pool's token fired while waiting.
  pub async fn submit(&self, task: Task<P>) -> Result<(), PoolError> {
    let task_id = task.id;
    if self.task_tx.is_closed() {
      return Err(self.reject_closed(task_id));
    }

    let token = self.state.lock().token.clone();
    // Rolled back if this future is dropped before the task is enqueued.
    let registration = self.outstanding.guard();
    trace!(pool_name = %self.pool_name, %task_id, "Submitting task to queue.");

    let delivery = match &token {
      Some(token) => send_or_cancel(&self.task_tx, task, token).await,
      None => match self.task_tx.send(task).await {
        Ok(()) => Delivery::Sent,
        Err(_) => Delivery::Closed,
      },
    };

    match delivery {
      Delivery::Sent => {
        // The worker that delivers the result deregisters the task.
        registration.disarm();
        Ok(())
      }
      Delivery::Cancelled => {
        debug!(pool_name = %self.pool_name, %task_id, "Submit: cancelled while waiting for queue capacity.");
        Err(PoolError::Cancelled(self.pool_name.to_string()))
      }
      Delivery::Closed => Err(self.reject_closed(task_id)),
    }
  }

  fn reject_closed(&self, task_id: u64) -> PoolError {
    error!(
      pool_name = %self.pool_name,
      %task_id,
      "Submit: task queue is closed, rejecting task. Tasks must be submitted before stop()."
    );
    PoolError::PoolClosed {
      pool_name: self.pool_name.to_string(),
      task_id,
    }
  }

  /// Launches exactly `worker_count` workers running `process` on each task.
  ///
  /// # Errors
  /// Returns `PoolError::AlreadyStarted` on a second call.
  pub fn start<F, Fut>(&self, token: CancellationToken, process: F) -> Result<(), PoolError>
  where
    F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<O>> + Send + 'static,
  {
    {
      let mut state = self.state.lock();
      if state.token.is_some() {
        warn!(pool_name = %self.pool_name, "Start: pool was already started.");
        return Err(PoolError::AlreadyStarted(self.pool_name.to_string()));
      }
      state.token = Some(token.clone());
    }

    info!(pool_name = %self.pool_name, worker_count = self.worker_count, "Starting workers.");
    let process = Arc::new(process);

    for worker_id in 0..self.worker_count {
      let worker = Worker {
        worker_id,
        pool_name: self.pool_name.clone(),
        task_rx: self.task_rx.clone(),
        result_tx: self.result_tx.clone(),
        outstanding: self.outstanding.clone(),
        active_tasks: self.active_tasks.clone(),
        observer: self.observer.clone(),
        token: token.clone(),
        process: process.clone(),
      };
      // Registered before spawning so `stop` can never observe a zero count
      // while a worker is still being launched.
      let live_guard = self.live_workers.guard();

      self.tokio_handle.spawn(
        worker
          .run(live_guard)
          .instrument(info_span!("pool_worker", pool_name = %self.pool_name, worker_id)),
      );
    }
    Ok(())
  }

  /// Closes the task queue, waits for every worker to exit, then for every
  /// outstanding task to be resulted, then closes the result stream.
  ///
  /// If the pool's token fires, tasks that will never be resulted are
  /// abandoned instead of waited for. Calling `stop` again is harmless.
  ///
  /// # Errors
  /// Returns `PoolError::NotStarted` if the pool was never started; both
  /// streams are closed regardless.
  pub async fn stop(&self) -> Result<(), PoolError> {
    if self.task_tx.close() {
      info!(pool_name = %self.pool_name, "Task queue closed, no further submissions accepted.");
    }

    let token = self.state.lock().token.clone();
    let Some(token) = token else {
      self.result_tx.close();
      warn!(pool_name = %self.pool_name, "Stop: pool was never started, closed both streams.");
      return Err(PoolError::NotStarted(self.pool_name.to_string()));
    };

    debug!(pool_name = %self.pool_name, "Stop: waiting for workers to exit.");
    self.live_workers.wait().await;

    debug!(
      pool_name = %self.pool_name,
      outstanding = self.outstanding.count(),
      "Stop: waiting for outstanding tasks."
    );
    tokio::select! {
      biased;
      _ = self.outstanding.wait() => {}
      _ = token.cancelled() => {}
    }

    if self.result_tx.close() {
      let abandoned_tasks = self.outstanding.count();
      if abandoned_tasks > 0 {
        warn!(pool_name = %self.pool_name, abandoned_tasks, "Pool cancelled before all tasks produced a result.");
      }
      info!(pool_name = %self.pool_name, "Result stream closed, pool stopped.");
      self.observer.emit(EngineEvent::PoolStopped {
        pool_name: self.pool_name.clone(),
        abandoned_tasks,
      });
    }
    Ok(())
  }

  /// Starts the pool, submits `tasks`, stops it and returns every result in
  /// arrival order.
  ///
  /// Results are drained while tasks are submitted and the pool stops, so a
  /// bounded result stream cannot block shutdown. If `token` fires, the
  /// results delivered before that point are returned.
  pub async fn process_tasks<F, Fut>(
    &self,
    token: CancellationToken,
    tasks: Vec<Task<P>>,
    process: F,
  ) -> Result<Vec<TaskResult<O>>, PoolError>
  where
    F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = TaskResult<O>> + Send + 'static,
  {
    self.start(token, process)?;
    let results = self.results();

    let feed = async {
      let mut submit_error = None;
      for task in tasks {
        match self.submit(task).await {
          Ok(()) => {}
          Err(PoolError::Cancelled(_)) => {
            debug!(pool_name = %self.pool_name, "Cancelled while submitting, skipping remaining tasks.");
            break;
          }
          Err(e) => {
            submit_error = Some(e);
            break;
          }
        }
      }
      let stopped = self.stop().await;
      match submit_error {
        Some(e) => Err(e),
        None => stopped,
      }
    };

    let (fed, collected) = tokio::join!(feed, stream::drain(&results));
    fed?;
    debug!(pool_name = %self.pool_name, results = collected.len(), "Collected results.");
    Ok(collected)
  }
}

impl<P: Send + 'static, O: Send + 'static> Drop for WorkerPool<P, O> {
  fn drop(&mut self) {
    // Workers drain what is left and exit; results go to any remaining receivers.
    if self.task_tx.close() {
      debug!(pool_name = %self.pool_name, "WorkerPool dropped without stop(), task queue closed.");
    }
  }
}

struct Worker<P, O, F> {
  worker_id: usize,
  pool_name: Arc<str>,
  task_rx: Receiver<Task<P>>,
  result_tx: Sender<TaskResult<O>>,
  outstanding: WaitGroup,
  active_tasks: Arc<DashMap<usize, u64>>,
  observer: Observer,
  token: CancellationToken,
  process: Arc<F>,
}

impl<P, O, F, Fut> Worker<P, O, F>
where
  P: Send + 'static,
  O: Send + 'static,
  F: Fn(Task<P>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = TaskResult<O>> + Send + 'static,
{
  async fn run(self, _live_guard: WaitGuard) {
    debug!("Worker started.");
    self.observer.emit(EngineEvent::WorkerStarted {
      pool_name: self.pool_name.clone(),
      worker_id: self.worker_id,
    });

    let reason = loop {
      let task = match recv_or_cancel(&self.task_rx, &self.token).await {
        Received::Item(task) => task,
        Received::Exhausted => break ExitReason::Exhausted,
        Received::Cancelled => break ExitReason::Cancelled,
      };

      let task_id = task.id;
      self.active_tasks.insert(self.worker_id, task_id);
      trace!(%task_id, "Processing task.");

      let process = self.process.as_ref();
      let processed = tokio::select! {
        biased;
        _ = self.token.cancelled() => None,
        outcome = AssertUnwindSafe(async move { process(task).await }).catch_unwind() => {
          Some(outcome.unwrap_or_else(|_| {
            error!(%task_id, "Processing function panicked.");
            TaskResult::panicked(task_id)
          }))
        }
      };
      self.active_tasks.remove(&self.worker_id);

      let Some(result) = processed else {
        self.abandon(task_id);
        break ExitReason::Cancelled;
      };

      let status = TaskStatus::from(&result);
      match send_or_cancel(&self.result_tx, result, &self.token).await {
        Delivery::Sent => {
          self.outstanding.done();
          trace!(%task_id, ?status, "Result delivered.");
          self.observer.emit(EngineEvent::TaskCompleted {
            pool_name: self.pool_name.clone(),
            worker_id: self.worker_id,
            task_id,
            status,
          });
        }
        Delivery::Cancelled => {
          self.abandon(task_id);
          break ExitReason::Cancelled;
        }
        Delivery::Closed => {
          // Only reachable when a consumer closed the result stream itself.
          warn!(%task_id, "Result stream closed by a consumer, result dropped.");
          self.outstanding.done();
        }
      }
    };

    debug!(?reason, "Worker stopped.");
    self.observer.emit(EngineEvent::WorkerStopped {
      pool_name: self.pool_name.clone(),
      worker_id: self.worker_id,
      reason,
    });
  }

  fn abandon(&self, task_id: u64) {
    debug!(%task_id, "Cancelled mid-flight, no result emitted.");
    self.observer.emit(EngineEvent::TaskAbandoned {
      pool_name: self.pool_name.clone(),
      worker_id: self.worker_id,
      task_id,
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_config_defaults_follow_worker_count() {
    let config = PoolConfig::new(3);
    assert_eq!(config.task_capacity, 6);
    assert_eq!(config.result_capacity, ResultCapacity::Bounded(6));
  }

  #[test]
  fn test_config_clamps_zero_values() {
    let config = PoolConfig::new(0)
      .with_task_capacity(0)
      .with_result_capacity(ResultCapacity::Bounded(0));
    assert_eq!(config.worker_count, 1);
    assert_eq!(config.task_capacity, 1);
    assert_eq!(config.result_capacity, ResultCapacity::Bounded(1));
  }

  #[tokio::test]
  async fn test_unnamed_pools_get_distinct_names() {
    let a = WorkerPool::<u32, u32>::new(PoolConfig::new(1), TokioHandle::current());
    let b = WorkerPool::<u32, u32>::new(PoolConfig::new(1), TokioHandle::current());
    assert!(a.name().starts_with("pool-"));
    assert_ne!(a.name(), b.name());
  }
}
