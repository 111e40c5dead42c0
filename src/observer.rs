use crate::task::TaskStatus;

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{error, trace};

/// Why a pool worker left its loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
  /// The task queue was closed and drained.
  Exhausted,
  /// The governing cancellation token fired.
  Cancelled,
}

/// Lifecycle of a pipeline stage or relay.
///
/// `Running` moves to `Draining` when the input is exhausted or to
/// `Cancelling` when the token fires; both end in `Closed`, which is terminal
/// and coincides with the stage's output stream being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageState {
  Running,
  Draining,
  Cancelling,
  Closed,
}

/// State transitions published by pools and pipelines.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
  WorkerStarted {
    pool_name: Arc<str>,
    worker_id: usize,
  },
  WorkerStopped {
    pool_name: Arc<str>,
    worker_id: usize,
    reason: ExitReason,
  },
  TaskCompleted {
    pool_name: Arc<str>,
    worker_id: usize,
    task_id: u64,
    status: TaskStatus,
  },
  /// A task was dequeued but cancellation fired before its result was delivered.
  TaskAbandoned {
    pool_name: Arc<str>,
    worker_id: usize,
    task_id: u64,
  },
  PoolStopped {
    pool_name: Arc<str>,
    /// Submitted tasks that never produced a result.
    abandoned_tasks: usize,
  },
  StageTransition {
    stage: Arc<str>,
    state: StageState,
  },
}

type Handler = Arc<dyn Fn(&EngineEvent) + Send + Sync + 'static>;

/// A registry of event handlers shared by pools and pipelines.
///
/// Handlers run synchronously on the task that emits the event, so they should
/// be cheap. A panicking handler is logged and does not affect the others.
#[derive(Clone, Default)]
pub struct Observer {
  handlers: Arc<RwLock<Vec<Handler>>>,
}

impl fmt::Debug for Observer {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Observer")
      .field("handler_count", &self.handler_count())
      .finish()
  }
}

impl Observer {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add_handler(&self, handler: impl Fn(&EngineEvent) + Send + Sync + 'static) {
    let mut handlers = self.handlers.write();
    handlers.push(Arc::new(handler));
    trace!("Observer: added handler, total handlers: {}", handlers.len());
  }

  pub fn handler_count(&self) -> usize {
    self.handlers.read().len()
  }

  pub(crate) fn emit(&self, event: EngineEvent) {
    // Snapshot so a handler may register further handlers without deadlocking.
    let handlers: Vec<Handler> = self.handlers.read().clone();
    if handlers.is_empty() {
      return;
    }

    for handler in handlers {
      if catch_unwind(AssertUnwindSafe(|| handler(&event))).is_err() {
        error!(?event, "An observer handler panicked while handling an event.");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use parking_lot::Mutex;

  fn stage_event(state: StageState) -> EngineEvent {
    EngineEvent::StageTransition {
      stage: Arc::from("stage"),
      state,
    }
  }

  #[test]
  fn test_emit_reaches_every_handler_in_order() {
    let observer = Observer::new();
    let seen = Arc::new(Mutex::new(Vec::new()));

    for tag in ["a", "b"] {
      let seen = seen.clone();
      observer.add_handler(move |event| {
        if let EngineEvent::StageTransition { state, .. } = event {
          seen.lock().push((tag, *state));
        }
      });
    }

    observer.emit(stage_event(StageState::Running));
    observer.emit(stage_event(StageState::Closed));

    assert_eq!(
      *seen.lock(),
      vec![
        ("a", StageState::Running),
        ("b", StageState::Running),
        ("a", StageState::Closed),
        ("b", StageState::Closed),
      ]
    );
  }

  #[test]
  fn test_panicking_handler_does_not_stop_others() {
    let observer = Observer::new();
    let delivered = Arc::new(Mutex::new(0usize));

    observer.add_handler(|_| panic!("handler failure"));
    let counter = delivered.clone();
    observer.add_handler(move |_| *counter.lock() += 1);

    observer.emit(stage_event(StageState::Running));
    assert_eq!(*delivered.lock(), 1);
    assert_eq!(observer.handler_count(), 2);
  }

  #[test]
  fn test_clones_share_handlers() {
    let observer = Observer::new();
    let clone = observer.clone();
    clone.add_handler(|_| {});
    assert_eq!(observer.handler_count(), 1);
  }
}
