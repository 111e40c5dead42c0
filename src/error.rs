use thiserror::Error;

/// Errors raised by the `futures_ensemble` worker pool itself.
///
/// These describe lifecycle and misuse conditions. A failing task is never
/// reported here; see [`TaskError`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
  #[error("Task queue of pool '{pool_name}' is closed, cannot accept task {task_id}")]
  PoolClosed { pool_name: String, task_id: u64 },

  #[error("Pool '{0}' was already started")]
  AlreadyStarted(String),

  #[error("Pool '{0}' was stopped without ever being started")]
  NotStarted(String),

  #[error("Operation on pool '{0}' was cancelled")]
  Cancelled(String),
}

/// Per-task failure carried inside a [`crate::TaskResult`].
///
/// The pool delivers these like any other result and never retries.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TaskError {
  #[error("Task failed: {0}")]
  Failed(String),

  #[error("Processing function panicked")]
  Panicked,
}

/// Errors surfaced when joining the stages of a [`crate::Pipeline`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
  #[error("Pipeline stages terminated abnormally: {0:?}")]
  StagesPanicked(Vec<String>),
}
