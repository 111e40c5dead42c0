use crate::error::TaskError;

/// A unit of work submitted to a [`crate::WorkerPool`].
///
/// The id is chosen by the submitter; the pool treats it as opaque and only
/// uses it for logging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task<P> {
  pub id: u64,
  pub payload: P,
}

impl<P> Task<P> {
  pub fn new(id: u64, payload: P) -> Self {
    Self { id, payload }
  }
}

/// The outcome of processing exactly one [`Task`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult<O> {
  pub task_id: u64,
  pub output: Result<O, TaskError>,
}

impl<O> TaskResult<O> {
  pub fn success(task_id: u64, output: O) -> Self {
    Self {
      task_id,
      output: Ok(output),
    }
  }

  pub fn failure(task_id: u64, message: impl Into<String>) -> Self {
    Self {
      task_id,
      output: Err(TaskError::Failed(message.into())),
    }
  }

  pub(crate) fn panicked(task_id: u64) -> Self {
    Self {
      task_id,
      output: Err(TaskError::Panicked),
    }
  }

  pub fn is_err(&self) -> bool {
    self.output.is_err()
  }

  /// Returns the error carried by this result, if any.
  pub fn error(&self) -> Option<&TaskError> {
    self.output.as_ref().err()
  }
}

/// Coarse classification of a result, used in observer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
  Success,
  Failed,
  Panicked,
}

impl<O> From<&TaskResult<O>> for TaskStatus {
  fn from(result: &TaskResult<O>) -> Self {
    match &result.output {
      Ok(_) => TaskStatus::Success,
      Err(TaskError::Failed(_)) => TaskStatus::Failed,
      Err(TaskError::Panicked) => TaskStatus::Panicked,
    }
  }
}
