use crate::error::PipelineError;
use crate::multiplex::{fan_in, StageTask};
use crate::observer::Observer;
use crate::stage::{run_producer, run_transform, StageLifecycle, StageOptions};
use crate::stream::{self, Receiver};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, Instrument};

/// Composes producer, transform and fan-in stages under one cancellation
/// token.
///
/// Every stage runs as its own task and owns its output stream, closing it
/// exactly once when it stops. Cancelling the token unwinds every stage.
///
/// ```ignore
/// let pipeline = Pipeline::new(token, Handle::current());
/// let a = pipeline.producer("producer-1", 0..3, Duration::from_millis(100));
/// let b = pipeline.producer("producer-2", 3..6, Duration::from_millis(100));
/// let a = pipeline.transform("worker-1", a, |n: i64| n * n);
/// let b = pipeline.transform("worker-2", b, |n: i64| n * n);
/// let merged = pipeline.merge("fan-in", vec![a, b]);
/// ```
pub struct Pipeline {
  token: CancellationToken,
  options: StageOptions,
  observer: Observer,
  tokio_handle: TokioHandle,
  stages: Mutex<Vec<(Arc<str>, JoinHandle<()>)>>,
}

impl fmt::Debug for Pipeline {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Pipeline")
      .field("cancelled", &self.token.is_cancelled())
      .field("options", &self.options)
      .field("stage_count", &self.stage_count())
      .finish_non_exhaustive()
  }
}

impl Pipeline {
  pub fn new(token: CancellationToken, tokio_handle: TokioHandle) -> Self {
    Self {
      token,
      options: StageOptions::default(),
      observer: Observer::new(),
      tokio_handle,
      stages: Mutex::new(Vec::new()),
    }
  }

  /// Default options for stages created without explicit ones.
  pub fn with_options(mut self, options: StageOptions) -> Self {
    self.options = options;
    self
  }

  pub fn with_observer(mut self, observer: Observer) -> Self {
    self.observer = observer;
    self
  }

  pub fn token(&self) -> &CancellationToken {
    &self.token
  }

  pub fn observer(&self) -> &Observer {
    &self.observer
  }

  pub fn cancel(&self) {
    debug!("Pipeline cancellation requested.");
    self.token.cancel();
  }

  /// Number of spawned stages and relays not yet joined.
  pub fn stage_count(&self) -> usize {
    self.stages.lock().len()
  }

  /// A source stage emitting `values` in order, `interval` apart.
  pub fn producer<T, I>(&self, name: &str, values: I, interval: Duration) -> Receiver<T>
  where
    T: Send + 'static,
    I: IntoIterator<Item = T> + Send + 'static,
    I::IntoIter: Send,
  {
    let name: Arc<str> = Arc::from(name);
    let (tx, rx) = stream::bounded(self.options.capacity);
    let lifecycle = StageLifecycle::new(name.clone(), self.observer.clone()).closing(tx.clone());
    let task = run_producer(values, interval, tx, self.token.clone(), lifecycle);
    self.spawn((name, task.boxed()));
    rx
  }

  /// A stage applying `transform` to every value of `input`, with the
  /// pipeline's default options.
  pub fn transform<T, U, F>(&self, name: &str, input: Receiver<T>, transform: F) -> Receiver<U>
  where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + 'static,
  {
    self.transform_with(name, input, transform, self.options)
  }

  pub fn transform_with<T, U, F>(
    &self,
    name: &str,
    input: Receiver<T>,
    transform: F,
    options: StageOptions,
  ) -> Receiver<U>
  where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Send + 'static,
  {
    let name: Arc<str> = Arc::from(name);
    let (tx, rx) = stream::bounded(options.capacity);
    let lifecycle = StageLifecycle::new(name.clone(), self.observer.clone()).closing(tx.clone());
    let task = run_transform(input, transform, options.pace, tx, self.token.clone(), lifecycle);
    self.spawn((name, task.boxed()));
    rx
  }

  /// Splits `input` across `workers` transform stages competing for its
  /// values. Each returned stream preserves the order in which its stage
  /// received values.
  pub fn fan_out<T, U, F>(&self, name: &str, input: Receiver<T>, workers: usize, transform: F) -> Vec<Receiver<U>>
  where
    T: Send + 'static,
    U: Send + 'static,
    F: Fn(T) -> U + Clone + Send + 'static,
  {
    (0..workers.max(1))
      .map(|index| self.transform(&format!("{name}-{index}"), input.clone(), transform.clone()))
      .collect()
  }

  /// Merges `inputs` into one stream closed after every input is exhausted or
  /// the pipeline is cancelled.
  pub fn merge<T>(&self, name: &str, inputs: Vec<Receiver<T>>) -> Receiver<T>
  where
    T: Send + 'static,
  {
    let (output, tasks) = fan_in(Arc::from(name), inputs, self.options.capacity, &self.token, &self.observer);
    for task in tasks {
      self.spawn(task);
    }
    output
  }

  fn spawn(&self, (name, task): StageTask) {
    let handle = self
      .tokio_handle
      .spawn(task.instrument(info_span!("pipeline_stage", stage = %name)));
    self.stages.lock().push((name, handle));
  }

  /// Waits for every stage spawned so far.
  ///
  /// # Errors
  /// Returns `PipelineError::StagesPanicked` naming the stages whose task
  /// panicked. Their outputs were still closed.
  pub async fn join(&self) -> Result<(), PipelineError> {
    let stages: Vec<(Arc<str>, JoinHandle<()>)> = std::mem::take(&mut *self.stages.lock());
    let mut panicked = Vec::new();

    for (name, handle) in stages {
      if let Err(join_error) = handle.await {
        error!(stage = %name, "Pipeline stage terminated abnormally: {:?}", join_error);
        panicked.push(name.to_string());
      }
    }

    if panicked.is_empty() {
      Ok(())
    } else {
      Err(PipelineError::StagesPanicked(panicked))
    }
  }
}
