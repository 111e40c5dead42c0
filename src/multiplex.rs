//! Merging of already-existing streams into one.
//!
//! Any `futures::Stream` can be a source: channel receivers, other pipelines'
//! outputs, `futures::stream::iter`, boxed streams of different concrete
//! types. One relay per source forwards into the shared output and a join
//! barrier closes the output once every relay has finished.

use crate::observer::{Observer, StageState};
use crate::stage::StageLifecycle;
use crate::stream::{self, send_or_cancel, Delivery, Received, Receiver, Sender};
use crate::wait_group::{WaitGroup, WaitGuard};

use std::sync::Arc;

use futures::future::BoxFuture;
use futures::{FutureExt, Stream, StreamExt};
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info_span, trace, Instrument};

/// A named future ready to be spawned as one stage or relay.
pub(crate) type StageTask = (Arc<str>, BoxFuture<'static, ()>);

pub(crate) async fn next_or_cancel<S>(source: &mut S, token: &CancellationToken) -> Received<S::Item>
where
  S: Stream + Unpin,
{
  tokio::select! {
    biased;
    _ = token.cancelled() => Received::Cancelled,
    next = source.next() => match next {
      Some(value) => Received::Item(value),
      None => Received::Exhausted,
    },
  }
}

/// Builds the relays and the closing task of a fan-in over `sources`.
///
/// Nothing runs until the returned tasks are spawned. The output closes after
/// every relay has seen its source exhausted or the token fire.
pub(crate) fn fan_in<S, T>(
  name: Arc<str>,
  sources: Vec<S>,
  capacity: usize,
  token: &CancellationToken,
  observer: &Observer,
) -> (Receiver<T>, Vec<StageTask>)
where
  S: Stream<Item = T> + Send + 'static,
  T: Send + 'static,
{
  let (tx, rx) = stream::bounded(capacity);
  let relays = WaitGroup::new();
  let mut tasks: Vec<StageTask> = Vec::with_capacity(sources.len() + 1);

  for (index, source) in sources.into_iter().enumerate() {
    let relay_name: Arc<str> = Arc::from(format!("{name}/relay-{index}"));
    let lifecycle = StageLifecycle::new(relay_name.clone(), observer.clone());
    let relay = run_relay(source, tx.clone(), token.clone(), lifecycle, relays.guard());
    tasks.push((relay_name, relay.boxed()));
  }

  debug!(stage = %name, relays = relays.count(), "Fan-in prepared.");
  let lifecycle = StageLifecycle::new(name.clone(), observer.clone()).closing(tx);
  tasks.push((name, close_after_relays(relays, token.clone(), lifecycle).boxed()));

  (rx, tasks)
}

async fn run_relay<S, T>(
  source: S,
  output: Sender<T>,
  token: CancellationToken,
  mut lifecycle: StageLifecycle,
  _barrier: WaitGuard,
) where
  S: Stream<Item = T>,
{
  tokio::pin!(source);
  let mut forwarded = 0usize;

  loop {
    let value = match next_or_cancel(&mut source, &token).await {
      Received::Item(value) => value,
      Received::Exhausted => {
        lifecycle.transition(StageState::Draining);
        break;
      }
      Received::Cancelled => {
        lifecycle.transition(StageState::Cancelling);
        break;
      }
    };

    match send_or_cancel(&output, value, &token).await {
      Delivery::Sent => forwarded += 1,
      Delivery::Cancelled => {
        lifecycle.transition(StageState::Cancelling);
        break;
      }
      Delivery::Closed => {
        lifecycle.transition(StageState::Draining);
        break;
      }
    }
  }

  trace!(stage = %lifecycle.name(), forwarded, "Relay finished.");
}

async fn close_after_relays(relays: WaitGroup, token: CancellationToken, mut lifecycle: StageLifecycle) {
  relays.wait().await;
  lifecycle.finish(&token);
  debug!(stage = %lifecycle.name(), "All relays finished, closing merged output.");
}

async fn run_concatenate<S, T>(
  sources: Vec<S>,
  output: Sender<T>,
  token: CancellationToken,
  mut lifecycle: StageLifecycle,
) where
  S: Stream<Item = T>,
{
  let mut forwarded = 0usize;

  'sources: for (index, source) in sources.into_iter().enumerate() {
    tokio::pin!(source);
    loop {
      match next_or_cancel(&mut source, &token).await {
        Received::Item(value) => match send_or_cancel(&output, value, &token).await {
          Delivery::Sent => forwarded += 1,
          Delivery::Cancelled | Delivery::Closed => break 'sources,
        },
        Received::Exhausted => {
          trace!(stage = %lifecycle.name(), index, "Source exhausted, moving on.");
          break;
        }
        Received::Cancelled => break 'sources,
      }
    }
  }

  lifecycle.finish(&token);
  debug!(stage = %lifecycle.name(), forwarded, "Concatenation finished.");
}

/// Merges existing streams into one, stopping when every source is exhausted
/// or the token fires.
#[derive(Debug, Clone)]
pub struct Multiplexer {
  name: Arc<str>,
  capacity: usize,
  observer: Observer,
  tokio_handle: TokioHandle,
}

impl Multiplexer {
  pub fn new(name: &str, tokio_handle: TokioHandle) -> Self {
    Self {
      name: Arc::from(name),
      capacity: 1,
      observer: Observer::new(),
      tokio_handle,
    }
  }

  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity.max(1);
    self
  }

  pub fn with_observer(mut self, observer: Observer) -> Self {
    self.observer = observer;
    self
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Interleaves all sources in arrival order. Each source keeps its own
  /// order; no order is guaranteed across sources.
  pub fn merge<S, T>(&self, token: &CancellationToken, sources: Vec<S>) -> Receiver<T>
  where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
  {
    let (output, tasks) = fan_in(self.name.clone(), sources, self.capacity, token, &self.observer);
    for (name, task) in tasks {
      self.spawn(name, task);
    }
    output
  }

  /// Drains the sources one after another, so the output keeps the global
  /// order: all of the first source, then all of the second, and so on.
  pub fn concatenate<S, T>(&self, token: &CancellationToken, sources: Vec<S>) -> Receiver<T>
  where
    S: Stream<Item = T> + Send + 'static,
    T: Send + 'static,
  {
    let (tx, rx) = stream::bounded(self.capacity);
    let lifecycle = StageLifecycle::new(self.name.clone(), self.observer.clone()).closing(tx.clone());
    self.spawn(
      self.name.clone(),
      run_concatenate(sources, tx, token.clone(), lifecycle).boxed(),
    );
    rx
  }

  fn spawn(&self, name: Arc<str>, task: BoxFuture<'static, ()>) {
    self
      .tokio_handle
      .spawn(task.instrument(info_span!("multiplexer", stage = %name)));
  }
}

/// [`Multiplexer::merge`] on the current runtime.
///
/// # Panics
/// Panics when called outside a Tokio runtime.
pub fn multiplex<S, T>(token: &CancellationToken, sources: Vec<S>) -> Receiver<T>
where
  S: Stream<Item = T> + Send + 'static,
  T: Send + 'static,
{
  Multiplexer::new("multiplexer", TokioHandle::current()).merge(token, sources)
}

/// [`Multiplexer::concatenate`] on the current runtime.
///
/// # Panics
/// Panics when called outside a Tokio runtime.
pub fn concatenate<S, T>(token: &CancellationToken, sources: Vec<S>) -> Receiver<T>
where
  S: Stream<Item = T> + Send + 'static,
  T: Send + 'static,
{
  Multiplexer::new("concatenation", TokioHandle::current()).concatenate(token, sources)
}
