use crate::cancel::sleep_or_cancel;
use crate::observer::{EngineEvent, Observer, StageState};
use crate::stream::{recv_or_cancel, send_or_cancel, Delivery, Received, Receiver, Sender};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Per-stage tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageOptions {
  /// Capacity of the stage's output stream, at least one.
  pub capacity: usize,
  /// Delay after each forwarded value.
  pub pace: Option<Duration>,
}

impl Default for StageOptions {
  fn default() -> Self {
    Self {
      capacity: 1,
      pace: None,
    }
  }
}

impl StageOptions {
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = capacity.max(1);
    self
  }

  pub fn with_pace(mut self, pace: Duration) -> Self {
    self.pace = Some(pace);
    self
  }
}

/// Tracks a stage's [`StageState`] and publishes every transition.
///
/// Dropping the lifecycle moves it to `Closed` and, for stages that own an
/// output, closes that output first. Because this happens in `Drop`, the
/// output is closed exactly once whether the stage finished, was cancelled or
/// panicked.
pub(crate) struct StageLifecycle {
  name: Arc<str>,
  state: StageState,
  observer: Observer,
  on_close: Option<Box<dyn FnOnce() + Send>>,
}

impl fmt::Debug for StageLifecycle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StageLifecycle")
      .field("name", &self.name)
      .field("state", &self.state)
      .finish_non_exhaustive()
  }
}

impl StageLifecycle {
  pub(crate) fn new(name: Arc<str>, observer: Observer) -> Self {
    observer.emit(EngineEvent::StageTransition {
      stage: name.clone(),
      state: StageState::Running,
    });
    Self {
      name,
      state: StageState::Running,
      observer,
      on_close: None,
    }
  }

  /// Makes this lifecycle responsible for closing `output`.
  pub(crate) fn closing<T: Send + 'static>(mut self, output: Sender<T>) -> Self {
    self.on_close = Some(Box::new(move || {
      output.close();
    }));
    self
  }

  pub(crate) fn name(&self) -> &Arc<str> {
    &self.name
  }

  pub(crate) fn transition(&mut self, state: StageState) {
    if self.state == state || self.state == StageState::Closed {
      return;
    }
    trace!(stage = %self.name, from = ?self.state, to = ?state, "Stage transition.");
    self.state = state;
    self.observer.emit(EngineEvent::StageTransition {
      stage: self.name.clone(),
      state,
    });
  }

  /// Records why the stage is about to stop, from the token's point of view.
  pub(crate) fn finish(&mut self, token: &CancellationToken) {
    if token.is_cancelled() {
      self.transition(StageState::Cancelling);
    } else {
      self.transition(StageState::Draining);
    }
  }
}

impl Drop for StageLifecycle {
  fn drop(&mut self) {
    if let Some(close) = self.on_close.take() {
      close();
    }
    self.transition(StageState::Closed);
  }
}

/// Emits `values` one by one, `interval` apart, until exhausted or cancelled.
pub(crate) async fn run_producer<T, I>(
  values: I,
  interval: Duration,
  output: Sender<T>,
  token: CancellationToken,
  mut lifecycle: StageLifecycle,
) where
  I: IntoIterator<Item = T>,
{
  let mut emitted = 0usize;

  for (index, value) in values.into_iter().enumerate() {
    if index > 0 && !interval.is_zero() && !sleep_or_cancel(interval, &token).await {
      break;
    }
    match send_or_cancel(&output, value, &token).await {
      Delivery::Sent => {
        emitted += 1;
        trace!(stage = %lifecycle.name(), index, "Producer emitted value.");
      }
      Delivery::Cancelled => break,
      Delivery::Closed => {
        debug!(stage = %lifecycle.name(), "Producer output closed by its consumer.");
        break;
      }
    }
  }

  lifecycle.finish(&token);
  debug!(stage = %lifecycle.name(), emitted, cancelled = token.is_cancelled(), "Producer finished.");
}

/// Forwards `transform(value)` for every value of `input` into `output`.
///
/// Shared by transform stages; receive and send are each raced against
/// `token`. Returns the number of forwarded values.
pub(crate) async fn forward<T, U, F>(
  input: &Receiver<T>,
  output: &Sender<U>,
  transform: F,
  pace: Option<Duration>,
  token: &CancellationToken,
  lifecycle: &mut StageLifecycle,
) -> usize
where
  F: Fn(T) -> U,
{
  let mut forwarded = 0usize;

  loop {
    let value = match recv_or_cancel(input, token).await {
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

    match send_or_cancel(output, transform(value), token).await {
      Delivery::Sent => forwarded += 1,
      Delivery::Cancelled => {
        lifecycle.transition(StageState::Cancelling);
        break;
      }
      Delivery::Closed => {
        debug!(stage = %lifecycle.name(), "Output closed by its consumer.");
        lifecycle.transition(StageState::Draining);
        break;
      }
    }

    if let Some(pace) = pace {
      if !sleep_or_cancel(pace, token).await {
        lifecycle.transition(StageState::Cancelling);
        break;
      }
    }
  }

  forwarded
}

pub(crate) async fn run_transform<T, U, F>(
  input: Receiver<T>,
  transform: F,
  pace: Option<Duration>,
  output: Sender<U>,
  token: CancellationToken,
  mut lifecycle: StageLifecycle,
) where
  F: Fn(T) -> U,
{
  let forwarded = forward(&input, &output, transform, pace, &token, &mut lifecycle).await;
  debug!(stage = %lifecycle.name(), forwarded, "Transform stage finished.");
}
