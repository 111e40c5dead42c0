//! Closable streams shared between pool workers and pipeline stages, plus the
//! cancellation-aware send/receive primitives every blocking point goes through.

pub use async_channel::{Receiver, Sender};
use tokio_util::sync::CancellationToken;

/// Creates a bounded stream. A capacity of zero is raised to one.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
  async_channel::bounded(capacity.max(1))
}

pub fn unbounded<T>() -> (Sender<T>, Receiver<T>) {
  async_channel::unbounded()
}

/// Outcome of [`send_or_cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
  Sent,
  /// The token fired first; the value was dropped.
  Cancelled,
  /// The stream was closed; the value was dropped.
  Closed,
}

/// Outcome of [`recv_or_cancel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received<T> {
  Item(T),
  /// The stream is closed and empty.
  Exhausted,
  Cancelled,
}

/// Sends `value`, racing the send against `token`.
///
/// Cancellation wins ties, so an already-cancelled token never lets a value
/// through.
pub async fn send_or_cancel<T>(tx: &Sender<T>, value: T, token: &CancellationToken) -> Delivery {
  tokio::select! {
    biased;
    _ = token.cancelled() => Delivery::Cancelled,
    sent = tx.send(value) => match sent {
      Ok(()) => Delivery::Sent,
      Err(_) => Delivery::Closed,
    },
  }
}

/// Receives the next value, racing the receive against `token`.
pub async fn recv_or_cancel<T>(rx: &Receiver<T>, token: &CancellationToken) -> Received<T> {
  tokio::select! {
    biased;
    _ = token.cancelled() => Received::Cancelled,
    received = rx.recv() => match received {
      Ok(value) => Received::Item(value),
      Err(_) => Received::Exhausted,
    },
  }
}

/// Drains `rx` until it is closed, in arrival order.
pub async fn drain<T>(rx: &Receiver<T>) -> Vec<T> {
  let mut values = Vec::new();
  while let Ok(value) = rx.recv().await {
    values.push(value);
  }
  values
}
