use crate::wait_group::WaitGroup;

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

/// Runs `process` on every item concurrently, one task per item, and returns
/// once all of them have finished.
///
/// A panicking item does not prevent the call from returning.
///
/// # Panics
/// Panics when called outside a Tokio runtime.
pub async fn process_items<T, F, Fut>(items: impl IntoIterator<Item = T>, process: F) -> usize
where
  T: Send + 'static,
  F: Fn(T) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = ()> + Send + 'static,
{
  let barrier = WaitGroup::new();
  let process = Arc::new(process);
  let mut spawned = 0usize;

  for item in items {
    let guard = barrier.guard();
    let process = process.clone();
    tokio::spawn(async move {
      let _guard = guard;
      (*process)(item).await;
    });
    spawned += 1;
  }

  debug!(spawned, "Waiting for item tasks.");
  barrier.wait().await;
  spawned
}
