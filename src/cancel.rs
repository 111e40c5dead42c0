//! Deadline-bound cancellation tokens.
//!
//! `CancellationToken` only supports manual triggering. These helpers derive a
//! child token that additionally fires on its own once a deadline passes, so a
//! whole pipeline can be bounded in time by handing it a single token.

use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Returns a child of `parent` that is cancelled after `timeout`, when
/// `parent` is cancelled, or when cancelled manually, whichever comes first.
///
/// Must be called from within a Tokio runtime.
pub fn with_timeout(parent: &CancellationToken, timeout: Duration) -> CancellationToken {
  with_deadline(parent, Instant::now() + timeout)
}

/// Returns a child of `parent` that is cancelled once `deadline` is reached.
///
/// Must be called from within a Tokio runtime.
pub fn with_deadline(parent: &CancellationToken, deadline: Instant) -> CancellationToken {
  let token = parent.child_token();
  let timer_token = token.clone();

  tokio::spawn(async move {
    tokio::select! {
      biased;
      _ = timer_token.cancelled() => {}
      _ = tokio::time::sleep_until(deadline) => {
        debug!("Deadline reached, cancelling token.");
        timer_token.cancel();
      }
    }
  });

  token
}

/// Sleeps for `duration` unless `token` fires first.
///
/// Returns `true` if the full duration elapsed.
pub async fn sleep_or_cancel(duration: Duration, token: &CancellationToken) -> bool {
  tokio::select! {
    biased;
    _ = token.cancelled() => false,
    _ = tokio::time::sleep(duration) => true,
  }
}
