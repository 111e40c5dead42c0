use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner {
  count: Mutex<usize>,
  zero: Notify,
}

/// A countdown join barrier.
///
/// Participants are registered with [`WaitGroup::add`] (or [`WaitGroup::guard`])
/// before they start and deregister with [`WaitGroup::done`]. [`WaitGroup::wait`]
/// resolves once the count is back at zero. Clones share the same counter.
#[derive(Clone)]
pub struct WaitGroup {
  inner: Arc<Inner>,
}

impl fmt::Debug for WaitGroup {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WaitGroup").field("count", &self.count()).finish()
  }
}

impl Default for WaitGroup {
  fn default() -> Self {
    Self::new()
  }
}

impl WaitGroup {
  pub fn new() -> Self {
    Self {
      inner: Arc::new(Inner {
        count: Mutex::new(0),
        zero: Notify::new(),
      }),
    }
  }

  pub fn add(&self, n: usize) {
    *self.inner.count.lock() += n;
  }

  /// Marks one participant as finished.
  ///
  /// # Panics
  /// Panics if called more often than participants were added.
  pub fn done(&self) {
    let reached_zero = {
      let mut count = self.inner.count.lock();
      *count = count
        .checked_sub(1)
        .unwrap_or_else(|| panic!("WaitGroup::done called with no outstanding participants"));
      *count == 0
    };
    if reached_zero {
      self.inner.zero.notify_waiters();
    }
  }

  pub fn count(&self) -> usize {
    *self.inner.count.lock()
  }

  /// Registers one participant and returns a guard that calls [`WaitGroup::done`]
  /// when dropped, including on unwind.
  pub fn guard(&self) -> WaitGuard {
    self.add(1);
    WaitGuard {
      group: Some(self.clone()),
    }
  }

  pub async fn wait(&self) {
    loop {
      // Register interest before reading the count so a concurrent `done`
      // cannot slip between the check and the await.
      let notified = self.inner.zero.notified();
      tokio::pin!(notified);
      notified.as_mut().enable();

      if self.count() == 0 {
        return;
      }
      notified.await;
    }
  }
}

/// Deregisters its participant from a [`WaitGroup`] on drop.
#[derive(Debug)]
pub struct WaitGuard {
  group: Option<WaitGroup>,
}

impl WaitGuard {
  /// Releases the guard without deregistering; the participant must then be
  /// finished with an explicit [`WaitGroup::done`].
  pub fn disarm(mut self) {
    self.group = None;
  }
}

impl Drop for WaitGuard {
  fn drop(&mut self) {
    if let Some(group) = self.group.take() {
      group.done();
    }
  }
}
