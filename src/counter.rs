use parking_lot::Mutex;

/// A mutex-guarded counter safe to share between threads and tasks.
#[derive(Debug, Default)]
pub struct Counter {
  value: Mutex<u64>,
}

impl Counter {
  pub fn new() -> Self {
    Self::default()
  }

  /// Increments the counter and returns the new value.
  pub fn increment(&self) -> u64 {
    let mut value = self.value.lock();
    *value += 1;
    *value
  }

  pub fn value(&self) -> u64 {
    *self.value.lock()
  }
}
