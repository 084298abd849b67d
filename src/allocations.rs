use super::*;

/// User callback attached to a class's allocation record.
///
/// Invoked with `(class, event, data)`. On [`EventKind::New`] `data` is
/// `None` and the returned value is retained for the object; on
/// [`EventKind::Free`] `data` is whatever the `New` invocation returned.
/// The callback must be fast, must not trigger a full collection, and
/// must not block. It may allocate; allocations made inside it are
/// suppressed from tracking. Panics are caught and logged.
pub trait AllocationCallback: Send + Sync {
  fn call(
    &self,
    class: Value,
    event: EventKind,
    data: Option<Value>,
  ) -> Option<Value>;
}

impl<F> AllocationCallback for F
where
  F: Fn(Value, EventKind, Option<Value>) -> Option<Value> + Send + Sync,
{
  fn call(
    &self,
    class: Value,
    event: EventKind,
    data: Option<Value>,
  ) -> Option<Value> {
    self(class, event, data)
  }
}

/// Per-class allocation counters with an optional user callback.
///
/// `new_count` is monotonic while tracking runs; the retained count
/// saturates at zero so objects freed after being allocated before
/// tracking started cannot underflow it.
#[derive(Default)]
pub struct Allocations {
  callback: Mutex<Option<Arc<dyn AllocationCallback>>>,
  free_count: AtomicU64,
  new_count: AtomicU64,
}

impl Allocations {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn new_count(&self) -> u64 {
    self.new_count.load(Ordering::Relaxed)
  }

  #[must_use]
  pub fn free_count(&self) -> u64 {
    self.free_count.load(Ordering::Relaxed)
  }

  /// Live allocations observed since tracking started.
  #[must_use]
  pub fn retained_count(&self) -> u64 {
    self.new_count().saturating_sub(self.free_count())
  }

  #[must_use]
  pub fn has_callback(&self) -> bool {
    self.lock_callback().is_some()
  }

  /// Attach a callback, replacing any existing one.
  pub fn track(&self, callback: Arc<dyn AllocationCallback>) {
    *self.lock_callback() = Some(callback);
  }

  /// Zero both counters and drop the callback.
  pub fn clear(&self) {
    self.new_count.store(0, Ordering::Relaxed);
    self.free_count.store(0, Ordering::Relaxed);
    *self.lock_callback() = None;
  }

  pub(crate) fn record_new(&self) {
    self.new_count.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn record_free(&self) {
    self.free_count.fetch_add(1, Ordering::Relaxed);
  }

  pub(crate) fn callback(&self) -> Option<Arc<dyn AllocationCallback>> {
    self.lock_callback().clone()
  }

  fn lock_callback(
    &self,
  ) -> MutexGuard<'_, Option<Arc<dyn AllocationCallback>>> {
    match self.callback.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }
}

impl std::fmt::Debug for Allocations {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Allocations")
      .field("new_count", &self.new_count())
      .field("free_count", &self.free_count())
      .field("has_callback", &self.has_callback())
      .finish()
  }
}
