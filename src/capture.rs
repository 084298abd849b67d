use super::*;

/// Aggregate capture statistics.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize)]
pub struct CaptureStatistics {
  pub tracked_count: usize,
  pub object_table_size: usize,
}

type TrackedMap = DashMap<Value, Arc<Allocations>, BuildNoHashHasher<Value>>;

/// State shared between `Capture` handles, the event queue, and the
/// installed hooks.
pub(crate) struct CaptureShared {
  container: OnceLock<ContainerHandle>,
  events: Arc<Events>,
  free_count: AtomicU64,
  new_count: AtomicU64,
  paused: AtomicI32,
  running: AtomicBool,
  runtime: Arc<dyn Runtime>,
  self_ref: OnceLock<Weak<CaptureShared>>,
  states: Mutex<ObjectTable>,
  tracked: TrackedMap,
}

/// Front end of the engine: converts raw allocator events into queue
/// events on the producer side and applies them when the deferred
/// consumer runs.
///
/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct Capture {
  shared: Arc<CaptureShared>,
}

impl Capture {
  /// Create a capture wired to the process-wide event queue.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::DeferredJobUnavailable`] when the queue's
  /// deferred job slot cannot be registered.
  pub fn new(runtime: Arc<dyn Runtime>) -> Result<Self, EngineError> {
    let events = Events::global(&runtime)?;

    Ok(Self::with_events(runtime, events))
  }

  /// Create a capture sharing an explicitly managed event queue.
  #[must_use]
  pub fn with_events(runtime: Arc<dyn Runtime>, events: Arc<Events>) -> Self {
    let shared = Arc::new(CaptureShared {
      container: OnceLock::new(),
      events,
      free_count: AtomicU64::new(0),
      new_count: AtomicU64::new(0),
      paused: AtomicI32::new(0),
      running: AtomicBool::new(false),
      runtime,
      self_ref: OnceLock::new(),
      states: Mutex::new(ObjectTable::new()),
      tracked: DashMap::with_hasher(BuildNoHashHasher::default()),
    });

    let _ = shared.self_ref.set(Arc::downgrade(&shared));

    let container = shared
      .runtime
      .register_collectable(Arc::clone(&shared) as Arc<dyn Collectable>);
    let _ = shared.container.set(container);

    Self { shared }
  }

  /// Begin receiving allocator events. Returns false if already running.
  pub fn start(&self) -> bool {
    if self.shared.running.swap(true, Ordering::AcqRel) {
      return false;
    }

    self
      .shared
      .runtime
      .install_event_hook(Arc::clone(&self.shared) as Arc<dyn EventHook>);

    true
  }

  /// Stop receiving events: unhook, drain pending events, clear the flag.
  /// Returns false if not running.
  pub fn stop(&self) -> bool {
    if !self.shared.running.swap(false, Ordering::AcqRel) {
      return false;
    }

    let hook = Arc::clone(&self.shared) as Arc<dyn EventHook>;
    self.shared.runtime.uninstall_event_hook(&hook);

    self.shared.events.process_all();

    true
  }

  /// Reset counters, per-class records, and the object table.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::CaptureRunning`] while the capture is running;
  /// queued events could still arrive and race the reset.
  pub fn clear(&self) -> Result<(), EngineError> {
    if self.running() {
      return Err(EngineError::CaptureRunning);
    }

    self.shared.new_count.store(0, Ordering::Relaxed);
    self.shared.free_count.store(0, Ordering::Relaxed);

    for entry in self.shared.tracked.iter() {
      entry.value().clear();
    }

    self.shared.lock_states().clear();

    Ok(())
  }

  /// Track `class`, optionally attaching a callback, and return its
  /// allocation record. Tracking a class that already has a record keeps
  /// its counters and replaces the callback.
  pub fn track(
    &self,
    class: Value,
    callback: Option<Arc<dyn AllocationCallback>>,
  ) -> Arc<Allocations> {
    let allocations = self.shared.allocations_for(class);

    if let Some(callback) = callback {
      allocations.track(callback);
    }

    allocations
  }

  /// Stop tracking `class`; its record is dropped once unreferenced.
  pub fn untrack(&self, class: Value) {
    self.shared.tracked.remove(&class);
  }

  #[must_use]
  pub fn is_tracking(&self, class: Value) -> bool {
    self.shared.tracked.contains_key(&class)
  }

  #[must_use]
  pub fn get(&self, class: Value) -> Option<Arc<Allocations>> {
    self
      .shared
      .tracked
      .get(&class)
      .map(|entry| Arc::clone(entry.value()))
  }

  #[must_use]
  pub fn retained_count_of(&self, class: Value) -> u64 {
    self
      .get(class)
      .map_or(0, |allocations| allocations.retained_count())
  }

  #[must_use]
  pub fn new_count(&self) -> u64 {
    self.shared.new_count.load(Ordering::Relaxed)
  }

  #[must_use]
  pub fn free_count(&self) -> u64 {
    self.shared.free_count.load(Ordering::Relaxed)
  }

  /// Live allocations observed across every class, saturating at zero.
  #[must_use]
  pub fn retained_count(&self) -> u64 {
    self.new_count().saturating_sub(self.free_count())
  }

  #[must_use]
  pub fn running(&self) -> bool {
    self.shared.running.load(Ordering::Acquire)
  }

  #[must_use]
  pub fn statistics(&self) -> CaptureStatistics {
    CaptureStatistics {
      tracked_count: self.shared.tracked.len(),
      object_table_size: self.shared.lock_states().len(),
    }
  }

  /// Iterate tracked classes and their allocation records, optionally
  /// restricted to one class.
  pub fn each<F>(&self, class: Option<Value>, mut f: F)
  where
    F: FnMut(Value, &Arc<Allocations>),
  {
    let snapshot: Vec<(Value, Arc<Allocations>)> = self
      .shared
      .tracked
      .iter()
      .filter(|entry| class.is_none_or(|wanted| *entry.key() == wanted))
      .map(|entry| (*entry.key(), Arc::clone(entry.value())))
      .collect();

    for (class, allocations) in &snapshot {
      f(*class, allocations);
    }
  }

  /// Enumerate live tracked objects as `(object, data)` pairs, optionally
  /// restricted to one class.
  ///
  /// Collection is disabled and the object table held strong for the whole
  /// enumeration; both are released on every exit path, unwinding
  /// included. The queue is drained first so the table reflects every
  /// allocation known at the call.
  pub fn each_object<F>(&self, class: Option<Value>, mut f: F)
  where
    F: FnMut(Value, Option<Value>),
  {
    let _collection = CollectionGuard::new(&self.shared.runtime);
    let _strong = StrongGuard::new(&self.shared);

    self.shared.events.process_all();

    let snapshot: Vec<(Value, Value)> = {
      let states = self.shared.lock_states();
      states
        .iter()
        .filter(|entry| class.is_none_or(|wanted| entry.class == wanted))
        .map(|entry| (entry.object, entry.data))
        .collect()
    };

    for (object, data) in snapshot {
      let data = if data.is_nil() { None } else { Some(data) };
      f(object, data);
    }
  }

  pub(crate) fn runtime(&self) -> &Arc<dyn Runtime> {
    &self.shared.runtime
  }

  #[cfg(test)]
  pub(crate) fn shared(&self) -> &Arc<CaptureShared> {
    &self.shared
  }
}

impl std::fmt::Debug for Capture {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Capture")
      .field("running", &self.running())
      .field("new_count", &self.new_count())
      .field("free_count", &self.free_count())
      .finish()
  }
}

impl CaptureShared {
  fn lock_states(&self) -> MutexGuard<'_, ObjectTable> {
    match self.states.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  fn container(&self) -> ContainerHandle {
    self.container.get().copied().unwrap_or(ContainerHandle(0))
  }

  fn capture_arc(&self) -> Option<Arc<CaptureShared>> {
    self.self_ref.get()?.upgrade()
  }

  /// Record for `class`, created lazily on first sight.
  fn allocations_for(&self, class: Value) -> Arc<Allocations> {
    if let Some(existing) = self.tracked.get(&class) {
      return Arc::clone(existing.value());
    }

    let entry = self
      .tracked
      .entry(class)
      .or_insert_with(|| Arc::new(Allocations::new()));
    let allocations = Arc::clone(entry.value());
    drop(entry);

    // The class key is a managed reference newly stored in engine memory.
    self
      .runtime
      .write_barrier(self.container(), Value::NIL, class);

    allocations
  }

  /// Consumer side of a NEW event. Runs where calling managed code is
  /// safe; the pause guard suppresses tracking of allocations made by the
  /// user callback.
  pub(crate) fn process_new(&self, class: Value, object: Value) {
    let _pause = PauseGuard::new(&self.paused);

    let allocations = self.allocations_for(class);

    let mut data = Value::NIL;

    if let Some(callback) = allocations.callback() {
      if let Some(state) = callback.call(class, EventKind::New, None) {
        data = state;
      }
    }

    let container = self.container();
    self.runtime.write_barrier(container, Value::NIL, class);

    if !data.is_nil() {
      self.runtime.write_barrier(container, Value::NIL, data);
    }

    let mut states = self.lock_states();

    match states.insert(object) {
      Ok(entry) => {
        entry.class = class;
        entry.data = data;
      }
      Err(err) => {
        // Fatal table state; absorb it per event so the batch survives.
        tracing::error!(error = %err, "failed to record allocation state");
      }
    }
  }

  /// Consumer side of a FREE event. An unknown object (allocated before
  /// tracking started, or a duplicate free) is silently absorbed.
  pub(crate) fn process_free(&self, object: Value) {
    let _pause = PauseGuard::new(&self.paused);

    let entry = {
      let mut states = self.lock_states();
      states.take(object)
    };

    let Some(entry) = entry else {
      return;
    };

    self.free_count.fetch_add(1, Ordering::Relaxed);

    // The class may have been untracked since the allocation.
    let allocations = self
      .tracked
      .get(&entry.class)
      .map(|found| Arc::clone(found.value()));

    let Some(allocations) = allocations else {
      return;
    };

    allocations.record_free();

    if entry.data.is_nil() {
      return;
    }

    if let Some(callback) = allocations.callback() {
      callback.call(entry.class, EventKind::Free, Some(entry.data));
    }
  }
}

impl EventHook for CaptureShared {
  fn on_event(&self, kind: EventKind, object: Value) {
    if !self.running.load(Ordering::Acquire) {
      return;
    }

    match kind {
      EventKind::New => {
        // Allocations made inside a user callback must not recurse into
        // tracking.
        if self.paused.load(Ordering::Acquire) > 0 {
          return;
        }

        if !self.runtime.is_trackable(object) {
          return;
        }

        let Some(class) = self.runtime.class_of(object) else {
          return;
        };

        // Counters advance on the producer side, so a queue-full drop
        // loses attribution detail but never count accuracy.
        self.new_count.fetch_add(1, Ordering::Relaxed);
        self.allocations_for(class).record_new();

        let Some(capture) = self.capture_arc() else {
          return;
        };

        let _ = self.events.enqueue(Event::New {
          capture,
          class,
          object,
        });
      }
      EventKind::Free => {
        // Free events refer to objects allocated outside any callback, so
        // they bypass the pause gate.
        if !self.runtime.is_trackable(object) {
          return;
        }

        let Some(capture) = self.capture_arc() else {
          return;
        };

        let _ = self.events.enqueue(Event::Free { capture, object });
      }
    }
  }
}

impl Collectable for CaptureShared {
  fn mark(&self, marker: &mut dyn Marker) {
    // Tracked class keys are pinned: free processing resolves classes by
    // raw identity after the object itself is already dead.
    for entry in self.tracked.iter() {
      marker.mark_pinned(*entry.key());
    }

    self.lock_states().mark(marker);
  }

  fn update_references(&self, relocator: &dyn Relocator) {
    // Class keys are pinned and therefore stable; only the object table
    // holds movable references.
    self.lock_states().update_references(relocator);
  }
}

struct PauseGuard<'a> {
  paused: &'a AtomicI32,
}

impl<'a> PauseGuard<'a> {
  fn new(paused: &'a AtomicI32) -> Self {
    paused.fetch_add(1, Ordering::AcqRel);

    Self { paused }
  }
}

impl Drop for PauseGuard<'_> {
  fn drop(&mut self) {
    self.paused.fetch_sub(1, Ordering::AcqRel);
  }
}

struct StrongGuard<'a> {
  shared: &'a CaptureShared,
}

impl<'a> StrongGuard<'a> {
  fn new(shared: &'a CaptureShared) -> Self {
    shared.lock_states().increment_strong();

    Self { shared }
  }
}

impl Drop for StrongGuard<'_> {
  fn drop(&mut self) {
    self.shared.lock_states().decrement_strong();
  }
}
