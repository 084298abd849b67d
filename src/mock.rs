use super::*;

use std::collections::HashSet;

/// In-process stand-in for a managed host runtime.
///
/// Simulates a rooted heap with mark/sweep collection and moving
/// compaction, event hooks fired synchronously from `allocate` and from
/// sweeps, a manually pumped deferred-job queue, and configurable stack
/// capture. Every trait method takes the internal lock briefly and never
/// calls back into the engine while holding it.
pub(crate) struct MockRuntime {
  barriers: AtomicU64,
  inner: Mutex<MockInner>,
}

#[derive(Clone, Copy)]
struct HeapObject {
  class: Value,
  trackable: bool,
}

#[derive(Default)]
struct MockInner {
  collectables: Vec<Arc<dyn Collectable>>,
  disable_depth: u32,
  fail_deferred: bool,
  heap: HashMap<usize, HeapObject>,
  hooks: Vec<Arc<dyn EventHook>>,
  jobs: Vec<Arc<dyn DeferredJob>>,
  next_address: usize,
  pinned: HashSet<usize>,
  roots: HashSet<usize>,
  scheduled: HashSet<u64>,
  stack: Vec<FrameMetadata>,
}

impl MockInner {
  fn allocate_address(&mut self) -> usize {
    let address = self.next_address;
    self.next_address += 16;
    address
  }
}

impl MockRuntime {
  pub(crate) fn new() -> Arc<Self> {
    Arc::new(Self {
      barriers: AtomicU64::new(0),
      inner: Mutex::new(MockInner {
        next_address: 0x1000,
        ..MockInner::default()
      }),
    })
  }

  pub(crate) fn handle(self: &Arc<Self>) -> Arc<dyn Runtime> {
    Arc::clone(self) as Arc<dyn Runtime>
  }

  fn lock(&self) -> MutexGuard<'_, MockInner> {
    match self.inner.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  /// Define a class object. Classes are rooted so they survive collection.
  pub(crate) fn define_class(&self) -> Value {
    let mut inner = self.lock();
    let address = inner.allocate_address();

    inner.heap.insert(
      address,
      HeapObject {
        class: Value::NIL,
        trackable: true,
      },
    );
    inner.roots.insert(address);

    Value::from_raw(address)
  }

  /// Allocate an instance of `class`, rooted until released. Fires the
  /// installed event hooks the way an allocator callback would.
  pub(crate) fn allocate(&self, class: Value) -> Value {
    self.allocate_with(class, true)
  }

  /// Allocate an internal-kind object; hooks still fire, the engine is
  /// expected to reject it.
  pub(crate) fn allocate_untrackable(&self, class: Value) -> Value {
    self.allocate_with(class, false)
  }

  fn allocate_with(&self, class: Value, trackable: bool) -> Value {
    let (object, hooks) = {
      let mut inner = self.lock();
      let address = inner.allocate_address();

      inner.heap.insert(address, HeapObject { class, trackable });
      inner.roots.insert(address);

      (Value::from_raw(address), inner.hooks.clone())
    };

    for hook in hooks {
      hook.on_event(EventKind::New, object);
    }

    object
  }

  /// Drop the root keeping `object` alive; it dies at the next sweep
  /// unless something else marks it.
  pub(crate) fn release(&self, object: Value) {
    self.lock().roots.remove(&object.raw());
  }

  pub(crate) fn set_stack(&self, frames: Vec<FrameMetadata>) {
    self.lock().stack = frames;
  }

  pub(crate) fn set_fail_deferred(&self, fail: bool) {
    self.lock().fail_deferred = fail;
  }

  pub(crate) fn barrier_count(&self) -> u64 {
    self.barriers.load(Ordering::Relaxed)
  }

  pub(crate) fn collection_disabled_depth(&self) -> u32 {
    self.lock().disable_depth
  }

  pub(crate) fn is_live(&self, object: Value) -> bool {
    self.lock().heap.contains_key(&object.raw())
  }

  /// Run every scheduled deferred job, including jobs rescheduled while
  /// the pump runs.
  pub(crate) fn run_deferred(&self) {
    loop {
      let jobs: Vec<Arc<dyn DeferredJob>> = {
        let mut inner = self.lock();

        if inner.scheduled.is_empty() {
          break;
        }

        let ids: Vec<u64> = inner.scheduled.drain().collect();

        ids
          .iter()
          .filter_map(|id| inner.jobs.get(*id as usize))
          .cloned()
          .collect()
      };

      for job in jobs {
        job.run();
      }
    }
  }

  /// Mark from roots and registered collectables, then sweep: every
  /// unreachable object emits a free event and leaves the heap.
  pub(crate) fn collect_garbage(&self) {
    if self.lock().disable_depth > 0 {
      return;
    }

    let (live, pinned) = self.mark_phase();

    let (dead, hooks) = {
      let mut inner = self.lock();
      inner.pinned = pinned;

      let dead: Vec<usize> = inner
        .heap
        .keys()
        .filter(|address| !live.contains(*address))
        .copied()
        .collect();

      (dead, inner.hooks.clone())
    };

    // Hooks observe the object while it is still on the heap, exactly as
    // a collector's free callback would.
    for address in &dead {
      let object = Value::from_raw(*address);

      for hook in &hooks {
        hook.on_event(EventKind::Free, object);
      }
    }

    let mut inner = self.lock();

    for address in &dead {
      inner.heap.remove(address);
    }
  }

  /// Full collection followed by a moving compaction: every live unpinned
  /// object relocates and all registered collectables rewrite their
  /// references.
  pub(crate) fn compact_heap(&self) {
    if self.lock().disable_depth > 0 {
      return;
    }

    self.collect_garbage();

    let (map, collectables) = {
      let mut inner = self.lock();

      let moving: Vec<usize> = inner
        .heap
        .keys()
        .filter(|address| !inner.pinned.contains(*address))
        .copied()
        .collect();

      let mut map = HashMap::new();

      for address in moving {
        let target = inner.allocate_address();
        map.insert(address, target);
      }

      let previous = std::mem::take(&mut inner.heap);
      let mut heap = HashMap::with_capacity(previous.len());

      for (address, mut object) in previous {
        if let Some(moved) = map.get(&object.class.raw()) {
          object.class = Value::from_raw(*moved);
        }

        let target = map.get(&address).copied().unwrap_or(address);
        heap.insert(target, object);
      }

      inner.heap = heap;
      inner.roots = inner
        .roots
        .iter()
        .map(|address| map.get(address).copied().unwrap_or(*address))
        .collect();

      (map, inner.collectables.clone())
    };

    let relocator = MockRelocator { map };

    for collectable in collectables {
      collectable.update_references(&relocator);
    }
  }

  fn mark_phase(&self) -> (HashSet<usize>, HashSet<usize>) {
    let (roots, collectables) = {
      let inner = self.lock();
      (inner.roots.clone(), inner.collectables.clone())
    };

    let mut marker = MockMarker {
      marked: HashSet::new(),
      pinned: HashSet::new(),
    };

    for collectable in &collectables {
      collectable.mark(&mut marker);
    }

    let mut live = marker.marked;
    live.extend(roots);

    (live, marker.pinned)
  }
}

struct MockMarker {
  marked: HashSet<usize>,
  pinned: HashSet<usize>,
}

impl Marker for MockMarker {
  fn mark(&mut self, value: Value) {
    if value.is_nil() || value.is_immediate() {
      return;
    }

    self.marked.insert(value.raw());
  }

  fn mark_pinned(&mut self, value: Value) {
    if value.is_nil() || value.is_immediate() {
      return;
    }

    self.marked.insert(value.raw());
    self.pinned.insert(value.raw());
  }
}

struct MockRelocator {
  map: HashMap<usize, usize>,
}

impl Relocator for MockRelocator {
  fn relocate(&self, value: Value) -> Value {
    if value.is_nil() || value.is_immediate() {
      return value;
    }

    match self.map.get(&value.raw()) {
      Some(target) => Value::from_raw(*target),
      None => value,
    }
  }
}

impl Runtime for MockRuntime {
  fn install_event_hook(&self, hook: Arc<dyn EventHook>) {
    self.lock().hooks.push(hook);
  }

  fn uninstall_event_hook(&self, hook: &Arc<dyn EventHook>) {
    self
      .lock()
      .hooks
      .retain(|installed| !Arc::ptr_eq(installed, hook));
  }

  fn register_deferred(
    &self,
    job: Arc<dyn DeferredJob>,
  ) -> Result<DeferredJobHandle, EngineError> {
    let mut inner = self.lock();

    if inner.fail_deferred {
      return Err(EngineError::DeferredJobUnavailable);
    }

    inner.jobs.push(job);

    Ok(DeferredJobHandle((inner.jobs.len() - 1) as u64))
  }

  fn schedule_deferred(&self, handle: DeferredJobHandle) {
    self.lock().scheduled.insert(handle.0);
  }

  fn register_collectable(
    &self,
    collectable: Arc<dyn Collectable>,
  ) -> ContainerHandle {
    let mut inner = self.lock();
    inner.collectables.push(collectable);

    ContainerHandle((inner.collectables.len() - 1) as u64)
  }

  fn write_barrier(&self, _container: ContainerHandle, _old: Value, _new: Value) {
    self.barriers.fetch_add(1, Ordering::Relaxed);
  }

  fn class_of(&self, object: Value) -> Option<Value> {
    let inner = self.lock();
    let object = inner.heap.get(&object.raw())?;

    if object.class.is_nil() {
      None
    } else {
      Some(object.class)
    }
  }

  fn is_trackable(&self, object: Value) -> bool {
    self
      .lock()
      .heap
      .get(&object.raw())
      .is_some_and(|object| object.trackable)
  }

  fn capture_stack(&self, depth: usize) -> Vec<FrameMetadata> {
    let inner = self.lock();
    let skip = inner.stack.len().saturating_sub(depth);

    inner.stack[skip..].to_vec()
  }

  fn disable_collection(&self) {
    self.lock().disable_depth += 1;
  }

  fn enable_collection(&self) {
    let mut inner = self.lock();
    inner.disable_depth = inner.disable_depth.saturating_sub(1);
  }

  fn collect(&self) {
    self.collect_garbage();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn sweeps_unrooted_objects() {
    let mock = MockRuntime::new();
    let class = mock.define_class();

    let kept = mock.allocate(class);
    let lost = mock.allocate(class);
    mock.release(lost);

    mock.collect_garbage();

    assert!(mock.is_live(kept));
    assert!(!mock.is_live(lost));
  }

  #[test]
  fn compaction_moves_unpinned_objects() {
    let mock = MockRuntime::new();
    let class = mock.define_class();
    let object = mock.allocate(class);

    mock.compact_heap();

    assert!(!mock.is_live(object));
    assert_eq!(mock.lock().heap.len(), 2);
  }

  #[test]
  fn disabled_collection_skips_the_sweep() {
    let mock = MockRuntime::new();
    let class = mock.define_class();
    let object = mock.allocate(class);
    mock.release(object);

    mock.disable_collection();
    mock.collect_garbage();

    assert!(mock.is_live(object));

    mock.enable_collection();
    mock.collect_garbage();

    assert!(!mock.is_live(object));
  }

  #[test]
  fn capture_stack_returns_innermost_frames() {
    let mock = MockRuntime::new();
    mock.set_stack(vec![
      FrameMetadata::new("main.rb", "main", 1),
      FrameMetadata::new("app.rb", "run", 10),
      FrameMetadata::new("worker.rb", "step", 20),
    ]);

    let frames = mock.capture_stack(2);

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0].path.as_ref(), "app.rb");
    assert_eq!(frames[1].path.as_ref(), "worker.rb");
  }
}
