use super::*;

/// Kinds of allocation events delivered by the host runtime and replayed
/// to user callbacks.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum EventKind {
  New,
  Free,
}

/// Identifies an engine-owned container registered with the host
/// collector, for use in write-barrier notifications.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct ContainerHandle(pub u64);

/// Handle for the deferred consumer job.
///
/// Deferred-job registrations are a scarce host resource; the engine
/// registers exactly one per event queue.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct DeferredJobHandle(pub u64);

/// Producer entry point: receives raw allocation and free events from
/// inside the allocator or the collector.
///
/// Implementations must complete synchronously and never propagate an
/// error into host code.
pub trait EventHook: Send + Sync {
  fn on_event(&self, kind: EventKind, object: Value);
}

/// Consumer entry point, invoked by the host between managed operations
/// where it is safe to run user code.
pub trait DeferredJob: Send + Sync {
  fn run(&self);
}

/// Visitor the host collector passes to [`Collectable::mark`].
///
/// `mark` keeps a movable reference alive; `mark_pinned` additionally
/// prevents the collector from relocating it. Nil and immediate values may
/// be passed and are ignored.
pub trait Marker {
  fn mark(&mut self, value: Value);
  fn mark_pinned(&mut self, value: Value);
}

/// Maps a managed reference to its new location during a compaction pass;
/// stable otherwise.
pub trait Relocator {
  fn relocate(&self, value: Value) -> Value;
}

/// An engine-owned container holding managed references, registered with
/// the host collector so it participates in marking and compaction.
pub trait Collectable: Send + Sync {
  fn mark(&self, marker: &mut dyn Marker);
  fn update_references(&self, relocator: &dyn Relocator);
}

/// Uniform interface to the host runtime. The engine consumes this; the
/// attachment glue implements it.
pub trait Runtime: Send + Sync {
  fn install_event_hook(&self, hook: Arc<dyn EventHook>);

  /// Remove a previously installed hook, matched by identity. The host
  /// must not fire the hook after this returns.
  fn uninstall_event_hook(&self, hook: &Arc<dyn EventHook>);

  /// Register the deferred consumer job.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::DeferredJobUnavailable`] when the host cannot
  /// provide a slot.
  fn register_deferred(
    &self,
    job: Arc<dyn DeferredJob>,
  ) -> Result<DeferredJobHandle, EngineError>;

  /// Trigger at most one invocation of the registered job between safe
  /// points. Callable from inside the allocator.
  fn schedule_deferred(&self, handle: DeferredJobHandle);

  fn register_collectable(
    &self,
    collectable: Arc<dyn Collectable>,
  ) -> ContainerHandle;

  /// Announce that a managed reference inside `container` was overwritten
  /// with `new`. Must be called for every such store of a reference that
  /// is not yet reachable from roots.
  fn write_barrier(&self, container: ContainerHandle, old: Value, new: Value);

  /// The class of `object`, or `None` when the object has no normal class.
  fn class_of(&self, object: Value) -> Option<Value>;

  /// True for normal object kinds; false for internal kinds (AST nodes,
  /// memo objects, forwarders, zombies, uninitialized slots).
  fn is_trackable(&self, object: Value) -> bool;

  /// The top `depth` frames of the current managed stack, outermost first.
  fn capture_stack(&self, depth: usize) -> Vec<FrameMetadata>;

  fn disable_collection(&self);
  fn enable_collection(&self);

  /// Trigger a full collection.
  fn collect(&self);
}

/// Scoped suppression of host collection.
///
/// Collection is re-enabled when the guard drops, on every exit path
/// including unwinding.
pub struct CollectionGuard {
  runtime: Arc<dyn Runtime>,
}

impl CollectionGuard {
  #[must_use]
  pub fn new(runtime: &Arc<dyn Runtime>) -> Self {
    runtime.disable_collection();

    Self {
      runtime: Arc::clone(runtime),
    }
  }
}

impl Drop for CollectionGuard {
  fn drop(&mut self) {
    self.runtime.enable_collection();
  }
}
