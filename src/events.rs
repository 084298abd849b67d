use super::*;

const DEFAULT_QUEUE_LIMIT: usize = 1 << 20;

/// A queued allocation event.
///
/// `None` marks a logically consumed slot. `New` keeps its class and
/// object alive until the consumer applies it; `Free` carries only the
/// identity of the object being collected.
#[derive(Clone)]
pub(crate) enum Event {
  None,
  New {
    capture: Arc<CaptureShared>,
    class: Value,
    object: Value,
  },
  Free {
    capture: Arc<CaptureShared>,
    object: Value,
  },
}

struct EventBuffer {
  limit: usize,
  slots: Vec<Event>,
}

impl EventBuffer {
  fn new(limit: usize) -> Self {
    Self {
      limit,
      slots: Vec::with_capacity(1024.min(limit)),
    }
  }

  fn push(&mut self, event: Event) -> bool {
    if self.slots.len() >= self.limit {
      return false;
    }

    self.slots.push(event);

    true
  }

  fn clear_slot(&mut self, position: usize) {
    if let Some(slot) = self.slots.get_mut(position) {
      *slot = Event::None;
    }
  }
}

/// Process-wide owner of the double-buffered event queue and the single
/// deferred consumer job.
///
/// Producers append to the `available` buffer from inside the allocator or
/// the collector; the consumer flips the buffers and drains the other side
/// in FIFO order, which preserves new-before-free for any given object.
/// Events arriving while a pass runs land on the flipped side.
pub struct Events {
  available: AtomicUsize,
  buffers: [Mutex<EventBuffer>; 2],
  container: OnceLock<ContainerHandle>,
  dropped: AtomicU64,
  job: OnceLock<DeferredJobHandle>,
  processing: AtomicBool,
  runtime: Arc<dyn Runtime>,
}

static GLOBAL: Mutex<Option<Arc<Events>>> = Mutex::new(None);

impl Events {
  /// Create a queue wired to `runtime`, registering its collectable
  /// container and the deferred consumer job.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::DeferredJobUnavailable`] when the host cannot
  /// provide the job slot.
  pub fn new(runtime: Arc<dyn Runtime>) -> Result<Arc<Self>, EngineError> {
    Self::with_queue_limit(runtime, DEFAULT_QUEUE_LIMIT)
  }

  /// As [`Events::new`] with an explicit per-buffer capacity limit.
  ///
  /// Once a buffer is full the newest event is dropped; allocation
  /// counters are maintained on the producer side, so a dropped event
  /// costs attribution detail but never count accuracy.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::DeferredJobUnavailable`] when the host cannot
  /// provide the job slot.
  pub fn with_queue_limit(
    runtime: Arc<dyn Runtime>,
    limit: usize,
  ) -> Result<Arc<Self>, EngineError> {
    let limit = limit.max(1);

    let events = Arc::new(Self {
      available: AtomicUsize::new(0),
      buffers: [
        Mutex::new(EventBuffer::new(limit)),
        Mutex::new(EventBuffer::new(limit)),
      ],
      container: OnceLock::new(),
      dropped: AtomicU64::new(0),
      job: OnceLock::new(),
      processing: AtomicBool::new(false),
      runtime,
    });

    let container = events
      .runtime
      .register_collectable(Arc::clone(&events) as Arc<dyn Collectable>);
    let _ = events.container.set(container);

    let job = events
      .runtime
      .register_deferred(Arc::clone(&events) as Arc<dyn DeferredJob>)?;
    let _ = events.job.set(job);

    Ok(events)
  }

  /// The process-wide queue shared by every capture instance.
  ///
  /// Deferred-job registrations are scarce, so one queue is registered
  /// lazily and kept for the life of the process; events carry their
  /// owning capture, which demultiplexes the shared queue. The first
  /// caller's runtime wins.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::DeferredJobUnavailable`] when the host cannot
  /// provide the job slot.
  pub fn global(runtime: &Arc<dyn Runtime>) -> Result<Arc<Self>, EngineError> {
    let mut slot = match GLOBAL.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    };

    if let Some(events) = slot.as_ref() {
      return Ok(Arc::clone(events));
    }

    let events = Self::new(Arc::clone(runtime))?;
    *slot = Some(Arc::clone(&events));

    Ok(events)
  }

  /// Events dropped because a buffer was at its limit.
  #[must_use]
  pub fn dropped_events(&self) -> u64 {
    self.dropped.load(Ordering::Relaxed)
  }

  /// Producer-side append; callable from inside the allocator or the
  /// collector. Returns false when the buffer is at its limit, in which
  /// case the event is dropped.
  pub(crate) fn enqueue(&self, event: Event) -> bool {
    if let Some(container) = self.container.get() {
      // Stored references must be announced before the collector can
      // snapshot roots without rescanning engine memory.
      if let Event::New { class, object, .. } = &event {
        self.runtime.write_barrier(*container, Value::NIL, *class);
        self.runtime.write_barrier(*container, Value::NIL, *object);
      }
    }

    let index = self.available.load(Ordering::Acquire);
    let pushed = self.lock_buffer(index).push(event);

    if pushed {
      if let Some(job) = self.job.get() {
        self.runtime.schedule_deferred(*job);
      }
    } else {
      self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    pushed
  }

  /// Consumer side: run passes until both buffers are empty.
  ///
  /// A re-entrant call from inside an active pass (a user callback that
  /// drains the queue) is a no-op; the outer pass already owns the events.
  pub fn process_all(&self) {
    if self.processing.swap(true, Ordering::AcqRel) {
      return;
    }

    let _reset = ResetOnDrop(&self.processing);

    while !self.is_empty() {
      self.process_queue();
    }
  }

  pub(crate) fn is_empty(&self) -> bool {
    self.lock_buffer(0).slots.is_empty() && self.lock_buffer(1).slots.is_empty()
  }

  /// One pass: flip available/processing and drain the processing side in
  /// insertion order.
  fn process_queue(&self) {
    let index = self.available.fetch_xor(1, Ordering::AcqRel);

    // The flipped side now receives new events. Slots on this side are
    // cloned out and dispatched without holding the buffer lock, so a
    // collection triggered from a user callback can walk both buffers;
    // each slot keeps its references until it is cleared after handling.
    let mut position = 0;

    loop {
      let event = {
        let buffer = self.lock_buffer(index);
        buffer.slots.get(position).cloned()
      };

      let Some(event) = event else {
        break;
      };

      self.dispatch(event);

      self.lock_buffer(index).clear_slot(position);

      position += 1;
    }

    self.lock_buffer(index).slots.clear();
  }

  fn dispatch(&self, event: Event) {
    let outcome = catch_unwind(AssertUnwindSafe(|| match event {
      Event::None => {}
      Event::New {
        capture,
        class,
        object,
      } => capture.process_new(class, object),
      Event::Free { capture, object } => capture.process_free(object),
    }));

    if outcome.is_err() {
      tracing::warn!("panic while processing event, caught and suppressed");
    }
  }

  fn lock_buffer(&self, index: usize) -> MutexGuard<'_, EventBuffer> {
    match self.buffers[index].lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }
}

struct ResetOnDrop<'a>(&'a AtomicBool);

impl Drop for ResetOnDrop<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

impl DeferredJob for Events {
  fn run(&self) {
    self.process_all();
  }
}

impl Collectable for Events {
  fn mark(&self, marker: &mut dyn Marker) {
    for index in 0..2 {
      let buffer = self.lock_buffer(index);

      for event in &buffer.slots {
        match event {
          Event::New { class, object, .. } => {
            marker.mark(*class);
            marker.mark(*object);
          }
          // A free event references only the object being collected;
          // marking it would resurrect it.
          Event::Free { .. } | Event::None => {}
        }
      }
    }
  }

  fn update_references(&self, relocator: &dyn Relocator) {
    for index in 0..2 {
      let mut buffer = self.lock_buffer(index);

      for event in &mut buffer.slots {
        match event {
          Event::New { class, object, .. } => {
            *class = relocator.relocate(*class);
            *object = relocator.relocate(*object);
          }
          Event::Free { object, .. } => {
            *object = relocator.relocate(*object);
          }
          Event::None => {}
        }
      }
    }
  }
}

impl std::fmt::Debug for Events {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Events")
      .field("available", &self.available.load(Ordering::Relaxed))
      .field("dropped", &self.dropped_events())
      .finish()
  }
}
