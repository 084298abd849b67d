use super::*;

const STACK_INLINE_DEPTH: usize = 32;

type StackFrameBuffer = SmallVec<[FrameMetadata; STACK_INLINE_DEPTH]>;

/// Predicate applied to captured frames before they enter a call tree.
pub type FrameFilter = Arc<dyn Fn(&FrameMetadata) -> bool + Send + Sync>;

type ClassMap<V> = HashMap<Value, V, BuildNoHashHasher<Value>>;

/// Ratcheting growth state for one tracked class.
///
/// The maximum only moves when the retained count exceeds it by more than
/// the threshold; each such move is one increase.
#[derive(Debug, Clone)]
pub struct Sample {
  current: u64,
  increases: u32,
  max_observed: u64,
  samples_taken: u64,
  target: Value,
  threshold: u64,
}

impl Sample {
  #[must_use]
  pub fn new(target: Value, threshold: u64) -> Self {
    Self {
      current: 0,
      increases: 0,
      max_observed: 0,
      samples_taken: 0,
      target,
      threshold,
    }
  }

  /// Record a retained count; true when it ratcheted the maximum.
  pub fn update(&mut self, n: u64) -> bool {
    self.current = n;
    self.samples_taken += 1;

    if n > self.max_observed && n - self.max_observed > self.threshold {
      self.max_observed = n;
      self.increases += 1;

      return true;
    }

    false
  }

  #[must_use]
  pub fn current(&self) -> u64 {
    self.current
  }

  #[must_use]
  pub fn increases(&self) -> u32 {
    self.increases
  }

  #[must_use]
  pub fn max_observed(&self) -> u64 {
    self.max_observed
  }

  #[must_use]
  pub fn samples_taken(&self) -> u64 {
    self.samples_taken
  }

  #[must_use]
  pub fn target(&self) -> Value {
    self.target
  }

  #[must_use]
  pub fn threshold(&self) -> u64 {
    self.threshold
  }
}

/// Thin builder that customizes [`SamplerConfig`] without exposing every
/// knob up front.
#[derive(Default)]
pub struct SamplerBuilder {
  config: SamplerConfig,
  filter: Option<FrameFilter>,
}

impl SamplerBuilder {
  #[must_use]
  pub fn new() -> Self {
    Self::default()
  }

  #[must_use]
  pub fn with_config(mut self, config: SamplerConfig) -> Self {
    self.config = config;
    self
  }

  #[must_use]
  pub fn depth(mut self, depth: usize) -> Self {
    self.config.depth = depth;
    self
  }

  #[must_use]
  pub fn sample_threshold(mut self, threshold: u64) -> Self {
    self.config.sample_threshold = threshold;
    self
  }

  #[must_use]
  pub fn increases_threshold(mut self, threshold: u32) -> Self {
    self.config.increases_threshold = threshold;
    self
  }

  #[must_use]
  pub fn prune_limit(mut self, limit: usize) -> Self {
    self.config.prune_limit = limit;
    self
  }

  #[must_use]
  pub fn prune_threshold(mut self, threshold: u64) -> Self {
    self.config.prune_threshold = threshold;
    self
  }

  #[must_use]
  pub fn gc(mut self, gc: bool) -> Self {
    self.config.gc = gc;
    self
  }

  #[must_use]
  pub fn filter(mut self, filter: FrameFilter) -> Self {
    self.filter = Some(filter);
    self
  }

  #[must_use]
  pub fn finish(self, capture: Capture) -> Sampler {
    Sampler {
      capture,
      config: self.config,
      filter: self.filter,
      running: AtomicBool::new(false),
      samples: Mutex::new(ClassMap::default()),
      trees: Mutex::new(ClassMap::default()),
    }
  }
}

/// Periodic control loop over a [`Capture`].
///
/// Polls retained counts per class, detects ratcheting growth, escalates
/// suspicious classes to stack capture, keeps tree memory bounded through
/// pruning, and answers leak-attribution queries.
pub struct Sampler {
  capture: Capture,
  config: SamplerConfig,
  filter: Option<FrameFilter>,
  running: AtomicBool,
  samples: Mutex<ClassMap<Sample>>,
  trees: Mutex<ClassMap<Arc<Mutex<CallTree>>>>,
}

impl Sampler {
  #[must_use]
  pub fn builder() -> SamplerBuilder {
    SamplerBuilder::new()
  }

  #[must_use]
  pub fn new(capture: Capture, config: SamplerConfig) -> Self {
    SamplerBuilder::new().with_config(config).finish(capture)
  }

  #[must_use]
  pub fn config(&self) -> &SamplerConfig {
    &self.config
  }

  /// Start the underlying capture. Returns false if already running.
  pub fn start(&self) -> bool {
    self.capture.start()
  }

  /// End any `run` loop and stop the underlying capture.
  pub fn stop(&self) -> bool {
    self.running.store(false, Ordering::Release);

    self.capture.stop()
  }

  /// Pre-register `class` for sampling so growth is measured from the
  /// first tick rather than from the first lazily observed allocation.
  pub fn track(&self, class: Value) {
    self.capture.track(class, None);

    self
      .lock_samples()
      .entry(class)
      .or_insert_with(|| Sample::new(class, self.config.sample_threshold));
  }

  pub fn untrack(&self, class: Value) {
    self.capture.untrack(class);
    self.lock_samples().remove(&class);
    self.lock_trees().remove(&class);
  }

  /// One sampling pass.
  pub fn sample(&self) {
    self.sample_with(|_, _| {});
  }

  /// One sampling pass, invoking `observer` with each class's sample
  /// state and whether this tick registered an increase.
  pub fn sample_with<F>(&self, mut observer: F)
  where
    F: FnMut(&Sample, bool),
  {
    let mut classes: Vec<(Value, u64)> = Vec::new();

    self.capture.each(None, |class, allocations| {
      classes.push((class, allocations.retained_count()));
    });

    for (class, retained) in classes {
      let (sample, increased) = {
        let mut samples = self.lock_samples();
        let sample = samples
          .entry(class)
          .or_insert_with(|| Sample::new(class, self.config.sample_threshold));
        let increased = sample.update(retained);

        (sample.clone(), increased)
      };

      if increased && sample.increases() >= self.config.increases_threshold {
        self.escalate(class);
      }

      observer(&sample, increased);
    }

    self.prune_pass();
  }

  /// Loop: optionally trigger a full collection, sample, sleep the
  /// remainder of the tick. Ends when [`Sampler::stop`] is called.
  pub fn run(&self, interval: Duration) {
    self.running.store(true, Ordering::Release);

    while self.running.load(Ordering::Acquire) {
      let started = Instant::now();

      if self.config.gc {
        self.capture.runtime().collect();
      }

      self.sample();

      let elapsed = started.elapsed();

      if !self.running.load(Ordering::Acquire) {
        break;
      }

      if elapsed < interval {
        thread::sleep(interval - elapsed);
      }
    }
  }

  /// Sample state for `class`, if any ticks have observed it.
  #[must_use]
  pub fn sample_for(&self, class: Value) -> Option<Sample> {
    self.lock_samples().get(&class).cloned()
  }

  /// Leak-attribution report for `class`.
  ///
  /// Returns `None` when the class is unknown or its retained count is
  /// below `retained_minimum`.
  #[must_use]
  pub fn analyze(
    &self,
    class: Value,
    options: &AnalyzeOptions,
  ) -> Option<Analysis> {
    let allocations = self.capture.get(class)?;
    let retained = allocations.retained_count();

    if retained < options.retained_minimum {
      return None;
    }

    let allocation_roots = if options.allocation_roots {
      self.tree_for(class).map(|tree| {
        let tree = lock_tree(&tree);

        AllocationRoots {
          hotspots: tree.hotspots(options.roots_limit, Metric::Retained),
          top_paths: tree.top_paths(options.roots_limit, Metric::Retained),
        }
      })
    } else {
      None
    };

    let retained_addresses = options.retained_addresses.map(|limit| {
      let mut addresses = Vec::new();

      self.capture.each_object(Some(class), |object, _data| {
        if addresses.len() < limit {
          addresses.push(address_of(object));
        }
      });

      addresses
    });

    Some(Analysis {
      allocations: AllocationCounts {
        free: allocations.free_count(),
        new: allocations.new_count(),
        retained,
      },
      allocation_roots,
      retained_addresses,
    })
  }

  pub(crate) fn tree_for(&self, class: Value) -> Option<Arc<Mutex<CallTree>>> {
    self.lock_trees().get(&class).cloned()
  }

  /// Attach the stack-capturing callback to `class`. Idempotent; the
  /// first escalation wins.
  fn escalate(&self, class: Value) {
    let tree = {
      let mut trees = self.lock_trees();

      if trees.contains_key(&class) {
        return;
      }

      let tree = Arc::new(Mutex::new(CallTree::new()));
      trees.insert(class, Arc::clone(&tree));

      tree
    };

    tracing::debug!(class = class.raw(), "escalating class to stack capture");

    let runtime = Arc::clone(self.capture.runtime());
    let depth = self.config.depth;
    let filter = self.filter.clone();

    let callback = move |_class: Value,
                         event: EventKind,
                         data: Option<Value>|
          -> Option<Value> {
      match event {
        EventKind::New => {
          let mut frames: StackFrameBuffer = SmallVec::new();

          for frame in runtime.capture_stack(depth) {
            if filter.as_ref().is_some_and(|filter| !filter(&frame)) {
              continue;
            }

            frames.push(frame);
          }

          let node = lock_tree(&tree).record(&frames);

          Some(Value::immediate(node.to_raw()))
        }
        EventKind::Free => {
          if let Some(raw) = data.and_then(Value::immediate_value) {
            lock_tree(&tree).decrement_path(NodeId::from_raw(raw));
          }

          None
        }
      }
    };

    let _ = self.capture.track(class, Some(Arc::new(callback)));
  }

  fn prune_pass(&self) {
    let trees: Vec<Arc<Mutex<CallTree>>> =
      self.lock_trees().values().cloned().collect();

    for tree in trees {
      let mut tree = lock_tree(&tree);

      if tree.insertion_count() >= self.config.prune_threshold {
        let detached = tree.prune(self.config.prune_limit);
        tree.reset_insertion_count();

        if detached > 0 {
          tracing::debug!(detached, "pruned call tree");
        }
      }
    }
  }

  fn lock_samples(&self) -> MutexGuard<'_, ClassMap<Sample>> {
    match self.samples.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }

  fn lock_trees(&self) -> MutexGuard<'_, ClassMap<Arc<Mutex<CallTree>>>> {
    match self.trees.lock() {
      Ok(guard) => guard,
      Err(err) => err.into_inner(),
    }
  }
}

fn lock_tree(tree: &Arc<Mutex<CallTree>>) -> MutexGuard<'_, CallTree> {
  match tree.lock() {
    Ok(guard) => guard,
    Err(err) => err.into_inner(),
  }
}

/// Options for [`Sampler::analyze`].
#[derive(Debug, Clone)]
pub struct AnalyzeOptions {
  /// Include call-tree top paths and hotspots.
  pub allocation_roots: bool,
  /// Include up to this many retained-object addresses.
  pub retained_addresses: Option<usize>,
  /// Suppress the report entirely below this retained count.
  pub retained_minimum: u64,
  /// Entries returned per allocation-roots listing.
  pub roots_limit: usize,
}

impl Default for AnalyzeOptions {
  fn default() -> Self {
    Self {
      allocation_roots: true,
      retained_addresses: None,
      retained_minimum: 0,
      roots_limit: 10,
    }
  }
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct AllocationCounts {
  pub free: u64,
  pub new: u64,
  pub retained: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct AllocationRoots {
  pub hotspots: Vec<Hotspot>,
  pub top_paths: Vec<CallPath>,
}

/// Leak-attribution report produced by [`Sampler::analyze`].
#[derive(Debug, Clone, Serialize)]
pub struct Analysis {
  pub allocations: AllocationCounts,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub allocation_roots: Option<AllocationRoots>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub retained_addresses: Option<Vec<String>>,
}

impl Analysis {
  /// Serialize the report as JSON into `writer`.
  ///
  /// # Errors
  ///
  /// Returns an error if serialization to JSON fails.
  pub fn export_json<W: Write>(&self, writer: W) -> Result<(), EngineError> {
    serde_json::to_writer(writer, self)?;

    Ok(())
  }
}
