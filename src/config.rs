/// Controls how the sampler detects growth and bounds call-tree memory.
#[derive(Debug, Clone)]
pub struct SamplerConfig {
  /// Maximum frames captured per allocation once a class is escalated.
  pub depth: usize,
  /// Trigger a full collection before each sample pass. Off by default
  /// because collection distorts allocation timing.
  pub gc: bool,
  /// Number of ratchet increases before a class is escalated to stack
  /// capture.
  pub increases_threshold: u32,
  /// Children kept per node when an escalated class's tree is pruned.
  pub prune_limit: usize,
  /// Insertions a tree accumulates between prune passes.
  pub prune_threshold: u64,
  /// Minimum growth of the retained count over the running maximum for a
  /// sample to register as an increase.
  pub sample_threshold: u64,
}

impl Default for SamplerConfig {
  fn default() -> Self {
    Self {
      depth: 16,
      gc: false,
      increases_threshold: 10,
      prune_limit: 10,
      prune_threshold: 10_000,
      sample_threshold: 1_000,
    }
  }
}

impl SamplerConfig {
  /// Builder-style helper to adjust the capture depth.
  #[must_use]
  pub fn with_depth(mut self, depth: usize) -> Self {
    self.depth = depth;
    self
  }

  /// Builder-style helper to adjust the increase ratchet threshold.
  #[must_use]
  pub fn with_sample_threshold(mut self, threshold: u64) -> Self {
    self.sample_threshold = threshold;
    self
  }
}
