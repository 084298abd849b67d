use super::*;

/// Sort key for tree queries.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Metric {
  Retained,
  Total,
}

/// Handle to a call-tree node.
///
/// Packs a slot index with a generation so a handle held across a prune
/// goes stale instead of dangling; operations on a stale handle are
/// no-ops. Round-trips through an immediate [`Value`] for storage as
/// per-object data.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub struct NodeId {
  generation: u32,
  index: u32,
}

impl NodeId {
  #[must_use]
  pub const fn to_raw(self) -> usize {
    ((self.generation as usize) << 32) | self.index as usize
  }

  #[must_use]
  pub const fn from_raw(raw: usize) -> Self {
    Self {
      generation: (raw >> 32) as u32,
      index: raw as u32,
    }
  }
}

#[derive(Debug)]
struct Node {
  children: Option<HashMap<String, NodeId>>,
  location: Option<FrameMetadata>,
  parent: Option<NodeId>,
  retained: u64,
  total: u64,
}

#[derive(Debug)]
struct Slot {
  generation: u32,
  node: Option<Node>,
}

/// One root-to-leaf call path with its counters.
#[derive(Debug, Clone, Serialize)]
pub struct CallPath {
  pub frames: Vec<FrameMetadata>,
  pub retained: u64,
  pub total: u64,
}

/// Aggregate counters for one frame across every position it occupies in
/// the tree.
#[derive(Debug, Clone, Serialize)]
pub struct Hotspot {
  pub frame: FrameMetadata,
  pub retained: u64,
  pub total: u64,
}

/// Aggregation tree of allocation call paths.
///
/// Shared stack prefixes deduplicate into shared ancestor nodes. Every
/// node carries two counters: `retained` shrinks as frees are processed
/// and is the leak signal; `total` is permanent history, so hot
/// allocation sites stay visible after their objects are reclaimed.
#[derive(Debug)]
pub struct CallTree {
  free: Vec<u32>,
  insertion_count: u64,
  root: NodeId,
  slots: Vec<Slot>,
}

impl CallTree {
  #[must_use]
  pub fn new() -> Self {
    let mut tree = Self {
      free: Vec::new(),
      insertion_count: 0,
      root: NodeId {
        generation: 0,
        index: 0,
      },
      slots: Vec::new(),
    };

    tree.root = tree.allocate(None, None);

    tree
  }

  /// Record one allocation at the call path `frames`, ordered outermost
  /// first. Creates missing nodes, increments `total` and `retained` on
  /// every node from the leaf back to the root, and returns the leaf.
  pub fn record(&mut self, frames: &[FrameMetadata]) -> NodeId {
    let mut current = self.root;

    for frame in frames {
      current = self.child(current, frame);
    }

    let mut cursor = Some(current);

    while let Some(id) = cursor {
      let Some(node) = self.node_mut(id) else {
        break;
      };

      node.total += 1;
      node.retained += 1;
      cursor = node.parent;
    }

    self.insertion_count += 1;

    current
  }

  /// Walk from `node` back to the root decrementing retained counts.
  /// Totals are permanent. Stale handles into pruned subtrees are
  /// ignored.
  pub fn decrement_path(&mut self, node: NodeId) {
    let mut cursor = Some(node);

    while let Some(id) = cursor {
      let Some(node) = self.node_mut(id) else {
        break;
      };

      node.retained = node.retained.saturating_sub(1);
      cursor = node.parent;
    }
  }

  /// Every leaf path, sorted descending by `by`, truncated to `limit`.
  #[must_use]
  pub fn top_paths(&self, limit: usize, by: Metric) -> Vec<CallPath> {
    let mut paths = Vec::new();
    self.collect_paths(self.root, &mut paths);

    paths.sort_by_key(|path| {
      std::cmp::Reverse(match by {
        Metric::Retained => path.retained,
        Metric::Total => path.total,
      })
    });
    paths.truncate(limit);

    paths
  }

  /// Per-frame counter sums across all occurrences in the tree, sorted
  /// descending by `by`, truncated to `limit`.
  #[must_use]
  pub fn hotspots(&self, limit: usize, by: Metric) -> Vec<Hotspot> {
    let mut sums: HashMap<String, Hotspot> = HashMap::new();

    for slot in &self.slots {
      let Some(node) = slot.node.as_ref() else {
        continue;
      };
      let Some(location) = node.location.as_ref() else {
        continue;
      };

      let entry = sums.entry(location.key()).or_insert_with(|| Hotspot {
        frame: location.clone(),
        retained: 0,
        total: 0,
      });
      entry.retained += node.retained;
      entry.total += node.total;
    }

    let mut hotspots: Vec<Hotspot> = sums.into_values().collect();

    hotspots.sort_by_key(|hotspot| {
      std::cmp::Reverse(match by {
        Metric::Retained => hotspot.retained,
        Metric::Total => hotspot.total,
      })
    });
    hotspots.truncate(limit);

    hotspots
  }

  /// Cap fan-out: at every node with more than `limit` children, keep the
  /// `limit` with the largest retained counts and detach the rest.
  /// Ancestor counters are left untouched. Returns the number of nodes
  /// detached.
  pub fn prune(&mut self, limit: usize) -> usize {
    self.prune_node(self.root, limit)
  }

  /// Replace the root with a fresh node and reset the insertion count.
  pub fn clear(&mut self) {
    self.slots.clear();
    self.free.clear();
    self.insertion_count = 0;
    self.root = self.allocate(None, None);
  }

  #[must_use]
  pub fn total_allocations(&self) -> u64 {
    self.node(self.root).map_or(0, |node| node.total)
  }

  #[must_use]
  pub fn retained_allocations(&self) -> u64 {
    self.node(self.root).map_or(0, |node| node.retained)
  }

  /// Insertions recorded since creation, the last `clear`, or the last
  /// insertion-count reset.
  #[must_use]
  pub fn insertion_count(&self) -> u64 {
    self.insertion_count
  }

  pub(crate) fn reset_insertion_count(&mut self) {
    self.insertion_count = 0;
  }

  /// Live nodes, the root included.
  #[must_use]
  pub fn node_count(&self) -> usize {
    self.slots.iter().filter(|slot| slot.node.is_some()).count()
  }

  fn allocate(
    &mut self,
    location: Option<FrameMetadata>,
    parent: Option<NodeId>,
  ) -> NodeId {
    let node = Node {
      children: None,
      location,
      parent,
      retained: 0,
      total: 0,
    };

    if let Some(index) = self.free.pop() {
      let slot = &mut self.slots[index as usize];
      slot.node = Some(node);

      NodeId {
        generation: slot.generation,
        index,
      }
    } else {
      self.slots.push(Slot {
        generation: 0,
        node: Some(node),
      });

      NodeId {
        generation: 0,
        index: (self.slots.len() - 1) as u32,
      }
    }
  }

  fn node(&self, id: NodeId) -> Option<&Node> {
    let slot = self.slots.get(id.index as usize)?;

    if slot.generation != id.generation {
      return None;
    }

    slot.node.as_ref()
  }

  fn node_mut(&mut self, id: NodeId) -> Option<&mut Node> {
    let slot = self.slots.get_mut(id.index as usize)?;

    if slot.generation != id.generation {
      return None;
    }

    slot.node.as_mut()
  }

  fn child(&mut self, parent: NodeId, frame: &FrameMetadata) -> NodeId {
    let key = frame.key();

    let existing = self
      .node(parent)
      .and_then(|node| node.children.as_ref())
      .and_then(|children| children.get(&key))
      .copied();

    if let Some(existing) = existing {
      return existing;
    }

    let child = self.allocate(Some(frame.clone()), Some(parent));

    if let Some(node) = self.node_mut(parent) {
      node
        .children
        .get_or_insert_with(HashMap::new)
        .insert(key, child);
    }

    child
  }

  fn collect_paths(&self, id: NodeId, paths: &mut Vec<CallPath>) {
    let Some(node) = self.node(id) else {
      return;
    };

    let children = node
      .children
      .as_ref()
      .filter(|children| !children.is_empty());

    let Some(children) = children else {
      if id != self.root {
        paths.push(CallPath {
          frames: self.frames_to(id),
          retained: node.retained,
          total: node.total,
        });
      }

      return;
    };

    for child in children.values() {
      self.collect_paths(*child, paths);
    }
  }

  fn frames_to(&self, id: NodeId) -> Vec<FrameMetadata> {
    let mut frames = Vec::new();
    let mut cursor = Some(id);

    while let Some(current) = cursor {
      let Some(node) = self.node(current) else {
        break;
      };

      if let Some(location) = node.location.as_ref() {
        frames.push(location.clone());
      }

      cursor = node.parent;
    }

    frames.reverse();

    frames
  }

  fn prune_node(&mut self, id: NodeId, limit: usize) -> usize {
    let Some(node) = self.node(id) else {
      return 0;
    };
    let Some(children) = node.children.as_ref() else {
      return 0;
    };

    let mut ordered: Vec<(String, NodeId, u64)> = children
      .iter()
      .map(|(key, child)| {
        let retained = self.node(*child).map_or(0, |node| node.retained);
        (key.clone(), *child, retained)
      })
      .collect();

    let mut detached = 0;

    if ordered.len() > limit {
      ordered.sort_by(|a, b| b.2.cmp(&a.2));

      let victims = ordered.split_off(limit);

      for (key, child, _) in victims {
        if let Some(node) = self.node_mut(id) {
          if let Some(children) = node.children.as_mut() {
            children.remove(&key);
          }
        }

        detached += self.release(child);
      }
    }

    for (_, child, _) in ordered {
      detached += self.prune_node(child, limit);
    }

    detached
  }

  /// Free a detached subtree's slots; outstanding handles into it go
  /// stale.
  fn release(&mut self, id: NodeId) -> usize {
    let Some(slot) = self.slots.get_mut(id.index as usize) else {
      return 0;
    };

    if slot.generation != id.generation {
      return 0;
    }

    let Some(node) = slot.node.take() else {
      return 0;
    };

    slot.generation = slot.generation.wrapping_add(1);
    self.free.push(id.index);

    let mut detached = 1;

    if let Some(children) = node.children {
      for child in children.into_values() {
        detached += self.release(child);
      }
    }

    detached
  }
}

impl Default for CallTree {
  fn default() -> Self {
    Self::new()
  }
}
