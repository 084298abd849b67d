use super::*;

const INITIAL_CAPACITY: usize = 1024;

/// Golden-ratio multiplier for mixing pointer-derived keys.
const HASH_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

const PROBE_SOFT_LIMIT: usize = 64;
const PROBE_HARD_LIMIT: usize = 4096;

/// Raw key 1 is an odd-tagged immediate, which can never be a heap-object
/// key, so it is free to serve as the deleted-slot sentinel.
const TOMBSTONE: Value = Value::immediate(0);

/// One slot of the object table.
#[derive(Clone, Copy, Debug)]
pub struct ObjectTableEntry {
  pub object: Value,
  pub class: Value,
  pub data: Value,
}

impl ObjectTableEntry {
  const EMPTY: Self = Self {
    object: Value::NIL,
    class: Value::NIL,
    data: Value::NIL,
  };

  fn is_empty(&self) -> bool {
    self.object.is_nil()
  }

  fn is_tombstone(&self) -> bool {
    self.object == TOMBSTONE
  }

  fn is_occupied(&self) -> bool {
    !self.is_empty() && !self.is_tombstone()
  }
}

enum Slot {
  Occupied(usize),
  Vacant {
    index: usize,
    reuses_tombstone: bool,
  },
  /// The probe chain exceeded the hard limit without passing an empty
  /// slot or a tombstone; nothing may be written anywhere.
  Corrupted,
}

/// GC-aware open-addressed map from raw object identity to `{class, data}`.
///
/// Weak by default: object keys are not presented to the collector, so an
/// object whose only remaining reference is this table gets reclaimed and
/// the resulting free event prunes the entry. A scoped strong mode pins
/// keys for safe enumeration.
///
/// Deletion tombstones the slot instead of repairing the probe chain;
/// tombstones count against the load factor and are dropped wholesale on
/// resize and on compaction rehash. All storage comes from the system
/// allocator, so the table is safe to touch from compaction and from
/// free-event handlers.
pub struct ObjectTable {
  count: usize,
  entries: Box<[ObjectTableEntry]>,
  strong_refs: u32,
  tombstones: usize,
}

impl ObjectTable {
  #[must_use]
  pub fn new() -> Self {
    Self::with_capacity(INITIAL_CAPACITY)
  }

  #[must_use]
  pub fn with_capacity(capacity: usize) -> Self {
    let capacity = capacity.next_power_of_two().max(2);

    Self {
      count: 0,
      entries: vec![ObjectTableEntry::EMPTY; capacity].into_boxed_slice(),
      strong_refs: 0,
      tombstones: 0,
    }
  }

  fn hash_index(&self, object: Value) -> usize {
    let mixed = ((object.raw() >> 3) as u64).wrapping_mul(HASH_MULTIPLIER);
    let shift = 64 - self.entries.len().trailing_zeros();
    (mixed >> shift) as usize
  }

  fn find(&self, object: Value) -> Slot {
    let mask = self.entries.len() - 1;
    let mut index = self.hash_index(object);
    let mut first_tombstone = None;
    let mut probes = 0usize;

    loop {
      let entry = &self.entries[index];

      if entry.is_empty() {
        return match first_tombstone {
          Some(index) => Slot::Vacant {
            index,
            reuses_tombstone: true,
          },
          None => Slot::Vacant {
            index,
            reuses_tombstone: false,
          },
        };
      }

      if entry.is_tombstone() {
        if first_tombstone.is_none() {
          first_tombstone = Some(index);
        }
      } else if entry.object == object {
        return Slot::Occupied(index);
      }

      probes += 1;

      if probes == PROBE_SOFT_LIMIT {
        tracing::warn!(probes, "object table probe chain exceeded soft limit");
      }

      if probes >= PROBE_HARD_LIMIT {
        // Abort the probe. A tombstone passed on the way is a correct
        // insertion slot; the slot under the cursor is live and must not
        // be handed out.
        if let Some(index) = first_tombstone {
          tracing::error!(
            probes,
            "object table probe chain exceeded hard limit, aborting probe"
          );

          return Slot::Vacant {
            index,
            reuses_tombstone: true,
          };
        }

        tracing::error!(
          probes,
          "object table probe chain exceeded hard limit with no usable slot"
        );

        return Slot::Corrupted;
      }

      index = (index + 1) & mask;
    }
  }

  /// Insert `object`, returning the slot for the caller to fill.
  ///
  /// Resizes first when the load factor, tombstones included, would exceed
  /// one half. Inserting an object that is already present returns the
  /// existing slot so the caller replaces its fields.
  ///
  /// # Errors
  ///
  /// Returns [`EngineError::TableCorrupted`] when the probe chain exceeds
  /// the hard limit without passing a reusable slot.
  pub fn insert(
    &mut self,
    object: Value,
  ) -> Result<&mut ObjectTableEntry, EngineError> {
    if (self.count + self.tombstones) * 2 >= self.entries.len() {
      self.resize(self.entries.len() * 2);
    }

    match self.find(object) {
      Slot::Occupied(index) => Ok(&mut self.entries[index]),
      Slot::Vacant {
        index,
        reuses_tombstone,
      } => {
        if reuses_tombstone {
          self.tombstones -= 1;
        }

        self.count += 1;
        self.entries[index] = ObjectTableEntry {
          object,
          class: Value::NIL,
          data: Value::NIL,
        };

        Ok(&mut self.entries[index])
      }
      Slot::Corrupted => Err(EngineError::TableCorrupted),
    }
  }

  /// Identity lookup, skipping tombstones. Never dereferences `object`, so
  /// it is safe with a reference to an object that is being collected.
  /// An aborted probe reads as absent.
  #[must_use]
  pub fn lookup(&self, object: Value) -> Option<&ObjectTableEntry> {
    match self.find(object) {
      Slot::Occupied(index) => Some(&self.entries[index]),
      Slot::Vacant { .. } | Slot::Corrupted => None,
    }
  }

  /// Remove and return the entry for `object`. The slot becomes a
  /// tombstone; no probe-chain repair.
  pub fn take(&mut self, object: Value) -> Option<ObjectTableEntry> {
    let Slot::Occupied(index) = self.find(object) else {
      return None;
    };

    let entry = self.entries[index];

    self.entries[index] = ObjectTableEntry {
      object: TOMBSTONE,
      class: Value::NIL,
      data: Value::NIL,
    };
    self.count -= 1;
    self.tombstones += 1;

    Some(entry)
  }

  pub fn remove(&mut self, object: Value) -> bool {
    self.take(object).is_some()
  }

  /// Occupied entries only.
  #[must_use]
  pub fn len(&self) -> usize {
    self.count
  }

  #[must_use]
  pub fn is_empty(&self) -> bool {
    self.count == 0
  }

  pub fn clear(&mut self) {
    self.entries.fill(ObjectTableEntry::EMPTY);
    self.count = 0;
    self.tombstones = 0;
  }

  pub fn iter(&self) -> impl Iterator<Item = &ObjectTableEntry> {
    self.entries.iter().filter(|entry| entry.is_occupied())
  }

  /// Rehash-path insertion into a table with unique keys, no tombstones,
  /// and guaranteed free space; probes straight to the first empty slot.
  fn place(&mut self, entry: ObjectTableEntry) {
    let mask = self.entries.len() - 1;
    let mut index = self.hash_index(entry.object);

    while self.entries[index].is_occupied() {
      index = (index + 1) & mask;
    }

    self.entries[index] = entry;
    self.count += 1;
  }

  fn resize(&mut self, capacity: usize) {
    let old = std::mem::replace(
      &mut self.entries,
      vec![ObjectTableEntry::EMPTY; capacity].into_boxed_slice(),
    );
    self.count = 0;
    self.tombstones = 0;

    for entry in old.iter().filter(|entry| entry.is_occupied()) {
      self.place(*entry);
    }
  }

  /// Present live managed references to the collector.
  ///
  /// Classes and data are always marked; object keys only while a strong
  /// scope is active. Keys left unmarked are how the engine learns about
  /// frees at all.
  pub fn mark(&self, marker: &mut dyn Marker) {
    let strong = self.strong_refs > 0;

    for entry in self.iter() {
      if strong {
        marker.mark(entry.object);
      }

      marker.mark(entry.class);

      if !entry.data.is_nil() {
        marker.mark(entry.data);
      }
    }
  }

  /// Rewrite stored references after a compaction pass.
  ///
  /// Keys are pointer-derived, so if any live object moved the whole table
  /// is rehashed: live entries are snapshotted into a scratch buffer from
  /// the system allocator, the slots are zeroed, and every entry is
  /// reinserted at its new position. Tombstones do not survive the rehash.
  pub fn update_references(&mut self, relocator: &dyn Relocator) {
    let any_moved = self
      .iter()
      .any(|entry| relocator.relocate(entry.object) != entry.object);

    if !any_moved {
      for entry in self.entries.iter_mut() {
        if !entry.is_occupied() {
          continue;
        }

        entry.class = relocator.relocate(entry.class);

        if !entry.data.is_nil() {
          entry.data = relocator.relocate(entry.data);
        }
      }

      return;
    }

    let live: Vec<ObjectTableEntry> = self
      .iter()
      .map(|entry| ObjectTableEntry {
        object: relocator.relocate(entry.object),
        class: relocator.relocate(entry.class),
        data: if entry.data.is_nil() {
          entry.data
        } else {
          relocator.relocate(entry.data)
        },
      })
      .collect();

    self.entries.fill(ObjectTableEntry::EMPTY);
    self.count = 0;
    self.tombstones = 0;

    for entry in live {
      self.place(entry);
    }
  }

  /// Enter strong mode: object keys are marked until the matching
  /// decrement, so they cannot die mid-enumeration.
  pub fn increment_strong(&mut self) {
    self.strong_refs += 1;
  }

  pub fn decrement_strong(&mut self) {
    self.strong_refs = self.strong_refs.saturating_sub(1);
  }

  #[must_use]
  pub fn strong(&self) -> bool {
    self.strong_refs > 0
  }
}

impl Default for ObjectTable {
  fn default() -> Self {
    Self::new()
  }
}

impl std::fmt::Debug for ObjectTable {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ObjectTable")
      .field("capacity", &self.entries.len())
      .field("count", &self.count)
      .field("tombstones", &self.tombstones)
      .field("strong_refs", &self.strong_refs)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashSet;

  fn object(raw: usize) -> Value {
    Value::from_raw(raw * 16)
  }

  fn insert(table: &mut ObjectTable, object: Value) -> &mut ObjectTableEntry {
    table.insert(object).expect("insert failed")
  }

  /// Keys that all hash to bucket zero of a table with `capacity` slots,
  /// found by inverting the Fibonacci mix modulo 2^64.
  fn colliding_keys(count: usize, capacity: usize) -> Vec<Value> {
    let shift = 64 - capacity.trailing_zeros();

    let mut inverse = HASH_MULTIPLIER;
    for _ in 0..6 {
      inverse = inverse
        .wrapping_mul(2u64.wrapping_sub(HASH_MULTIPLIER.wrapping_mul(inverse)));
    }
    assert_eq!(HASH_MULTIPLIER.wrapping_mul(inverse), 1);

    let mut keys = Vec::with_capacity(count);
    let mut mixed: u64 = 1;

    while keys.len() < count {
      assert!(mixed >> shift == 0, "ran out of bucket-zero hash values");

      let premix = mixed.wrapping_mul(inverse);
      mixed += 1;

      // The key is premix << 3, so premix must survive the round trip and
      // avoid the empty sentinel.
      if premix == 0 || premix >> 61 != 0 {
        continue;
      }

      keys.push(Value::from_raw((premix << 3) as usize));
    }

    keys
  }

  struct CollectingMarker {
    marked: Vec<Value>,
  }

  impl Marker for CollectingMarker {
    fn mark(&mut self, value: Value) {
      self.marked.push(value);
    }

    fn mark_pinned(&mut self, value: Value) {
      self.marked.push(value);
    }
  }

  struct ShiftRelocator {
    offset: usize,
  }

  impl Relocator for ShiftRelocator {
    fn relocate(&self, value: Value) -> Value {
      if value.is_nil() || value.is_immediate() {
        value
      } else {
        Value::from_raw(value.raw() + self.offset)
      }
    }
  }

  #[test]
  fn insert_then_lookup_round_trips() {
    let mut table = ObjectTable::with_capacity(8);

    let entry = insert(&mut table, object(1));
    entry.class = object(100);
    entry.data = Value::immediate(7);

    let found = table.lookup(object(1)).expect("missing entry");
    assert_eq!(found.class, object(100));
    assert_eq!(found.data, Value::immediate(7));
    assert_eq!(table.len(), 1);
  }

  #[test]
  fn take_tombstones_the_slot() {
    let mut table = ObjectTable::with_capacity(8);
    insert(&mut table, object(1)).class = object(100);

    let taken = table.take(object(1)).expect("missing entry");
    assert_eq!(taken.class, object(100));
    assert!(table.lookup(object(1)).is_none());
    assert_eq!(table.len(), 0);
    assert_eq!(table.tombstones, 1);
  }

  #[test]
  fn reinserting_reuses_the_tombstone() {
    let mut table = ObjectTable::with_capacity(8);
    insert(&mut table, object(1));
    table.remove(object(1));

    assert_eq!(table.tombstones, 1);

    insert(&mut table, object(1));

    assert_eq!(table.tombstones, 0);
    assert_eq!(table.len(), 1);
  }

  #[test]
  fn random_churn_preserves_size_and_load_factor() {
    let mut table = ObjectTable::new();
    let mut live = HashSet::new();
    let mut seed = 0x1234_5678_usize;

    for step in 0..10_000 {
      seed = seed.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
      let key = object((seed >> 16) % 4096 + 1);

      if step % 3 == 0 && live.contains(&key) {
        assert!(table.remove(key));
        live.remove(&key);
      } else {
        insert(&mut table, key).class = object(1);
        live.insert(key);
      }

      assert!(
        (table.count + table.tombstones) * 2 <= table.entries.len(),
        "load factor exceeded at step {step}"
      );
    }

    assert_eq!(table.len(), live.len());

    for key in &live {
      assert!(table.lookup(*key).is_some());
    }
  }

  #[test]
  fn resize_drops_tombstones() {
    let mut table = ObjectTable::with_capacity(8);

    for raw in 1..=3 {
      insert(&mut table, object(raw));
    }
    for raw in 1..=3 {
      table.remove(object(raw));
    }

    assert_eq!(table.tombstones, 3);

    // The next insert pushes count + tombstones past the load factor.
    insert(&mut table, object(10));

    assert_eq!(table.tombstones, 0);
    assert_eq!(table.len(), 1);
    assert!(table.lookup(object(10)).is_some());
  }

  #[test]
  fn long_probe_chains_stay_correct_past_the_soft_limit() {
    let capacity = 1024;
    let mut table = ObjectTable::with_capacity(capacity);
    let keys = colliding_keys(PROBE_SOFT_LIMIT * 2, capacity);

    for (index, key) in keys.iter().enumerate() {
      assert_eq!(table.hash_index(*key), 0);
      insert(&mut table, *key).data = Value::immediate(index);
    }

    assert_eq!(table.len(), keys.len());

    for (index, key) in keys.iter().enumerate() {
      let entry = table.lookup(*key).expect("missing colliding key");
      assert_eq!(entry.data, Value::immediate(index));
    }
  }

  #[test]
  fn hard_limit_abort_never_overwrites_live_entries() {
    // Room for the whole chain without triggering a resize.
    let capacity = PROBE_HARD_LIMIT * 4;
    let mut table = ObjectTable::with_capacity(capacity);
    let keys = colliding_keys(PROBE_HARD_LIMIT + 1, capacity);

    for (index, key) in keys.iter().take(PROBE_HARD_LIMIT).enumerate() {
      insert(&mut table, *key).data = Value::immediate(index);
    }

    assert_eq!(table.len(), PROBE_HARD_LIMIT);

    // One more colliding key probes the full run of live entries and must
    // fail rather than claim one of their slots.
    let overflow = keys[PROBE_HARD_LIMIT];
    assert!(matches!(
      table.insert(overflow),
      Err(EngineError::TableCorrupted)
    ));

    // An aborted lookup reads as absent.
    assert!(table.lookup(overflow).is_none());

    // Nothing was written: every prior entry is intact and the count did
    // not move.
    assert_eq!(table.len(), PROBE_HARD_LIMIT);

    for (index, key) in keys.iter().take(PROBE_HARD_LIMIT).enumerate() {
      let entry = table.lookup(*key).expect("live entry destroyed");
      assert_eq!(entry.object, *key);
      assert_eq!(entry.data, Value::immediate(index));
    }
  }

  #[test]
  fn hard_limit_abort_reuses_a_tombstone_when_available() {
    let capacity = PROBE_HARD_LIMIT * 4;
    let mut table = ObjectTable::with_capacity(capacity);
    let keys = colliding_keys(PROBE_HARD_LIMIT + 1, capacity);

    for key in keys.iter().take(PROBE_HARD_LIMIT) {
      insert(&mut table, *key).class = object(1);
    }

    // A tombstone in the middle of the run is the best insertion slot the
    // aborted probe has seen.
    let removed = keys[PROBE_HARD_LIMIT / 2];
    assert!(table.remove(removed));

    let overflow = keys[PROBE_HARD_LIMIT];
    insert(&mut table, overflow).class = object(2);

    assert_eq!(table.len(), PROBE_HARD_LIMIT);
    assert_eq!(table.tombstones, 0);

    let entry = table.lookup(overflow).expect("missing overflow key");
    assert_eq!(entry.class, object(2));

    // The surviving originals are untouched.
    for key in keys.iter().take(PROBE_HARD_LIMIT) {
      if *key == removed {
        assert!(table.lookup(*key).is_none());
      } else {
        let entry = table.lookup(*key).expect("live entry destroyed");
        assert_eq!(entry.class, object(1));
      }
    }
  }

  #[test]
  fn weak_mark_skips_object_keys() {
    let mut table = ObjectTable::with_capacity(8);
    let entry = insert(&mut table, object(1));
    entry.class = object(100);
    entry.data = object(200);

    let mut marker = CollectingMarker { marked: Vec::new() };
    table.mark(&mut marker);

    assert!(!marker.marked.contains(&object(1)));
    assert!(marker.marked.contains(&object(100)));
    assert!(marker.marked.contains(&object(200)));
  }

  #[test]
  fn strong_mark_includes_object_keys() {
    let mut table = ObjectTable::with_capacity(8);
    insert(&mut table, object(1)).class = object(100);
    table.increment_strong();

    let mut marker = CollectingMarker { marked: Vec::new() };
    table.mark(&mut marker);

    assert!(marker.marked.contains(&object(1)));

    table.decrement_strong();
    assert!(!table.strong());
  }

  #[test]
  fn moved_keys_rehash_to_their_new_positions() {
    let mut table = ObjectTable::new();

    for raw in 1..=100 {
      let entry = insert(&mut table, object(raw));
      entry.class = object(1000);
      entry.data = Value::immediate(raw);
    }

    let relocator = ShiftRelocator { offset: 0x10_0000 };
    table.update_references(&relocator);

    assert_eq!(table.len(), 100);

    for raw in 1..=100 {
      let moved = relocator.relocate(object(raw));
      let entry = table.lookup(moved).expect("moved entry not found");
      assert_eq!(entry.data, Value::immediate(raw));
      assert!(table.lookup(object(raw)).is_none());
    }
  }

  #[test]
  fn stationary_compaction_only_rewrites_fields() {
    struct ClassOnlyRelocator;

    impl Relocator for ClassOnlyRelocator {
      fn relocate(&self, value: Value) -> Value {
        // Keys below 0x1000 stay put; higher references move.
        if value.raw() >= 0x1000 {
          Value::from_raw(value.raw() + 0x100)
        } else {
          value
        }
      }
    }

    let mut table = ObjectTable::with_capacity(8);
    let entry = insert(&mut table, Value::from_raw(0x10));
    entry.class = Value::from_raw(0x2000);

    table.update_references(&ClassOnlyRelocator);

    let entry = table.lookup(Value::from_raw(0x10)).expect("key moved");
    assert_eq!(entry.class, Value::from_raw(0x2100));
  }
}
