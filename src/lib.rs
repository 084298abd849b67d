//! Event-driven retained-object tracking for managed runtimes.
//!
//! The engine attaches to a host runtime's allocation and free event
//! stream and answers, for every live object of interest, where it was
//! allocated and what still retains it. Events produced inside the
//! allocator or the collector are buffered in a double-buffered queue and
//! applied by a deferred consumer, so user callbacks never run where
//! calling managed code is unsafe. A weak object table detects frees, a
//! call tree attributes allocations to their sites, and a sampler turns
//! raw counts into a leak signal.

mod allocations;
mod call_tree;
mod capture;
mod config;
mod error;
mod events;
mod frame;
#[cfg(test)]
mod mock;
mod runtime;
mod sampler;
mod table;
mod value;

use {
  dashmap::DashMap,
  nohash_hasher::BuildNoHashHasher,
  serde::Serialize,
  smallvec::SmallVec,
  std::{
    collections::HashMap,
    io::Write,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
      Arc, Mutex, MutexGuard, OnceLock, Weak,
      atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering},
    },
    thread,
    time::{Duration, Instant},
  },
};

pub use {
  allocations::{AllocationCallback, Allocations},
  call_tree::{CallPath, CallTree, Hotspot, Metric, NodeId},
  capture::{Capture, CaptureStatistics},
  config::SamplerConfig,
  error::EngineError,
  events::Events,
  frame::FrameMetadata,
  runtime::{
    Collectable, CollectionGuard, ContainerHandle, DeferredJob,
    DeferredJobHandle, EventHook, EventKind, Marker, Relocator, Runtime,
  },
  sampler::{
    AllocationCounts, AllocationRoots, Analysis, AnalyzeOptions, FrameFilter,
    Sample, Sampler, SamplerBuilder,
  },
  table::{ObjectTable, ObjectTableEntry},
  value::{Value, address_of},
};

pub(crate) use {capture::CaptureShared, events::Event};
