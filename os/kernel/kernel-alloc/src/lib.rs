//! # Per-CPU object allocator
//!
//! Fixed-size kernel objects are served by [`ObjectPool`]s. A pool cuts pages
//! of one size class, obtained through [`PageProvider`](kernel_pmm::PageProvider),
//! into [`Slab`]s and keeps one [`PerCpuCache`] per CPU so the hot paths only
//! touch the local CPU's lock:
//!
//! ```text
//! PoolRegistry ─┬─ shared ladder: 16, 24, 40, 64, 96, ... bytes ─┐
//!               └─ exclusive pools ──────────────────────────────┤
//!                                                                ▼
//!                                      ObjectPool ── [PerCpuCache; cpus]
//!                                                      partial / full slabs
//!                                                      pending frees
//!                                                                │
//!                                                    PageProvider (kernel-pmm)
//! ```
//!
//! * `acquire` pops a pending free or carves a slot from a partial slab, and
//!   adds a slab when both are empty.
//! * `release` only pushes onto the CPU's pending list. Pending objects are
//!   matched back to their slab in batches (reconciliation), probing other
//!   CPUs' caches for objects freed away from their home CPU.
//! * The [`PoolRegistry`] seeds itself from one hand-placed page and offers a
//!   byte-count heap on top of the shared ladder; [`GlobalHeap`] exposes that
//!   heap as a `GlobalAlloc`.
//!
//! Collaborators (pages, address translation, CPU topology, configuration)
//! are passed in explicitly as an [`AllocEnv`].

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod cache;
mod config;
mod env;
mod error;
mod frame;
mod heap;
mod layout;
mod object_pool;
mod registry;
mod slab;

pub use cache::{CacheStats, PerCpuCache};
pub use config::{
    AllocConfig, LARGE_OBJECT_DIVISOR, MIN_OBJECT_SIZE, MIN_SLAB_OBJECTS, PENDING_WATERMARK,
};
pub use env::{AllocEnv, CpuTopology};
pub use error::AllocError;
pub use frame::PageFrame;
pub use heap::{GlobalHeap, HEADER_BYTES, HEAP_ALIGN, HEAP_MAGIC, HeapHeader};
pub use layout::{LayoutPolicy, SlabLayout};
pub use object_pool::{ObjectPool, PoolStats, ReconcileStep};
pub use registry::{
    LADDER, LADDER_BASE, LADDER_STEPS, ObjectPoolHandle, PoolRegistry, Refused, ladder_step,
};
pub use slab::{SLAB_HEADER_BYTES, Slab, SlabState};
