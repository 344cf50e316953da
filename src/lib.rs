//! `heap_reach` is a live heap profiler.  It records every live allocation
//! together with its allocation site and, optionally, its type, and on
//! demand computes:
//!
//! * the number of live objects per type;
//! * live bytes grouped by allocation call stack;
//! * the retained size of an object or of all objects of a type: the bytes
//!   transitively reachable from them through pointer-aligned references,
//!   with shared structure counted once;
//! * a bounded graph of the objects that reference the objects of a type.
//!
//! Unlike sampling profilers, every allocation is accounted for exactly.
//! Profiles are useful for diagnosing memory growth and leaks in
//! long-running processes.
//!
//! ## Enabling `heap_reach` in a Rust program
//!
//! Configure it as a global allocator instead of [`std::alloc::System`]:
//!
//! ```
//! use heap_reach::ProfAllocator;
//!
//! #[global_allocator]
//! static GLOBAL: ProfAllocator = ProfAllocator;
//!
//! fn main() {}
//! ```
//!
//! Call [`announce_type`] right before an allocation to attribute it to a
//! type, and [`announce_leaf`] for allocations that hold no pointers.
//! Reports are produced with [`with_reporter`]:
//!
//! ```no_run
//! let by_site = heap_reach::with_reporter(|r| r.by_allocation_site(4096));
//! ```
//!
//! ## Using `heap_reach` via `LD_PRELOAD`
//!
//! For programs in other languages, use the companion `lib_heap_reach`
//! crate, which builds a dynamic library intercepting `malloc`, `calloc`,
//! `realloc` and `free`:
//!
//! ```bash
//! LD_PRELOAD=libheap_reach.so ./my_program
//! ```
//!
//! ## Viewing snapshots
//!
//! [`dump_snapshot`] writes the type, retained-size and allocation-site
//! tables, with symbolized stacks, to `heap_reach.<pid>/snapshot.<n>.yaml`.
//! View them with the `hr_print` tool from this crate:
//!
//! ```bash
//! hr_print --dir heap_reach.<pid> --min-bytes 4096
//! ```
//!
//! ## Embedding in a managed runtime
//!
//! Runtimes with their own collector drive a [`Tracker`] directly from
//! their allocation hooks and build a [`Reporter`] with their own
//! [`MutatorPauser`] and [`CollectorControl`] implementations.

#![allow(clippy::ptr_arg)]

mod alloc;
pub mod config;
pub mod error;
pub mod graph;
pub mod interval_set;
pub mod memory;
pub mod reach;
pub mod report;
pub mod snapshot;
pub mod stack;
pub mod symbolize;
pub mod tracker;
pub mod types;
pub mod world;

pub use crate::{
    alloc::{
        announce_leaf, announce_type, configure, dump_snapshot, with_reporter, GlobalReporter,
        ProfAllocator,
    },
    config::ProfilerConfig,
    error::{Error, Result},
    graph::{GraphEdge, GraphNode, ObjectGraph},
    interval_set::{Interval, IntervalSet},
    memory::{ByteHeap, HeapMemory, LiveMemory},
    reach::Reachability,
    report::{Reporter, RetainedRow, SiteRow, TypeCountRow},
    snapshot::HeapSnapshot,
    stack::{BacktraceCapturer, StackCapturer, StackKey},
    symbolize::{BacktraceSymbolizer, Symbolizer},
    tracker::{AllocationRecord, LiveTable, SuspendGuard, Tracker},
    types::{FieldMap, TypeId, TypeInfo, TypeRegistry, UNKNOWN_TYPE},
    world::{CollectorControl, MutatorPauser, NoCollector, StoppedWorld},
};
