//! Live allocation table and the track/untrack hook protocol.
//!
//! Tracker bookkeeping allocates memory itself.  When the tracker is wired
//! into the allocator, those allocations re-enter `track`/`untrack` on the
//! same call stack.  Every internal operation therefore runs under a
//! [`SuspendGuard`]; while one is alive, hook calls are no-ops.  Mutating the
//! table while a snapshot borrow is held without a guard is a programming
//! error and panics.

use std::cell::{Cell, RefCell};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::{
    config::ProfilerConfig,
    stack::{BacktraceCapturer, StackCapturer, StackKey},
    types::{FieldMap, TypeId, TypeRegistry, UNKNOWN_TYPE},
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub address: usize,
    pub size: usize,
    pub stack: StackKey,
    pub type_id: TypeId,
    /// The allocation holds no outgoing references.
    pub leaf: bool,
}

/// address -> record for every live tracked allocation.
pub type LiveTable = FxHashMap<usize, AllocationRecord>;

#[derive(Debug, Default)]
struct TrackerState {
    table: LiveTable,
    registry: TypeRegistry,
    pending_type: Option<TypeId>,
}

pub struct Tracker<S = BacktraceCapturer> {
    capturer: S,
    depth: usize,
    alloc_skip: usize,
    other_skip: usize,
    suspended: Cell<usize>,
    state: RefCell<TrackerState>,
}

/// Scoped suspension of hook processing.  Nests; dropping restores the
/// previous level on every exit path, including unwinding.
#[must_use]
pub struct SuspendGuard<'a> {
    suspended: &'a Cell<usize>,
}

impl Drop for SuspendGuard<'_> {
    fn drop(&mut self) {
        self.suspended.set(self.suspended.get() - 1);
    }
}

impl Tracker<BacktraceCapturer> {
    pub fn new(config: &ProfilerConfig) -> Self {
        Self::with_capturer(BacktraceCapturer, config)
    }
}

impl<S: StackCapturer> Tracker<S> {
    pub fn with_capturer(capturer: S, config: &ProfilerConfig) -> Self {
        Tracker {
            capturer,
            depth: config.stack_depth,
            alloc_skip: config.alloc_skip_frames,
            other_skip: config.other_skip_frames,
            suspended: Cell::new(0),
            state: RefCell::new(TrackerState::default()),
        }
    }

    pub fn capturer(&self) -> &S {
        &self.capturer
    }

    /// Call stack of the caller, outside of any allocation hook.
    pub fn capture_stack(&self) -> StackKey {
        let _guard = self.suspend();
        self.capturer.capture(self.other_skip, self.depth)
    }

    pub fn suspend(&self) -> SuspendGuard<'_> {
        self.suspended.set(self.suspended.get() + 1);
        SuspendGuard {
            suspended: &self.suspended,
        }
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended.get() > 0
    }

    /// Records a new allocation at `address` and returns `address`
    /// unchanged.  Consumes the pending type announcement, if any.
    pub fn track(&self, address: usize, size: usize, leaf: bool) -> usize {
        if self.is_suspended() {
            return address;
        }
        let _guard = self.suspend();

        let stack = self.capturer.capture(self.alloc_skip, self.depth);
        let type_id = self
            .state
            .borrow_mut()
            .pending_type
            .take()
            .unwrap_or(UNKNOWN_TYPE);
        self.insert(AllocationRecord {
            address,
            size,
            stack,
            type_id,
            leaf,
        });
        address
    }

    /// Records an allocation whose stack and type the caller already knows.
    /// Neither captures a stack nor touches the pending type announcement.
    pub fn track_record(&self, record: AllocationRecord) -> usize {
        let address = record.address;
        if self.is_suspended() {
            return address;
        }
        let _guard = self.suspend();
        self.insert(record);
        address
    }

    fn insert(&self, record: AllocationRecord) {
        let mut state = self.state.borrow_mut();
        let type_id = record.type_id;
        if let Some(old) = state.table.insert(record.address, record) {
            state.registry.decrement(old.type_id);
        }
        state.registry.increment(type_id);
    }

    /// Forgets the allocation at `address`.  Returns whether it was a leaf,
    /// or `None` if the address was not tracked.
    pub fn untrack(&self, address: usize) -> Option<bool> {
        self.remove(address).map(|record| record.leaf)
    }

    /// Forgets the allocation at `address` and hands back its record.
    pub fn remove(&self, address: usize) -> Option<AllocationRecord> {
        if self.is_suspended() {
            return None;
        }
        let _guard = self.suspend();

        let mut state = self.state.borrow_mut();
        let record = state.table.remove(&address)?;
        state.registry.decrement(record.type_id);
        Some(record)
    }

    /// Announces the type of the next tracked allocation.
    pub fn announce_type(&self, type_id: TypeId, name: &str, fields: Option<&FieldMap>) {
        if self.is_suspended() {
            return;
        }
        let _guard = self.suspend();

        let mut state = self.state.borrow_mut();
        state.registry.register(type_id, name, fields);
        state.pending_type = if type_id == UNKNOWN_TYPE {
            None
        } else {
            Some(type_id)
        };
    }

    /// Adds `type_id` to the registry without touching the pending slot.
    pub fn register_type(&self, type_id: TypeId, name: &str, fields: Option<&FieldMap>) {
        if self.is_suspended() {
            return;
        }
        let _guard = self.suspend();
        self.state
            .borrow_mut()
            .registry
            .register(type_id, name, fields);
    }

    /// Runs `f` over the live table and type registry.  Callers should hold
    /// a [`SuspendGuard`] for the duration if `f` may allocate.
    pub fn with_table<R>(&self, f: impl FnOnce(&LiveTable, &TypeRegistry) -> R) -> R {
        let state = self.state.borrow();
        f(&state.table, &state.registry)
    }

    pub fn get(&self, address: usize) -> Option<AllocationRecord> {
        self.state.borrow().table.get(&address).cloned()
    }

    pub fn live_count(&self, type_id: TypeId) -> usize {
        self.state.borrow().registry.live_count(type_id)
    }

    pub fn len(&self) -> usize {
        self.state.borrow().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.borrow().table.is_empty()
    }
}
