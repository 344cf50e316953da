//! Allocator hooks feeding the process-wide tracker.

use std::{
    alloc::{GlobalAlloc, Layout, System},
    cell::Cell,
    path::{Path, PathBuf},
    sync::{Mutex, MutexGuard},
    thread_local,
};

use libc::{c_char, c_void, dlsym, RTLD_NEXT};
use once_cell::sync::{Lazy, OnceCell};

use crate::{
    config::ProfilerConfig,
    error::Result,
    memory::LiveMemory,
    report::Reporter,
    snapshot::HeapSnapshot,
    stack::{BacktraceCapturer, StackCapturer, StackKey},
    symbolize::BacktraceSymbolizer,
    tracker::{AllocationRecord, Tracker},
    types::{FieldMap, TypeId, UNKNOWN_TYPE},
    world::NoCollector,
};

/// Reporter over the process-wide tracker.
pub type GlobalReporter<'a> = Reporter<'a, BacktraceCapturer, NoCollector, LiveMemory>;

static CONFIG: OnceCell<ProfilerConfig> = OnceCell::new();

static TRACKER: Lazy<Mutex<Tracker>> = Lazy::new(|| Mutex::new(Tracker::new(config())));

thread_local! {
    // Set while this thread is inside the profiler.  Allocations made in
    // that window go straight to the system allocator.
    static NESTED: Cell<bool> = Cell::new(false);

    // The next allocation on this thread holds no references.
    static PENDING_LEAF: Cell<bool> = Cell::new(false);

    // Type of the next allocation on this thread.
    static PENDING_TYPE: Cell<Option<TypeId>> = Cell::new(None);
}

struct Unnest<'a>(&'a Cell<bool>);

impl Drop for Unnest<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

fn lock_tracker() -> MutexGuard<'static, Tracker> {
    // A panic while holding the lock leaves the table consistent: every
    // mutation is a single insert or remove.
    TRACKER.lock().unwrap_or_else(|e| e.into_inner())
}

fn config() -> &'static ProfilerConfig {
    CONFIG.get_or_init(ProfilerConfig::default)
}

// Runs `f` with this thread marked as inside the profiler, unless it already
// is or its TLS is being torn down.
fn nested<R>(f: impl FnOnce() -> R) -> Option<R> {
    NESTED
        .try_with(|nested| {
            if nested.replace(true) {
                return None;
            }
            let _unnest = Unnest(nested);
            Some(f())
        })
        .ok()
        .flatten()
}

fn with_tracker<R>(f: impl FnOnce(&Tracker) -> R) -> Option<R> {
    nested(|| f(&lock_tracker()))
}

// Never called under the tracker lock: `backtrace` walks and resolves under
// a lock of its own, and its holder may be allocating.
fn capture_stack(skip: usize) -> StackKey {
    BacktraceCapturer.capture(skip, config().stack_depth)
}

fn report<R>(tracker: &Tracker, f: impl FnOnce(&GlobalReporter<'_>) -> R) -> R {
    // SAFETY: every tracked allocation is live, and no thread can free
    // one while we hold the tracker lock, since `dealloc` untracks
    // before returning memory to the system.
    let memory = unsafe { LiveMemory::new() };
    f(&Reporter::new(tracker, &NoCollector, &memory))
}

/// Sets the configuration used by the global tracker.  Only effective
/// before the first tracked allocation; returns `false` otherwise.
pub fn configure(config: ProfilerConfig) -> bool {
    CONFIG.set(config).is_ok()
}

/// Announces the type of the next allocation made on this thread.
pub fn announce_type(type_id: TypeId, name: &str, fields: Option<&FieldMap>) {
    with_tracker(|tracker| tracker.register_type(type_id, name, fields));
    let _ = PENDING_TYPE.try_with(|pending| pending.set(Some(type_id)));
}

/// Marks the next allocation made on this thread as pointer-free.
pub fn announce_leaf() {
    let _ = PENDING_LEAF.try_with(|leaf| leaf.set(true));
}

/// Runs `f` with a reporter over the global tracker.  Allocation hooks on
/// other threads block until `f` returns, so `f` must not capture or
/// symbolize stacks through `backtrace`.  Returns `None` when called from
/// inside the profiler itself.
pub fn with_reporter<R>(f: impl FnOnce(&GlobalReporter<'_>) -> R) -> Option<R> {
    with_tracker(|tracker| report(tracker, f))
}

/// Captures a snapshot of the global heap and writes it under `dir`.
pub fn dump_snapshot(dir: &Path) -> Option<Result<PathBuf>> {
    nested(|| {
        let origin = capture_stack(config().other_skip_frames);
        let mut snapshot = report(&lock_tracker(), |reporter| HeapSnapshot::collect(reporter));
        snapshot.origin = origin;
        snapshot.resolve_symbols(&BacktraceSymbolizer);
        snapshot.dump(dir)
    })
}

/// Allocator that records every live allocation in the global tracker.
/// Use the `global_allocator` attribute to enable it:
///
/// ```
/// use heap_reach::ProfAllocator;
///
/// #[global_allocator]
/// static GLOBAL: ProfAllocator = ProfAllocator;
///
/// fn main() {}
/// ```
pub struct ProfAllocator;

impl ProfAllocator {
    /// Allocation hook.  Returns `address` unchanged.
    pub fn on_allocate(address: usize, size: usize) -> usize {
        nested(|| {
            let leaf = PENDING_LEAF.try_with(|leaf| leaf.replace(false)).unwrap_or(false);
            let type_id = PENDING_TYPE
                .try_with(|pending| pending.take())
                .ok()
                .flatten()
                .unwrap_or(UNKNOWN_TYPE);
            let stack = capture_stack(config().alloc_skip_frames);
            lock_tracker().track_record(AllocationRecord {
                address,
                size,
                stack,
                type_id,
                leaf,
            })
        });
        address
    }

    /// Deallocation hook.  Returns whether the allocation was a leaf, or
    /// `None` if it was not tracked.
    pub fn on_deallocate(address: usize) -> Option<bool> {
        with_tracker(|tracker| tracker.untrack(address)).flatten()
    }

    // Takes the record of a block about to be reallocated.
    fn on_reallocate_start(address: usize) -> Option<AllocationRecord> {
        with_tracker(|tracker| tracker.remove(address)).flatten()
    }

    // Tracks the outcome of a reallocation.  `moved` is the new block, or
    // `None` if the old block is still live with its old record.  The site,
    // type and leaf classification carry over.
    fn on_reallocate_end(old: Option<AllocationRecord>, moved: Option<(usize, usize)>) {
        match (old, moved) {
            (Some(record), Some((address, size))) => {
                with_tracker(|tracker| {
                    tracker.track_record(AllocationRecord {
                        address,
                        size,
                        ..record
                    })
                });
            }
            (Some(record), None) => {
                with_tracker(|tracker| tracker.track_record(record));
            }
            (None, Some((address, size))) => {
                nested(|| {
                    let stack = capture_stack(config().alloc_skip_frames);
                    lock_tracker().track_record(AllocationRecord {
                        address,
                        size,
                        stack,
                        type_id: UNKNOWN_TYPE,
                        leaf: false,
                    })
                });
            }
            (None, None) => {}
        }
    }

    /// A replacement `malloc()` that records each allocation.
    /// When loaded via `LD_PRELOAD`, [`lib_heap_reach`] redirects `malloc`
    /// calls here.
    ///
    /// # Safety
    ///
    /// Same contract as `libc::malloc`.
    pub unsafe fn malloc(size: libc::size_t) -> *mut c_void {
        let res = (REAL.malloc)(size);
        if !res.is_null() {
            Self::on_allocate(res as usize, size);
        }
        res
    }

    /// # Safety
    ///
    /// Same contract as `libc::calloc`.
    pub unsafe fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
        let res = (REAL.calloc)(nmemb, size);
        if !res.is_null() {
            Self::on_allocate(res as usize, nmemb.saturating_mul(size));
        }
        res
    }

    /// # Safety
    ///
    /// Same contract as `libc::realloc`.
    pub unsafe fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
        if ptr.is_null() {
            return Self::malloc(size);
        }
        let old = Self::on_reallocate_start(ptr as usize);
        let res = (REAL.realloc)(ptr, size);
        if !res.is_null() {
            Self::on_reallocate_end(old, Some((res as usize, size)));
        } else if size != 0 {
            // Failed; `ptr` is untouched.
            Self::on_reallocate_end(old, None);
        }
        // A null result for size 0 means `ptr` was freed.
        res
    }

    /// # Safety
    ///
    /// Same contract as `libc::free`.
    pub unsafe fn free(ptr: *mut c_void) {
        if !ptr.is_null() {
            Self::on_deallocate(ptr as usize);
        }
        (REAL.free)(ptr)
    }
}

type MallocFunc = unsafe extern "C" fn(size: libc::size_t) -> *mut c_void;
type CallocFunc = unsafe extern "C" fn(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void;
type ReallocFunc = unsafe extern "C" fn(ptr: *mut c_void, size: libc::size_t) -> *mut c_void;
type FreeFunc = unsafe extern "C" fn(ptr: *mut c_void);

struct RealFuncs {
    malloc: MallocFunc,
    calloc: CallocFunc,
    realloc: ReallocFunc,
    free: FreeFunc,
}

unsafe fn real_symbol(name: &[u8]) -> *mut c_void {
    let sym = dlsym(RTLD_NEXT, name.as_ptr() as *const c_char);
    if sym.is_null() {
        panic!("heap_reach: couldn't find original {}", String::from_utf8_lossy(name));
    }
    sym
}

static REAL: Lazy<RealFuncs> = Lazy::new(|| unsafe {
    RealFuncs {
        malloc: std::mem::transmute::<*mut c_void, MallocFunc>(real_symbol(b"malloc\0")),
        calloc: std::mem::transmute::<*mut c_void, CallocFunc>(real_symbol(b"calloc\0")),
        realloc: std::mem::transmute::<*mut c_void, ReallocFunc>(real_symbol(b"realloc\0")),
        free: std::mem::transmute::<*mut c_void, FreeFunc>(real_symbol(b"free\0")),
    }
});

unsafe impl GlobalAlloc for ProfAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let res = System.alloc(layout);
        if !res.is_null() {
            Self::on_allocate(res as usize, layout.size());
        }
        res
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let res = System.alloc_zeroed(layout);
        if !res.is_null() {
            Self::on_allocate(res as usize, layout.size());
        }
        res
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        Self::on_deallocate(ptr as usize);
        System.dealloc(ptr, layout);
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let old = Self::on_reallocate_start(ptr as usize);
        let res = System.realloc(ptr, layout, new_size);
        let moved = if res.is_null() {
            None
        } else {
            Some((res as usize, new_size))
        };
        Self::on_reallocate_end(old, moved);
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::WORD;
    use std::thread::spawn;

    #[global_allocator]
    static GLOBAL: ProfAllocator = ProfAllocator;

    fn tracked(address: usize) -> Option<(usize, bool, TypeId)> {
        with_tracker(|t| t.get(address).map(|r| (r.size, r.leaf, r.type_id))).flatten()
    }

    #[test]
    fn alloc_vectors() {
        let mut thread_handles = vec![];
        for _ in 0..10 {
            let thread = spawn(|| {
                let v = vec![1u64, 2, 3];
                let b = Box::new(true);
                assert_eq!(tracked(v.as_ptr() as usize).map(|r| r.0), Some(24));
                assert_eq!(tracked(&*b as *const bool as usize).map(|r| r.0), Some(1));
            });
            thread_handles.push(thread);
        }
        for t in thread_handles.drain(..) {
            t.join().unwrap();
        }
    }

    #[test]
    fn deallocate_untracks_and_tolerates_unknown_addresses() {
        // Never a real heap address, so no other test can collide with it.
        assert_eq!(ProfAllocator::on_allocate(0x10, 8), 0x10);
        assert_eq!(tracked(0x10), Some((8, false, 0)));
        assert_eq!(ProfAllocator::on_deallocate(0x10), Some(false));
        assert_eq!(ProfAllocator::on_deallocate(0x10), None);
        assert_eq!(ProfAllocator::on_deallocate(0x18), None);
    }

    #[test]
    fn realloc_keeps_leaf_classification() {
        announce_leaf();
        let mut v: Vec<u8> = Vec::with_capacity(8);
        assert_eq!(tracked(v.as_ptr() as usize).map(|r| r.1), Some(true));
        v.reserve(4096);
        assert_eq!(tracked(v.as_ptr() as usize), Some((v.capacity(), true, 0)));
    }

    #[test]
    fn c_realloc_tracks_only_live_blocks() {
        unsafe {
            let p = ProfAllocator::malloc(64);
            assert!(!p.is_null());
            assert_eq!(tracked(p as usize).map(|r| r.0), Some(64));

            // A failed realloc leaves the block and its record alone.
            assert!(ProfAllocator::realloc(p, usize::MAX).is_null());
            assert_eq!(tracked(p as usize).map(|r| r.0), Some(64));

            let q = ProfAllocator::realloc(p, 0);
            if q.is_null() {
                assert_eq!(tracked(p as usize), None);
            } else {
                assert_eq!(tracked(q as usize).map(|r| r.0), Some(0));
                ProfAllocator::free(q);
                assert_eq!(tracked(q as usize), None);
            }
        }
    }

    #[test]
    fn realloc_keeps_the_announced_type() {
        const BUF: TypeId = 0xb0f;
        announce_type(BUF, "Buf", None);
        let mut v: Vec<u64> = Vec::with_capacity(2);
        assert_eq!(tracked(v.as_ptr() as usize).map(|r| r.2), Some(BUF));
        v.reserve(1024);
        assert_eq!(tracked(v.as_ptr() as usize).map(|r| r.2), Some(BUF));
        let name = with_reporter(|r| r.tracker().with_table(|_, reg| reg.name(BUF).to_string()));
        assert_eq!(name.as_deref(), Some("Buf"));
    }

    #[test]
    fn type_announced_inside_the_profiler_is_not_renamed() {
        const LATE: TypeId = 0x1a7e;
        // Registration is skipped while nested; the allocation still gets
        // the id, and a later announcement supplies the name.
        with_reporter(|_| announce_type(LATE, "Late", None));
        let b = Box::new(1u32);
        assert_eq!(tracked(&*b as *const u32 as usize).map(|r| r.2), Some(LATE));
        announce_type(LATE, "Late", None);
        let name = with_reporter(|r| r.tracker().with_table(|_, reg| reg.name(LATE).to_string()));
        assert_eq!(name.as_deref(), Some("Late"));
        let _ = PENDING_TYPE.with(|pending| pending.take());
    }

    #[test]
    fn allocating_inside_backtrace_does_not_deadlock() {
        let (done, finished) = std::sync::mpsc::channel();
        for _ in 0..4 {
            let done = done.clone();
            spawn(move || {
                for _ in 0..50 {
                    backtrace::trace(|_| {
                        let v = vec![0u8; 32];
                        v.len() == 32
                    });
                    let _b = Box::new([0u64; 4]);
                    let _ = with_reporter(|r| r.by_allocation_site(0).len());
                }
                let _ = done.send(());
            });
        }
        drop(done);
        for _ in 0..4 {
            finished
                .recv_timeout(std::time::Duration::from_secs(60))
                .expect("allocating threads stalled");
        }
    }

    #[test]
    fn dump_snapshot_writes_a_loadable_file() {
        let dir = tempfile::tempdir().unwrap();
        let _b = Box::new([1u64; 8]);
        let path = dump_snapshot(dir.path()).unwrap().unwrap();
        let snapshot = HeapSnapshot::load(&path).unwrap();
        assert!(!snapshot.sites.is_empty());
        assert!(path.to_string_lossy().contains("snapshot."));
    }

    #[test]
    fn typed_allocations_and_retained_size() {
        const NODE: TypeId = 0x4e0d;
        announce_leaf();
        let child = Box::new([7u64; 4]);
        let mut fields = FieldMap::new();
        fields.insert(0, "child".to_string());
        announce_type(NODE, "Node", Some(&fields));
        let parent = Box::new([&*child as *const [u64; 4] as usize, 0usize]);
        let address = &*parent as *const [usize; 2] as usize;

        assert_eq!(tracked(address).map(|r| r.2), Some(NODE));
        let retained = with_reporter(|r| r.retained_size(address)).unwrap().unwrap();
        assert_eq!(retained, 2 * WORD + 32);

        let counts = with_reporter(|r| r.by_type()).unwrap();
        assert!(counts.iter().any(|row| row.type_id == NODE && row.count == 1));
        drop(parent);
        let counts = with_reporter(|r| r.by_type()).unwrap();
        assert!(!counts.iter().any(|row| row.type_id == NODE));
        drop(child);
    }

    #[test]
    fn reporter_is_unavailable_from_inside_the_profiler() {
        let nested = with_reporter(|_| with_reporter(|_| ()));
        assert_eq!(nested, Some(None));
    }
}
