//! Companion crate to [`heap_reach`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the allocator calls issued by the program and record
//! them in the `heap_reach` live allocation table.

use heap_reach::ProfAllocator;
use libc::c_void;

/// Records the allocation before handing the block to the program.
///
/// # Safety
///
/// Same contract as [`libc::malloc`].
#[no_mangle]
pub unsafe extern "C" fn malloc(size: libc::size_t) -> *mut c_void {
    ProfAllocator::malloc(size)
}

/// # Safety
///
/// Same contract as [`libc::calloc`].
#[no_mangle]
pub unsafe extern "C" fn calloc(nmemb: libc::size_t, size: libc::size_t) -> *mut c_void {
    ProfAllocator::calloc(nmemb, size)
}

/// Moves the allocation record to the new block, keeping its leaf classification.
///
/// # Safety
///
/// Same contract as [`libc::realloc`].
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: libc::size_t) -> *mut c_void {
    ProfAllocator::realloc(ptr, size)
}

/// Forgets the allocation; addresses allocated before the library was loaded are ignored.
///
/// # Safety
///
/// Same contract as [`libc::free`].
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    ProfAllocator::free(ptr)
}
