//! Word-level access to heap contents for reference scans.

use std::{collections::BTreeMap, mem::size_of};

use byteorder::{ByteOrder, NativeEndian};

/// Size and alignment of a scanned reference slot.
pub const WORD: usize = size_of::<usize>();

/// Reads pointer-sized words out of the heap.
pub trait HeapMemory {
    /// Word stored at the aligned address `address`, or `None` if that
    /// memory cannot be read.
    fn read_word(&self, address: usize) -> Option<usize>;
}

/// Reads the memory of the current process directly.
#[derive(Debug)]
pub struct LiveMemory {
    _private: (),
}

impl LiveMemory {
    /// # Safety
    ///
    /// Scans only touch the byte ranges of tracked allocations.  The caller
    /// must guarantee that every tracked allocation is live and mapped, and
    /// that no mutator frees memory while the returned reader is used,
    /// i.e. the world is stopped.
    pub unsafe fn new() -> Self {
        LiveMemory { _private: () }
    }
}

impl HeapMemory for LiveMemory {
    fn read_word(&self, address: usize) -> Option<usize> {
        if address % WORD != 0 || address == 0 {
            return None;
        }
        // SAFETY: aligned, non-null and inside a live tracked allocation per
        // the contract of `LiveMemory::new`.  Volatile, since the compiler
        // knows nothing about who wrote the word.
        Some(unsafe { std::ptr::read_volatile(address as *const usize) })
    }
}

/// A copy of heap regions, for analysing memory images outside the process
/// that produced them, and for tests.
#[derive(Clone, Debug, Default)]
pub struct ByteHeap {
    regions: BTreeMap<usize, Vec<u8>>,
}

impl ByteHeap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a zero-filled region `[base, base + size)`.
    pub fn map(&mut self, base: usize, size: usize) {
        self.regions.insert(base, vec![0; size]);
    }

    pub fn unmap(&mut self, base: usize) {
        self.regions.remove(&base);
    }

    fn region_mut(&mut self, address: usize) -> Option<(usize, &mut Vec<u8>)> {
        let (base, bytes) = self.regions.range_mut(..=address).next_back()?;
        Some((*base, bytes))
    }

    /// Stores `value` at `address`; returns `false` if the word does not lie
    /// inside a mapped region.
    pub fn write_word(&mut self, address: usize, value: usize) -> bool {
        match self.region_mut(address) {
            Some((base, bytes)) if address - base + WORD <= bytes.len() => {
                let off = address - base;
                NativeEndian::write_uint(&mut bytes[off..off + WORD], value as u64, WORD);
                true
            }
            _ => false,
        }
    }
}

impl HeapMemory for ByteHeap {
    fn read_word(&self, address: usize) -> Option<usize> {
        let (base, bytes) = self.regions.range(..=address).next_back()?;
        let off = address - base;
        if off + WORD > bytes.len() {
            return None;
        }
        Some(NativeEndian::read_uint(&bytes[off..off + WORD], WORD) as usize)
    }
}
