//! Retained-size computation over the live table.
//!
//! Multi-root breadth-first search.  `reached` accumulates the byte ranges
//! of every non-leaf allocation found so far; each step scans the current
//! frontier for words equal to the start address of a tracked allocation.
//! Leaf allocations are never scanned and go straight into a byte total.
//!
//! Only pointer-aligned, pointer-sized words are considered.  Misaligned
//! or tagged references are invisible to the scan, so retained sizes are a
//! lower bound of what a precise scan would report.

use std::collections::BTreeMap;

use rustc_hash::FxHashSet;

use crate::{
    interval_set::{Interval, IntervalSet},
    memory::{HeapMemory, WORD},
    tracker::{AllocationRecord, LiveTable},
    types::{TypeId, UNKNOWN_TYPE},
};

/// Calls `f(slot_address, value)` for every aligned word that lies wholly
/// inside `iv`.
pub(crate) fn scan_words<M, F>(memory: &M, iv: Interval, mut f: F)
where
    M: HeapMemory + ?Sized,
    F: FnMut(usize, usize),
{
    let mut slot = match iv.lo().checked_add(WORD - 1) {
        Some(x) => x / WORD * WORD,
        None => return,
    };
    loop {
        let last = match slot.checked_add(WORD - 1) {
            Some(last) if last <= iv.hi() => last,
            _ => return,
        };
        if let Some(value) = memory.read_word(slot) {
            f(slot, value);
        }
        if last == usize::MAX {
            return;
        }
        slot += WORD;
    }
}

/// Byte range of an allocation, or `None` if it is empty.
pub(crate) fn extent(record: &AllocationRecord) -> Option<Interval> {
    if record.size == 0 {
        None
    } else {
        Some(Interval::spanning(record.address, record.size))
    }
}

pub struct Reachability<'a, M: HeapMemory + ?Sized> {
    table: &'a LiveTable,
    memory: &'a M,
}

// Search state shared by all roots of one query.
#[derive(Default)]
struct Search {
    reached: IntervalSet,
    leaves: FxHashSet<usize>,
    leaf_bytes: usize,
}

impl Search {
    // Records `record` as reached.  Returns its range if it is a non-leaf
    // allocation that still needs scanning.
    fn visit(&mut self, record: &AllocationRecord, pending: &IntervalSet) -> Option<Interval> {
        if record.leaf {
            if self.leaves.insert(record.address) {
                self.leaf_bytes = self.leaf_bytes.saturating_add(record.size);
            }
            return None;
        }
        if self.reached.contains(record.address) || pending.contains(record.address) {
            return None;
        }
        extent(record)
    }
}

impl<'a, M: HeapMemory + ?Sized> Reachability<'a, M> {
    pub fn new(table: &'a LiveTable, memory: &'a M) -> Self {
        Reachability { table, memory }
    }

    /// Distinct bytes transitively reachable from `roots`, counting each
    /// byte once.  Addresses that are not tracked are ignored.
    pub fn retained_size<I: IntoIterator<Item = usize>>(&self, roots: I) -> usize {
        let mut search = Search::default();
        let mut seeds = IntervalSet::new();
        for root in roots {
            if let Some(record) = self.table.get(&root) {
                if let Some(range) = search.visit(record, &seeds) {
                    seeds.insert(range);
                }
            }
        }
        search.reached.union(&seeds);

        let mut frontier = seeds;
        while !frontier.is_empty() {
            let mut next = IntervalSet::new();
            for iv in frontier.iter() {
                scan_words(self.memory, *iv, |_, value| {
                    if let Some(target) = self.table.get(&value) {
                        if let Some(range) = search.visit(target, &next) {
                            next.insert(range);
                        }
                    }
                });
            }
            next.subtract(&search.reached);
            search.reached.union(&next);
            frontier = next;
        }

        search.reached.size().saturating_add(search.leaf_bytes)
    }

    /// Retained size of a single allocation, or `None` if it is not tracked.
    pub fn retained_size_of(&self, address: usize) -> Option<usize> {
        if self.table.contains_key(&address) {
            Some(self.retained_size(std::iter::once(address)))
        } else {
            None
        }
    }

    /// Retained size of every known type, seeded with all of the type's live
    /// allocations in ascending address order.
    pub fn retained_by_type(&self) -> BTreeMap<TypeId, usize> {
        let mut roots: BTreeMap<TypeId, Vec<usize>> = BTreeMap::new();
        for record in self.table.values() {
            if record.type_id != UNKNOWN_TYPE {
                roots.entry(record.type_id).or_default().push(record.address);
            }
        }
        roots
            .into_iter()
            .map(|(type_id, mut addresses)| {
                addresses.sort_unstable();
                (type_id, self.retained_size(addresses))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{memory::ByteHeap, stack::StackKey};

    struct Heap {
        table: LiveTable,
        memory: ByteHeap,
    }

    impl Heap {
        fn new() -> Self {
            Heap {
                table: LiveTable::default(),
                memory: ByteHeap::new(),
            }
        }

        fn alloc(&mut self, address: usize, size: usize, leaf: bool, type_id: TypeId) {
            self.memory.map(address, size);
            self.table.insert(
                address,
                AllocationRecord {
                    address,
                    size,
                    stack: StackKey::default(),
                    type_id,
                    leaf,
                },
            );
        }

        fn free(&mut self, address: usize) {
            self.table.remove(&address);
        }

        fn point(&mut self, from: usize, slot: usize, to: usize) {
            assert!(self.memory.write_word(from + slot * WORD, to));
        }

        fn retained(&self, roots: &[usize]) -> usize {
            Reachability::new(&self.table, &self.memory).retained_size(roots.iter().copied())
        }
    }

    #[test]
    fn root_with_leaf_child() {
        let mut heap = Heap::new();
        heap.alloc(0x1000, 48, false, 0);
        heap.alloc(0x2000, 16, true, 0);
        heap.point(0x1000, 1, 0x2000);
        assert_eq!(heap.retained(&[0x1000]), 64);
        heap.free(0x2000);
        assert_eq!(heap.retained(&[0x1000]), 48);
    }

    #[test]
    fn shared_child_counted_once() {
        let mut heap = Heap::new();
        heap.alloc(0x1000, 32, false, 0);
        heap.alloc(0x2000, 32, false, 0);
        heap.alloc(0x3000, 64, false, 0);
        heap.alloc(0x4000, 8, true, 0);
        heap.point(0x1000, 0, 0x3000);
        heap.point(0x2000, 3, 0x3000);
        heap.point(0x3000, 2, 0x4000);
        heap.point(0x1000, 1, 0x4000);
        assert_eq!(heap.retained(&[0x1000]), 32 + 64 + 8);
        assert_eq!(heap.retained(&[0x2000]), 32 + 64 + 8);
        assert_eq!(heap.retained(&[0x1000, 0x2000]), 32 + 32 + 64 + 8);
    }

    #[test]
    fn cycles_terminate() {
        let mut heap = Heap::new();
        heap.alloc(0x1000, 24, false, 0);
        heap.alloc(0x2000, 40, false, 0);
        heap.point(0x1000, 0, 0x2000);
        heap.point(0x2000, 4, 0x1000);
        assert_eq!(heap.retained(&[0x1000]), 64);
        assert_eq!(heap.retained(&[0x2000, 0x1000]), 64);
    }

    #[test]
    fn leaves_are_not_scanned() {
        let mut heap = Heap::new();
        heap.alloc(0x1000, 16, true, 0);
        heap.alloc(0x2000, 16, false, 0);
        heap.point(0x1000, 0, 0x2000);
        assert_eq!(heap.retained(&[0x1000]), 16);
    }

    #[test]
    fn misaligned_and_interior_pointers_are_invisible() {
        let mut heap = Heap::new();
        heap.alloc(0x1000, 4 * WORD, false, 0);
        heap.alloc(0x2000, 16, true, 0);
        heap.alloc(0x3000, 16, true, 0);
        // Interior pointer into 0x2000 does not retain it.
        heap.point(0x1000, 0, 0x2008);
        // A reference straddling two words is not seen either.
        let bytes = (0x3000usize).to_ne_bytes();
        let split = WORD / 2;
        let mut lo = [0u8; WORD];
        let mut hi = [0u8; WORD];
        lo[split..].copy_from_slice(&bytes[..WORD - split]);
        hi[..split].copy_from_slice(&bytes[WORD - split..]);
        heap.memory
            .write_word(0x1000 + WORD, usize::from_ne_bytes(lo));
        heap.memory
            .write_word(0x1000 + 2 * WORD, usize::from_ne_bytes(hi));
        assert_eq!(heap.retained(&[0x1000]), 4 * WORD);
    }

    #[test]
    fn untracked_roots_are_ignored() {
        let mut heap = Heap::new();
        heap.alloc(0x1000, 8, false, 0);
        assert_eq!(heap.retained(&[0x5000]), 0);
        let reach = Reachability::new(&heap.table, &heap.memory);
        assert_eq!(reach.retained_size_of(0x5000), None);
        assert_eq!(reach.retained_size_of(0x1000), Some(8));
    }

    #[test]
    fn per_type_totals() {
        let mut heap = Heap::new();
        heap.alloc(0x1000, 32, false, 1);
        heap.alloc(0x2000, 32, false, 1);
        heap.alloc(0x3000, 16, true, 2);
        heap.alloc(0x4000, 100, true, 0);
        heap.point(0x1000, 0, 0x3000);
        heap.point(0x2000, 0, 0x3000);
        heap.point(0x2000, 1, 0x4000);
        let by_type = Reachability::new(&heap.table, &heap.memory).retained_by_type();
        assert_eq!(by_type.get(&1), Some(&(32 + 32 + 16 + 100)));
        assert_eq!(by_type.get(&2), Some(&16));
        assert_eq!(by_type.get(&0), None);
    }

    #[test]
    fn scan_stops_at_address_space_end() {
        let mut seen = Vec::new();
        let memory = ByteHeap::new();
        scan_words(&memory, Interval::new(usize::MAX - 2 * WORD + 1, usize::MAX), |slot, _| {
            seen.push(slot)
        });
        assert!(seen.is_empty());
        let mut heap = ByteHeap::new();
        heap.map(0x100, 3 * WORD + 3);
        let mut slots = Vec::new();
        scan_words(&heap, Interval::new(0x101, 0x100 + 3 * WORD + 2), |slot, _| {
            slots.push(slot)
        });
        assert_eq!(slots, vec![0x100 + WORD, 0x100 + 2 * WORD]);
    }
}
