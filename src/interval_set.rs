//! Coalesced sets of closed address ranges.
//!
//! An [`IntervalSet`] keeps its ranges sorted and in canonical form: every
//! stored interval has `lo <= hi`, and two neighbours never overlap or touch
//! (`hi_i + 1 < lo_{i+1}`).  Touching ranges are merged on insertion.

use std::fmt;

/// Closed range `[lo, hi]` with `lo <= hi`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Interval {
    lo: usize,
    hi: usize,
}

impl Interval {
    /// Panics if `lo > hi`.
    pub fn new(lo: usize, hi: usize) -> Self {
        assert!(lo <= hi, "inverted interval [{:#x}, {:#x}]", lo, hi);
        Interval { lo, hi }
    }

    /// Range starting at `lo` spanning `count` units, saturating at
    /// `usize::MAX`.  `count` must be non-zero.
    pub fn spanning(lo: usize, count: usize) -> Self {
        assert!(count > 0, "empty interval at {:#x}", lo);
        Interval {
            lo,
            hi: lo.saturating_add(count - 1),
        }
    }

    pub fn lo(&self) -> usize {
        self.lo
    }

    pub fn hi(&self) -> usize {
        self.hi
    }

    /// Number of units covered.  Saturates for the full address space.
    pub fn len(&self) -> usize {
        (self.hi - self.lo).saturating_add(1)
    }

    pub fn contains(&self, x: usize) -> bool {
        self.lo <= x && x <= self.hi
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}, {:#x}]", self.lo, self.hi)
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
}

impl IntervalSet {
    pub fn new() -> Self {
        Self::default()
    }

    // Index of the first interval that could merge with a range starting at
    // `lo`, i.e. the first one whose `hi + 1 >= lo`.
    fn first_touching(&self, lo: usize) -> usize {
        self.intervals
            .partition_point(|iv| iv.hi.saturating_add(1) < lo)
    }

    /// Inserts `[lo, lo + count - 1]`, merging with overlapping or adjacent
    /// intervals.  A zero `count` is a no-op.
    pub fn add(&mut self, lo: usize, count: usize) {
        if count == 0 {
            return;
        }
        self.insert(Interval::spanning(lo, count));
    }

    pub fn insert(&mut self, new: Interval) {
        let start = self.first_touching(new.lo);
        let mut end = start;
        let mut merged = new;
        // Absorb every interval that overlaps or touches `merged`.
        while end < self.intervals.len() && self.intervals[end].lo <= merged.hi.saturating_add(1) {
            merged.lo = merged.lo.min(self.intervals[end].lo);
            merged.hi = merged.hi.max(self.intervals[end].hi);
            end += 1;
        }
        self.intervals.splice(start..end, std::iter::once(merged));
    }

    /// Removes `[lo, lo + count - 1]`, splitting overlapped intervals into
    /// zero, one or two fragments.
    pub fn delete(&mut self, lo: usize, count: usize) {
        if count == 0 {
            return;
        }
        self.remove(Interval::spanning(lo, count));
    }

    pub fn remove(&mut self, gone: Interval) {
        let start = self.intervals.partition_point(|iv| iv.hi < gone.lo);
        let mut end = start;
        while end < self.intervals.len() && self.intervals[end].lo <= gone.hi {
            end += 1;
        }
        if start == end {
            return;
        }

        let first = self.intervals[start];
        let last = self.intervals[end - 1];
        let mut fragments = Vec::with_capacity(2);
        if first.lo < gone.lo {
            fragments.push(Interval::new(first.lo, gone.lo - 1));
        }
        if last.hi > gone.hi {
            fragments.push(Interval::new(gone.hi + 1, last.hi));
        }
        self.intervals.splice(start..end, fragments);
    }

    /// Removes every range covered by `other`.
    pub fn subtract(&mut self, other: &IntervalSet) {
        for iv in other.iter() {
            if self.is_empty() {
                break;
            }
            self.remove(*iv);
        }
    }

    /// Adds every range covered by `other`.
    pub fn union(&mut self, other: &IntervalSet) {
        for iv in other.iter() {
            self.insert(*iv);
        }
    }

    pub fn contains(&self, x: usize) -> bool {
        let idx = self.intervals.partition_point(|iv| iv.hi < x);
        self.intervals
            .get(idx)
            .map_or(false, |iv| iv.contains(x))
    }

    /// Total number of units covered.
    pub fn size(&self) -> usize {
        self.intervals
            .iter()
            .fold(0usize, |acc, iv| acc.saturating_add(iv.len()))
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Ascending iteration over the stored intervals.
    pub fn iter(&self) -> std::slice::Iter<'_, Interval> {
        self.intervals.iter()
    }

    pub fn intervals(&self) -> &[Interval] {
        &self.intervals
    }
}

impl<'a> IntoIterator for &'a IntervalSet {
    type Item = &'a Interval;
    type IntoIter = std::slice::Iter<'a, Interval>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
