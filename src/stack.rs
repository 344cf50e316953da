//! Allocation-site call stacks.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fixed-length tuple of instruction addresses identifying an allocation
/// site.  Stacks shallower than the capture depth are zero-padded.
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct StackKey(Vec<usize>);

impl StackKey {
    /// Builds a key of exactly `depth` entries from `frames`, truncating or
    /// zero-padding as needed.
    pub fn new(frames: &[usize], depth: usize) -> Self {
        let mut key = vec![0; depth];
        let n = frames.len().min(depth);
        key[..n].copy_from_slice(&frames[..n]);
        StackKey(key)
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    /// All entries, including zero padding.
    pub fn entries(&self) -> &[usize] {
        &self.0
    }

    /// Captured frames without the zero padding.
    pub fn frames(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied().take_while(|ip| *ip != 0)
    }
}

impl fmt::Display for StackKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for ip in self.frames() {
            if !first {
                f.write_str(" <- ")?;
            }
            write!(f, "{:#x}", ip)?;
            first = false;
        }
        Ok(())
    }
}

/// Capability producing the current call stack.
pub trait StackCapturer {
    /// Captures up to `depth` frames, skipping the innermost `skip` frames.
    /// The result always has exactly `depth` entries.
    fn capture(&self, skip: usize, depth: usize) -> StackKey;
}

/// Walks the stack with [`backtrace::trace`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BacktraceCapturer;

impl StackCapturer for BacktraceCapturer {
    fn capture(&self, skip: usize, depth: usize) -> StackKey {
        let mut frames = vec![0; depth];
        let mut skipped = 0;
        let mut n = 0;
        if depth == 0 {
            return StackKey(frames);
        }
        backtrace::trace(|frame| {
            if skipped < skip {
                skipped += 1;
                return true;
            }
            frames[n] = frame.ip() as usize;
            n += 1;
            n < depth
        });
        StackKey(frames)
    }
}
