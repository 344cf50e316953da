//! Host runtime capabilities needed to take a consistent heap snapshot.

use tracing::debug;

/// Pauses every other mutator thread of the host.
pub trait MutatorPauser {
    fn pause(&self);
    fn resume(&self);
}

/// Controls the host's garbage collector.
pub trait CollectorControl {
    /// Runs a full collection pass.
    fn collect(&self);
    fn enable(&self);
    fn disable(&self);
}

/// Host without a collector and with its own allocator serialization, such
/// as a Rust program using [`crate::ProfAllocator`].
#[derive(Clone, Copy, Debug, Default)]
pub struct NoCollector;

impl MutatorPauser for NoCollector {
    fn pause(&self) {}
    fn resume(&self) {}
}

impl CollectorControl for NoCollector {
    fn collect(&self) {}
    fn enable(&self) {}
    fn disable(&self) {}
}

/// A stopped world: collection done, collector disabled, mutators paused.
/// Everything is undone in reverse order when the guard drops.
#[must_use]
pub struct StoppedWorld<'a, P: MutatorPauser + ?Sized, C: CollectorControl + ?Sized> {
    pauser: &'a P,
    collector: &'a C,
}

impl<'a, P: MutatorPauser + ?Sized, C: CollectorControl + ?Sized> StoppedWorld<'a, P, C> {
    pub fn enter(pauser: &'a P, collector: &'a C) -> Self {
        collector.collect();
        collector.disable();
        pauser.pause();
        debug!("world stopped");
        StoppedWorld { pauser, collector }
    }
}

impl<P: MutatorPauser + ?Sized, C: CollectorControl + ?Sized> Drop for StoppedWorld<'_, P, C> {
    fn drop(&mut self) {
        self.pauser.resume();
        self.collector.enable();
        debug!("world resumed");
    }
}
