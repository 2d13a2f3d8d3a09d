//! Escalation from a minor collection to the global collector.

use crate::chunk::ChunkDirectory;
use crate::gc::roots::RootSet;
use crate::heap::VProcHeap;
use crate::vproc::VProcHandle;

/// Everything a major collector gets from the minor collection that
/// escalated to it.
#[derive(Debug)]
pub struct MajorGcRequest<'a> {
    /// The escalating vproc.
    pub vproc: &'a VProcHandle,
    /// Its heap. Survivors of the minor collection sit in
    /// `[heap.old_top(), scan_top)`; `old_top` is still where it was before
    /// the minor collection.
    pub heap: &'a mut VProcHeap,
    /// The same roots the minor collection used, plus any global ones.
    pub roots: &'a mut RootSet,
    /// End of the objects the minor collection copied.
    pub scan_top: usize,
    /// The runtime-wide chunk directory.
    pub chunks: &'a ChunkDirectory,
}

/// A global collector that a vproc hands its heap to when local space runs low.
///
/// The minor collection leaves the vproc's bookkeeping to the implementor:
/// `major_collect` must set the heap's old-space top to the end of whatever
/// it keeps, and clear the vproc's pending global collection if it served one.
pub trait MajorCollector {
    /// Collects the escalating vproc's old space.
    fn major_collect(&mut self, request: MajorGcRequest<'_>);
}

/// Leaves every survivor where it is.
///
/// This is enough for a vproc whose old space never needs compaction; heap
/// exhaustion is then detected when the next nursery cannot be carved.
#[derive(Debug, Default, Clone, Copy)]
pub struct InPlaceMajorCollector {
    collections: usize,
}

impl InPlaceMajorCollector {
    /// A fresh collector.
    #[must_use]
    pub const fn new() -> Self {
        Self { collections: 0 }
    }

    /// Number of escalations served.
    #[must_use]
    pub const fn collections(&self) -> usize {
        self.collections
    }
}

impl MajorCollector for InPlaceMajorCollector {
    fn major_collect(&mut self, request: MajorGcRequest<'_>) {
        self.collections += 1;
        request.heap.set_old_top(request.scan_top);
        request.vproc.clear_global_gc_pending();
    }
}

impl<T: MajorCollector + ?Sized> MajorCollector for &mut T {
    fn major_collect(&mut self, request: MajorGcRequest<'_>) {
        (**self).major_collect(request);
    }
}
