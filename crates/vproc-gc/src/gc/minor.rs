//! Minor (nursery) collection.
//!
//! Copies everything reachable from one vproc's roots out of its nursery
//! into the old space just above `old_top`, Cheney style: roots are forwarded
//! first, then the copies are scanned in address order until the scan
//! pointer catches up with the copy pointer. Only this vproc's heap and
//! deques are touched.

use std::ptr;
use std::time::Instant;

use crate::error::die;
use crate::gc::major::{MajorCollector, MajorGcRequest};
use crate::header::{is_forward_word, Header, HeaderCell};
use crate::heap::{VProcHeap, WORD_SIZE};
use crate::metrics::{CollectionType, MinorGcMetrics, PhaseTimer};
use crate::tracing::internal as trace;
use crate::value::Value;
use crate::vproc::{GcParts, VProc};

/// Copy state for one collection.
struct Evacuator<'h> {
    heap: &'h mut VProcHeap,
    /// Data address of the next copy; its header goes one word below.
    next_w: usize,
    local_ptrs: usize,
    global_ptrs: usize,
}

impl<'h> Evacuator<'h> {
    fn new(heap: &'h mut VProcHeap) -> Self {
        let next_w = heap.old_top() + WORD_SIZE;
        Self {
            heap,
            next_w,
            local_ptrs: 0,
            global_ptrs: 0,
        }
    }

    /// Forwards `v` if it points into the nursery; other words are returned as is.
    fn forward(&mut self, v: Value) -> Value {
        if !v.is_ptr() {
            return v;
        }
        if self.heap.in_nursery(v.addr()) {
            self.local_ptrs += 1;
            self.forward_obj(v)
        } else {
            self.global_ptrs += 1;
            v
        }
    }

    /// Copies the object at `v` to old space, or returns the existing copy.
    fn forward_obj(&mut self, v: Value) -> Value {
        // SAFETY: `v` is a nursery object, so its header word is in the heap.
        let cell = unsafe { HeaderCell::of_object(v.addr()) };
        let word = cell.load();
        if is_forward_word(word) {
            return Value::from_addr((word >> 3) as usize);
        }
        let words = match Header::decode(word).map(Header::size_words) {
            Ok(Some(words)) => words,
            _ => die(&format!(
                "corrupt header {word:#x} at {:#x} during minor GC",
                cell.addr()
            )),
        };
        let new_obj = self.next_w;
        debug_assert!(
            new_obj + words * WORD_SIZE <= self.heap.nursery_base(),
            "minor GC copy overran the nursery"
        );
        // SAFETY: source and destination are inside the heap and disjoint:
        // the source is in the nursery, the destination below it.
        unsafe {
            ptr::copy_nonoverlapping(
                (v.addr() - WORD_SIZE) as *const u64,
                (new_obj - WORD_SIZE) as *mut u64,
                words + 1,
            );
        }
        cell.forward_to(new_obj);
        self.next_w = new_obj + (words + 1) * WORD_SIZE;
        Value::from_addr(new_obj)
    }

    fn forward_slot(&mut self, addr: usize) {
        let v = Value::from_raw(self.heap.read_word(addr));
        if v.is_ptr() {
            let fwd = self.forward(v);
            if fwd != v {
                self.heap.write_word(addr, fwd.raw());
            }
        }
    }

    /// Scans copies from `scan` until no unscanned copy remains. Returns the
    /// final scan pointer, which is the new end of old space.
    fn scan_from(&mut self, mut scan: usize) -> usize {
        while scan < self.next_w - WORD_SIZE {
            let word = self.heap.read_word(scan);
            scan += WORD_SIZE;
            match Header::decode(word) {
                Ok(Header::Mixed { mask, len }) => {
                    let mut bits = mask;
                    let mut slot = scan;
                    while bits != 0 {
                        if bits & 1 == 1 {
                            self.forward_slot(slot);
                        }
                        bits >>= 1;
                        slot += WORD_SIZE;
                    }
                    scan += len * WORD_SIZE;
                }
                Ok(Header::Vector { len }) => {
                    for _ in 0..len {
                        self.forward_slot(scan);
                        scan += WORD_SIZE;
                    }
                }
                Ok(raw @ Header::Raw { .. }) => {
                    scan += raw.size_words().unwrap_or(0) * WORD_SIZE;
                }
                Ok(Header::Forward(_)) | Err(_) => die(&format!(
                    "unexpected header {word:#x} at {:#x} in to-space",
                    scan - WORD_SIZE
                )),
            }
        }
        debug_assert!(scan == self.next_w - WORD_SIZE, "scan ran past the copies");
        scan
    }
}

/// Runs a minor collection on `vp`.
///
/// When too little space is left above the survivors, or a global
/// collection is pending, the collection escalates: `major` is called once
/// and takes over moving the old-space top and acknowledging the pending
/// request. A fresh nursery is carved afterwards; failing to carve one is
/// fatal.
pub fn minor_gc<G: MajorCollector + ?Sized>(vp: &mut VProc, major: &mut G) -> MinorGcMetrics {
    let start = Instant::now();
    let gc_id = trace::next_gc_id();
    let _span = trace::trace_minor_gc(vp.id(), gc_id);
    let mut timer = PhaseTimer::new();

    // Dead across a collection.
    vp.regs.std_arg = Value::UNIT;
    vp.regs.std_exn_cont = Value::UNIT;

    // The register roots alias `vp`; touch it only through these parts until
    // the last use of `roots`.
    let GcParts {
        mut roots,
        heap,
        deques,
        chunks,
        handle,
    } = vp.gc_parts();
    let global_pending = handle.global_gc_pending();

    let mut metrics = MinorGcMetrics {
        roots: roots.len(),
        nursery_bytes: heap.nursery_used(),
        collection_type: CollectionType::Minor,
        ..MinorGcMetrics::new()
    };

    let old_top = heap.old_top();
    debug_assert!(old_top < heap.nursery_base());

    timer.start();
    let mut ev = Evacuator::new(&mut *heap);
    for slot in roots.iter() {
        let v = slot.get();
        let fwd = ev.forward(v);
        if fwd != v {
            slot.set(fwd);
        }
    }
    timer.end_roots();

    timer.start();
    let scan_top = ev.scan_from(old_top);
    timer.end_scan();

    metrics.local_ptrs = ev.local_ptrs;
    metrics.global_ptrs = ev.global_ptrs;
    metrics.bytes_copied = scan_top - old_top;
    metrics.available = heap.size() - (scan_top - heap.base());
    trace::log_minor_gc_end(&metrics);

    if metrics.available < heap.major_gc_threshold() || global_pending {
        trace::log_escalation(metrics.available, global_pending);
        metrics.collection_type = CollectionType::Escalated;
        deques.enumerate_global_roots(&mut roots);
        timer.start();
        major.major_collect(MajorGcRequest {
            vproc: &handle,
            heap: &mut *heap,
            roots: &mut roots,
            scan_top,
            chunks,
        });
        timer.end_major();
    } else {
        heap.set_old_top(scan_top);
    }

    #[cfg(feature = "heap-check")]
    crate::gc::check::report_diagnostics(&crate::gc::check::check_heap(
        heap,
        chunks,
        handle.id(),
        &roots,
    ));

    heap.reset_nursery();

    metrics.root_duration = timer.roots;
    metrics.scan_duration = timer.scan;
    metrics.major_duration = timer.major;
    metrics.duration = start.elapsed();
    vp.stats_mut().record_minor(&metrics);
    metrics
}
