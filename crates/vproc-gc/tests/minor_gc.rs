//! Integration tests for minor collection.
//!
//! These tests build small object graphs in a vproc's nursery, collect, and
//! check what survived and where it landed.

use vproc_gc::heap::WORD_SIZE;
use vproc_gc::{
    minor_gc, CollectionType, DequeRole, Field, HeapConfig, InPlaceMajorCollector, MajorCollector,
    MajorGcRequest, Runtime, RuntimeConfig, VProc, Value,
};

fn runtime(heap: HeapConfig) -> Runtime {
    Runtime::new(RuntimeConfig {
        heap,
        ..RuntimeConfig::default()
    })
    .unwrap()
}

fn small_vproc() -> (Runtime, VProc) {
    let mut rt = runtime(HeapConfig::with_heap_size_log2(20));
    let vp = rt.take_vproc(0).unwrap();
    (rt, vp)
}

/// Counts escalations and records what each one saw. It only touches the
/// old-space top and the pending flag when told to.
#[derive(Default)]
struct RecordingMajor {
    calls: usize,
    roots_seen: usize,
    scan_tops: Vec<usize>,
    old_tops: Vec<usize>,
    keep_survivors: bool,
    acknowledge: bool,
}

impl MajorCollector for RecordingMajor {
    fn major_collect(&mut self, request: MajorGcRequest<'_>) {
        self.calls += 1;
        self.roots_seen = request.roots.len();
        self.scan_tops.push(request.scan_top);
        self.old_tops.push(request.heap.old_top());
        if self.keep_survivors {
            request.heap.set_old_top(request.scan_top);
        }
        if self.acknowledge {
            request.vproc.clear_global_gc_pending();
        }
    }
}

#[test]
fn test_linked_list_survives_in_order() {
    let (_rt, mut vp) = small_vproc();
    let mut list = Value::NIL;
    for i in 0..100 {
        list = vp
            .heap_mut()
            .alloc_mixed(&[Field::Ptr(Value::from_int(i)), Field::Ptr(list)])
            .unwrap();
    }
    // Garbage interleaved with nothing pointing at it.
    vp.heap_mut().alloc_vector(&[Value::UNIT; 32]).unwrap();
    vp.regs.rdy_q_hd = list;

    let metrics = minor_gc(&mut vp, &mut InPlaceMajorCollector::new());
    assert_eq!(metrics.collection_type, CollectionType::Minor);
    assert_eq!(metrics.bytes_copied, 100 * 3 * WORD_SIZE);
    assert_eq!(metrics.local_ptrs, 100);

    let heap = vp.heap();
    let mut cursor = vp.regs.rdy_q_hd;
    for expected in (0..100).rev() {
        assert!(!heap.in_nursery(cursor.addr()));
        assert_eq!(heap.load(cursor, 0), Some(Value::from_int(expected)));
        cursor = heap.load(cursor, 1).unwrap();
    }
    assert_eq!(cursor, Value::NIL);
}

#[test]
fn test_cycle_is_copied_once() {
    let (_rt, mut vp) = small_vproc();
    let a = vp
        .heap_mut()
        .alloc_mixed(&[Field::Ptr(Value::NIL), Field::Word(1)])
        .unwrap();
    let b = vp
        .heap_mut()
        .alloc_mixed(&[Field::Ptr(a), Field::Word(2)])
        .unwrap();
    vp.heap_mut().store(a, 0, b).unwrap();
    vp.regs.current_fls = a;

    let metrics = minor_gc(&mut vp, &mut InPlaceMajorCollector::new());
    assert_eq!(metrics.bytes_copied, 2 * 3 * WORD_SIZE);

    let heap = vp.heap();
    let a2 = vp.regs.current_fls;
    let b2 = heap.load(a2, 0).unwrap();
    assert_eq!(heap.load(b2, 0), Some(a2));
    assert_eq!(heap.load(b2, 1), Some(Value::from_raw(2)));
}

#[test]
fn test_second_collection_copies_nothing() {
    let (_rt, mut vp) = small_vproc();
    let obj = vp.heap_mut().alloc_raw(b"persist").unwrap();
    vp.regs.landing_pad = obj;

    minor_gc(&mut vp, &mut InPlaceMajorCollector::new());
    let moved = vp.regs.landing_pad;
    let old_top = vp.heap().old_top();

    let metrics = minor_gc(&mut vp, &mut InPlaceMajorCollector::new());
    assert_eq!(metrics.bytes_copied, 0);
    assert_eq!(metrics.local_ptrs, 0);
    assert_eq!(metrics.global_ptrs, 1);
    assert_eq!(vp.regs.landing_pad, moved);
    assert_eq!(vp.heap().old_top(), old_top);
    assert_eq!(vp.heap().raw_bytes(moved), Some(&b"persist"[..]));
}

#[test]
fn test_word_fields_are_never_followed() {
    let (_rt, mut vp) = small_vproc();
    let target = vp.heap_mut().alloc_raw(b"target").unwrap();
    let holder = vp
        .heap_mut()
        .alloc_mixed(&[Field::Word(target.raw()), Field::Ptr(Value::UNIT)])
        .unwrap();
    vp.regs.action_stk = holder;

    let metrics = minor_gc(&mut vp, &mut InPlaceMajorCollector::new());
    assert_eq!(metrics.local_ptrs, 1);
    assert_eq!(
        vp.heap().load(vp.regs.action_stk, 0),
        Some(Value::from_raw(target.raw()))
    );
}

#[test]
fn test_deque_slots_are_forwarded() {
    let (_rt, mut vp) = small_vproc();
    let deque = vp.deques_mut().allocate(7, DequeRole::Primary, 8);
    let a = vp.heap_mut().alloc_raw(b"first").unwrap();
    let b = vp.heap_mut().alloc_raw(b"second").unwrap();
    deque.push(a).unwrap();
    deque.push(b).unwrap();

    let metrics = minor_gc(&mut vp, &mut InPlaceMajorCollector::new());
    assert_eq!(metrics.local_ptrs, 2);

    let b2 = deque.pop().unwrap();
    let a2 = deque.pop().unwrap();
    assert_ne!(a2, a);
    assert_ne!(b2, b);
    assert_eq!(vp.heap().raw_bytes(a2), Some(&b"first"[..]));
    assert_eq!(vp.heap().raw_bytes(b2), Some(&b"second"[..]));
}

#[test]
fn test_pointers_into_other_heaps_are_left_alone() {
    let mut rt = runtime(HeapConfig {
        num_vprocs: 2,
        ..HeapConfig::with_heap_size_log2(20)
    });
    let mut vp0 = rt.take_vproc(0).unwrap();
    let mut vp1 = rt.take_vproc(1).unwrap();

    let remote = vp1.heap_mut().alloc_raw(b"remote").unwrap();
    let local = vp0
        .heap_mut()
        .alloc_mixed(&[Field::Ptr(remote)])
        .unwrap();
    vp0.regs.dummy_k = local;

    let metrics = minor_gc(&mut vp0, &mut InPlaceMajorCollector::new());
    assert_eq!(metrics.local_ptrs, 1);
    assert_eq!(metrics.global_ptrs, 1);
    assert_eq!(vp0.heap().load(vp0.regs.dummy_k, 0), Some(remote));
    assert_eq!(vp1.heap().raw_bytes(remote), Some(&b"remote"[..]));
}

#[test]
fn test_low_space_escalates_once() {
    let heap = HeapConfig::with_heap_size_log2(20);
    let mut rt = runtime(HeapConfig {
        major_gc_threshold: heap.heap_size() - 1,
        ..heap
    });
    let mut vp = rt.take_vproc(0).unwrap();
    let obj = vp.heap_mut().alloc_raw(b"survivor").unwrap();
    vp.regs.sched_cont = obj;
    let old_top = vp.heap().old_top();

    let mut major = RecordingMajor {
        keep_survivors: true,
        ..RecordingMajor::default()
    };
    let metrics = minor_gc(&mut vp, &mut major);
    assert_eq!(metrics.collection_type, CollectionType::Escalated);
    assert_eq!(major.calls, 1);
    assert_eq!(major.old_tops, vec![old_top]);
    assert_eq!(major.scan_tops, vec![old_top + 2 * WORD_SIZE]);
    assert!(major.roots_seen >= 10);
    assert_eq!(vp.heap().old_top(), old_top + 2 * WORD_SIZE);
    assert_eq!(vp.stats().escalations, 1);
}

#[test]
fn test_escalation_leaves_old_top_to_major_collector() {
    let heap = HeapConfig::with_heap_size_log2(20);
    let mut rt = runtime(HeapConfig {
        major_gc_threshold: heap.heap_size() - 1,
        ..heap
    });
    let mut vp = rt.take_vproc(0).unwrap();
    let obj = vp.heap_mut().alloc_raw(b"survivor").unwrap();
    vp.regs.sched_cont = obj;
    let old_top = vp.heap().old_top();

    let mut major = RecordingMajor::default();
    minor_gc(&mut vp, &mut major);
    assert_eq!(major.calls, 1);
    assert_eq!(vp.heap().old_top(), old_top);
}

#[test]
fn test_major_collector_sets_old_top() {
    let (rt, mut vp) = small_vproc();
    rt.request_global_gc();
    let obj = vp.heap_mut().alloc_raw(b"gone").unwrap();
    vp.regs.rdy_q_tl = obj;
    let old_top = vp.heap().old_top();

    let mut major = RecordingMajor {
        acknowledge: true,
        ..RecordingMajor::default()
    };
    let metrics = minor_gc(&mut vp, &mut major);
    assert_eq!(metrics.collection_type, CollectionType::Escalated);
    assert_eq!(major.calls, 1);
    assert_eq!(vp.heap().old_top(), old_top);
    assert!(!vp.handle().global_gc_pending());

    // The pending request was consumed.
    let metrics = minor_gc(&mut vp, &mut major);
    assert_eq!(metrics.collection_type, CollectionType::Minor);
    assert_eq!(major.calls, 1);
}

#[test]
fn test_unacknowledged_global_gc_stays_pending() {
    let (rt, mut vp) = small_vproc();
    rt.request_global_gc();

    let mut major = RecordingMajor {
        keep_survivors: true,
        ..RecordingMajor::default()
    };
    minor_gc(&mut vp, &mut major);
    assert!(vp.handle().global_gc_pending());

    let metrics = minor_gc(&mut vp, &mut major);
    assert_eq!(metrics.collection_type, CollectionType::Escalated);
    assert_eq!(major.calls, 2);
}

#[test]
fn test_nursery_is_recarved_after_collection() {
    let (_rt, mut vp) = small_vproc();
    for _ in 0..64 {
        vp.heap_mut().alloc_vector(&[Value::UNIT; 16]).unwrap();
    }
    assert!(vp.heap().nursery_used() > 0);

    minor_gc(&mut vp, &mut InPlaceMajorCollector::new());
    let heap = vp.heap();
    assert_eq!(heap.nursery_used(), 0);
    assert_eq!(heap.alloc_ptr(), heap.nursery_base() + WORD_SIZE);
    assert!(heap.old_top() < heap.nursery_base());
    assert_eq!(vp.stats().minor_collections, 1);
}
