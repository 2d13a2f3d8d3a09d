//! Virtual processors.
//!
//! A [`VProc`] is the per-worker state the collector and the execution loop
//! operate on: its heap, its register file, its deques and its counters.
//! The parts other threads may touch (the preemptible limit word, the
//! global-GC-pending flag and the sleep state) live in a shared
//! [`VProcHandle`].

use std::ptr::{addr_of_mut, NonNull};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::chunk::ChunkDirectory;
use crate::deque::DequeStore;
use crate::error::die;
use crate::gc::roots::{RootSet, RootSlot};
use crate::heap::{Field, VProcHeap};
use crate::metrics::VProcStats;
use crate::runtime::RuntimeShared;
use crate::value::Value;

/// The register file saved across runtime calls.
///
/// Every register except `std_arg`, `std_cont` and `std_exn_cont` is a GC root.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Registers {
    /// Fiber-local storage of the running thread.
    pub current_fls: Value,
    /// Stack of signal actions.
    pub action_stk: Value,
    /// Scheduler continuation that receives preemption signals.
    pub sched_cont: Value,
    /// Placeholder continuation for signals sent to this vproc.
    pub dummy_k: Value,
    /// Continuation resumed after a sleep; `NIL` when none is installed.
    pub wakeup_cont: Value,
    /// Continuation run once when the runtime shuts down; `NIL` when none.
    pub shutdown_cont: Value,
    /// Head of the ready queue.
    pub rdy_q_hd: Value,
    /// Tail of the ready queue.
    pub rdy_q_tl: Value,
    /// Incoming messages from other vprocs.
    pub landing_pad: Value,
    /// Environment of the code to resume after a request.
    pub std_env_ptr: Value,
    /// Argument register; dead across a collection.
    pub std_arg: Value,
    /// Code address to resume after a request. Not a heap pointer.
    pub std_cont: Value,
    /// Exception continuation register; dead across a collection.
    pub std_exn_cont: Value,
}

impl Registers {
    /// Every register cleared.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            current_fls: Value::NIL,
            action_stk: Value::NIL,
            sched_cont: Value::NIL,
            dummy_k: Value::NIL,
            wakeup_cont: Value::NIL,
            shutdown_cont: Value::NIL,
            rdy_q_hd: Value::NIL,
            rdy_q_tl: Value::NIL,
            landing_pad: Value::NIL,
            std_env_ptr: Value::NIL,
            std_arg: Value::UNIT,
            std_cont: Value::UNIT,
            std_exn_cont: Value::UNIT,
        }
    }

    /// Number of root registers.
    pub const ROOT_COUNT: usize = 10;
}

impl Default for Registers {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Default)]
struct SleepState {
    woken: bool,
}

/// The thread-shared half of a vproc.
#[derive(Debug)]
pub(crate) struct VProcShared {
    id: usize,
    /// Allocation limit seen by mutator code; zero forces a safe point.
    limit: AtomicUsize,
    global_gc_pending: AtomicBool,
    sleep: Mutex<SleepState>,
    wakeup: Condvar,
}

impl VProcShared {
    pub(crate) fn new(id: usize, limit: usize) -> Self {
        Self {
            id,
            limit: AtomicUsize::new(limit),
            global_gc_pending: AtomicBool::new(false),
            sleep: Mutex::new(SleepState::default()),
            wakeup: Condvar::new(),
        }
    }

    /// Installs `limit`, returning the previous word.
    fn swap_limit(&self, limit: usize) -> usize {
        self.limit.swap(limit, Ordering::AcqRel)
    }

    fn preempt(&self) {
        self.limit.store(0, Ordering::Release);
    }

    fn wake(&self) {
        let mut state = self.sleep.lock();
        state.woken = true;
        self.wakeup.notify_one();
    }

    /// Parks until woken or until `timeout` elapses. Returns `true` when
    /// another thread woke us.
    fn sleep(&self, timeout: Option<Duration>) -> bool {
        let mut state = self.sleep.lock();
        match timeout {
            None => {
                while !state.woken {
                    self.wakeup.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while !state.woken {
                    if self.wakeup.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
            }
        }
        std::mem::take(&mut state.woken)
    }
}

/// A cloneable, thread-safe handle to one vproc.
#[derive(Debug, Clone)]
pub struct VProcHandle(pub(crate) Arc<VProcShared>);

impl VProcHandle {
    /// Id of the vproc.
    #[must_use]
    pub fn id(&self) -> usize {
        self.0.id
    }

    /// Forces the vproc to its next safe point by zeroing its limit word.
    pub fn preempt(&self) {
        self.0.preempt();
    }

    /// Wakes the vproc if it is sleeping; otherwise its next sleep returns at once.
    pub fn wake(&self) {
        self.0.wake();
    }

    /// Makes the vproc's next minor collection escalate.
    pub fn request_global_gc(&self) {
        self.0.global_gc_pending.store(true, Ordering::Release);
    }

    /// `true` while a global collection is pending for this vproc.
    #[must_use]
    pub fn global_gc_pending(&self) -> bool {
        self.0.global_gc_pending.load(Ordering::Acquire)
    }

    /// Acknowledges a pending global collection. Called by the major
    /// collector once it has served the request.
    pub fn clear_global_gc_pending(&self) {
        self.0.global_gc_pending.store(false, Ordering::Release);
    }

    /// `true` once the limit word has been zeroed and not yet restored.
    #[must_use]
    pub fn is_preempted(&self) -> bool {
        self.0.limit.load(Ordering::Acquire) == 0
    }
}

/// A virtual processor.
#[derive(Debug)]
pub struct VProc {
    id: usize,
    heap: VProcHeap,
    /// The register file.
    pub regs: Registers,
    /// Signals are deferred while set.
    pub atomic: bool,
    /// A signal arrived while `atomic` was set.
    pub sig_pending: bool,
    pub(crate) shutdown_pending: bool,
    deques: DequeStore,
    stats: VProcStats,
    shared: Arc<VProcShared>,
    runtime: Arc<RuntimeShared>,
}

impl VProc {
    pub(crate) fn new(
        id: usize,
        heap: VProcHeap,
        shared: Arc<VProcShared>,
        runtime: Arc<RuntimeShared>,
    ) -> Self {
        Self {
            id,
            heap,
            regs: Registers::new(),
            atomic: false,
            sig_pending: false,
            shutdown_pending: false,
            deques: DequeStore::new(),
            stats: VProcStats::default(),
            shared,
            runtime,
        }
    }

    /// Id of this vproc.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// The local heap.
    #[must_use]
    pub const fn heap(&self) -> &VProcHeap {
        &self.heap
    }

    /// The local heap, mutably. Mutator code allocates through this.
    pub fn heap_mut(&mut self) -> &mut VProcHeap {
        &mut self.heap
    }

    /// The deques this vproc owns.
    #[must_use]
    pub const fn deques(&self) -> &DequeStore {
        &self.deques
    }

    /// The deques this vproc owns, mutably.
    pub fn deques_mut(&mut self) -> &mut DequeStore {
        &mut self.deques
    }

    /// Collection and scheduling counters.
    #[must_use]
    pub const fn stats(&self) -> &VProcStats {
        &self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut VProcStats {
        &mut self.stats
    }

    /// The runtime-wide chunk directory.
    #[must_use]
    pub fn chunks(&self) -> &ChunkDirectory {
        &self.runtime.chunks
    }

    /// A handle other threads can use to reach this vproc.
    #[must_use]
    pub fn handle(&self) -> VProcHandle {
        VProcHandle(Arc::clone(&self.shared))
    }

    pub(crate) fn runtime(&self) -> &RuntimeShared {
        &self.runtime
    }

    /// The limit word mutator code compares the allocation cursor against.
    #[must_use]
    pub fn limit_word(&self) -> usize {
        self.shared.limit.load(Ordering::Acquire)
    }

    /// `true` when mutator code must stop at its next safe point, either
    /// because the nursery is used up or because the vproc was preempted.
    #[must_use]
    pub fn limit_reached(&self) -> bool {
        self.heap.alloc_ptr() > self.limit_word()
    }

    /// Restores the real allocation limit and returns the word it replaced.
    pub(crate) fn restore_limit(&self) -> usize {
        self.shared.swap_limit(self.heap.limit())
    }

    pub(crate) fn global_gc_pending(&self) -> bool {
        self.shared.global_gc_pending.load(Ordering::Acquire)
    }

    pub(crate) fn sleep(&self, timeout: Option<Duration>) -> bool {
        self.shared.sleep(timeout)
    }

    /// Allocates a Mixed object for the runtime itself. Running out of heap
    /// here is fatal.
    pub(crate) fn alloc_mixed_or_die(&mut self, fields: &[Field]) -> Value {
        match self.heap.alloc_mixed(fields) {
            Some(v) => v,
            None => die(&format!("vproc {}: out of heap allocating runtime object", self.id)),
        }
    }

    /// Packages the non-empty resume deques of `work_group` as a heap list
    /// of one-word boxes, in creation order. Each listed deque is claimed.
    pub fn resume_deques_value(&mut self, work_group: u64) -> Value {
        let deques = self.deques.fetch_resume_deques(work_group);
        let mut list = Value::NIL;
        for deque in deques.iter().rev() {
            let boxed = self.alloc_mixed_or_die(&[Field::Ptr(deque.as_value())]);
            list = self.alloc_mixed_or_die(&[Field::Ptr(boxed), Field::Ptr(list)]);
        }
        list
    }

    /// Collects the slots a minor collection must treat as roots: the root
    /// registers followed by every occupied deque slot.
    ///
    /// The register slots stay valid until `self` is next borrowed mutably.
    pub fn local_roots(&mut self) -> RootSet {
        let mut roots =
            RootSet::with_capacity(Registers::ROOT_COUNT + self.deques.compute_root_count());
        register_roots(&mut self.regs, &mut roots);
        self.deques.enumerate_local_roots(&mut roots);
        roots
    }

    /// Splits the vproc into the disjoint parts a collection works on. The
    /// returned roots reach the register file only through the borrow held
    /// by the parts, so the heap can be written while they are live.
    pub(crate) fn gc_parts(&mut self) -> GcParts<'_> {
        let mut roots =
            RootSet::with_capacity(Registers::ROOT_COUNT + self.deques.compute_root_count());
        register_roots(&mut self.regs, &mut roots);
        self.deques.enumerate_local_roots(&mut roots);
        GcParts {
            roots,
            heap: &mut self.heap,
            deques: &self.deques,
            chunks: &self.runtime.chunks,
            handle: VProcHandle(Arc::clone(&self.shared)),
        }
    }
}

/// Disjoint borrows of one vproc for the duration of a collection.
pub(crate) struct GcParts<'a> {
    pub(crate) roots: RootSet,
    pub(crate) heap: &'a mut VProcHeap,
    pub(crate) deques: &'a DequeStore,
    pub(crate) chunks: &'a ChunkDirectory,
    pub(crate) handle: VProcHandle,
}

fn register_roots(regs: &mut Registers, roots: &mut RootSet) {
    let regs: *mut Registers = regs;
    // SAFETY: every slot is derived from the same exclusive borrow of the
    // register file, which outlives the root set's use by the collector.
    unsafe {
        for slot in [
            addr_of_mut!((*regs).current_fls),
            addr_of_mut!((*regs).action_stk),
            addr_of_mut!((*regs).sched_cont),
            addr_of_mut!((*regs).dummy_k),
            addr_of_mut!((*regs).wakeup_cont),
            addr_of_mut!((*regs).shutdown_cont),
            addr_of_mut!((*regs).rdy_q_hd),
            addr_of_mut!((*regs).rdy_q_tl),
            addr_of_mut!((*regs).landing_pad),
            addr_of_mut!((*regs).std_env_ptr),
        ] {
            roots.push(RootSlot::new(NonNull::new_unchecked(slot)));
        }
    }
}

impl Drop for VProc {
    fn drop(&mut self) {
        self.runtime
            .chunks
            .unregister(self.heap.base(), self.heap.size());
    }
}
