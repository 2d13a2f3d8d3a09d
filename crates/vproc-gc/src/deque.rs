//! Work-stealing deques and their per-vproc store.
//!
//! Deques live outside the GC heap. Their occupied slots hold heap values,
//! so every deque a vproc owns contributes roots to that vproc's minor
//! collections.
//!
//! A deque of capacity `C` is a ring of `C` slots indexed by two cursors
//! in `[0, C)`: `new` (owner end, push/pop) and `old` (thief end). One slot
//! always stays empty, so a deque holds at most `C - 1` values.

use std::alloc::{alloc, dealloc, handle_alloc_error, Layout};
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam::utils::CachePadded;
use parking_lot::Mutex;

use crate::error::die;
use crate::gc::roots::{RootSet, RootSlot};
use crate::value::Value;

/// Alignment of deque slot buffers, one cache line.
pub const DEQUE_ALIGN: usize = 64;

/// Which slot of a work group a deque fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DequeRole {
    /// The scheduler's main deque.
    Primary,
    /// Overflow deque.
    Secondary,
    /// One of the deques resumed after a suspension.
    Resume,
}

/// A fixed-capacity circular deque of [`Value`]s.
pub struct Deque {
    new: CachePadded<AtomicUsize>,
    old: CachePadded<AtomicUsize>,
    claims: AtomicUsize,
    lock: Mutex<()>,
    mask: usize,
    slots: NonNull<Value>,
}

// SAFETY: every cursor update and slot access from `push`, `pop` and
// `steal` happens under `lock`.
unsafe impl Send for Deque {}
// SAFETY: see above.
unsafe impl Sync for Deque {}

impl Deque {
    fn slot_layout(capacity: usize) -> Layout {
        match Layout::array::<Value>(capacity).and_then(|l| l.align_to(DEQUE_ALIGN)) {
            Ok(layout) => layout,
            Err(_) => die(&format!("deque capacity {capacity} overflows")),
        }
    }

    /// Allocates an empty deque with room for at least `requested` values.
    ///
    /// The capacity is rounded up to a power of two (minimum 2) and the
    /// deque starts with one claim held by its creator.
    #[must_use]
    pub fn new(requested: usize) -> Self {
        let Some(capacity) = requested.max(2).checked_next_power_of_two() else {
            die(&format!("deque capacity {requested} overflows"));
        };
        let layout = Self::slot_layout(capacity);
        // SAFETY: the layout has non-zero size.
        let ptr = unsafe { alloc(layout) }.cast::<Value>();
        let Some(slots) = NonNull::new(ptr) else {
            handle_alloc_error(layout);
        };
        for i in 0..capacity {
            // SAFETY: `i < capacity` and the buffer was just allocated.
            unsafe { slots.as_ptr().add(i).write(Value::NIL) };
        }
        Self {
            new: CachePadded::new(AtomicUsize::new(0)),
            old: CachePadded::new(AtomicUsize::new(0)),
            claims: AtomicUsize::new(1),
            lock: Mutex::new(()),
            mask: capacity - 1,
            slots,
        }
    }

    /// Number of slots in the ring.
    #[inline]
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Number of values currently held.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        let new = self.new.load(Ordering::Acquire);
        let old = self.old.load(Ordering::Acquire);
        new.wrapping_sub(old) & self.mask
    }

    /// `true` when the deque holds nothing.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    fn slot(&self, index: usize) -> *mut Value {
        debug_assert!(index <= self.mask);
        // SAFETY: `index` is a cursor value, always below the capacity.
        unsafe { self.slots.as_ptr().add(index) }
    }

    /// Pushes at the new end. Returns the value back when the deque is full.
    pub fn push(&self, value: Value) -> Result<(), Value> {
        let _guard = self.lock.lock();
        let new = self.new.load(Ordering::Relaxed);
        let old = self.old.load(Ordering::Relaxed);
        let next = (new + 1) & self.mask;
        if next == old {
            return Err(value);
        }
        // SAFETY: slot `new` is free and other users are locked out.
        unsafe { self.slot(new).write(value) };
        self.new.store(next, Ordering::Release);
        Ok(())
    }

    /// Pops from the new end.
    pub fn pop(&self) -> Option<Value> {
        let _guard = self.lock.lock();
        let new = self.new.load(Ordering::Relaxed);
        let old = self.old.load(Ordering::Relaxed);
        if new == old {
            return None;
        }
        let last = move_left(new, self.capacity());
        // SAFETY: `last` is occupied and thieves are locked out.
        let value = unsafe { self.slot(last).replace(Value::NIL) };
        self.new.store(last, Ordering::Release);
        Some(value)
    }

    /// Steals from the old end.
    pub fn steal(&self) -> Option<Value> {
        let _guard = self.lock.lock();
        let old = self.old.load(Ordering::Relaxed);
        let new = self.new.load(Ordering::Acquire);
        if new == old {
            return None;
        }
        // SAFETY: `old` is occupied and other thieves are locked out.
        let value = unsafe { self.slot(old).replace(Value::NIL) };
        self.old.store((old + 1) & self.mask, Ordering::Release);
        Some(value)
    }

    /// Registers one more user of this deque.
    pub fn claim(&self) {
        self.claims.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one claim.
    pub fn release(&self) {
        let prev = self.claims.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "deque released more often than claimed");
    }

    /// Current claim count.
    #[must_use]
    pub fn claims(&self) -> usize {
        self.claims.load(Ordering::Acquire)
    }

    /// Adds one root per occupied slot, walking from the new end toward the old end.
    fn add_roots(&self, roots: &mut RootSet) {
        let old = self.old.load(Ordering::Acquire);
        let mut i = self.new.load(Ordering::Acquire);
        while i != old {
            let j = move_left(i, self.capacity());
            // SAFETY: the slot lies inside our buffer, which outlives the
            // collection that uses the root set.
            roots.push(unsafe { RootSlot::new(NonNull::new_unchecked(self.slot(j))) });
            i = j;
        }
    }
}

impl Drop for Deque {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.slots.as_ptr().cast(), Self::slot_layout(self.capacity())) };
    }
}

impl fmt::Debug for Deque {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Deque")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("claims", &self.claims())
            .finish()
    }
}

/// Steps one slot toward the old end, wrapping at zero.
#[inline]
const fn move_left(i: usize, capacity: usize) -> usize {
    if i == 0 {
        capacity - 1
    } else {
        i - 1
    }
}

/// Shared handle to a [`Deque`].
///
/// The store keeps one handle per live deque; schedulers hold more. The
/// buffer is released when the last handle goes away.
#[derive(Debug, Clone)]
pub struct DequeRef(Arc<Deque>);

impl DequeRef {
    fn new(capacity: usize) -> Self {
        Self(Arc::new(Deque::new(capacity)))
    }

    /// The deque's address as a word generated code can carry.
    #[must_use]
    pub fn as_value(&self) -> Value {
        Value::from_ptr(Arc::as_ptr(&self.0))
    }

    /// `true` if both handles refer to the same deque.
    #[must_use]
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Deref for DequeRef {
    type Target = Deque;

    fn deref(&self) -> &Deque {
        &self.0
    }
}

/// The deques one work group owns on one vproc.
#[derive(Debug, Default)]
pub struct WorkGroup {
    primary: Option<DequeRef>,
    secondary: Option<DequeRef>,
    resume: Vec<DequeRef>,
}

impl WorkGroup {
    fn deques(&self) -> impl Iterator<Item = &DequeRef> {
        self.primary
            .iter()
            .chain(self.secondary.iter())
            .chain(self.resume.iter())
    }

    /// Number of resume deques currently linked.
    #[must_use]
    pub fn resume_count(&self) -> usize {
        self.resume.len()
    }
}

/// Per-vproc registry of work groups and their deques.
#[derive(Debug, Default)]
pub struct DequeStore {
    groups: BTreeMap<u64, WorkGroup>,
}

impl DequeStore {
    /// Creates an empty store.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            groups: BTreeMap::new(),
        }
    }

    fn group(&mut self, work_group: u64) -> &mut WorkGroup {
        self.groups.entry(work_group).or_default()
    }

    /// Looks up a work group without creating it.
    #[must_use]
    pub fn work_group(&self, work_group: u64) -> Option<&WorkGroup> {
        self.groups.get(&work_group)
    }

    /// Allocates a deque for `role` in `work_group`.
    ///
    /// A new primary or secondary deque replaces the previous one, whose
    /// store claim is released; resume deques accumulate.
    pub fn allocate(&mut self, work_group: u64, role: DequeRole, capacity: usize) -> DequeRef {
        let deque = DequeRef::new(capacity);
        let group = self.group(work_group);
        let replaced = match role {
            DequeRole::Primary => group.primary.replace(deque.clone()),
            DequeRole::Secondary => group.secondary.replace(deque.clone()),
            DequeRole::Resume => {
                group.resume.push(deque.clone());
                None
            }
        };
        if let Some(old) = replaced {
            old.release();
        }
        deque
    }

    /// Returns the primary or secondary deque of `work_group`.
    ///
    /// Resume deques are fetched through [`Self::fetch_resume_deques`]; asking
    /// for [`DequeRole::Resume`] here yields `None`.
    pub fn fetch(&mut self, work_group: u64, role: DequeRole) -> Option<DequeRef> {
        let group = self.group(work_group);
        match role {
            DequeRole::Primary => group.primary.clone(),
            DequeRole::Secondary => group.secondary.clone(),
            DequeRole::Resume => None,
        }
    }

    /// Returns the non-empty resume deques of `work_group` in creation order,
    /// claiming each on behalf of the caller.
    pub fn fetch_resume_deques(&mut self, work_group: u64) -> Vec<DequeRef> {
        self.group(work_group)
            .resume
            .iter()
            .filter(|d| !d.is_empty())
            .inspect(|d| d.claim())
            .cloned()
            .collect()
    }

    /// Unlinks resume deques that are empty and unclaimed.
    fn prune(&mut self) {
        for group in self.groups.values_mut() {
            group.resume.retain(|d| !d.is_empty() || d.claims() > 0);
        }
    }

    /// Prunes dead resume deques, then counts the values held by all deques.
    pub fn compute_root_count(&mut self) -> usize {
        self.prune();
        self.groups
            .values()
            .flat_map(WorkGroup::deques)
            .map(|d| d.len())
            .sum()
    }

    /// Adds every occupied deque slot of this vproc to `roots`.
    pub fn enumerate_local_roots(&self, roots: &mut RootSet) {
        for deque in self.groups.values().flat_map(WorkGroup::deques) {
            deque.add_roots(roots);
        }
    }

    /// Global collections need no extra deque roots; the local pass already
    /// reported every slot.
    pub fn enumerate_global_roots(&self, _roots: &mut RootSet) {}

    /// Number of work groups seen so far.
    #[must_use]
    pub fn work_group_count(&self) -> usize {
        self.groups.len()
    }
}
