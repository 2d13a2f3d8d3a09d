//! Root sets.

use std::ptr::NonNull;

use crate::value::Value;

/// A location holding a [`Value`] the collector may rewrite.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootSlot(NonNull<Value>);

impl RootSlot {
    /// Wraps a slot address.
    ///
    /// # Safety
    ///
    /// `slot` must stay valid for reads and writes, and must not be accessed
    /// through any other path, for as long as the root set holding it is used.
    #[inline]
    #[must_use]
    pub const unsafe fn new(slot: NonNull<Value>) -> Self {
        Self(slot)
    }

    /// Reads the slot.
    #[inline]
    #[must_use]
    pub fn get(self) -> Value {
        // SAFETY: validity is the constructor's contract.
        unsafe { self.0.as_ptr().read() }
    }

    /// Overwrites the slot.
    #[inline]
    pub fn set(self, value: Value) {
        // SAFETY: validity is the constructor's contract.
        unsafe { self.0.as_ptr().write(value) }
    }

    /// Address of the slot.
    #[inline]
    #[must_use]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }
}

/// Ordered, growable set of root slots for one collection.
#[derive(Debug, Default)]
pub struct RootSet {
    slots: Vec<RootSlot>,
}

impl RootSet {
    /// Creates an empty root set.
    #[must_use]
    pub const fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Creates an empty root set with room for `n` slots.
    #[must_use]
    pub fn with_capacity(n: usize) -> Self {
        Self {
            slots: Vec::with_capacity(n),
        }
    }

    /// Appends a slot.
    #[inline]
    pub fn push(&mut self, slot: RootSlot) {
        self.slots.push(slot);
    }

    /// Number of slots.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// `true` when no slot has been added.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Iterates the slots in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = RootSlot> + '_ {
        self.slots.iter().copied()
    }
}
