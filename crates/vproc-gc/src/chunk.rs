//! Address-to-chunk classification.
//!
//! The directory slices a 48-bit address into a 14-bit top index, a 14-bit
//! leaf index and a 20-bit offset inside a 1 MiB granule. Leaves are
//! installed lazily with a CAS and live as long as the directory, so
//! [`ChunkDirectory::classify`] is two dependent loads and never locks.

use std::fmt;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use crate::heap::CHUNK_GRANULE_LOG2;

const ADDR_BITS: u32 = 48;
const INDEX_BITS: u32 = ADDR_BITS - CHUNK_GRANULE_LOG2;
const L1_BITS: u32 = INDEX_BITS / 2;
const L2_BITS: u32 = INDEX_BITS - L1_BITS;
const L1_SIZE: usize = 1 << L1_BITS;
const L2_SIZE: usize = 1 << L2_BITS;

/// Size of one directory granule.
pub const CHUNK_GRANULE: usize = 1 << CHUNK_GRANULE_LOG2;

const UNMAPPED: u32 = 0;
const FREE: u32 = 1;
const FROM_SPACE: u32 = 2;
const TO_SPACE: u32 = 3;
const VPROC_BASE: u32 = 4;

/// What a region of the address space is currently used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkStatus {
    /// Not managed by the runtime.
    Unmapped,
    /// Managed but not holding live data.
    Free,
    /// Global heap being evacuated.
    FromSpace,
    /// Global heap receiving copies.
    ToSpace,
    /// The local heap of the vproc with this id.
    VProc(u32),
}

impl ChunkStatus {
    /// The owning vproc, if this is a local heap chunk.
    #[must_use]
    pub const fn owner(self) -> Option<u32> {
        match self {
            Self::VProc(id) => Some(id),
            _ => None,
        }
    }

    const fn encode(self) -> u32 {
        match self {
            Self::Unmapped => UNMAPPED,
            Self::Free => FREE,
            Self::FromSpace => FROM_SPACE,
            Self::ToSpace => TO_SPACE,
            Self::VProc(id) => VPROC_BASE + id,
        }
    }

    const fn decode(raw: u32) -> Self {
        match raw {
            UNMAPPED => Self::Unmapped,
            FREE => Self::Free,
            FROM_SPACE => Self::FromSpace,
            TO_SPACE => Self::ToSpace,
            n => Self::VProc(n - VPROC_BASE),
        }
    }
}

struct Leaf {
    entries: Box<[AtomicU32]>,
}

impl Leaf {
    fn new() -> Self {
        Self {
            entries: (0..L2_SIZE).map(|_| AtomicU32::new(UNMAPPED)).collect(),
        }
    }
}

/// O(1) map from addresses to [`ChunkStatus`].
pub struct ChunkDirectory {
    top: Box<[AtomicPtr<Leaf>]>,
}

impl ChunkDirectory {
    /// Creates an empty directory; every address classifies as unmapped.
    #[must_use]
    pub fn new() -> Self {
        Self {
            top: (0..L1_SIZE).map(|_| AtomicPtr::new(ptr::null_mut())).collect(),
        }
    }

    #[inline]
    const fn split(addr: usize) -> Option<(usize, usize)> {
        if addr >> ADDR_BITS != 0 {
            return None;
        }
        let granule = addr >> CHUNK_GRANULE_LOG2;
        Some((granule >> L2_BITS, granule & (L2_SIZE - 1)))
    }

    /// Classifies `addr`.
    #[must_use]
    pub fn classify(&self, addr: usize) -> ChunkStatus {
        let Some((hi, lo)) = Self::split(addr) else {
            return ChunkStatus::Unmapped;
        };
        let leaf = self.top[hi].load(Ordering::Acquire);
        if leaf.is_null() {
            return ChunkStatus::Unmapped;
        }
        // SAFETY: leaves are never freed before the directory.
        let raw = unsafe { (*leaf).entries[lo].load(Ordering::Acquire) };
        ChunkStatus::decode(raw)
    }

    /// Tags every granule overlapping `[base, base + len)` with `status`.
    ///
    /// Granules beyond the 48-bit address space are ignored.
    pub fn register(&self, base: usize, len: usize, status: ChunkStatus) {
        debug_assert!(
            base % CHUNK_GRANULE == 0,
            "chunk base {base:#x} is not granule aligned"
        );
        let end = base.saturating_add(len);
        let raw = status.encode();
        let mut addr = base & !(CHUNK_GRANULE - 1);
        while addr < end {
            let Some((hi, lo)) = Self::split(addr) else {
                break;
            };
            self.leaf(hi).entries[lo].store(raw, Ordering::Release);
            addr += CHUNK_GRANULE;
        }
    }

    /// Returns `[base, base + len)` to the unmapped state.
    pub fn unregister(&self, base: usize, len: usize) {
        self.register(base, len, ChunkStatus::Unmapped);
    }

    fn leaf(&self, hi: usize) -> &Leaf {
        let slot = &self.top[hi];
        let current = slot.load(Ordering::Acquire);
        if !current.is_null() {
            // SAFETY: installed leaves live as long as `self`.
            return unsafe { &*current };
        }
        let fresh = Box::into_raw(Box::new(Leaf::new()));
        match slot.compare_exchange(ptr::null_mut(), fresh, Ordering::AcqRel, Ordering::Acquire) {
            // SAFETY: we just installed it.
            Ok(_) => unsafe { &*fresh },
            Err(winner) => {
                // SAFETY: `fresh` was never shared.
                drop(unsafe { Box::from_raw(fresh) });
                // SAFETY: installed leaves live as long as `self`.
                unsafe { &*winner }
            }
        }
    }
}

impl Default for ChunkDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ChunkDirectory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leaves = self
            .top
            .iter()
            .filter(|slot| !slot.load(Ordering::Relaxed).is_null())
            .count();
        f.debug_struct("ChunkDirectory")
            .field("leaves", &leaves)
            .finish()
    }
}

impl Drop for ChunkDirectory {
    fn drop(&mut self) {
        for slot in &mut *self.top {
            let leaf = *slot.get_mut();
            if !leaf.is_null() {
                // SAFETY: leaves come from `Box::into_raw` and are dropped once.
                drop(unsafe { Box::from_raw(leaf) });
            }
        }
    }
}

/// The base of the size-aligned vproc heap containing `addr`.
#[inline]
#[must_use]
pub const fn heap_base_of(addr: usize, heap_size: usize) -> usize {
    addr & !(heap_size - 1)
}
