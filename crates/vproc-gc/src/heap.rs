//! Per-vproc local heaps.
//!
//! Each vproc owns one power-of-two sized, size-aligned region:
//!
//! ```text
//!   base                old_top          nursery_base   alloc_ptr    limit   top
//!    |  old space ------->|    free          | nursery ----->|   ...    | slop |
//! ```
//!
//! Old space grows up from `base`; the minor collector copies survivors to
//! `old_top`. The nursery is carved from the free top and filled by bump
//! allocation. `alloc_ptr` always addresses the first data word of the next
//! object, so its header lives one word below.

use std::io;

use sys_alloc::{Mmap, MmapOptions};

use crate::error::{die, ConfigError};
use crate::header::{Header, HeaderCell, MAX_MIXED_LEN};
use crate::value::Value;

/// Bytes per heap word.
pub const WORD_SIZE: usize = 8;

/// Slop between the allocation limit and the heap top.
pub const ALLOC_BUF_SIZE: usize = 4 * 1024;

/// Smallest nursery worth running with.
pub const MIN_NURSERY_SIZE: usize = 16 * 1024;

/// log2 of the chunk directory granule (1 MiB).
pub const CHUNK_GRANULE_LOG2: u32 = 20;

/// Default vproc heap size (4 MiB).
pub const DEFAULT_HEAP_SIZE_LOG2: u32 = 22;

const MAX_HEAP_SIZE_LOG2: u32 = 40;
const MAX_VPROCS: usize = 1 << 16;

/// Heap sizing knobs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapConfig {
    /// log2 of each vproc's heap size.
    pub vproc_heap_size_log2: u32,
    /// Upper bound on the nursery carved after each collection.
    pub max_nursery_size: usize,
    /// Escalate to a major collection when less than this much space is free.
    pub major_gc_threshold: usize,
    /// Number of vprocs (and worker threads).
    pub num_vprocs: usize,
    /// Pre-fault heap pages at reservation time.
    pub populate: bool,
}

impl HeapConfig {
    /// Defaults for a heap of `2^log2` bytes: nursery at most a quarter of
    /// the heap, escalation below half.
    #[must_use]
    pub const fn with_heap_size_log2(log2: u32) -> Self {
        let size = 1usize << log2;
        Self {
            vproc_heap_size_log2: log2,
            max_nursery_size: size / 4,
            major_gc_threshold: size / 2,
            num_vprocs: 1,
            populate: false,
        }
    }

    /// Size of each vproc heap in bytes.
    #[must_use]
    pub const fn heap_size(&self) -> usize {
        1 << self.vproc_heap_size_log2
    }

    /// Checks that the sizes are consistent with each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(CHUNK_GRANULE_LOG2..=MAX_HEAP_SIZE_LOG2).contains(&self.vproc_heap_size_log2) {
            return Err(ConfigError::HeapSizeOutOfRange(self.vproc_heap_size_log2));
        }
        if self.max_nursery_size < MIN_NURSERY_SIZE {
            return Err(ConfigError::NurseryTooSmall(self.max_nursery_size));
        }
        if self.major_gc_threshold == 0 || self.major_gc_threshold >= self.heap_size() {
            return Err(ConfigError::ThresholdOutOfRange(self.major_gc_threshold));
        }
        if self.num_vprocs == 0 || self.num_vprocs > MAX_VPROCS {
            return Err(ConfigError::VProcCount(self.num_vprocs));
        }
        Ok(())
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self::with_heap_size_log2(DEFAULT_HEAP_SIZE_LOG2)
    }
}

/// One field of a Mixed object under construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    /// A value the collector must trace.
    Ptr(Value),
    /// A word the collector never follows (code addresses, unboxed data).
    Word(u64),
}

impl Field {
    const fn word(self) -> u64 {
        match self {
            Self::Ptr(v) => v.raw(),
            Self::Word(w) => w,
        }
    }
}

/// A vproc's local heap.
pub struct VProcHeap {
    mmap: Mmap,
    base: usize,
    size: usize,
    old_top: usize,
    nursery_base: usize,
    alloc_ptr: usize,
    max_nursery_size: usize,
    major_gc_threshold: usize,
}

impl VProcHeap {
    /// Reserves a size-aligned heap and carves the first nursery.
    pub fn new(config: &HeapConfig) -> io::Result<Self> {
        let size = config.heap_size();
        // SAFETY: the mapping is owned by the heap and outlives every address handed out.
        let mmap = unsafe {
            MmapOptions::new()
                .len(size)
                .align(size)
                .populate(config.populate)
                .map_anon()?
        };
        let base = mmap.ptr() as usize;
        let mut heap = Self {
            mmap,
            base,
            size,
            old_top: base,
            nursery_base: base,
            alloc_ptr: base + WORD_SIZE,
            max_nursery_size: config.max_nursery_size,
            major_gc_threshold: config.major_gc_threshold,
        };
        heap.reset_nursery();
        Ok(heap)
    }

    /// Lowest address of the heap.
    #[inline]
    #[must_use]
    pub const fn base(&self) -> usize {
        self.base
    }

    /// Heap size in bytes.
    #[inline]
    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// One past the highest address of the heap.
    #[inline]
    #[must_use]
    pub const fn top(&self) -> usize {
        self.base + self.size
    }

    /// Allocation limit checked by mutator code.
    #[inline]
    #[must_use]
    pub const fn limit(&self) -> usize {
        self.top() - ALLOC_BUF_SIZE
    }

    /// End of old space: the slot for the next survivor's header.
    #[inline]
    #[must_use]
    pub const fn old_top(&self) -> usize {
        self.old_top
    }

    /// Moves the end of old space.
    #[inline]
    pub fn set_old_top(&mut self, old_top: usize) {
        debug_assert!(old_top >= self.base && old_top <= self.top());
        self.old_top = old_top;
    }

    /// Address of the nursery's first header word.
    #[inline]
    #[must_use]
    pub const fn nursery_base(&self) -> usize {
        self.nursery_base
    }

    /// Allocation cursor.
    #[inline]
    #[must_use]
    pub const fn alloc_ptr(&self) -> usize {
        self.alloc_ptr
    }

    /// Moves the allocation cursor, as generated code does after inline allocation.
    #[inline]
    pub fn set_alloc_ptr(&mut self, alloc_ptr: usize) {
        debug_assert!(alloc_ptr > self.nursery_base && alloc_ptr <= self.top());
        self.alloc_ptr = alloc_ptr;
    }

    /// Bytes allocated in the nursery so far (headers included).
    #[inline]
    #[must_use]
    pub const fn nursery_used(&self) -> usize {
        self.alloc_ptr - self.nursery_base - WORD_SIZE
    }

    /// Free bytes above old space.
    #[inline]
    #[must_use]
    pub const fn available(&self) -> usize {
        self.size - (self.old_top - self.base)
    }

    /// Configured escalation threshold.
    #[inline]
    #[must_use]
    pub const fn major_gc_threshold(&self) -> usize {
        self.major_gc_threshold
    }

    /// `true` if `addr` is the data address of an object allocated in the
    /// current nursery.
    #[inline]
    #[must_use]
    pub const fn in_nursery(&self, addr: usize) -> bool {
        addr.wrapping_sub(self.nursery_base + WORD_SIZE) < self.nursery_used()
    }

    /// `true` if `addr` lies inside the heap.
    #[inline]
    #[must_use]
    pub fn contains(&self, addr: usize) -> bool {
        self.mmap.contains(addr)
    }

    /// Carves a fresh nursery from the free top: half the free space,
    /// bounded by the configured maximum. Returns the nursery size, or
    /// `None` when less than [`MIN_NURSERY_SIZE`] would remain.
    pub fn try_reset_nursery(&mut self) -> Option<usize> {
        let free = self.top() - self.old_top;
        let size = ((free / 2) & !(WORD_SIZE - 1)).min(self.max_nursery_size);
        if size < MIN_NURSERY_SIZE {
            return None;
        }
        self.nursery_base = self.top() - size;
        self.alloc_ptr = self.nursery_base + WORD_SIZE;
        Some(size)
    }

    /// Like [`Self::try_reset_nursery`], but heap exhaustion is fatal.
    pub fn reset_nursery(&mut self) -> usize {
        match self.try_reset_nursery() {
            Some(size) => size,
            None => die(&format!(
                "heap exhausted: {} bytes free in vproc heap at {:#x}",
                self.top() - self.old_top,
                self.base
            )),
        }
    }

    /// Bump-allocates an object and writes its header. The payload is left
    /// as it was. Allocation may run into the slop above [`Self::limit`]
    /// but never past the heap top.
    pub fn alloc_object(&mut self, header: Header) -> Option<Value> {
        let words = header.size_words()?;
        let data = self.alloc_ptr;
        let next = words
            .checked_mul(WORD_SIZE)
            .and_then(|bytes| data.checked_add(bytes + WORD_SIZE))?;
        if next > self.top() {
            return None;
        }
        // SAFETY: `data - WORD_SIZE .. next` lies inside the mapping.
        unsafe { HeaderCell::of_object(data) }.store(header);
        self.alloc_ptr = next;
        Some(Value::from_addr(data))
    }

    /// Allocates a Mixed object; the pointer mask marks the [`Field::Ptr`] fields.
    pub fn alloc_mixed(&mut self, fields: &[Field]) -> Option<Value> {
        if fields.len() > MAX_MIXED_LEN {
            return None;
        }
        let mask = fields
            .iter()
            .enumerate()
            .filter(|(_, f)| matches!(f, Field::Ptr(_)))
            .fold(0u64, |m, (i, _)| m | (1 << i));
        let header = Header::mixed(mask, fields.len()).ok()?;
        let obj = self.alloc_object(header)?;
        for (i, f) in fields.iter().enumerate() {
            self.write_word(obj.addr() + i * WORD_SIZE, f.word());
        }
        Some(obj)
    }

    /// Allocates a Vector of potential pointers.
    pub fn alloc_vector(&mut self, elems: &[Value]) -> Option<Value> {
        let header = Header::vector(elems.len()).ok()?;
        let obj = self.alloc_object(header)?;
        for (i, v) in elems.iter().enumerate() {
            self.write_word(obj.addr() + i * WORD_SIZE, v.raw());
        }
        Some(obj)
    }

    /// Allocates a Raw object holding `bytes`, zero padded to a word.
    pub fn alloc_raw(&mut self, bytes: &[u8]) -> Option<Value> {
        let header = Header::raw(bytes.len()).ok()?;
        let obj = self.alloc_object(header)?;
        for (i, chunk) in bytes.chunks(WORD_SIZE).enumerate() {
            let mut word = [0u8; WORD_SIZE];
            word[..chunk.len()].copy_from_slice(chunk);
            self.write_word(obj.addr() + i * WORD_SIZE, u64::from_ne_bytes(word));
        }
        Some(obj)
    }

    /// Decodes the header of a local object.
    #[must_use]
    pub fn header(&self, obj: Value) -> Option<Header> {
        if !obj.is_ptr() || !self.contains(obj.addr().wrapping_sub(WORD_SIZE)) {
            return None;
        }
        Header::decode(self.read_word(obj.addr() - WORD_SIZE)).ok()
    }

    /// Reads field `index` of a local object.
    #[must_use]
    pub fn load(&self, obj: Value, index: usize) -> Option<Value> {
        let addr = self.field_addr(obj, index)?;
        Some(Value::from_raw(self.read_word(addr)))
    }

    /// Writes field `index` of a local object.
    pub fn store(&mut self, obj: Value, index: usize, value: Value) -> Option<()> {
        let addr = self.field_addr(obj, index)?;
        self.write_word(addr, value.raw());
        Some(())
    }

    /// Reads the payload bytes of a local Raw object.
    #[must_use]
    pub fn raw_bytes(&self, obj: Value) -> Option<&[u8]> {
        let Header::Raw { len_bytes } = self.header(obj)? else {
            return None;
        };
        if obj.addr() + len_bytes > self.top() {
            return None;
        }
        // SAFETY: the payload lies inside the mapping and the borrow of `self`
        // keeps it alive.
        Some(unsafe { std::slice::from_raw_parts(obj.addr() as *const u8, len_bytes) })
    }

    fn field_addr(&self, obj: Value, index: usize) -> Option<usize> {
        let words = self.header(obj)?.size_words()?;
        if index >= words {
            return None;
        }
        let addr = obj.addr() + index * WORD_SIZE;
        self.contains(addr).then_some(addr)
    }

    #[inline]
    pub(crate) fn read_word(&self, addr: usize) -> u64 {
        debug_assert!(self.contains(addr) && addr % WORD_SIZE == 0);
        // SAFETY: callers pass aligned addresses inside the mapping.
        unsafe { (addr as *const u64).read() }
    }

    #[inline]
    pub(crate) fn write_word(&mut self, addr: usize, word: u64) {
        debug_assert!(self.contains(addr) && addr % WORD_SIZE == 0);
        // SAFETY: callers pass aligned addresses inside the mapping.
        unsafe { (addr as *mut u64).write(word) }
    }
}

impl std::fmt::Debug for VProcHeap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VProcHeap")
            .field("base", &format_args!("{:#x}", self.base))
            .field("size", &self.size)
            .field("old_top", &format_args!("{:#x}", self.old_top))
            .field("nursery_base", &format_args!("{:#x}", self.nursery_base))
            .field("alloc_ptr", &format_args!("{:#x}", self.alloc_ptr))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_heap() -> VProcHeap {
        VProcHeap::new(&HeapConfig::with_heap_size_log2(20)).expect("heap reservation")
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = HeapConfig::default();
        assert_eq!(config.heap_size(), 4 << 20);
        assert_eq!(config.max_nursery_size, 1 << 20);
        assert_eq!(config.major_gc_threshold, 2 << 20);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = HeapConfig::with_heap_size_log2(19);
        assert_eq!(config.validate(), Err(ConfigError::HeapSizeOutOfRange(19)));

        config = HeapConfig::default();
        config.max_nursery_size = 1024;
        assert_eq!(config.validate(), Err(ConfigError::NurseryTooSmall(1024)));

        config = HeapConfig::default();
        config.num_vprocs = 0;
        assert_eq!(config.validate(), Err(ConfigError::VProcCount(0)));

        config = HeapConfig::default();
        config.major_gc_threshold = config.heap_size();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_heap_is_size_aligned() {
        let heap = small_heap();
        assert_eq!(heap.base() % heap.size(), 0);
        assert_eq!(heap.old_top(), heap.base());
        assert_eq!(heap.limit(), heap.top() - ALLOC_BUF_SIZE);
    }

    #[test]
    fn test_first_nursery_is_carved_from_top() {
        let heap = small_heap();
        // Half of 1 MiB capped at a quarter.
        assert_eq!(heap.top() - heap.nursery_base(), 256 * 1024);
        assert_eq!(heap.alloc_ptr(), heap.nursery_base() + WORD_SIZE);
        assert_eq!(heap.nursery_used(), 0);
    }

    #[test]
    fn test_nursery_halves_free_space() {
        let mut config = HeapConfig::with_heap_size_log2(20);
        config.max_nursery_size = 1 << 20;
        let mut heap = VProcHeap::new(&config).unwrap();
        let base = heap.base();
        heap.set_old_top(base + 1000);
        let size = heap.try_reset_nursery().unwrap();
        assert_eq!(size, ((heap.size() - 1000) / 2) & !7);
        assert_eq!(heap.nursery_base(), heap.top() - size);
    }

    #[test]
    fn test_exhausted_heap_has_no_nursery() {
        let mut heap = small_heap();
        let nearly_full = heap.top() - 2 * MIN_NURSERY_SIZE + WORD_SIZE;
        heap.set_old_top(nearly_full);
        assert_eq!(heap.try_reset_nursery(), None);
    }

    #[test]
    fn test_alloc_mixed_sets_mask() {
        let mut heap = small_heap();
        let a = heap.alloc_raw(b"abc").unwrap();
        let obj = heap
            .alloc_mixed(&[Field::Word(7), Field::Ptr(a), Field::Ptr(Value::UNIT)])
            .unwrap();
        assert_eq!(heap.header(obj), Some(Header::Mixed { mask: 0b110, len: 3 }));
        assert_eq!(heap.load(obj, 0), Some(Value::from_raw(7)));
        assert_eq!(heap.load(obj, 1), Some(a));
        assert_eq!(heap.load(obj, 3), None);
        assert!(heap.in_nursery(obj.addr()));
        assert_eq!(heap.raw_bytes(a), Some(&b"abc"[..]));
    }

    #[test]
    fn test_alloc_advances_cursor() {
        let mut heap = small_heap();
        let start = heap.alloc_ptr();
        let v = heap.alloc_vector(&[Value::UNIT; 4]).unwrap();
        assert_eq!(v.addr(), start);
        assert_eq!(heap.alloc_ptr(), start + 5 * WORD_SIZE);
        assert_eq!(heap.nursery_used(), 5 * WORD_SIZE);
        assert!(!heap.in_nursery(heap.alloc_ptr()));
        assert!(!heap.in_nursery(heap.nursery_base()));
    }

    #[test]
    fn test_alloc_stops_at_heap_top() {
        let mut heap = small_heap();
        let room = (heap.top() - heap.alloc_ptr()) / WORD_SIZE;
        assert!(heap.alloc_object(Header::vector(room).unwrap()).is_none());
        assert!(heap.alloc_object(Header::vector(room - 1).unwrap()).is_some());
        assert_eq!(heap.alloc_ptr(), heap.top());
    }
}
