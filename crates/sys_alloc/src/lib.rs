use std::io;

#[cfg(unix)]
mod unix;
#[cfg(unix)]
use unix as os;

#[cfg(windows)]
mod windows;
#[cfg(windows)]
use windows as os;

pub use os::page_size;

/// Returns the system allocation granularity.
///
/// On Windows, this is typically 64KB. On Unix, this is typically the system page size.
/// Alignments requested through [`MmapOptions::align`] are rounded up to this value.
pub fn allocation_granularity() -> usize {
    #[cfg(windows)]
    {
        os::allocation_granularity()
    }
    #[cfg(unix)]
    {
        os::page_size()
    }
}

/// A handle to an anonymous memory reservation.
///
/// The reservation is released when this handle is dropped. The usable range
/// `[ptr, ptr + len)` starts on the alignment requested at creation time.
pub struct Mmap {
    inner: os::MmapInner,
}

impl Mmap {
    /// Returns a pointer to the (aligned) start of the mapping.
    pub fn ptr(&self) -> *mut u8 {
        self.inner.ptr()
    }

    /// Returns the usable length of the mapping in bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if the mapping is empty. Mappings created through
    /// [`MmapOptions::map_anon`] never are.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns `true` if `addr` lies inside the usable range.
    pub fn contains(&self, addr: usize) -> bool {
        let start = self.ptr() as usize;
        addr >= start && addr - start < self.len()
    }
}

unsafe impl Send for Mmap {}
unsafe impl Sync for Mmap {}

/// Configuration for creating a memory mapping.
#[derive(Debug, Clone)]
pub struct MmapOptions {
    len: usize,
    align: usize,
    populate: bool,
}

impl MmapOptions {
    /// Creates a new `MmapOptions` with default settings (length 0, page alignment).
    /// You must set a length before mapping.
    pub fn new() -> Self {
        Self {
            len: 0,
            align: 0,
            populate: false,
        }
    }

    /// Sets the length of the mapping in bytes.
    pub fn len(mut self, len: usize) -> Self {
        self.len = len;
        self
    }

    /// Requires the start of the mapping to be a multiple of `align`.
    ///
    /// `align` must be a power of two. Values below the allocation
    /// granularity are rounded up to it. Large alignments are obtained by
    /// over-reserving and trimming, so the OS never has to honour a hint.
    pub fn align(mut self, align: usize) -> Self {
        self.align = align;
        self
    }

    /// Sets whether to pre-populate (prefault) the page tables.
    ///
    /// On Linux, this adds `MAP_POPULATE`.
    pub fn populate(mut self, populate: bool) -> Self {
        self.populate = populate;
        self
    }

    /// Creates an anonymous, zero-filled, read-write memory map.
    ///
    /// # Safety
    ///
    /// The returned memory is only valid while the `Mmap` is alive; any raw
    /// pointer derived from [`Mmap::ptr`] must not outlive it.
    pub unsafe fn map_anon(&self) -> io::Result<Mmap> {
        if self.len == 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "length must be greater than 0",
            ));
        }
        if self.align != 0 && !self.align.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "alignment must be a power of two",
            ));
        }
        let align = self.align.max(allocation_granularity());

        let inner = unsafe { os::MmapInner::map_aligned(self.len, align, self.populate)? };

        Ok(Mmap { inner })
    }
}

impl Default for MmapOptions {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ptr;

    #[test]
    fn test_page_size() {
        let ps = page_size();
        assert!(ps > 0);
        assert_eq!(ps & (ps - 1), 0, "Page size should be power of 2");
    }

    #[test]
    fn test_allocation_granularity() {
        let ag = allocation_granularity();
        assert!(ag > 0);
        assert_eq!(ag & (ag - 1), 0, "Allocation granularity should be power of 2");
        assert!(ag >= page_size());
    }

    #[test]
    fn test_basic_map() {
        let len = page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .map_anon()
                .expect("failed to map")
        };

        let ptr = mmap.ptr();
        assert!(!ptr.is_null());
        assert_eq!(ptr as usize % page_size(), 0);
        assert_eq!(mmap.len(), len);

        unsafe {
            ptr::write_volatile(ptr, 42);
            assert_eq!(ptr::read_volatile(ptr), 42);
        }
    }

    #[test]
    fn test_aligned_map() {
        let align = 1 << 22;
        let mmap = unsafe {
            MmapOptions::new()
                .len(align)
                .align(align)
                .map_anon()
                .expect("failed to map aligned region")
        };

        let base = mmap.ptr() as usize;
        assert_eq!(base % align, 0, "mapping must start on the requested alignment");
        assert!(mmap.contains(base));
        assert!(mmap.contains(base + align - 1));
        assert!(!mmap.contains(base + align));

        // Both ends of the usable range are writable.
        unsafe {
            ptr::write_volatile(mmap.ptr(), 7);
            ptr::write_volatile(mmap.ptr().add(align - 1), 9);
            assert_eq!(ptr::read_volatile(mmap.ptr()), 7);
            assert_eq!(ptr::read_volatile(mmap.ptr().add(align - 1)), 9);
        }
    }

    #[test]
    fn test_populated_map_is_zeroed() {
        let len = 4 * page_size();
        let mmap = unsafe {
            MmapOptions::new()
                .len(len)
                .align(len)
                .populate(true)
                .map_anon()
                .expect("failed to map populated region")
        };
        assert_eq!(mmap.ptr() as usize % len, 0);
        let bytes = unsafe { std::slice::from_raw_parts(mmap.ptr(), len) };
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn test_zero_length_rejected() {
        let result = unsafe { MmapOptions::new().map_anon() };
        assert!(result.is_err());
    }

    #[test]
    fn test_bad_alignment_rejected() {
        let result = unsafe { MmapOptions::new().len(page_size()).align(3 * 4096).map_anon() };
        assert!(result.is_err());
    }
}
