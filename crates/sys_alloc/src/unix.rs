use std::io::{self, Error};
use std::ptr;
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(any(target_os = "linux", target_os = "android"))]
const MAP_POPULATE: libc::c_int = libc::MAP_POPULATE;

#[cfg(not(any(target_os = "linux", target_os = "android")))]
const MAP_POPULATE: libc::c_int = 0;

/// Returns the system page size, cached atomically.
pub fn page_size() -> usize {
    static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

    match PAGE_SIZE.load(Ordering::Relaxed) {
        0 => {
            let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize };
            PAGE_SIZE.store(page_size, Ordering::Relaxed);
            page_size
        }
        page_size => page_size,
    }
}

pub struct MmapInner {
    ptr: *mut libc::c_void,
    len: usize,
}

impl MmapInner {
    /// Maps `len` bytes starting on a multiple of `align`.
    ///
    /// Over-maps by `align` bytes and unmaps the unaligned head and the
    /// surplus tail, so the surviving mapping is exactly `[ptr, ptr + len)`.
    ///
    /// # Safety
    ///
    /// This function is unsafe because it calls `mmap` and `munmap`.
    pub unsafe fn map_aligned(
        len: usize,
        align: usize,
        populate: bool,
    ) -> io::Result<MmapInner> {
        let page = page_size();
        let len = len.div_ceil(page) * page;
        let padded = if align > page {
            len.checked_add(align)
                .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?
        } else {
            len
        };

        // Populating the padding would fault in pages that are unmapped right away.
        let populate = if populate && padded == len { MAP_POPULATE } else { 0 };

        let flags = libc::MAP_PRIVATE | libc::MAP_ANON | populate;
        let prot = libc::PROT_READ | libc::PROT_WRITE;

        let raw = unsafe { libc::mmap(ptr::null_mut(), padded, prot, flags, -1, 0) };
        if raw == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }

        let start = raw as usize;
        let aligned = start.next_multiple_of(align.max(page));
        let head = aligned - start;
        let tail = padded - head - len;

        unsafe {
            if head > 0 {
                libc::munmap(raw, head);
            }
            if tail > 0 {
                libc::munmap((aligned + len) as *mut libc::c_void, tail);
            }
        }

        Ok(MmapInner {
            ptr: aligned as *mut libc::c_void,
            len,
        })
    }

    pub fn ptr(&self) -> *mut u8 {
        self.ptr.cast::<u8>()
    }

    pub fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
