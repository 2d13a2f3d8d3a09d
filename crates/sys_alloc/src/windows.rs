use std::io::{self, Error};
use std::mem;
use std::ptr;

#[cfg(not(miri))]
use windows_sys::Win32::System::Memory::{
    VirtualAlloc, VirtualFree, MEM_COMMIT, MEM_RELEASE, MEM_RESERVE, PAGE_READWRITE,
};
#[cfg(not(miri))]
use windows_sys::Win32::System::SystemInformation::{GetSystemInfo, SYSTEM_INFO};

/// Returns the system allocation granularity.
///
/// On Windows, `VirtualAlloc` address must be aligned to this value (typically 64KB),
/// which is often larger than the page size (typically 4KB).
pub fn allocation_granularity() -> usize {
    #[cfg(miri)]
    {
        65536
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let gran = info.dwAllocationGranularity as usize;
        if gran == 0 {
            65536
        } else {
            gran
        }
    }
}

pub fn page_size() -> usize {
    #[cfg(miri)]
    {
        4096
    }
    #[cfg(not(miri))]
    unsafe {
        let mut info: SYSTEM_INFO = mem::zeroed();
        GetSystemInfo(&mut info);
        let size = info.dwPageSize as usize;
        if size == 0 {
            4096
        } else {
            size
        }
    }
}

/// An aligned view into a (possibly larger) reservation.
///
/// `VirtualFree(MEM_RELEASE)` can only release a whole reservation, so the
/// padding used to reach the alignment stays reserved until drop.
pub struct MmapInner {
    base: *mut std::ffi::c_void,
    ptr: *mut u8,
    len: usize,
    #[cfg(miri)]
    align: usize,
}

impl MmapInner {
    /// Reserves and commits `len` bytes starting on a multiple of `align`.
    pub unsafe fn map_aligned(
        len: usize,
        align: usize,
        _populate: bool,
    ) -> io::Result<MmapInner> {
        #[cfg(miri)]
        {
            use std::alloc::{alloc_zeroed, Layout};
            // Miri doesn't support VirtualAlloc.
            let layout = Layout::from_size_align(len, align)
                .map_err(|_| Error::from(io::ErrorKind::InvalidInput))?;
            let ptr = unsafe { alloc_zeroed(layout) };
            if ptr.is_null() {
                return Err(Error::from(io::ErrorKind::OutOfMemory));
            }
            Ok(MmapInner {
                base: ptr.cast::<std::ffi::c_void>(),
                ptr,
                len,
                align,
            })
        }
        #[cfg(not(miri))]
        {
            let gran = allocation_granularity();
            let padded = if align > gran {
                len.checked_add(align)
                    .ok_or_else(|| Error::from(io::ErrorKind::InvalidInput))?
            } else {
                len
            };

            let base = unsafe { VirtualAlloc(ptr::null(), padded, MEM_RESERVE, PAGE_READWRITE) };
            if base.is_null() {
                return Err(Error::last_os_error());
            }

            let aligned = (base as usize).next_multiple_of(align.max(gran));
            let committed = unsafe {
                VirtualAlloc(
                    aligned as *const std::ffi::c_void,
                    len,
                    MEM_COMMIT,
                    PAGE_READWRITE,
                )
            };
            if committed.is_null() {
                let err = Error::last_os_error();
                unsafe {
                    VirtualFree(base, 0, MEM_RELEASE);
                }
                return Err(err);
            }

            Ok(MmapInner {
                base,
                ptr: aligned as *mut u8,
                len,
            })
        }
    }

    pub const fn ptr(&self) -> *mut u8 {
        self.ptr
    }

    pub const fn len(&self) -> usize {
        self.len
    }
}

impl Drop for MmapInner {
    fn drop(&mut self) {
        if self.len > 0 {
            unsafe {
                #[cfg(miri)]
                {
                    use std::alloc::{dealloc, Layout};
                    let layout = Layout::from_size_align_unchecked(self.len, self.align);
                    dealloc(self.base.cast::<u8>(), layout);
                }
                #[cfg(not(miri))]
                {
                    // MEM_RELEASE requires dwSize to be 0
                    VirtualFree(self.base, 0, MEM_RELEASE);
                }
            }
        }
    }
}

unsafe impl Send for MmapInner {}
unsafe impl Sync for MmapInner {}
