//! OS memory provider
//!
//! Acquires and releases page-granular virtual memory regions directly from
//! the operating system: anonymous private read-write mappings on POSIX,
//! reserve+commit read-write on Windows. Either the full requested size is
//! mapped or the call fails; released regions must not be touched again.

use core::ptr::NonNull;

use crate::error::{AllocError, AllocResult};

cfg_if::cfg_if! {
    if #[cfg(unix)] {
        /// Maps a read-write region of `size` bytes.
        pub(crate) fn acquire(size: usize) -> AllocResult<NonNull<u8>> {
            use libc::{MAP_ANONYMOUS, MAP_FAILED, MAP_PRIVATE, PROT_READ, PROT_WRITE};

            // SAFETY: anonymous mapping with no address hint; the kernel
            // picks a placement or reports MAP_FAILED.
            let ptr = unsafe {
                libc::mmap(
                    core::ptr::null_mut(),
                    size,
                    PROT_READ | PROT_WRITE,
                    MAP_ANONYMOUS | MAP_PRIVATE,
                    -1,
                    0,
                )
            };

            if ptr == MAP_FAILED {
                return Err(AllocError::os_alloc_failed(size));
            }
            NonNull::new(ptr.cast::<u8>()).ok_or(AllocError::OsMemoryAllocFailed { size })
        }

        /// Unmaps a region previously returned by [`acquire`].
        ///
        /// # Safety
        ///
        /// `ptr` must be the exact address returned by `acquire` and `size`
        /// the exact size passed to it; the region must not be accessed
        /// afterwards.
        pub(crate) unsafe fn release(ptr: *mut u8, size: usize) {
            libc::munmap(ptr.cast::<libc::c_void>(), size);
        }
    } else if #[cfg(windows)] {
        /// Maps a read-write region of `size` bytes.
        pub(crate) fn acquire(size: usize) -> AllocResult<NonNull<u8>> {
            use winapi::um::memoryapi::VirtualAlloc;
            use winapi::um::winnt::{MEM_COMMIT, MEM_RESERVE, PAGE_READWRITE};

            // SAFETY: reserve and commit in one call; a null return means
            // the OS refused.
            let ptr = unsafe {
                VirtualAlloc(
                    core::ptr::null_mut(),
                    size,
                    MEM_COMMIT | MEM_RESERVE,
                    PAGE_READWRITE,
                )
            };

            NonNull::new(ptr.cast::<u8>()).ok_or(AllocError::OsMemoryAllocFailed { size })
        }

        /// Unmaps a region previously returned by [`acquire`].
        ///
        /// # Safety
        ///
        /// `ptr` must be the exact address returned by `acquire`; the region
        /// must not be accessed afterwards.
        pub(crate) unsafe fn release(ptr: *mut u8, size: usize) {
            use winapi::um::memoryapi::VirtualFree;
            use winapi::um::winnt::MEM_RELEASE;

            let _ = size;
            VirtualFree(ptr.cast::<winapi::ctypes::c_void>(), 0, MEM_RELEASE);
        }
    } else {
        compile_error!("mapalloc requires a POSIX or Windows target");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_release() {
        let size = 4096;
        let region = acquire(size).expect("mapping failed");

        // The region must be writable and readable back.
        unsafe {
            region.as_ptr().write_bytes(0xab, size);
            assert_eq!(*region.as_ptr(), 0xab);
            assert_eq!(*region.as_ptr().add(size - 1), 0xab);
            release(region.as_ptr(), size);
        }
    }

    #[test]
    fn distinct_regions() {
        let a = acquire(4096).unwrap();
        let b = acquire(4096).unwrap();
        assert_ne!(a.as_ptr(), b.as_ptr());
        unsafe {
            release(a.as_ptr(), 4096);
            release(b.as_ptr(), 4096);
        }
    }
}
