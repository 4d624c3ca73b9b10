//! Bump arena over a single OS region
//!
//! The arena header lives in-band at the base of the region it describes;
//! claims advance a cursor monotonically through the bytes that follow it.
//! Individual claims cannot be freed out of order — only the exact tail
//! claim rewinds the cursor, and `reset` rewinds everything. Arenas can be
//! chained into a doubly-linked sibling list and destroyed recursively.

use core::mem;
use core::ptr::{self, NonNull};

use crate::error::{AllocError, AllocResult};
use crate::platform;
use crate::utils::ptr_in_range;

/// Arena header, placed at the base of the OS region it owns.
///
/// `start` points at the first byte after the header; `current` is the bump
/// cursor; `size` counts claimed bytes; `alloc_size` is the usable capacity
/// excluding the header itself.
#[repr(C)]
pub struct Arena {
    pub(crate) alloc_size: usize,
    pub(crate) size: usize,
    pub(crate) start: *mut u8,
    pub(crate) current: *mut u8,
    pub(crate) next: *mut Arena,
    pub(crate) prev: *mut Arena,
}

impl Arena {
    /// Size of the in-band arena header.
    pub const HEADER_SIZE: usize = mem::size_of::<Arena>();

    /// Acquires `size + HEADER_SIZE` bytes from the OS and initializes the
    /// header at the base of the new region.
    pub fn alloc(size: usize) -> AllocResult<NonNull<Arena>> {
        let region_size = size
            .checked_add(Self::HEADER_SIZE)
            .ok_or(AllocError::InvalidSize { size })?;

        let region = platform::acquire(region_size)?;
        let arena = region.cast::<Arena>();

        // SAFETY: the region is freshly mapped, writable, and large enough
        // for the header; `start` points at the byte following it.
        unsafe {
            let start = region.as_ptr().add(Self::HEADER_SIZE);
            arena.as_ptr().write(Arena {
                alloc_size: size,
                size: 0,
                start,
                current: start,
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
            });
        }

        Ok(arena)
    }

    /// Returns the current cursor and advances it by `size`.
    ///
    /// # Safety
    ///
    /// `arena` must point at a live arena header.
    pub unsafe fn claim(arena: NonNull<Arena>, size: usize) -> AllocResult<NonNull<u8>> {
        let a = arena.as_ptr();
        let available = (*a).alloc_size - (*a).size;
        if size > (*a).alloc_size || size > available {
            return Err(AllocError::arena_exhausted(size, available));
        }

        let claimed = (*a).current;
        (*a).size += size;
        (*a).current = claimed.add(size);

        Ok(NonNull::new_unchecked(claimed))
    }

    /// Rewinds the arena to its initialized state. Previously claimed
    /// bytes may be overwritten by later claims.
    ///
    /// # Safety
    ///
    /// `arena` must point at a live arena header.
    pub unsafe fn reset(arena: NonNull<Arena>) {
        let a = arena.as_ptr();
        (*a).size = 0;
        (*a).current = (*a).start;
    }

    /// Releases a claim of `size` bytes at `*target`.
    ///
    /// If the claim is exactly the arena's tail the cursor rewinds over it.
    /// When the claimed total reaches zero the arena either rewinds fully
    /// or, under `auto_destroy`, unlinks from its sibling list and returns
    /// its region to the OS. The caller's handle is nulled either way.
    ///
    /// # Safety
    ///
    /// `arena` must point at a live arena header and `*target` must not be
    /// used after this call returns `Ok`.
    pub unsafe fn free(
        arena: NonNull<Arena>,
        target: &mut *mut u8,
        size: usize,
        auto_destroy: bool,
    ) -> AllocResult<()> {
        if target.is_null() {
            return Err(AllocError::NullParam);
        }

        let a = arena.as_ptr();
        if size > (*a).alloc_size || size > (*a).size {
            return Err(AllocError::InvalidSize { size });
        }
        if !ptr_in_range(*target, (*a).start, (*a).size) {
            return Err(AllocError::invalid_address(*target));
        }

        if (*a).current == (*target).add(size) {
            (*a).current = (*a).current.sub(size);
        }
        (*a).size -= size;

        if (*a).size == 0 {
            if auto_destroy {
                let mut handle = a;
                Self::destroy(&mut handle, false);
            } else {
                (*a).current = (*a).start;
            }
        }

        *target = ptr::null_mut();

        Ok(())
    }

    /// Unlinks the arena from its sibling list and releases its region.
    /// With `recursive`, continues into each `next` sibling. The caller's
    /// handle is nulled.
    ///
    /// # Safety
    ///
    /// `*handle` must be null or point at a live arena header; no pointer
    /// into any destroyed region may be used afterwards.
    pub unsafe fn destroy(handle: &mut *mut Arena, recursive: bool) {
        let mut arena = *handle;
        while !arena.is_null() {
            let next = (*arena).next;
            let prev = (*arena).prev;
            if !prev.is_null() {
                (*prev).next = next;
            }
            if !next.is_null() {
                (*next).prev = prev;
            }

            let region_size = (*arena).alloc_size + Self::HEADER_SIZE;
            platform::release(arena.cast::<u8>(), region_size);

            if !recursive {
                break;
            }
            arena = next;
        }

        *handle = ptr::null_mut();
    }

    /// Usable capacity in bytes, excluding the header.
    pub fn capacity(&self) -> usize {
        self.alloc_size
    }

    /// Bytes claimed so far.
    pub fn claimed(&self) -> usize {
        self.size
    }
}
