//! Memory pool: one OS region subdivided into blocks
//!
//! The pool header lives in-band at the base of its region; the bytes after
//! it hold block headers and payloads separated by free gaps. A pool
//! optionally belongs to a [`MemoryMap`], which chains pools into a
//! doubly-linked list and tracks lifetime counters.

use core::mem;
use core::ptr::{self, NonNull};

use crate::block::{Block, BlockRef};
use crate::error::{AllocError, AllocResult};
use crate::map::MemoryMap;
use crate::platform;
use crate::utils::ptr_in_range;

#[cfg(feature = "logging")]
use crate::utils::format_bytes;
#[cfg(feature = "logging")]
use tracing::trace;

/// Pool header, placed at the base of the OS region it owns.
///
/// `alloc_size` is the usable region size excluding this header; `size` is
/// the sum of `payload + header` bytes over all live blocks. `head` and
/// `tail` are the lowest- and highest-address live blocks.
#[repr(C)]
pub struct Pool {
    pub(crate) alloc_size: usize,
    pub(crate) size: usize,
    pub(crate) start: *mut u8,
    pub(crate) head: *mut Block,
    pub(crate) tail: *mut Block,
    pub(crate) next: *mut Pool,
    pub(crate) prev: *mut Pool,
    pub(crate) parent_map: *mut MemoryMap,
}

impl Pool {
    /// Size of the in-band pool header.
    pub const HEADER_SIZE: usize = mem::size_of::<Pool>();

    /// Acquires `size + HEADER_SIZE` bytes from the OS, initializes the
    /// header with an empty block list, and appends the pool to `map`'s
    /// pool list when a map is given.
    pub fn alloc(map: Option<NonNull<MemoryMap>>, size: usize) -> AllocResult<NonNull<Pool>> {
        let region_size = size
            .checked_add(Self::HEADER_SIZE)
            .ok_or(AllocError::InvalidSize { size })?;

        let region = platform::acquire(region_size)?;
        let pool = region.cast::<Pool>();

        // SAFETY: the region is freshly mapped and large enough for the
        // header; list links are fixed up right after the write.
        unsafe {
            pool.as_ptr().write(Pool {
                alloc_size: size,
                size: 0,
                start: region.as_ptr().add(Self::HEADER_SIZE),
                head: ptr::null_mut(),
                tail: ptr::null_mut(),
                next: ptr::null_mut(),
                prev: ptr::null_mut(),
                parent_map: map.map_or(ptr::null_mut(), NonNull::as_ptr),
            });

            if let Some(map) = map {
                let m = map.as_ptr();
                if (*m).pool_tail.is_null() {
                    (*m).pool_head = pool.as_ptr();
                } else {
                    (*(*m).pool_tail).next = pool.as_ptr();
                    (*pool.as_ptr()).prev = (*m).pool_tail;
                }
                (*m).pool_tail = pool.as_ptr();
                (*m).pool_count += 1;
                (*m).metadata.pools_created += 1;
            }
        }

        #[cfg(feature = "logging")]
        trace!(size = %format_bytes(size), "pool mapped");

        Ok(pool)
    }

    /// Releases the pool's region back to the OS and nulls the caller's
    /// handle. With `recursive`, the `next` sibling chain is freed first.
    /// A pool belonging to a map is unlinked from its pool list with
    /// head/tail fixed up, `pool_count` decremented and `pools_freed`
    /// incremented.
    ///
    /// # Safety
    ///
    /// `*handle` must be null or point at a live pool header; no pointer
    /// into any freed region may be used afterwards.
    pub unsafe fn free(handle: &mut *mut Pool, recursive: bool) -> AllocResult<()> {
        let pool = *handle;
        if pool.is_null() {
            return Err(AllocError::NullParam);
        }

        if recursive {
            // Frees forward through the field itself so the link is nulled
            // before this pool is unlinked.
            let next_field = ptr::addr_of_mut!((*pool).next);
            let _ = Self::free(&mut *next_field, true);
        }

        let prev = (*pool).prev;
        let next = (*pool).next;
        let map = (*pool).parent_map;

        if prev.is_null() {
            if !map.is_null() {
                (*map).pool_head = next;
            }
        } else {
            (*prev).next = next;
        }
        if next.is_null() {
            if !map.is_null() {
                (*map).pool_tail = prev;
            }
        } else {
            (*next).prev = prev;
        }

        if !map.is_null() {
            (*map).pool_count -= 1;
            (*map).metadata.pools_freed += 1;
        }

        #[cfg(feature = "logging")]
        trace!(size = %format_bytes((*pool).alloc_size), "pool unmapped");

        let region_size = (*pool).alloc_size + Self::HEADER_SIZE;
        platform::release(pool.cast::<u8>(), region_size);

        *handle = ptr::null_mut();

        Ok(())
    }

    /// Checks whether `ptr` lies inside the pool's usable region.
    pub fn contains(&self, ptr: *const u8) -> bool {
        ptr_in_range(ptr, self.start, self.alloc_size)
    }

    /// Remaining capacity: usable region bytes not claimed by live blocks.
    pub fn remaining(&self) -> usize {
        self.alloc_size - self.size
    }

    /// Iterates the pool's live blocks in address order.
    ///
    /// # Safety
    ///
    /// `pool` must point at a live pool header that is not mutated while
    /// the iterator is in use.
    pub(crate) unsafe fn blocks(pool: *const Pool) -> Blocks {
        Blocks {
            current: BlockRef((*pool).head),
        }
    }
}

/// Iterator over a pool's block list. See [`Pool::blocks`].
pub(crate) struct Blocks {
    current: BlockRef,
}

impl Iterator for Blocks {
    type Item = BlockRef;

    fn next(&mut self) -> Option<BlockRef> {
        if self.current.is_null() {
            return None;
        }
        let item = self.current;
        // SAFETY: the constructor's contract guarantees the list is live
        // and unchanged for the iterator's lifetime.
        self.current = unsafe { item.next() };
        Some(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mapless_pool_lifecycle() {
        let pool = Pool::alloc(None, 512).unwrap();
        unsafe {
            assert_eq!(pool.as_ref().alloc_size, 512);
            assert_eq!(pool.as_ref().size, 0);
            assert_eq!(pool.as_ref().remaining(), 512);
            assert!(pool.as_ref().head.is_null());
            assert!(pool.as_ref().tail.is_null());
            assert!(pool.as_ref().parent_map.is_null());

            let start = pool.as_ref().start;
            assert!(pool.as_ref().contains(start));
            assert!(pool.as_ref().contains(start.add(511)));
            assert!(!pool.as_ref().contains(start.add(512)));

            let mut handle = pool.as_ptr();
            Pool::free(&mut handle, false).unwrap();
            assert!(handle.is_null());
        }
    }

    #[test]
    fn free_null_handle_is_an_error() {
        let mut handle: *mut Pool = ptr::null_mut();
        unsafe {
            assert_eq!(
                Pool::free(&mut handle, false),
                Err(AllocError::NullParam)
            );
        }
    }

    #[test]
    fn block_iteration_follows_list() {
        let pool = Pool::alloc(None, 1024).unwrap();
        unsafe {
            Block::create(pool, 8, 0).unwrap();
            Block::create(pool, 8, 100).unwrap();
            Block::create(pool, 8, 200).unwrap();

            let count = Pool::blocks(pool.as_ptr()).count();
            assert_eq!(count, 3);

            let mut handle = pool.as_ptr();
            Pool::free(&mut handle, false).unwrap();
        }
    }
}
