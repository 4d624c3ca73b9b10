//! Memory block: the smallest unit of user allocation
//!
//! A block is an in-band header followed immediately by the caller's
//! payload, both living inside a pool's region. Blocks within a pool form a
//! doubly-linked list kept in strict ascending address order.
//!
//! Payload sizes are arbitrary, so a block header can land at any byte
//! offset. Header fields are therefore never accessed through references:
//! every read and write goes through unaligned raw-pointer operations via
//! [`BlockRef`], keeping the structured view of the header bytes distinct
//! from the payload view.

use core::mem;
use core::ptr::{self, NonNull};

use crate::error::{AllocError, AllocResult};
use crate::map::MemoryMap;
use crate::pool::Pool;
use crate::utils::ptr_in_range;

/// Block header, colocated with the payload it describes.
///
/// `start` always equals the header's own address plus
/// [`Block::HEADER_SIZE`]; the payload is the `size` bytes from `start`.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct Block {
    pub(crate) size: usize,
    pub(crate) start: *mut u8,
    pub(crate) next: *mut Block,
    pub(crate) prev: *mut Block,
    pub(crate) parent: *mut Pool,
}

/// Copyable accessor for a possibly-unaligned block header.
///
/// All field access goes through `read_unaligned`/`write_unaligned` on raw
/// place projections, so no reference to the header is ever formed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub(crate) struct BlockRef(pub(crate) *mut Block);

impl BlockRef {
    pub(crate) const NULL: BlockRef = BlockRef(ptr::null_mut());

    #[inline]
    pub(crate) fn is_null(self) -> bool {
        self.0.is_null()
    }

    /// Address of the header itself.
    #[inline]
    pub(crate) fn addr(self) -> *mut u8 {
        self.0.cast::<u8>()
    }

    #[inline]
    pub(crate) unsafe fn size(self) -> usize {
        ptr::addr_of!((*self.0).size).read_unaligned()
    }

    #[inline]
    pub(crate) unsafe fn set_size(self, size: usize) {
        ptr::addr_of_mut!((*self.0).size).write_unaligned(size);
    }

    #[inline]
    pub(crate) unsafe fn start(self) -> *mut u8 {
        ptr::addr_of!((*self.0).start).read_unaligned()
    }

    #[inline]
    pub(crate) unsafe fn next(self) -> BlockRef {
        BlockRef(ptr::addr_of!((*self.0).next).read_unaligned())
    }

    #[inline]
    pub(crate) unsafe fn set_next(self, next: *mut Block) {
        ptr::addr_of_mut!((*self.0).next).write_unaligned(next);
    }

    #[inline]
    pub(crate) unsafe fn prev(self) -> BlockRef {
        BlockRef(ptr::addr_of!((*self.0).prev).read_unaligned())
    }

    #[inline]
    pub(crate) unsafe fn set_prev(self, prev: *mut Block) {
        ptr::addr_of_mut!((*self.0).prev).write_unaligned(prev);
    }

    #[inline]
    pub(crate) unsafe fn parent(self) -> *mut Pool {
        ptr::addr_of!((*self.0).parent).read_unaligned()
    }

    /// First byte past the payload.
    #[inline]
    pub(crate) unsafe fn payload_end(self) -> *mut u8 {
        self.start().add(self.size())
    }
}

impl Block {
    /// Size of the in-band block header.
    pub const HEADER_SIZE: usize = mem::size_of::<Block>();

    /// Installs a block header at `pool.start + offset` and splices it into
    /// the pool's address-ordered block list.
    ///
    /// Fails with insufficient-pool-memory when the header plus payload
    /// would overrun the pool region. On success the pool's live size grows
    /// by `size + HEADER_SIZE` and the owning map's created counter (if
    /// any) is bumped.
    ///
    /// # Safety
    ///
    /// `pool` must point at a live pool header, and `[offset, offset +
    /// size + HEADER_SIZE)` must not overlap any live block in it.
    pub unsafe fn create(
        pool: NonNull<Pool>,
        size: usize,
        offset: usize,
    ) -> AllocResult<NonNull<Block>> {
        let p = pool.as_ptr();

        let end = offset
            .checked_add(size)
            .and_then(|v| v.checked_add(Self::HEADER_SIZE))
            .ok_or(AllocError::InvalidSize { size })?;
        if end > (*p).alloc_size {
            return Err(AllocError::pool_exhausted(
                size + Self::HEADER_SIZE,
                (*p).alloc_size.saturating_sub(offset),
            ));
        }

        let header = (*p).start.add(offset).cast::<Block>();
        header.write_unaligned(Block {
            size,
            start: header.cast::<u8>().add(Self::HEADER_SIZE),
            next: ptr::null_mut(),
            prev: ptr::null_mut(),
            parent: p,
        });
        let block = BlockRef(header);

        // Walk forward to the last block below the new address.
        let mut current = BlockRef((*p).head);
        let mut pred = BlockRef::NULL;
        while !current.is_null() && current.addr() < block.addr() {
            pred = current;
            current = current.next();
        }

        if pred.is_null() {
            block.set_next((*p).head);
            let old_head = BlockRef((*p).head);
            if !old_head.is_null() {
                old_head.set_prev(header);
            }
            (*p).head = header;
            if (*p).tail.is_null() {
                (*p).tail = header;
            }
        } else {
            let succ = pred.next();
            block.set_prev(pred.0);
            block.set_next(succ.0);
            if succ.is_null() {
                (*p).tail = header;
            } else {
                succ.set_prev(header);
            }
            pred.set_next(header);
        }

        (*p).size += size + Self::HEADER_SIZE;
        let map = (*p).parent_map;
        if !map.is_null() {
            (*map).metadata.blocks_created += 1;
        }

        Ok(NonNull::new_unchecked(header))
    }

    /// Finds the block whose payload starts at `ptr` by scanning the map's
    /// pools and, for the pool whose region contains `ptr`, its block list.
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header.
    pub unsafe fn find(map: NonNull<MemoryMap>, ptr: *const u8) -> AllocResult<NonNull<Block>> {
        if ptr.is_null() {
            return Err(AllocError::NullParam);
        }

        let mut pool = map.as_ref().pool_head;
        while !pool.is_null() {
            if ptr_in_range(ptr, (*pool).start, (*pool).alloc_size) {
                let mut block = BlockRef((*pool).head);
                while !block.is_null() {
                    if block.start().cast_const() == ptr {
                        return Ok(NonNull::new_unchecked(block.0));
                    }
                    block = block.next();
                }
            }
            pool = (*pool).next;
        }

        Err(AllocError::not_found(ptr))
    }

    /// Unlinks the block from its pool, adjusts the accounting, and nulls
    /// the caller's handle. A pool whose live size reaches zero is itself
    /// freed.
    ///
    /// # Safety
    ///
    /// `*handle` must be null or point at a live block header; neither the
    /// block nor (if this was its last block) the pool may be used
    /// afterwards.
    pub unsafe fn free(handle: &mut *mut Block) {
        let block = BlockRef(*handle);
        if block.is_null() {
            return;
        }

        let pool = block.parent();
        let prev = block.prev();
        let next = block.next();

        if prev.is_null() {
            (*pool).head = next.0;
        } else {
            prev.set_next(next.0);
        }
        if next.is_null() {
            (*pool).tail = prev.0;
        } else {
            next.set_prev(prev.0);
        }

        (*pool).size -= block.size() + Self::HEADER_SIZE;
        let map = (*pool).parent_map;
        if !map.is_null() {
            (*map).metadata.blocks_freed += 1;
        }

        *handle = ptr::null_mut();

        if (*pool).size == 0 {
            let mut pool_handle = pool;
            let _ = Pool::free(&mut pool_handle, false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    unsafe fn collect_offsets(pool: NonNull<Pool>) -> Vec<usize> {
        let start = pool.as_ref().start as usize;
        let mut offsets = Vec::new();
        let mut block = BlockRef(pool.as_ref().head);
        while !block.is_null() {
            offsets.push(block.addr() as usize - start);
            block = block.next();
        }
        offsets
    }

    #[test]
    fn creation_keeps_address_order() {
        let pool = Pool::alloc(None, 1024).unwrap();
        unsafe {
            // Created out of address order on purpose.
            Block::create(pool, 16, 300).unwrap();
            Block::create(pool, 16, 0).unwrap();
            Block::create(pool, 16, 600).unwrap();
            Block::create(pool, 16, 150).unwrap();

            assert_eq!(collect_offsets(pool), vec![0, 150, 300, 600]);
            assert_eq!(pool.as_ref().size, 4 * (16 + Block::HEADER_SIZE));

            let head = BlockRef(pool.as_ref().head);
            let tail = BlockRef(pool.as_ref().tail);
            assert_eq!(head.addr() as usize, pool.as_ref().start as usize);
            assert_eq!(tail.addr() as usize, pool.as_ref().start as usize + 600);
            assert!(head.prev().is_null());
            assert!(tail.next().is_null());

            let mut handle = pool.as_ptr();
            Pool::free(&mut handle, false).unwrap();
        }
    }

    #[test]
    fn payload_follows_header() {
        let pool = Pool::alloc(None, 256).unwrap();
        unsafe {
            let block = Block::create(pool, 32, 0).unwrap();
            let block = BlockRef(block.as_ptr());
            assert_eq!(
                block.start() as usize,
                block.addr() as usize + Block::HEADER_SIZE
            );
            assert_eq!(block.payload_end() as usize, block.start() as usize + 32);

            let mut handle = pool.as_ptr();
            Pool::free(&mut handle, false).unwrap();
        }
    }

    #[test]
    fn create_rejects_overrun() {
        let pool = Pool::alloc(None, 128).unwrap();
        unsafe {
            // Exactly filling the region is fine; one more byte is not.
            let fitting = 128 - Block::HEADER_SIZE;
            assert!(Block::create(pool, fitting + 1, 0).is_err());
            let block = Block::create(pool, fitting, 0).unwrap();
            assert_eq!(pool.as_ref().size, 128);

            let _ = block;
            let mut handle = pool.as_ptr();
            Pool::free(&mut handle, false).unwrap();
        }
    }

    #[test]
    fn free_unlinks_and_relinks_neighbors() {
        let pool = Pool::alloc(None, 1024).unwrap();
        unsafe {
            let _a = Block::create(pool, 16, 0).unwrap();
            let b = Block::create(pool, 16, 200).unwrap();
            let _c = Block::create(pool, 16, 400).unwrap();

            let mut handle = b.as_ptr();
            Block::free(&mut handle);
            assert!(handle.is_null());

            assert_eq!(collect_offsets(pool), vec![0, 400]);
            assert_eq!(pool.as_ref().size, 2 * (16 + Block::HEADER_SIZE));

            let head = BlockRef(pool.as_ref().head);
            assert_eq!(head.next().addr(), pool.as_ref().tail.cast::<u8>());
            assert_eq!(BlockRef(pool.as_ref().tail).prev(), head);

            let mut handle = pool.as_ptr();
            Pool::free(&mut handle, false).unwrap();
        }
    }

    #[test]
    fn freeing_last_block_frees_the_pool() {
        let pool = Pool::alloc(None, 256).unwrap();
        unsafe {
            let block = Block::create(pool, 8, 0).unwrap();
            let mut handle = block.as_ptr();
            // The pool empties and releases itself; nothing to assert
            // beyond the nulled handle without a parent map (covered by the
            // map-level tests).
            Block::free(&mut handle);
            assert!(handle.is_null());
        }
    }
}
