//! Memory map: the top-level registry of pools
//!
//! A map owns a doubly-linked list of pools, the placement policy applied
//! to them, a dynamic-growth flag, and lifetime counters. The map header
//! itself lives in a dedicated [`Arena`] sized exactly for it.
//!
//! Everything here operates on explicit map instances; the process-wide
//! default map built on top of these operations lives in [`crate::global`].

use core::mem;
use core::ptr::{self, NonNull};

use crate::arena::Arena;
use crate::block::{Block, BlockRef};
use crate::error::{AllocError, AllocResult};
use crate::fit::{self, FitPolicy};
use crate::pool::Pool;
use crate::utils::{copy_bytes, fill_bytes};

#[cfg(feature = "logging")]
use tracing::debug;

/// Default number of pools pre-created by a lazily initialized map.
pub const DEFAULT_POOL_COUNT: usize = 0;

/// Default pool size in bytes, also the minimum size of pools appended by
/// dynamic growth.
pub const DEFAULT_POOL_SIZE: usize = 8 * 1024;

/// Map construction parameters: placement policy and growth behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapParams {
    /// Rule for placing new blocks within a pool.
    pub policy: FitPolicy,
    /// Whether a fresh pool is appended when no existing pool admits a
    /// request.
    pub dynamic: bool,
}

impl Default for MapParams {
    fn default() -> Self {
        Self {
            policy: FitPolicy::Best,
            dynamic: true,
        }
    }
}

/// Lifetime counters: totals of pools and blocks ever created and freed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MapMetadata {
    pub blocks_created: u64,
    pub blocks_freed: u64,
    pub pools_created: u64,
    pub pools_freed: u64,
}

/// Map header, claimed from its backing arena.
#[repr(C)]
pub struct MemoryMap {
    pub(crate) params: MapParams,
    pub(crate) metadata: MapMetadata,
    pub(crate) pool_count: usize,
    pub(crate) pool_head: *mut Pool,
    pub(crate) pool_tail: *mut Pool,
}

impl MemoryMap {
    /// Creates a map inside a fresh arena and pre-creates
    /// `init_pool_count` pools of `init_pool_size` bytes each.
    ///
    /// On a partial pre-creation failure everything allocated so far is
    /// rolled back before the error surfaces: pools first, then the arena
    /// holding the map header.
    pub fn create(
        init_pool_count: usize,
        init_pool_size: usize,
        params: MapParams,
    ) -> AllocResult<(NonNull<MemoryMap>, NonNull<Arena>)> {
        let header_size = mem::size_of::<MemoryMap>();
        let arena = Arena::alloc(header_size)?;

        // SAFETY: the arena was sized exactly for the header, so the claim
        // cannot fail and the returned bytes are writable and aligned to
        // the region base.
        let map = unsafe {
            match Arena::claim(arena, header_size) {
                Ok(bytes) => bytes.cast::<MemoryMap>(),
                Err(err) => {
                    let mut handle = arena.as_ptr();
                    Arena::destroy(&mut handle, false);
                    return Err(err);
                }
            }
        };

        unsafe {
            map.as_ptr().write(MemoryMap {
                params,
                metadata: MapMetadata::default(),
                pool_count: 0,
                pool_head: ptr::null_mut(),
                pool_tail: ptr::null_mut(),
            });

            for _ in 0..init_pool_count {
                if let Err(err) = Pool::alloc(Some(map), init_pool_size) {
                    let mut pools = (*map.as_ptr()).pool_head;
                    let _ = Pool::free(&mut pools, true);
                    let mut handle = arena.as_ptr();
                    Arena::destroy(&mut handle, false);
                    return Err(err);
                }
            }
        }

        #[cfg(feature = "logging")]
        debug!(
            pools = init_pool_count,
            pool_size = init_pool_size,
            policy = ?params.policy,
            dynamic = params.dynamic,
            "memory map created"
        );

        Ok((map, arena))
    }

    /// Allocates `size` payload bytes and returns their address.
    ///
    /// Pools are scanned head to tail; the first pool whose remaining
    /// capacity admits the request is asked for an offset under the map's
    /// policy. When no pool accepts, a dynamic map appends a pool of
    /// `max(DEFAULT_POOL_SIZE, size + Block::HEADER_SIZE)` bytes and places
    /// the block at offset zero; a non-dynamic map fails with
    /// insufficient-pool-memory.
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header.
    pub unsafe fn allocate(map: NonNull<MemoryMap>, size: usize) -> AllocResult<NonNull<u8>> {
        let m = map.as_ptr();
        let needed = size
            .checked_add(Block::HEADER_SIZE)
            .ok_or(AllocError::InvalidSize { size })?;

        let mut pool = (*m).pool_head;
        while !pool.is_null() {
            if (*pool).alloc_size - (*pool).size >= needed {
                if let Some(offset) = fit::find_fit(pool, (*m).params.policy, size) {
                    let block = Block::create(NonNull::new_unchecked(pool), size, offset)?;
                    return Ok(NonNull::new_unchecked(BlockRef(block.as_ptr()).start()));
                }
            }
            pool = (*pool).next;
        }

        if !(*m).params.dynamic {
            let mut available = 0;
            let mut pool = (*m).pool_head;
            while !pool.is_null() {
                available = available.max((*pool).alloc_size - (*pool).size);
                pool = (*pool).next;
            }
            return Err(AllocError::pool_exhausted(needed, available));
        }

        #[cfg(feature = "logging")]
        debug!(size, "no pool admits request, appending a pool");

        let pool = Pool::alloc(Some(map), DEFAULT_POOL_SIZE.max(needed))?;
        let block = Block::create(pool, size, 0)?;
        Ok(NonNull::new_unchecked(BlockRef(block.as_ptr()).start()))
    }

    /// Resizes the allocation whose payload starts at `src`.
    ///
    /// Shrinking adjusts the block in place. Growing extends in place when
    /// the block is its pool's tail and the pool has room; otherwise a new
    /// block is allocated, `min(old, new)` bytes are copied, and `src` is
    /// freed. The returned address replaces `src`, which is invalid after
    /// a relocation.
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header and `src` must be a payload
    /// address previously returned by this map.
    pub unsafe fn reallocate(
        map: NonNull<MemoryMap>,
        src: *mut u8,
        size: usize,
    ) -> AllocResult<NonNull<u8>> {
        if src.is_null() {
            return Err(AllocError::NullParam);
        }

        let block = BlockRef(Block::find(map, src)?.as_ptr());
        let pool = block.parent();
        let old_size = block.size();

        if size <= old_size {
            (*pool).size -= old_size - size;
            block.set_size(size);
            return Ok(NonNull::new_unchecked(block.start()));
        }

        let grown = (*pool).size.checked_add(size - old_size);
        if (*pool).tail == block.0 && grown.is_some_and(|g| g <= (*pool).alloc_size) {
            (*pool).size += size - old_size;
            block.set_size(size);
            return Ok(NonNull::new_unchecked(block.start()));
        }

        let dst = Self::allocate(map, size)?;
        copy_bytes(dst.as_ptr(), src, old_size.min(size));
        let mut old = src;
        Self::free(map, &mut old)?;

        Ok(dst)
    }

    /// Allocates `size` payload bytes and zero-fills them.
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header.
    pub unsafe fn allocate_zeroed(map: NonNull<MemoryMap>, size: usize) -> AllocResult<NonNull<u8>> {
        let ptr = Self::allocate(map, size)?;
        fill_bytes(ptr.as_ptr(), 0, size);
        Ok(ptr)
    }

    /// Frees the allocation whose payload starts at `*target` and nulls the
    /// caller's handle. The owning pool is released once its last block is
    /// freed.
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header; `*target` must not be used
    /// after this call returns `Ok`.
    pub unsafe fn free(map: NonNull<MemoryMap>, target: &mut *mut u8) -> AllocResult<()> {
        if target.is_null() {
            return Err(AllocError::NullParam);
        }

        let block = Block::find(map, *target)?;
        let mut handle = block.as_ptr();
        Block::free(&mut handle);

        *target = ptr::null_mut();

        Ok(())
    }

    /// Frees every pool, destroys the backing arena, and nulls both
    /// handles. All addresses handed out by the map are invalid afterwards.
    ///
    /// # Safety
    ///
    /// `*map` must be null or a live map header created together with
    /// `*arena`.
    pub unsafe fn destroy(map: &mut *mut MemoryMap, arena: &mut *mut Arena) {
        let m = *map;
        if !m.is_null() {
            let mut pools = (*m).pool_head;
            let _ = Pool::free(&mut pools, true);
        }
        *map = ptr::null_mut();

        Arena::destroy(arena, false);
    }

    /// Total live bytes across all pools: payload plus block headers.
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header.
    pub unsafe fn total_size(map: NonNull<MemoryMap>) -> usize {
        let mut total = 0;
        let mut pool = map.as_ref().pool_head;
        while !pool.is_null() {
            total += (*pool).size;
            pool = (*pool).next;
        }
        total
    }

    /// Number of live pools, counted by walking the pool list.
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header.
    pub unsafe fn pool_count(map: NonNull<MemoryMap>) -> usize {
        let mut count = 0;
        let mut pool = map.as_ref().pool_head;
        while !pool.is_null() {
            count += 1;
            pool = (*pool).next;
        }
        count
    }

    /// Number of live blocks, counted by walking every pool's block list.
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header.
    pub unsafe fn block_count(map: NonNull<MemoryMap>) -> usize {
        let mut count = 0;
        let mut pool = map.as_ref().pool_head;
        while !pool.is_null() {
            count += Pool::blocks(pool).count();
            pool = (*pool).next;
        }
        count
    }

    /// The pool count maintained incrementally on pool creation and
    /// removal; always equal to [`MemoryMap::pool_count`].
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header.
    pub unsafe fn tracked_pool_count(map: NonNull<MemoryMap>) -> usize {
        map.as_ref().pool_count
    }

    /// Snapshot of the lifetime counters.
    ///
    /// # Safety
    ///
    /// `map` must point at a live map header.
    pub unsafe fn metadata(map: NonNull<MemoryMap>) -> MapMetadata {
        map.as_ref().metadata
    }
}
