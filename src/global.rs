//! Process-wide default allocator
//!
//! One [`MemoryMap`] and its backing [`Arena`] form the default allocator
//! for the process. It is created lazily by the first [`allocate`] (with
//! the crate defaults), eagerly by [`init`], and torn down by [`dump`].
//!
//! The singleton sits behind a mutex so that overlapping calls cannot
//! corrupt it; this serializes access, it does not make the allocator a
//! concurrent one. Addresses handed out remain plain raw pointers whose
//! lifetime the caller manages.

use core::ptr::{self, NonNull};

use parking_lot::Mutex;

use crate::arena::Arena;
use crate::error::{AllocError, AllocResult};
use crate::map::{MapMetadata, MapParams, MemoryMap, DEFAULT_POOL_COUNT, DEFAULT_POOL_SIZE};

#[cfg(feature = "logging")]
use tracing::debug;

struct DefaultMap {
    map: *mut MemoryMap,
    arena: *mut Arena,
}

// SAFETY: every access to the raw pointers goes through the mutex below;
// the allocator is single-threaded by contract and the lock enforces that
// no two calls overlap.
unsafe impl Send for DefaultMap {}

static DEFAULT: Mutex<DefaultMap> = Mutex::new(DefaultMap {
    map: ptr::null_mut(),
    arena: ptr::null_mut(),
});

impl DefaultMap {
    /// Map pointer, creating the map with crate defaults if necessary.
    fn get_or_init(&mut self) -> AllocResult<NonNull<MemoryMap>> {
        if self.map.is_null() {
            #[cfg(feature = "logging")]
            debug!("lazily initializing default memory map");

            let (map, arena) =
                MemoryMap::create(DEFAULT_POOL_COUNT, DEFAULT_POOL_SIZE, MapParams::default())?;
            self.map = map.as_ptr();
            self.arena = arena.as_ptr();
        }

        // SAFETY: just checked or created above.
        Ok(unsafe { NonNull::new_unchecked(self.map) })
    }

    fn get(&self) -> AllocResult<NonNull<MemoryMap>> {
        NonNull::new(self.map).ok_or(AllocError::Uninitialized)
    }

    fn teardown(&mut self) {
        // SAFETY: the pointers were produced by MemoryMap::create and are
        // only reachable through this (locked) struct.
        unsafe {
            MemoryMap::destroy(&mut self.map, &mut self.arena);
        }
    }
}

/// Creates the default map eagerly with the given parameters.
///
/// An already existing default map is dumped first, so `init` always
/// leaves a freshly created map behind.
pub fn init(init_pool_count: usize, init_pool_size: usize, params: MapParams) -> AllocResult<()> {
    let mut state = DEFAULT.lock();
    if !state.map.is_null() {
        state.teardown();
    }

    let (map, arena) = MemoryMap::create(init_pool_count, init_pool_size, params)?;
    state.map = map.as_ptr();
    state.arena = arena.as_ptr();

    Ok(())
}

/// Allocates `size` bytes from the default map, creating it with the crate
/// defaults on first use.
///
/// The returned address stays valid until it is freed, relocated by
/// [`reallocate`], or invalidated wholesale by [`dump`].
pub fn allocate(size: usize) -> AllocResult<NonNull<u8>> {
    let mut state = DEFAULT.lock();
    let map = state.get_or_init()?;
    // SAFETY: the map is live and the lock serializes all mutation.
    unsafe { MemoryMap::allocate(map, size) }
}

/// Allocates `size` zero-filled bytes from the default map.
pub fn allocate_zeroed(size: usize) -> AllocResult<NonNull<u8>> {
    let mut state = DEFAULT.lock();
    let map = state.get_or_init()?;
    // SAFETY: as in `allocate`.
    unsafe { MemoryMap::allocate_zeroed(map, size) }
}

/// Resizes the allocation at `src`, in place when possible.
///
/// On relocation the old address is freed and must be discarded. Fails
/// with `Uninitialized` when no default map exists.
pub fn reallocate(src: *mut u8, size: usize) -> AllocResult<NonNull<u8>> {
    let state = DEFAULT.lock();
    let map = state.get()?;
    // SAFETY: as in `allocate`.
    unsafe { MemoryMap::reallocate(map, src, size) }
}

/// Frees the allocation whose payload starts at `*target` and nulls the
/// handle. Fails with `Uninitialized` when no default map exists.
pub fn free(target: &mut *mut u8) -> AllocResult<()> {
    let state = DEFAULT.lock();
    let map = state.get()?;
    // SAFETY: as in `allocate`.
    unsafe { MemoryMap::free(map, target) }
}

/// Destroys the default map: every pool is released, the backing arena is
/// destroyed, and all previously returned addresses become invalid. The
/// next [`allocate`] re-initializes from the defaults. Idempotent.
pub fn dump() {
    let mut state = DEFAULT.lock();
    if state.map.is_null() {
        return;
    }

    #[cfg(feature = "logging")]
    debug!("dumping default memory map");

    state.teardown();
}

/// Total live payload + header bytes across the default map's pools; zero
/// when uninitialized.
#[must_use]
pub fn total_size() -> usize {
    let state = DEFAULT.lock();
    match state.get() {
        // SAFETY: map is live under the lock.
        Ok(map) => unsafe { MemoryMap::total_size(map) },
        Err(_) => 0,
    }
}

/// Number of live pools in the default map; zero when uninitialized.
#[must_use]
pub fn pool_count() -> usize {
    let state = DEFAULT.lock();
    match state.get() {
        // SAFETY: map is live under the lock.
        Ok(map) => unsafe { MemoryMap::pool_count(map) },
        Err(_) => 0,
    }
}

/// Number of live blocks in the default map; zero when uninitialized.
#[must_use]
pub fn block_count() -> usize {
    let state = DEFAULT.lock();
    match state.get() {
        // SAFETY: map is live under the lock.
        Ok(map) => unsafe { MemoryMap::block_count(map) },
        Err(_) => 0,
    }
}

/// Snapshot of the default map's lifetime counters; all zero when
/// uninitialized.
#[must_use]
pub fn metadata() -> MapMetadata {
    let state = DEFAULT.lock();
    match state.get() {
        // SAFETY: map is live under the lock.
        Ok(map) => unsafe { MemoryMap::metadata(map) },
        Err(_) => MapMetadata::default(),
    }
}
