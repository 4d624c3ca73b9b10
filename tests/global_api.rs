//! Lifecycle tests for the process-wide default allocator.
//!
//! The default map is shared by every test in this binary, so each test
//! takes the file-level lock and starts from a dumped state.

use core::ptr;

use parking_lot::{Mutex, MutexGuard};

use mapalloc::block::Block;
use mapalloc::{global, AllocError, FitPolicy, MapParams};

static TEST_LOCK: Mutex<()> = Mutex::new(());

/// Serializes tests against the shared default map and resets it.
fn fresh() -> MutexGuard<'static, ()> {
    let guard = TEST_LOCK.lock();
    global::dump();
    guard
}

#[test]
fn lazy_initialization_on_first_allocate() {
    let _guard = fresh();

    assert_eq!(global::pool_count(), 0);
    let ptr = global::allocate(32).expect("allocation failed");
    assert_eq!(global::pool_count(), 1);
    assert_eq!(global::block_count(), 1);
    assert_eq!(global::total_size(), 32 + Block::HEADER_SIZE);

    let meta = global::metadata();
    assert_eq!(meta.pools_created, 1);
    assert_eq!(meta.blocks_created, 1);

    let mut handle = ptr.as_ptr();
    global::free(&mut handle).unwrap();
    assert!(handle.is_null());

    // The defaults are dynamic: the emptied pool went back to the OS and
    // the totals return to their pre-allocate values.
    let meta = global::metadata();
    assert_eq!(meta.blocks_created, 1);
    assert_eq!(meta.blocks_freed, 1);
    assert_eq!(meta.pools_freed, 1);
    assert_eq!(global::total_size(), 0);
    assert_eq!(global::block_count(), 0);

    global::dump();
}

#[test]
fn explicit_init_precreates_pools() {
    let _guard = fresh();

    global::init(
        2,
        512,
        MapParams {
            policy: FitPolicy::First,
            dynamic: false,
        },
    )
    .unwrap();
    assert_eq!(global::pool_count(), 2);
    assert_eq!(global::metadata().pools_created, 2);

    // Re-init dumps the previous map: counters start over.
    global::init(1, 256, MapParams::default()).unwrap();
    assert_eq!(global::pool_count(), 1);
    assert_eq!(global::metadata().pools_created, 1);

    global::dump();
}

#[test]
fn operations_before_init_fail_uninitialized() {
    let _guard = fresh();

    let mut bogus = 0x1000 as *mut u8;
    assert_eq!(global::free(&mut bogus), Err(AllocError::Uninitialized));
    assert_eq!(
        global::reallocate(bogus, 64).unwrap_err(),
        AllocError::Uninitialized
    );
    assert_eq!(global::total_size(), 0);
    assert_eq!(global::block_count(), 0);
}

#[test]
fn free_null_handle_fails_null_param() {
    let _guard = fresh();

    let keep = global::allocate(16).unwrap();
    let mut null: *mut u8 = ptr::null_mut();
    assert_eq!(global::free(&mut null), Err(AllocError::NullParam));

    let mut handle = keep.as_ptr();
    global::free(&mut handle).unwrap();
    global::dump();
}

#[test]
fn zero_allocate_returns_zeroed_memory() {
    let _guard = fresh();

    // Dirty a block, free it, then zero-allocate into the same gap.
    let dirty = global::allocate(128).unwrap();
    let keep = global::allocate(8).unwrap();
    unsafe {
        dirty.as_ptr().write_bytes(0xee, 128);
    }
    let mut handle = dirty.as_ptr();
    global::free(&mut handle).unwrap();

    let zeroed = global::allocate_zeroed(128).unwrap();
    unsafe {
        for i in 0..128 {
            assert_eq!(zeroed.as_ptr().add(i).read(), 0);
        }
    }

    let _ = keep;
    global::dump();
}

#[test]
fn reallocate_same_size_is_identity() {
    let _guard = fresh();

    let ptr = global::allocate(64).unwrap();
    let same = global::reallocate(ptr.as_ptr(), 64).unwrap();
    assert_eq!(same.as_ptr(), ptr.as_ptr());

    global::dump();
}

#[test]
fn dump_resets_everything_and_is_idempotent() {
    let _guard = fresh();

    for _ in 0..5 {
        global::allocate(100).unwrap();
    }
    assert!(global::total_size() > 0);

    global::dump();
    global::dump();

    assert_eq!(global::total_size(), 0);
    assert_eq!(global::pool_count(), 0);
    assert_eq!(global::block_count(), 0);
    assert_eq!(global::metadata(), mapalloc::MapMetadata::default());

    // A later allocation re-initializes cleanly.
    let ptr = global::allocate(16).unwrap();
    assert_eq!(global::block_count(), 1);
    let mut handle = ptr.as_ptr();
    global::free(&mut handle).unwrap();
    global::dump();
}

#[test]
fn non_dynamic_default_map_surfaces_exhaustion() {
    let _guard = fresh();

    global::init(
        1,
        128,
        MapParams {
            policy: FitPolicy::Linear,
            dynamic: false,
        },
    )
    .unwrap();

    let per_block = 8 + Block::HEADER_SIZE;
    let room = 128 / per_block;
    for _ in 0..room {
        global::allocate(8).unwrap();
    }

    let err = global::allocate(8).unwrap_err();
    assert!(matches!(err, AllocError::InsufficientPoolMemory { .. }));
    assert_eq!(err.code(), 150);

    global::dump();
}
