//! Walkthrough of the default allocator: allocate, reallocate,
//! zero-allocate, free, and the introspection helpers.
//!
//! Run with `cargo run --example basic_usage`.

use mapalloc::{global, FitPolicy, MapParams};

fn main() -> Result<(), mapalloc::AllocError> {
    global::init(
        1,
        4096,
        MapParams {
            policy: FitPolicy::Best,
            dynamic: true,
        },
    )?;

    // A buffer of 64 u32 values, written through the raw payload pointer.
    let count = 64;
    let buffer = global::allocate(count * 4)?;
    unsafe {
        let values = buffer.as_ptr().cast::<u32>();
        for i in 0..count {
            values.add(i).write_unaligned(i as u32 * 3);
        }
        println!(
            "allocated {count} u32s, first={} last={}",
            values.read_unaligned(),
            values.add(count - 1).read_unaligned()
        );
    }

    // Growing the buffer keeps the existing contents.
    let buffer = global::reallocate(buffer.as_ptr(), count * 8)?;
    unsafe {
        let values = buffer.as_ptr().cast::<u32>();
        assert_eq!(values.add(count - 1).read_unaligned(), (count as u32 - 1) * 3);
    }
    println!("grown to {} bytes in place or relocated", count * 8);

    // Zeroed allocation.
    let zeroed = global::allocate_zeroed(128)?;
    unsafe {
        for i in 0..128 {
            assert_eq!(zeroed.as_ptr().add(i).read(), 0);
        }
    }

    println!(
        "live: {} bytes across {} blocks in {} pools",
        global::total_size(),
        global::block_count(),
        global::pool_count()
    );

    let mut handle = buffer.as_ptr();
    global::free(&mut handle)?;
    let mut handle = zeroed.as_ptr();
    global::free(&mut handle)?;

    let meta = global::metadata();
    println!(
        "created/freed: {}/{} blocks, {}/{} pools",
        meta.blocks_created, meta.blocks_freed, meta.pools_created, meta.pools_freed
    );

    global::dump();
    Ok(())
}
