#![no_main]

use std::ptr::NonNull;
use std::slice;

use arbitrary::Arbitrary;
use buddy_arena::BuddyArena;
use libfuzzer_sys::fuzz_target;

const MAX_ARENA: u64 = 1 << 20;
const MAX_ALLOC: usize = 1 << 16;

#[derive(Clone, Debug, Arbitrary)]
enum ArenaOp {
    Allocate { size: usize },
    Deallocate { index: usize },
}

#[derive(Clone, Debug, Arbitrary)]
struct Args {
    size: u64,
    ops: Vec<ArenaOp>,
}

fuzz_target!(|args: Args| {
    let mut arena = match BuddyArena::try_new(args.size % MAX_ARENA) {
        Ok(a) => a,
        Err(_) => return,
    };

    let mut outstanding: Vec<(NonNull<u8>, usize, u8)> = Vec::new();

    for (id, op) in args.ops.into_iter().enumerate() {
        match op {
            ArenaOp::Allocate { size } => {
                let size = size % MAX_ALLOC;

                if let Ok(ptr) = arena.allocate(size) {
                    unsafe { ptr.as_ptr().write_bytes(id as u8, size) };
                    outstanding.push((ptr, size, id as u8));
                }
            }

            ArenaOp::Deallocate { index } => {
                if outstanding.is_empty() {
                    continue;
                }

                let (ptr, size, tag) = outstanding.swap_remove(index % outstanding.len());

                // A torn payload means two live allocations overlapped.
                let bytes = unsafe { slice::from_raw_parts(ptr.as_ptr(), size) };
                assert!(bytes.iter().all(|&b| b == tag));

                unsafe { arena.deallocate(ptr) };
            }
        }
    }
});
