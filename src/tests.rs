extern crate std;

use core::ptr::NonNull;
use core::slice;
use std::prelude::rust_2021::*;

use quickcheck::{Arbitrary, Gen, QuickCheck};

use crate::buddy::{BuddyArena, HEADER_BYTES};
use crate::polyfill::NonNullStrict;
use crate::{AllocInitError, BackingAllocator, Raw};

/// Offset of an allocation from the arena base.
fn offset_in<A: BackingAllocator>(arena: &mut BuddyArena<A>, ptr: NonNull<u8>) -> usize {
    ptr.addr().get() - arena.region().cast::<u8>().addr().get()
}

#[test]
fn create_and_destroy() {
    let arena = BuddyArena::try_new(1016).unwrap();
    drop(arena);
}

#[test]
fn undersized_arena_is_rejected() {
    // 0 + 8 rounds to 8 bytes, below the minimum block size.
    assert!(matches!(
        BuddyArena::try_new(0),
        Err(AllocInitError::InvalidConfig)
    ));
}

#[test]
fn oversized_arena_is_rejected() {
    // 2^32 rounds to 2^33 with the header word, which exceeds the largest
    // supported arena.
    assert!(matches!(
        BuddyArena::try_new(1 << 32),
        Err(AllocInitError::InvalidConfig)
    ));
    assert!(matches!(
        BuddyArena::try_new(u64::MAX),
        Err(AllocInitError::InvalidConfig)
    ));
}

#[test]
fn layout_calculators_cover_the_largest_arena() {
    let region = BuddyArena::<Raw>::region_layout((1 << 32) - 8).unwrap();
    assert_eq!(region.size(), 1 << 32);
    assert_eq!(region.align(), 16);

    let metadata = BuddyArena::<Raw>::metadata_layout((1 << 32) - 8).unwrap();
    assert!(metadata.size() > 0);
    assert_eq!(metadata.align(), 8);
}

#[test]
fn zero_size_requests_are_served() {
    let mut arena = BuddyArena::try_new(1016).unwrap();

    let a = arena.allocate(0).unwrap();
    let b = arena.allocate(0).unwrap();
    assert_ne!(a, b);

    unsafe {
        arena.deallocate(a);
        arena.deallocate(b);
    }
}

#[test]
fn alloc_write_and_free() {
    let mut arena = BuddyArena::try_new(8184).unwrap();

    let ptr = arena.allocate(64).unwrap();

    {
        // Do this in a separate scope so that the slice no longer exists
        // when ptr is freed.
        let buf: &mut [u8] = unsafe { slice::from_raw_parts_mut(ptr.as_ptr(), 64) };
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = i as u8;
        }
    }

    unsafe { arena.deallocate(ptr) };
}

#[test]
fn split_and_adjacent() {
    let mut arena = BuddyArena::try_new(1016).unwrap();

    // 504 + 8 rounds to an order-9 block, 248 + 8 to an order-8 block. The
    // first allocation splits the arena in half and takes the front; the
    // second splits the back half and takes its front.
    let q = arena.allocate(504).unwrap();
    let r = arena.allocate(248).unwrap();

    assert_eq!(offset_in(&mut arena, q), HEADER_BYTES);
    assert_eq!(offset_in(&mut arena, r), 512 + HEADER_BYTES);

    unsafe {
        arena.deallocate(r);
        arena.deallocate(q);
    }
}

#[test]
fn free_then_realloc_reproduces_layout() {
    let mut arena = BuddyArena::try_new(1016).unwrap();

    let q = arena.allocate(504).unwrap();
    let r = arena.allocate(248).unwrap();

    unsafe {
        arena.deallocate(r);
        arena.deallocate(q);
    }

    let q2 = arena.allocate(504).unwrap();
    let r2 = arena.allocate(248).unwrap();

    assert_eq!(q2, q);
    assert_eq!(r2, r);

    unsafe {
        arena.deallocate(r2);
        arena.deallocate(q2);
    }
}

#[test]
fn whole_arena_coalesces_after_free() {
    let mut arena = BuddyArena::try_new(1016).unwrap();

    let p = arena.allocate(1016).unwrap();
    assert_eq!(offset_in(&mut arena, p), HEADER_BYTES);

    unsafe { arena.deallocate(p) };

    // The whole arena is allocatable again only if the free lists were
    // restored to a single top-order block.
    let p2 = arena.allocate(1016).unwrap();
    assert_eq!(offset_in(&mut arena, p2), HEADER_BYTES);

    unsafe { arena.deallocate(p2) };
}

#[test]
fn request_above_capacity_fails() {
    let mut arena = BuddyArena::try_new(1016).unwrap();

    // Anything above 1016 bytes rounds past the arena size.
    arena.allocate(1017).unwrap_err();
    arena.allocate(usize::MAX).unwrap_err();
}

#[test]
fn exhaustion_then_recovery() {
    let mut arena = BuddyArena::try_new(1016).unwrap();

    let p = arena.allocate(1016).unwrap();
    arena.allocate(16).unwrap_err();

    unsafe { arena.deallocate(p) };

    let q = arena.allocate(16).unwrap();
    unsafe { arena.deallocate(q) };
}

#[test]
fn fragmentation_exhaustion() {
    let mut arena = BuddyArena::try_new(1016).unwrap();

    // Eight order-7 blocks tile the arena end to end.
    let blocks: Vec<NonNull<u8>> = (0..8).map(|_| arena.allocate(120).unwrap()).collect();
    for (i, &block) in blocks.iter().enumerate() {
        assert_eq!(offset_in(&mut arena, block), i * 128 + HEADER_BYTES);
    }

    arena.allocate(120).unwrap_err();

    for &block in &blocks {
        unsafe { arena.deallocate(block) };
    }

    // Freeing all eight must merge everything back into one block.
    let p = arena.allocate(1016).unwrap();
    unsafe { arena.deallocate(p) };
}

#[test]
fn split_buddy_is_not_coalesced() {
    let mut arena = BuddyArena::try_new(1016).unwrap();

    let big = arena.allocate(504).unwrap(); // order 9 at offset 0
    let small_a = arena.allocate(120).unwrap(); // order 7 at offset 512
    let small_b = arena.allocate(120).unwrap(); // order 7 at offset 640

    assert_eq!(offset_in(&mut arena, big), HEADER_BYTES);
    assert_eq!(offset_in(&mut arena, small_a), 512 + HEADER_BYTES);
    assert_eq!(offset_in(&mut arena, small_b), 640 + HEADER_BYTES);

    unsafe { small_b.as_ptr().write_bytes(0x5A, 120) };

    unsafe { arena.deallocate(small_a) };

    // The order-9 buddy of `big` is split, with only its front quarter
    // free. Its leading word reads as a free-list link, but freeing `big`
    // must not treat it as a whole free order-9 block.
    unsafe { arena.deallocate(big) };

    // The back half still holds a live allocation, so the arena must not
    // have merged whole.
    arena.allocate(1016).unwrap_err();

    let bytes = unsafe { slice::from_raw_parts(small_b.as_ptr(), 120) };
    assert!(bytes.iter().all(|&b| b == 0x5A));

    unsafe { arena.deallocate(small_b) };

    // Now everything is free and the arena must coalesce whole again.
    let p = arena.allocate(1016).unwrap();
    assert_eq!(offset_in(&mut arena, p), HEADER_BYTES);

    unsafe { arena.deallocate(p) };
}

#[test]
fn raw_construction_round_trip() {
    let region_layout = BuddyArena::<Raw>::region_layout(1016).unwrap();
    let metadata_layout = BuddyArena::<Raw>::metadata_layout(1016).unwrap();

    unsafe {
        let region = NonNull::new(std::alloc::alloc(region_layout)).unwrap();
        let metadata = NonNull::new(std::alloc::alloc(metadata_layout)).unwrap();

        let mut arena = BuddyArena::new_raw(region, metadata, 1016).unwrap();

        let p = arena.allocate(64).unwrap();
        p.as_ptr().write_bytes(0xC3, 64);
        arena.deallocate(p);

        let (region, metadata) = arena.into_raw_parts();
        std::alloc::dealloc(region.as_ptr(), region_layout);
        std::alloc::dealloc(metadata.as_ptr(), metadata_layout);
    }
}

enum AllocatorOpTag {
    Allocate,
    Free,
}

#[derive(Clone, Debug)]
enum AllocatorOp {
    /// Allocate a buffer of `size` bytes.
    Allocate { size: usize },
    /// Free an existing allocation.
    ///
    /// Given `n` outstanding allocations, the allocation to free is at index
    /// `index % n`.
    Free { index: usize },
}

/// Limit on allocation size, expressed in bits.
const ALLOC_LIMIT_BITS: u8 = 16;

impl Arbitrary for AllocatorOp {
    fn arbitrary(g: &mut Gen) -> Self {
        match g
            .choose(&[AllocatorOpTag::Allocate, AllocatorOpTag::Free])
            .unwrap()
        {
            AllocatorOpTag::Allocate => AllocatorOp::Allocate {
                size: {
                    // Try to distribute allocations evenly between powers of two.
                    let exp = u8::arbitrary(g) % (ALLOC_LIMIT_BITS + 1);
                    usize::arbitrary(g) % 2_usize.pow(exp.into())
                },
            },
            AllocatorOpTag::Free => AllocatorOp::Free {
                index: usize::arbitrary(g),
            },
        }
    }
}

struct Allocation {
    id: u8,
    ptr: NonNull<u8>,
    size: usize,
}

#[test]
fn allocations_are_mutually_exclusive() {
    fn prop(ops: Vec<AllocatorOp>) -> bool {
        let mut arena = BuddyArena::try_new(1 << 16).unwrap();

        let mut allocations: Vec<Allocation> = Vec::new();

        for (op_id, op) in ops.into_iter().enumerate() {
            match op {
                AllocatorOp::Allocate { size } => {
                    let ptr = match arena.allocate(size) {
                        Ok(p) => p,
                        Err(_) => continue,
                    };

                    let id = op_id as u8;
                    unsafe { ptr.as_ptr().write_bytes(id, size) };

                    allocations.push(Allocation { id, ptr, size });
                }

                AllocatorOp::Free { index } => {
                    if allocations.is_empty() {
                        continue;
                    }

                    let a = allocations.swap_remove(index % allocations.len());

                    unsafe {
                        let bytes: &[u8] = slice::from_raw_parts(a.ptr.as_ptr(), a.size);
                        if bytes.iter().any(|&byte| byte != a.id) {
                            return false;
                        }

                        arena.deallocate(a.ptr);
                    }
                }
            }
        }

        true
    }

    let mut qc = QuickCheck::new();
    qc.quickcheck(prop as fn(_) -> bool);
}
