//! Binary buddy allocation over a single power-of-two arena.
//!
//! The allocator manages one contiguous region whose size is a power of two
//! between 16 bytes and 4 GiB. Block sizes are powers of two as well, named
//! by their *order* (the base-2 logarithm of the size). A free block of
//! order `o` sits on the free list of its order; when no block of the
//! requested order is free, the allocator splits the head of the nearest
//! larger list in half repeatedly, and when a block is freed it is merged
//! with its *buddy* (the adjacent block its parent was split into) for as
//! long as that buddy is also free.
//!
//! ## Characteristics
//!
//! #### Time complexity
//!
//! | Operation                | Best-case | Worst-case  |
//! |--------------------------|-----------|-------------|
//! | Allocate                 | O(1)      | O(log size) |
//! | Deallocate               | O(1)      | O(log size) |
//!
//! #### Fragmentation
//!
//! Requests are rounded up to a power of two, so internal fragmentation
//! approaches 50% in the worst case. External fragmentation is bounded by
//! eager coalescing: two free buddies of the same order never coexist on a
//! free list.

use core::alloc::Layout;
use core::mem::{self, ManuallyDrop};
use core::num::NonZeroUsize;
use core::ptr::NonNull;
use core::{array, cmp, fmt};

use crate::bitmap::Bitmap;
use crate::polyfill::{NonNullStrict, UsizeExt};
use crate::{
    AllocError, AllocInitError, BackingAllocator, BasePtr, BlockHeader, FreeLink, Raw,
};

#[cfg(any(feature = "alloc", test))]
use crate::Global;

/// The order of the smallest block the allocator will carve.
///
/// A free block must be able to hold a pair of list links, so blocks are
/// never smaller than 16 bytes.
pub const MIN_ORDER: u32 = 4;

/// The order of the largest supported arena (4 GiB).
pub const MAX_ORDER: u32 = 32;

/// The number of bytes reserved at the front of every allocated block.
pub const HEADER_BYTES: usize = mem::size_of::<BlockHeader>();

/// Alignment of the arena region; every block is at least this aligned
/// relative to the base.
const BLOCK_ALIGN: usize = 1 << MIN_ORDER;

const NUM_BANKS: usize = MAX_ORDER as usize + 1;

/// Computes the rounded arena size and top block order for a requested
/// arena size.
fn arena_params(size: u64) -> Result<(usize, u32), AllocInitError> {
    let padded = size
        .checked_add(HEADER_BYTES as u64)
        .ok_or(AllocInitError::InvalidConfig)?;
    let arena_size = padded
        .checked_next_power_of_two()
        .ok_or(AllocInitError::InvalidConfig)?;

    if arena_size < (1 << MIN_ORDER) || arena_size > (1 << MAX_ORDER) {
        return Err(AllocInitError::InvalidConfig);
    }

    let arena_size: usize = arena_size
        .try_into()
        .map_err(|_| AllocInitError::InvalidConfig)?;

    Ok((arena_size, arena_size.log2()))
}

/// The number of `u64` words backing the free bitmaps of an arena.
///
/// Each order from [`MIN_ORDER`] up to the top order gets one bit per block
/// of that order.
fn metadata_words(arena_size: usize, max_order: u32) -> usize {
    (MIN_ORDER..=max_order)
        .map(|order| Bitmap::words(arena_size >> order))
        .sum()
}

/// A binary buddy allocator over a single contiguous arena.
///
/// The managed region is created by [`try_new`] (out of the global
/// allocator) or supplied by the caller via [`new_raw`]. All allocator
/// state other than the free-list heads lives in-band: free blocks carry
/// their list links in their first bytes, and allocated blocks carry a
/// one-word header recording their order.
///
/// [`try_new`]: BuddyArena::try_new
/// [`new_raw`]: BuddyArena::new_raw
pub struct BuddyArena<A: BackingAllocator> {
    /// Pointer to the region managed by this allocator.
    base: BasePtr,
    /// Pointer to the region that backs the free bitmaps.
    metadata: NonNull<u8>,
    /// Order of the whole arena.
    max_order: u32,
    /// Free-list heads, indexed by block order.
    heads: [Option<NonZeroUsize>; NUM_BANKS],
    /// Per-order bitmaps with one bit per block of that order, set while
    /// the block sits on the order's free list.
    free_maps: [Option<Bitmap>; NUM_BANKS],
    backing_allocator: A,
}

impl BuddyArena<Raw> {
    /// Constructs a new `BuddyArena` from raw pointers.
    ///
    /// `size` is the largest allocation the arena must be able to serve;
    /// the managed region is the next power of two above `size` plus the
    /// header word.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the rounded arena size
    /// falls outside the supported range, and
    /// [`AllocInitError::InvalidLocation`] if the region would wrap the
    /// address space.
    ///
    /// # Safety
    ///
    /// The caller must uphold the following invariants:
    /// - `region` must be a pointer to a region that satisfies the
    ///   [`Layout`] returned by [`Self::region_layout(size)`], and it must
    ///   be valid for reads and writes for the entire size indicated by
    ///   that `Layout`.
    /// - `metadata` must be a pointer to a region that satisfies the
    ///   [`Layout`] returned by [`Self::metadata_layout(size)`], and it
    ///   must be valid for reads and writes for the entire size indicated
    ///   by that `Layout`.
    ///
    /// [`Self::region_layout(size)`]: BuddyArena::region_layout
    /// [`Self::metadata_layout(size)`]: BuddyArena::metadata_layout
    pub unsafe fn new_raw(
        region: NonNull<u8>,
        metadata: NonNull<u8>,
        size: u64,
    ) -> Result<BuddyArena<Raw>, AllocInitError> {
        unsafe {
            RawBuddyArena::try_new(region, metadata, size)
                .map(|raw| raw.with_backing_allocator(Raw))
        }
    }
}

#[cfg(any(feature = "alloc", test))]
impl BuddyArena<Global> {
    /// Attempts to construct a new `BuddyArena` backed by the global
    /// allocator.
    ///
    /// `size` is the largest allocation the arena must be able to serve;
    /// the managed region is the next power of two above `size` plus the
    /// header word.
    ///
    /// # Errors
    ///
    /// Returns [`AllocInitError::InvalidConfig`] if the rounded arena size
    /// falls outside the supported range, and
    /// [`AllocInitError::AllocFailed`] if the global allocator refuses
    /// either the region or the metadata allocation.
    pub fn try_new(size: u64) -> Result<BuddyArena<Global>, AllocInitError> {
        let region_layout = Self::region_layout(size)?;
        let metadata_layout = Self::metadata_layout(size)?;

        unsafe {
            let region = NonNull::new(alloc::alloc::alloc(region_layout))
                .ok_or(AllocInitError::AllocFailed(region_layout))?;

            let metadata = match NonNull::new(alloc::alloc::alloc(metadata_layout)) {
                Some(m) => m,
                None => {
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    return Err(AllocInitError::AllocFailed(metadata_layout));
                }
            };

            match RawBuddyArena::try_new(region, metadata, size) {
                Ok(raw) => Ok(raw.with_backing_allocator(Global)),
                Err(e) => {
                    alloc::alloc::dealloc(metadata.as_ptr(), metadata_layout);
                    alloc::alloc::dealloc(region.as_ptr(), region_layout);
                    Err(e)
                }
            }
        }
    }
}

impl<A: BackingAllocator> BuddyArena<A> {
    /// Returns the layout requirements of the arena region for an allocator
    /// created with `size`.
    pub fn region_layout(size: u64) -> Result<Layout, AllocInitError> {
        let (arena_size, _) = arena_params(size)?;

        Layout::from_size_align(arena_size, BLOCK_ALIGN)
            .map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Returns the layout requirements of the free-bitmap region for an
    /// allocator created with `size`.
    pub fn metadata_layout(size: u64) -> Result<Layout, AllocInitError> {
        let (arena_size, max_order) = arena_params(size)?;

        Layout::array::<u64>(metadata_words(arena_size, max_order))
            .map_err(|_| AllocInitError::InvalidConfig)
    }

    /// Attempts to allocate a block of at least `size` bytes.
    ///
    /// The request is served by the smallest power-of-two block that can
    /// hold `size` bytes plus the header word, and never by a block smaller
    /// than 32 bytes. The returned pointer addresses at least
    /// `max(size, 16)` usable bytes.
    ///
    /// # Errors
    ///
    /// Returns `Err` if the request exceeds the arena size or if no
    /// sufficiently large contiguous block is free.
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let order = self.alloc_order(size).ok_or(AllocError)?;

        // Fast path: a block of the right order is already free.
        if let Some(block) = unsafe { self.detach_head(order) } {
            return Ok(unsafe { self.lease(block, order) });
        }

        // Otherwise split the head of the nearest larger list down to the
        // requested order.
        let parent = (order + 1..=self.max_order)
            .find(|&o| self.heads[o as usize].is_some())
            .ok_or(AllocError)?;

        for o in (order + 1..=parent).rev() {
            // The front half keeps the parent's address; the back half
            // starts one child-size further on. Both land on the child
            // list, front first.
            let front = unsafe { self.detach_head(o) }.expect("split source vanished");
            let child = o - 1;
            let back = self
                .base
                .addr_at(self.base.offset_to(front) + (1 << child));

            unsafe {
                self.push_free(child, front);
                self.push_free(child, back);
            }
        }

        let block =
            unsafe { self.detach_head(order) }.expect("split cascade missed the target order");

        Ok(unsafe { self.lease(block, order) })
    }

    /// Returns a block to the allocator, merging it with its buddy at every
    /// order where the buddy is also whole and free.
    ///
    /// # Safety
    ///
    /// `ptr` must denote a block previously returned by [`allocate`] on
    /// this allocator that has not been deallocated since. The caller must
    /// not access the block after this call.
    ///
    /// [`allocate`]: BuddyArena::allocate
    pub unsafe fn deallocate(&mut self, ptr: NonNull<u8>) {
        // Immediately drop and shadow the caller's pointer by converting it
        // to an address. From here on the block is only touched through the
        // base pointer.
        let user = ptr.addr();

        let block = NonZeroUsize::new(user.get().checked_sub(HEADER_BYTES).unwrap()).unwrap();
        let header = unsafe { self.base.header_at(block) };

        debug_assert!(header.is_used(), "header clobbered or double free");

        let order = header.order();
        assert!(
            (MIN_ORDER..=self.max_order).contains(&order),
            "header order out of range"
        );

        // Rejoining a free list overwrites the header with link fields.
        unsafe { self.push_free(order, block) };

        self.coalesce(block, order);
    }

    /// Returns a pointer to the managed region.
    ///
    /// It is undefined behavior to dereference the returned pointer or
    /// upgrade it to a reference if there are any outstanding allocations.
    pub fn region(&mut self) -> NonNull<[u8]> {
        self.base.with_addr_and_size(self.base.addr(), self.arena_size())
    }

    /// Decomposes the allocator into its raw components.
    ///
    /// The returned tuple contains the region pointer and the metadata
    /// pointer.
    ///
    /// # Safety
    ///
    /// All outstanding allocations are invalidated when this method is
    /// called; the returned region pointer becomes the sole owner of the
    /// region that was used to construct the allocator. As such, all
    /// allocations made from this allocator should be either freed or
    /// forgotten before calling this method.
    pub unsafe fn into_raw_parts(self) -> (NonNull<u8>, NonNull<u8>) {
        let this = ManuallyDrop::new(self);

        (this.base.ptr(), this.metadata)
    }

    #[inline]
    fn arena_size(&self) -> usize {
        1 << self.max_order
    }

    /// The order of block that serves a `size`-byte request, or `None` if
    /// no block this arena can hold would.
    fn alloc_order(&self, size: usize) -> Option<u32> {
        let padded = cmp::max(size, 1 << MIN_ORDER).checked_add(HEADER_BYTES)?;
        let block_size = padded.checked_next_power_of_two()?;
        let order = block_size.log2();

        (order <= self.max_order).then_some(order)
    }

    /// Retrieves the offset of the buddy of the block at `ofs`.
    #[inline]
    fn buddy_ofs(ofs: usize, order: u32) -> usize {
        ofs ^ (1 << order)
    }

    /// Retrieves the index of the block at `ofs` within its order's bitmap.
    #[inline]
    fn block_index(ofs: usize, order: u32) -> usize {
        ofs >> order
    }

    #[inline]
    fn free_map(&mut self, order: u32) -> &mut Bitmap {
        self.free_maps[order as usize]
            .as_mut()
            .expect("no free bitmap for order")
    }

    /// Stamps the header onto a detached block and hands out its payload.
    unsafe fn lease(&mut self, block: NonZeroUsize, order: u32) -> NonNull<u8> {
        unsafe { self.base.init_header_at(block, BlockHeader::new_used(order)) };

        let user = NonZeroUsize::new(block.get() + HEADER_BYTES).unwrap();
        self.base.with_addr(user)
    }

    /// Removes and returns the head of `bank[order]`.
    ///
    /// The returned block's own link fields are left as they were; the
    /// caller overwrites them with a header or fresh links.
    unsafe fn detach_head(&mut self, order: u32) -> Option<NonZeroUsize> {
        let head = self.heads[order as usize].take()?;

        let next = unsafe { self.base.link_mut(head) }.next;
        if let Some(next) = next {
            unsafe { self.base.link_mut(next) }.prev = None;
        }
        self.heads[order as usize] = next;

        let ofs = self.base.offset_to(head);
        self.free_map(order).set(Self::block_index(ofs, order), false);

        Some(head)
    }

    /// Inserts `block` into `bank[order]`.
    ///
    /// The block becomes the head of an empty list; otherwise it is linked
    /// in directly behind the current head.
    unsafe fn push_free(&mut self, order: u32, block: NonZeroUsize) {
        assert_eq!(block.get() & (mem::align_of::<FreeLink>() - 1), 0);

        match self.heads[order as usize] {
            None => {
                unsafe {
                    self.base
                        .init_link_at(block, FreeLink { prev: None, next: None })
                };
                self.heads[order as usize] = Some(block);
            }
            Some(head) => {
                let second = unsafe { self.base.link_mut(head) }.next;

                unsafe {
                    self.base.init_link_at(
                        block,
                        FreeLink {
                            prev: Some(head),
                            next: second,
                        },
                    );
                    self.base.link_mut(head).next = Some(block);
                }

                if let Some(second) = second {
                    unsafe { self.base.link_mut(second) }.prev = Some(block);
                }
            }
        }

        let ofs = self.base.offset_to(block);
        self.free_map(order).set(Self::block_index(ofs, order), true);
    }

    /// Removes `block` from `bank[order]`, wherever it sits.
    unsafe fn remove_free(&mut self, order: u32, block: NonZeroUsize) {
        if self.heads[order as usize] == Some(block) {
            unsafe { self.detach_head(order) };
            return;
        }

        // Splice an interior node, then null its own links.
        let link = unsafe { self.base.link_mut(block) };
        let (prev, next) = (link.prev, link.next);

        if let Some(prev) = prev {
            unsafe { self.base.link_mut(prev) }.next = next;
        }
        if let Some(next) = next {
            unsafe { self.base.link_mut(next) }.prev = prev;
        }

        unsafe {
            self.base
                .init_link_at(block, FreeLink { prev: None, next: None })
        };

        let ofs = self.base.offset_to(block);
        self.free_map(order).set(Self::block_index(ofs, order), false);
    }

    /// Merges the block with its buddy for as long as the buddy is whole
    /// and free at the same order.
    fn coalesce(&mut self, mut block: NonZeroUsize, mut order: u32) {
        while order < self.max_order {
            let ofs = self.base.offset_to(block);
            let buddy_ofs = Self::buddy_ofs(ofs, order);
            let buddy = self.base.addr_at(buddy_ofs);

            // An allocated buddy announces itself with the used bit of its
            // header word.
            if unsafe { self.base.header_at(buddy) }.is_used() {
                break;
            }

            // The leading word also reads as "free" when the buddy has been
            // split and its front piece freed at a smaller order; only the
            // free bit confirms the buddy is whole at this order.
            if !self.free_map(order).get(Self::block_index(buddy_ofs, order)) {
                break;
            }

            unsafe {
                self.remove_free(order, block);
                self.remove_free(order, buddy);
            }

            // The merged block starts at the lower of the two addresses.
            block = cmp::min(block, buddy);
            order += 1;

            unsafe { self.push_free(order, block) };
        }
    }
}

impl<A: BackingAllocator> Drop for BuddyArena<A> {
    fn drop(&mut self) {
        let region_layout = Layout::from_size_align(self.arena_size(), BLOCK_ALIGN).unwrap();
        let metadata_layout =
            Layout::array::<u64>(metadata_words(self.arena_size(), self.max_order)).unwrap();

        unsafe {
            self.backing_allocator
                .deallocate(self.base.ptr(), region_layout);
            self.backing_allocator
                .deallocate(self.metadata, metadata_layout);
        }
    }
}

impl<A: BackingAllocator> fmt::Debug for BuddyArena<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BuddyArena")
            .field("base", &self.base)
            .field("max_order", &self.max_order)
            .finish()
    }
}

/// Like a `BuddyArena`, but without a `Drop` impl or an associated
/// allocator.
///
/// This assists in tacking on the allocator type parameter, because this
/// struct can be moved out of while `BuddyArena` itself cannot.
struct RawBuddyArena {
    base: BasePtr,
    metadata: NonNull<u8>,
    max_order: u32,
    heads: [Option<NonZeroUsize>; NUM_BANKS],
    free_maps: [Option<Bitmap>; NUM_BANKS],
}

impl RawBuddyArena {
    fn with_backing_allocator<A: BackingAllocator>(
        self,
        backing_allocator: A,
    ) -> BuddyArena<A> {
        let RawBuddyArena {
            base,
            metadata,
            max_order,
            heads,
            free_maps,
        } = self;

        BuddyArena {
            base,
            metadata,
            max_order,
            heads,
            free_maps,
            backing_allocator,
        }
    }

    /// Constructs a new `RawBuddyArena` from raw pointers.
    ///
    /// # Safety
    ///
    /// As for [`BuddyArena::new_raw`].
    unsafe fn try_new(
        region: NonNull<u8>,
        metadata: NonNull<u8>,
        size: u64,
    ) -> Result<RawBuddyArena, AllocInitError> {
        assert!(BLOCK_ALIGN >= mem::size_of::<FreeLink>());

        let (arena_size, max_order) = arena_params(size)?;

        if region.addr().get() & (BLOCK_ALIGN - 1) != 0 {
            return Err(AllocInitError::InvalidConfig);
        }

        // Pointer calculations on the region must not wrap the address
        // space.
        region
            .addr()
            .get()
            .checked_add(arena_size)
            .ok_or(AllocInitError::InvalidLocation)?;

        let base = BasePtr::new(region, arena_size);

        // The coalescer probes raw words out of the arena, so memory that
        // has never been allocated must read as zero.
        unsafe { region.as_ptr().write_bytes(0, arena_size) };

        // Carve one bitmap per order out of the metadata region.
        let mut free_maps: [Option<Bitmap>; NUM_BANKS] = array::from_fn(|_| None);
        let mut meta_curs = metadata.as_ptr().cast::<u64>();

        for order in MIN_ORDER..=max_order {
            let num_bits = arena_size >> order;

            free_maps[order as usize] = Some(unsafe { Bitmap::new(num_bits, meta_curs) });
            meta_curs = unsafe { meta_curs.add(Bitmap::words(num_bits)) };
        }

        let mut raw = RawBuddyArena {
            base,
            metadata,
            max_order,
            heads: [None; NUM_BANKS],
            free_maps,
        };

        // The whole arena starts out as the sole free block of the top
        // order.
        unsafe {
            base.init_link_at(base.addr(), FreeLink { prev: None, next: None });
        }
        raw.heads[max_order as usize] = Some(base.addr());
        raw.free_maps[max_order as usize]
            .as_mut()
            .expect("no free bitmap for top order")
            .set(0, true);

        Ok(raw)
    }
}
