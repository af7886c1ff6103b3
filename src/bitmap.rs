use core::mem;

/// A fixed-size bitmap over a caller-provided array of `u64` words.
///
/// The allocator keeps one of these per block order to record which blocks
/// currently sit on that order's free list.
pub struct Bitmap {
    num_bits: usize,
    map: *mut u64,
}

impl Bitmap {
    /// The number of `u64` words required to store `num_bits` bits.
    #[inline]
    pub fn words(num_bits: usize) -> usize {
        num_bits
            .checked_add(u64::BITS as usize - 1)
            .unwrap()
            .checked_div(u64::BITS as usize)
            .unwrap()
    }

    /// Constructs a new bitmap of `num_bits` bits, backed by `map`.
    ///
    /// All bits are initially clear.
    ///
    /// # Safety
    ///
    /// `map` must be valid for reads and writes for
    /// `Self::words(num_bits) * mem::size_of::<u64>()` bytes, and it must be
    /// properly aligned.
    pub unsafe fn new(num_bits: usize, map: *mut u64) -> Bitmap {
        assert!(num_bits > 0);
        assert!(!map.is_null());
        assert!(map.align_offset(mem::align_of::<u64>()) == 0);

        for i in 0..Self::words(num_bits) {
            unsafe { map.add(i).write(0) };
        }

        Bitmap { num_bits, map }
    }

    /// Returns a tuple of the index of the `u64` containing `bit` and a mask
    /// which extracts it.
    #[inline]
    const fn index_and_mask(bit: usize) -> (usize, u64) {
        (
            bit / u64::BITS as usize,
            1 << (bit as u64 % u64::BITS as u64),
        )
    }

    /// Gets the value of the indexed bit.
    #[inline]
    pub fn get(&self, index: usize) -> bool {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        unsafe { self.map.add(word_idx).read() & mask != 0 }
    }

    /// Sets the value of the indexed bit.
    #[inline]
    pub fn set(&mut self, index: usize, value: bool) {
        assert!(index < self.num_bits);

        let (word_idx, mask) = Self::index_and_mask(index);

        unsafe {
            let word_ptr = self.map.add(word_idx);
            let word = word_ptr.read();
            word_ptr.write(match value {
                true => word | mask,
                false => word & !mask,
            });
        }
    }
}
