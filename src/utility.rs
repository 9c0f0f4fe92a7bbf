//! Small helpers shared across the crate: power-of-two math, aligned heap
//! buffers, and the hash finalizer used by the default key implementations.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;

#[inline]
pub const fn is_power_of_two(n: u64) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

/// Round `size` up to a multiple of `alignment` (which must be a power of two).
#[inline]
pub const fn pad_alignment(size: usize, alignment: usize) -> usize {
    debug_assert!(is_power_of_two(alignment as u64));
    (size + alignment - 1) & !(alignment - 1)
}

/// MurmurHash3 64-bit finalizer. Good avalanche for integer keys.
#[inline]
pub const fn murmur3_finalize(mut h: u64) -> u64 {
    h ^= h >> 33;
    h = h.wrapping_mul(0xff51afd7ed558ccd);
    h ^= h >> 33;
    h = h.wrapping_mul(0xc4ceb9fe1a85ec53);
    h ^= h >> 33;
    h
}

/// RAII owner of a zero-initialized, alignment-constrained heap buffer.
///
/// Page frames and hash tables need stronger alignment than `Vec<u8>`
/// guarantees, so they allocate through this wrapper.
pub struct AlignedBuffer {
    ptr: NonNull<u8>,
    size: usize,
    alignment: usize,
}

impl AlignedBuffer {
    /// Allocate a zeroed buffer. Returns `None` on allocation failure or a
    /// degenerate layout.
    pub fn zeroed(alignment: usize, size: usize) -> Option<Self> {
        debug_assert!(is_power_of_two(alignment as u64));
        debug_assert!(size > 0);
        let layout = Layout::from_size_align(size, alignment).ok()?;
        // SAFETY: layout is non-zero-sized and validated above.
        let ptr = unsafe { alloc_zeroed(layout) };
        NonNull::new(ptr).map(|ptr| Self {
            ptr,
            size,
            alignment,
        })
    }

    #[inline]
    pub fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr() as *const u8
    }

    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr.as_ptr()
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: the buffer is owned, initialized (zeroed) and `size` bytes long.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Zero the whole buffer.
    ///
    /// # Safety
    /// The caller must guarantee no other thread is reading or writing the
    /// buffer (page frames enforce this through head/tail boundaries).
    pub unsafe fn clear(&self) {
        std::ptr::write_bytes(self.ptr.as_ptr(), 0, self.size);
    }
}

impl Drop for AlignedBuffer {
    fn drop(&mut self) {
        // SAFETY: ptr/size/alignment describe the original allocation.
        unsafe {
            let layout = Layout::from_size_align_unchecked(self.size, self.alignment);
            dealloc(self.ptr.as_ptr(), layout);
        }
    }
}

// SAFETY: AlignedBuffer owns its allocation; access discipline is the
// caller's responsibility (raw pointers never escape checked accessors).
unsafe impl Send for AlignedBuffer {}
unsafe impl Sync for AlignedBuffer {}
