//! Page-aligned heap buffers for direct i/o.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

use triedb_types::CPU_PAGE_SIZE;

/// A heap allocation aligned to the CPU page size, as required by `O_DIRECT`
/// transfers. Always zero-initialized so flushing a partially filled page
/// pads with zeroes for free.
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    cap: usize,
}

// The buffer is uniquely owned; moving it between threads is sound.
unsafe impl Send for AlignedBuf {}

impl AlignedBuf {
    pub fn zeroed(cap: usize) -> Self {
        assert!(cap > 0, "zero-sized i/o buffer");
        let layout = Layout::from_size_align(cap, CPU_PAGE_SIZE)
            .unwrap_or_else(|_| panic!("unrepresentable buffer layout: {cap}"));
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| std::alloc::handle_alloc_error(layout));
        Self { ptr, cap }
    }

    pub fn capacity(&self) -> usize {
        self.cap
    }

    /// Zeroes the buffer so it can be handed back out without leaking stale
    /// bytes into a short read.
    pub fn clear(&mut self) {
        self.as_mut_slice().fill(0);
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: ptr is valid for cap bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.cap) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: ptr is valid for cap bytes and uniquely borrowed.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.cap) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.cap, CPU_PAGE_SIZE)
            .unwrap_or_else(|_| unreachable!("layout validated at allocation"));
        // SAFETY: allocated with the identical layout in `zeroed`.
        unsafe { dealloc(self.ptr.as_ptr(), layout) }
    }
}

impl Deref for AlignedBuf {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl DerefMut for AlignedBuf {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.as_mut_slice()
    }
}
