//! Page-aligned memory regions shared between the caller and a multiplexer.

use std::alloc::{alloc_zeroed, dealloc, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use crate::buffer::{Buffer, ConstBuffer};
use crate::error::{MultiplexError, Result};
use crate::log_trace;

/// Owned, page-aligned allocation backing a [`RegisteredBuffer`].
#[derive(Debug)]
struct Region {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the region is a plain heap allocation with no thread affinity.
// Concurrent access to its bytes is governed by the unsafe accessors on
// `RegisteredBuffer`.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Drop for Region {
    fn drop(&mut self) {
        log_trace!(
            "buffer",
            "releasing registered region of {} bytes",
            self.layout.size()
        );
        // SAFETY: ptr was returned by alloc_zeroed with this exact layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Reference-counted memory region usable for zero-copy transfer.
///
/// Cloning shares the region. The memory is released when the last holder,
/// which may be an in-flight operation, drops its handle. The caller must not
/// touch the bytes while an operation using the region is outstanding.
#[derive(Debug, Clone)]
pub struct RegisteredBuffer {
    region: Arc<Region>,
}

impl RegisteredBuffer {
    /// Allocates a zeroed region of `len` bytes aligned to `align`.
    ///
    /// `len` is used as given; callers round to page granularity first.
    pub(crate) fn allocate(len: usize, align: usize) -> Result<Self> {
        if len == 0 {
            return Err(MultiplexError::InvalidRequest(
                "registered buffer length must be non-zero",
            ));
        }
        let layout = Layout::from_size_align(len, align)
            .map_err(|_| MultiplexError::InvalidRequest("invalid registered buffer layout"))?;

        // SAFETY: layout has non-zero size.
        let ptr = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(MultiplexError::ResourceExhausted(
            "registered buffer allocation failed",
        ))?;

        log_trace!("buffer", "allocated registered region of {} bytes", len);
        Ok(Self {
            region: Arc::new(Region { ptr, layout }),
        })
    }

    /// Size of the region in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.region.layout.size()
    }

    /// Always false: regions are never empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    /// Alignment of the region.
    #[inline]
    pub fn alignment(&self) -> usize {
        self.region.layout.align()
    }

    /// Number of live handles to this region, including in-flight operations.
    #[inline]
    pub fn holders(&self) -> usize {
        Arc::strong_count(&self.region)
    }

    /// Scatter view over the whole region.
    pub fn as_buffer(&self) -> Buffer {
        // SAFETY: the region is valid for len() bytes while any handle lives.
        unsafe { Buffer::from_raw_parts(self.region.ptr.as_ptr(), self.len()) }
    }

    /// Gather view over the whole region.
    pub fn as_const_buffer(&self) -> ConstBuffer {
        // SAFETY: as above.
        unsafe { ConstBuffer::from_raw_parts(self.region.ptr.as_ptr(), self.len()) }
    }

    /// Borrows the region's bytes.
    ///
    /// # Safety
    ///
    /// No operation may be writing into the region for the lifetime of the
    /// returned slice.
    pub unsafe fn as_slice(&self) -> &[u8] {
        // SAFETY: upheld by the caller; the allocation is live while self is.
        unsafe { std::slice::from_raw_parts(self.region.ptr.as_ptr(), self.len()) }
    }

    /// Mutably borrows the region's bytes.
    ///
    /// # Safety
    ///
    /// No operation may be using the region, and no other holder may access
    /// it, for the lifetime of the returned slice.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_mut_slice(&self) -> &mut [u8] {
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts_mut(self.region.ptr.as_ptr(), self.len()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::IoBuffer;

    #[test]
    fn allocation_is_zeroed_and_aligned() {
        let buffer = RegisteredBuffer::allocate(8192, 4096).unwrap();
        assert_eq!(buffer.len(), 8192);
        assert_eq!(buffer.alignment(), 4096);
        assert_eq!(buffer.as_buffer().as_ptr() as usize % 4096, 0);
        assert!(unsafe { buffer.as_slice() }.iter().all(|&b| b == 0));
    }

    #[test]
    fn holders_track_clones() {
        let buffer = RegisteredBuffer::allocate(4096, 4096).unwrap();
        assert_eq!(buffer.holders(), 1);
        let shared = buffer.clone();
        assert_eq!(buffer.holders(), 2);
        drop(shared);
        assert_eq!(buffer.holders(), 1);
    }

    #[test]
    fn views_cover_region() {
        let buffer = RegisteredBuffer::allocate(4096, 4096).unwrap();
        unsafe { buffer.as_mut_slice()[..3].copy_from_slice(b"abc") };
        let view = buffer.as_const_buffer();
        assert_eq!(view.len(), 4096);
        assert_eq!(&unsafe { view.as_slice() }[..3], b"abc");
    }

    #[test]
    fn zero_length_is_rejected() {
        assert!(matches!(
            RegisteredBuffer::allocate(0, 4096),
            Err(MultiplexError::InvalidRequest(_))
        ));
    }
}
