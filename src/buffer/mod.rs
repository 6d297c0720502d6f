//! Buffer views, requests and transfer results.
//!
//! The types in this module do not own the memory they describe. A [`Buffer`]
//! is a pointer and a length, exactly what the kernel needs for scatter/gather
//! i/o. The caller owns the memory and must keep it alive, and must not touch
//! it, until the operation using it has completed.
//!
//! # Example
//!
//! ```rust
//! use iomux::buffer::{Buffer, ConstBuffer, IoRequest};
//!
//! let mut storage = [0u8; 64];
//! let request = IoRequest::new(vec![Buffer::new(&mut storage)], 0);
//! assert_eq!(request.total_len(), 64);
//!
//! let gather = IoRequest::single(ConstBuffer::new(b"hello"), 0);
//! assert_eq!(gather.total_len(), 5);
//! ```

pub mod registered;
pub mod result;

pub use registered::RegisteredBuffer;
pub use result::{IoResult, ReadResult, WriteResult};

/// Common view over [`Buffer`] and [`ConstBuffer`].
pub trait IoBuffer: Copy + Send + Sync + std::fmt::Debug {
    /// Address of the first byte.
    fn as_ptr(&self) -> *const u8;

    /// Number of bytes described.
    fn len(&self) -> usize;

    /// Returns true if the view describes no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The same view shortened to `len` bytes.
    fn truncated(self, len: usize) -> Self;
}

/// Scatter buffer: a mutable, non-owning view the kernel fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    ptr: *mut u8,
    len: usize,
}

// SAFETY: a Buffer is a plain address/length pair. Dereferencing it is
// already unsafe and governed by the caller's contract, so moving the view
// between threads adds no hazard of its own.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    /// Describes `memory`. The borrow ends immediately; the caller must keep
    /// the memory alive and untouched until any operation using it completes.
    #[inline]
    pub fn new(memory: &mut [u8]) -> Self {
        Self {
            ptr: memory.as_mut_ptr(),
            len: memory.len(),
        }
    }

    /// Builds a view from raw parts.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for writes of `len` bytes for as long as the view
    /// is used by an operation.
    #[inline]
    pub const unsafe fn from_raw_parts(ptr: *mut u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Mutable address of the first byte.
    #[inline]
    pub fn as_mut_ptr(&self) -> *mut u8 {
        self.ptr
    }

    /// Borrows the described bytes.
    ///
    /// # Safety
    ///
    /// The memory must still be alive and no operation may be writing to it.
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl IoBuffer for Buffer {
    #[inline]
    fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn truncated(self, len: usize) -> Self {
        Self {
            ptr: self.ptr,
            len: len.min(self.len),
        }
    }
}

/// Gather buffer: a read-only, non-owning view the kernel drains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstBuffer {
    ptr: *const u8,
    len: usize,
}

// SAFETY: see `Buffer`.
unsafe impl Send for ConstBuffer {}
unsafe impl Sync for ConstBuffer {}

impl ConstBuffer {
    /// Describes `memory`. The caller must keep it alive until any operation
    /// using it completes.
    #[inline]
    pub fn new(memory: &[u8]) -> Self {
        Self {
            ptr: memory.as_ptr(),
            len: memory.len(),
        }
    }

    /// Builds a view from raw parts.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads of `len` bytes for as long as the view
    /// is used by an operation.
    #[inline]
    pub const unsafe fn from_raw_parts(ptr: *const u8, len: usize) -> Self {
        Self { ptr, len }
    }

    /// Borrows the described bytes.
    ///
    /// # Safety
    ///
    /// The memory must still be alive and unmodified for `'a`.
    #[inline]
    pub unsafe fn as_slice<'a>(&self) -> &'a [u8] {
        if self.len == 0 {
            return &[];
        }
        // SAFETY: upheld by the caller.
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }
}

impl IoBuffer for ConstBuffer {
    #[inline]
    fn as_ptr(&self) -> *const u8 {
        self.ptr
    }

    #[inline]
    fn len(&self) -> usize {
        self.len
    }

    #[inline]
    fn truncated(self, len: usize) -> Self {
        Self {
            ptr: self.ptr,
            len: len.min(self.len),
        }
    }
}

impl From<Buffer> for ConstBuffer {
    #[inline]
    fn from(buffer: Buffer) -> Self {
        Self {
            ptr: buffer.ptr,
            len: buffer.len,
        }
    }
}

impl<'a> From<&'a [u8]> for ConstBuffer {
    #[inline]
    fn from(memory: &'a [u8]) -> Self {
        Self::new(memory)
    }
}

impl<'a> From<&'a mut [u8]> for Buffer {
    #[inline]
    fn from(memory: &'a mut [u8]) -> Self {
        Self::new(memory)
    }
}

/// An ordered buffer list plus the byte offset at which to start.
///
/// Buffer order is fill order for reads and drain order for writes. The
/// offset is ignored by stream resources such as pipes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IoRequest<T> {
    /// Buffers to fill or drain, in order.
    pub buffers: Vec<T>,
    /// Starting byte offset within the resource.
    pub offset: u64,
}

impl<T: IoBuffer> IoRequest<T> {
    /// Creates a request.
    pub fn new(buffers: Vec<T>, offset: u64) -> Self {
        Self { buffers, offset }
    }

    /// Creates a single-buffer request.
    pub fn single(buffer: T, offset: u64) -> Self {
        Self::new(vec![buffer], offset)
    }

    /// Sum of the lengths of all buffers.
    pub fn total_len(&self) -> usize {
        self.buffers.iter().map(IoBuffer::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffer_describes_memory() {
        let mut storage = [7u8; 16];
        let buffer = Buffer::new(&mut storage);
        assert_eq!(buffer.len(), 16);
        assert_eq!(buffer.as_ptr(), storage.as_ptr());
        assert_eq!(unsafe { buffer.as_slice() }, &[7u8; 16]);
    }

    #[test]
    fn const_buffer_from_buffer() {
        let mut storage = *b"abc";
        let buffer = Buffer::new(&mut storage);
        let gather = ConstBuffer::from(buffer);
        assert_eq!(gather.len(), 3);
        assert_eq!(gather.as_ptr(), buffer.as_ptr());
        assert_eq!(unsafe { gather.as_slice() }, b"abc");
    }

    #[test]
    fn truncation_never_grows() {
        let data = [0u8; 8];
        let view = ConstBuffer::new(&data);
        assert_eq!(view.truncated(3).len(), 3);
        assert_eq!(view.truncated(100).len(), 8);
        assert!(view.truncated(0).is_empty());
    }

    #[test]
    fn request_total_len() {
        let a = [0u8; 10];
        let b = [0u8; 22];
        let request = IoRequest::new(vec![ConstBuffer::new(&a), ConstBuffer::new(&b)], 4096);
        assert_eq!(request.total_len(), 32);
        assert_eq!(request.offset, 4096);
    }

    #[test]
    fn empty_view_slices_safely() {
        let buffer = unsafe { Buffer::from_raw_parts(std::ptr::null_mut(), 0) };
        assert!(unsafe { buffer.as_slice() }.is_empty());
    }
}
