//! The abstract multiplexer contract.

use std::alloc::Layout;
use std::sync::Arc;

use crate::buffer::{Buffer, ConstBuffer, IoRequest, ReadResult, RegisteredBuffer, WriteResult};
use crate::deadline::Deadline;
use crate::error::{MultiplexError, Result};
use crate::handle::IoHandle;
use crate::operation::{
    BarrierKind, OperationId, OperationRequest, OperationStateType, OperationVisitor,
};
use crate::sys;

/// Shared, reference-counted multiplexer.
///
/// Handles and thread bindings hold one of these, so a multiplexer lives
/// until the last handle attached to it and the last binding are gone.
pub type SharedMultiplexer = Arc<dyn Multiplexer>;

/// [`SharedMultiplexer`] that may be moved to and driven from other threads.
///
/// Coerces into a [`SharedMultiplexer`] wherever one is expected.
pub type SyncMultiplexer = Arc<dyn Multiplexer + Send + Sync>;

/// Two-bit classification a multiplexer stores on a registered handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct HandleTag(u8);

impl HandleTag {
    /// Not classified yet; the backend inspects the descriptor on demand.
    pub const UNCLASSIFIED: HandleTag = HandleTag(0);
    /// A pollable stream: pipe, socket or character device.
    pub const POLLABLE: HandleTag = HandleTag(1);
    /// Seekable or otherwise non-pollable; i/o always completes synchronously.
    pub const SEEKABLE: HandleTag = HandleTag(2);

    /// Builds a tag from its two bits.
    pub fn new(bits: u8) -> Result<Self> {
        if bits > 0b11 {
            return Err(MultiplexError::InvalidRequest("handle tag has only two bits"));
        }
        Ok(Self(bits))
    }

    /// Raw bits.
    #[inline]
    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Returns true once the handle has been classified.
    #[inline]
    pub const fn is_classified(self) -> bool {
        self.0 != 0
    }
}

/// Engine tracking and completing many i/o operations without one thread
/// per operation.
///
/// # Operation lifecycle
///
/// 1. [`init_io_operation`](Self::init_io_operation) creates an operation and
///    returns its [`OperationId`]. The i/o is attempted at once and may
///    complete synchronously.
/// 2. [`flush_inited_io_operations`](Self::flush_inited_io_operations)
///    submits anything a batching backend held back.
/// 3. [`check_io_operation`](Self::check_io_operation) or
///    [`check_for_any_completed_io`](Self::check_for_any_completed_io) drive
///    operations to their finished state.
/// 4. The result is moved out with [`take_completed_read`](Self::take_completed_read)
///    or [`take_completed_write_or_barrier`](Self::take_completed_write_or_barrier),
///    and [`release_io_operation`](Self::release_io_operation) frees the slot.
///
/// Initiation is `unsafe`: the buffers a request describes are not
/// borrowed by the operation, so the caller promises to keep them alive and
/// untouched until the operation is released. [`NativeHandle`]'s blocking
/// entry points uphold this themselves and are safe to call.
///
/// [`NativeHandle`]: crate::handle::NativeHandle
pub trait Multiplexer {
    /// Short backend name, e.g. `"epoll"`.
    fn name(&self) -> &'static str;

    /// Size and alignment of the state this multiplexer keeps per operation.
    fn io_state_requirements(&self) -> Layout;

    /// Preallocates room for `count` more operations so initiation does not
    /// allocate on the hot path.
    fn reserve_io_operations(&self, count: usize) -> Result<()>;

    /// Registers a handle, returning the tag the handle should store.
    fn do_io_handle_register(&self, handle: &dyn IoHandle) -> Result<HandleTag>;

    /// Deregisters a handle. Operations still in flight on it are cancelled.
    fn do_io_handle_deregister(&self, handle: &dyn IoHandle) -> Result<()>;

    /// Most buffers one request on `handle` may carry.
    fn do_io_handle_max_buffers(&self, _handle: &dyn IoHandle) -> usize {
        sys::iov_max()
    }

    /// Allocates a registered buffer of at least `bytes` bytes.
    ///
    /// `bytes` is rounded up to page granularity and updated to the size
    /// actually allocated.
    fn do_io_handle_allocate_registered_buffer(
        &self,
        _handle: &dyn IoHandle,
        bytes: &mut usize,
    ) -> Result<RegisteredBuffer> {
        let page = sys::page_size();
        let rounded = (*bytes).max(1).checked_next_multiple_of(page).ok_or(
            MultiplexError::ResourceExhausted("registered buffer size overflows"),
        )?;
        let buffer = RegisteredBuffer::allocate(rounded, page)?;
        *bytes = rounded;
        Ok(buffer)
    }

    /// Creates an operation and attempts it.
    ///
    /// On success the operation is in its `*Initialised`, `*Initiated` or
    /// `*Completed` state. Never blocks past `deadline`; if the deadline has
    /// already expired and the i/o cannot complete at once, returns
    /// [`MultiplexError::TimedOut`] and leaves no operation behind.
    ///
    /// Reads and writes must carry at least one buffer, otherwise
    /// [`MultiplexError::InvalidRequest`] is returned.
    ///
    /// # Safety
    ///
    /// Every buffer in `request` must stay valid for the access it describes
    /// (writes for reads, reads for writes), and must not be accessed by the
    /// caller, until the returned operation has been released with
    /// [`release_io_operation`](Self::release_io_operation) or is reported
    /// unknown. Until then the multiplexer may perform the i/o from any call
    /// that drives operations.
    unsafe fn init_io_operation(
        &self,
        handle: &dyn IoHandle,
        visitor: Option<Arc<dyn OperationVisitor>>,
        registered: Option<RegisteredBuffer>,
        deadline: Deadline,
        request: OperationRequest,
    ) -> Result<OperationId>;

    /// Initiates a scatter read.
    ///
    /// # Safety
    ///
    /// As for [`init_io_operation`](Self::init_io_operation).
    ///
    /// Initiating outside an `unsafe` block does not compile, because the
    /// operation outlives the borrow that built its buffers:
    ///
    /// ```compile_fail,E0133
    /// use iomux::backend::SynchronousMultiplexer;
    /// use iomux::buffer::{Buffer, IoRequest};
    /// use iomux::handle::RawHandle;
    /// use iomux::{Deadline, Multiplexer};
    ///
    /// let mux = SynchronousMultiplexer::new(0);
    /// let handle = RawHandle::new(0, false);
    /// let mut storage = vec![0u8; 64];
    /// let op = mux.init_read(
    ///     &handle,
    ///     None,
    ///     IoRequest::single(Buffer::new(&mut storage), 0),
    ///     Deadline::never(),
    /// );
    /// drop(storage);
    /// ```
    unsafe fn init_read(
        &self,
        handle: &dyn IoHandle,
        visitor: Option<Arc<dyn OperationVisitor>>,
        request: IoRequest<Buffer>,
        deadline: Deadline,
    ) -> Result<OperationId> {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.init_io_operation(
                handle,
                visitor,
                None,
                deadline,
                OperationRequest::Read(request),
            )
        }
    }

    /// Initiates a gather write.
    ///
    /// # Safety
    ///
    /// As for [`init_io_operation`](Self::init_io_operation).
    unsafe fn init_write(
        &self,
        handle: &dyn IoHandle,
        visitor: Option<Arc<dyn OperationVisitor>>,
        request: IoRequest<ConstBuffer>,
        deadline: Deadline,
    ) -> Result<OperationId> {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.init_io_operation(
                handle,
                visitor,
                None,
                deadline,
                OperationRequest::Write(request),
            )
        }
    }

    /// Initiates a barrier.
    ///
    /// # Safety
    ///
    /// As for [`init_io_operation`](Self::init_io_operation).
    unsafe fn init_barrier(
        &self,
        handle: &dyn IoHandle,
        visitor: Option<Arc<dyn OperationVisitor>>,
        request: IoRequest<ConstBuffer>,
        kind: BarrierKind,
        deadline: Deadline,
    ) -> Result<OperationId> {
        // SAFETY: forwarded from the caller.
        unsafe {
            self.init_io_operation(
                handle,
                visitor,
                None,
                deadline,
                OperationRequest::Barrier(request, kind),
            )
        }
    }

    /// Submits operations a batching backend has not yet handed to the OS.
    fn flush_inited_io_operations(&self) -> Result<()> {
        Ok(())
    }

    /// Samples an operation's state without driving it.
    fn current_state(&self, op: OperationId) -> Result<OperationStateType>;

    /// Samples an operation and, where the backend cannot notify
    /// proactively, tries to make progress on it. Never blocks.
    ///
    /// A completed operation is moved to its finished state by this call.
    fn check_io_operation(&self, op: OperationId) -> Result<OperationStateType>;

    /// Cancels an initiated operation.
    ///
    /// A cancelled operation completes with an `ECANCELED` OS error and is
    /// returned in its finished state. An operation that already completed
    /// is returned unchanged. Backends that cannot cancel in-flight i/o
    /// return [`MultiplexError::NotSupported`].
    fn cancel_io_operation(
        &self,
        op: OperationId,
        deadline: Deadline,
    ) -> Result<OperationStateType>;

    /// Drives outstanding operations, finishing up to `max_completions` of
    /// them, and returns how many were finished.
    ///
    /// Sleeps until something completes, `deadline` expires or another
    /// thread calls
    /// [`wake_check_for_any_completed_io`](Self::wake_check_for_any_completed_io);
    /// the latter two return `Ok(0)`.
    fn check_for_any_completed_io(&self, deadline: Deadline, max_completions: usize)
        -> Result<usize>;

    /// Wakes exactly one thread blocked in
    /// [`check_for_any_completed_io`](Self::check_for_any_completed_io).
    /// Does nothing if none is blocked.
    fn wake_check_for_any_completed_io(&self) -> Result<()>;

    /// Moves a completed read result out. Single shot.
    fn take_completed_read(&self, op: OperationId) -> Result<ReadResult>;

    /// Moves a completed write or barrier result out. Single shot.
    fn take_completed_write_or_barrier(&self, op: OperationId) -> Result<WriteResult>;

    /// Frees a finished operation. Refused with
    /// [`MultiplexError::OperationPending`] before it has finished.
    fn release_io_operation(&self, op: OperationId) -> Result<()>;

    /// Number of operations not yet released.
    fn operations_in_flight(&self) -> usize;
}

static_assertions::assert_impl_all!(SyncMultiplexer: Send, Sync);

impl std::fmt::Debug for dyn Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer")
            .field("name", &self.name())
            .field("operations_in_flight", &self.operations_in_flight())
            .finish()
    }
}
