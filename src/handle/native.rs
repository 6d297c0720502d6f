//! Descriptor-owning handle with blocking, deadline-aware i/o.

use std::fs::File;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};

use crate::buffer::{Buffer, ConstBuffer, IoBuffer, IoRequest, IoResult, ReadResult, WriteResult};
use crate::deadline::Deadline;
use crate::error::{MultiplexError, Result};
use crate::handle::IoHandle;
use crate::multiplexer::{HandleTag, Multiplexer, SharedMultiplexer};
use crate::logging::{self, LogLevel};
use crate::operation::{BarrierKind, OperationId, OperationRequest};
use crate::{log_debug, log_operation, log_warn, sys, this_thread};

/// Longest single sleep while waiting for a multiplexed operation, so an
/// operation finished by another draining thread is noticed promptly.
const WAIT_SLICE: Duration = Duration::from_millis(100);

/// An owned descriptor plus its multiplexer registration.
///
/// The blocking entry points use, in order of preference, the handle's own
/// multiplexer, the calling thread's bound multiplexer, or a direct syscall
/// whose deadline is emulated with `poll(2)`. Only multiplexable handles use
/// a multiplexer.
pub struct NativeHandle {
    fd: OwnedFd,
    multiplexable: bool,
    multiplexer: Option<SharedMultiplexer>,
    tag: HandleTag,
}

impl NativeHandle {
    /// Takes ownership of `fd`. A multiplexable handle is switched to
    /// non-blocking mode.
    pub fn from_owned_fd(fd: OwnedFd, multiplexable: bool) -> Result<Self> {
        if multiplexable {
            sys::set_nonblocking(fd.as_raw_fd(), true)?;
        }
        Ok(Self {
            fd,
            multiplexable,
            multiplexer: None,
            tag: HandleTag::UNCLASSIFIED,
        })
    }

    /// Takes ownership of an open file.
    pub fn from_file(file: File, multiplexable: bool) -> Result<Self> {
        Self::from_owned_fd(OwnedFd::from(file), multiplexable)
    }

    /// Creates a pipe, returning `(read end, write end)`.
    pub fn anonymous_pipe(multiplexable: bool) -> Result<(Self, Self)> {
        let (reader, writer) = sys::pipe(multiplexable)?;
        let reader = Self {
            fd: reader,
            multiplexable,
            multiplexer: None,
            tag: HandleTag::UNCLASSIFIED,
        };
        let writer = Self {
            fd: writer,
            multiplexable,
            multiplexer: None,
            tag: HandleTag::UNCLASSIFIED,
        };
        log_debug!(
            "handle",
            "created pipe fd:{} -> fd:{}",
            writer.raw_fd(),
            reader.raw_fd()
        );
        Ok((reader, writer))
    }

    /// Attaches this handle to `multiplexer`, detaching it from any previous
    /// one. `None` detaches.
    ///
    /// Fails with [`MultiplexError::NotSupported`] for handles not opened in
    /// multiplexable mode.
    pub fn set_multiplexer(&mut self, multiplexer: Option<SharedMultiplexer>) -> Result<()> {
        if multiplexer.is_some() && !self.multiplexable {
            return Err(MultiplexError::NotSupported(
                "handle was not opened in multiplexable mode",
            ));
        }
        if let Some(previous) = self.multiplexer.take() {
            self.tag = HandleTag::UNCLASSIFIED;
            previous.do_io_handle_deregister(&*self)?;
        }
        if let Some(next) = multiplexer {
            self.tag = next.do_io_handle_register(&*self)?;
            self.multiplexer = Some(next);
        }
        Ok(())
    }

    /// Reads into `request`'s buffers, blocking no later than `deadline`.
    pub fn read(&self, request: IoRequest<Buffer>, deadline: impl Into<Deadline>) -> ReadResult {
        let deadline = deadline.into();
        match self.effective_multiplexer() {
            Some(mux) => self
                .multiplexed(&*mux, OperationRequest::Read(request), deadline, |mux, op| {
                    mux.take_completed_read(op)
                })
                .unwrap_or_else(ReadResult::failure),
            None => {
                let buffers = request.buffers.clone();
                match self.direct(&OperationRequest::Read(request), deadline) {
                    Ok(n) => ReadResult::from_transfer(buffers, n),
                    Err(e) => ReadResult::failure(e),
                }
            }
        }
    }

    /// Writes `request`'s buffers, blocking no later than `deadline`.
    pub fn write(
        &self,
        request: IoRequest<ConstBuffer>,
        deadline: impl Into<Deadline>,
    ) -> WriteResult {
        let deadline = deadline.into();
        match self.effective_multiplexer() {
            Some(mux) => self
                .multiplexed(&*mux, OperationRequest::Write(request), deadline, |mux, op| {
                    mux.take_completed_write_or_barrier(op)
                })
                .unwrap_or_else(WriteResult::failure),
            None => {
                let buffers = request.buffers.clone();
                match self.direct(&OperationRequest::Write(request), deadline) {
                    Ok(n) => WriteResult::from_transfer(buffers, n),
                    Err(e) => WriteResult::failure(e),
                }
            }
        }
    }

    /// Makes previously written data durable according to `kind`.
    pub fn barrier(
        &self,
        request: IoRequest<ConstBuffer>,
        kind: BarrierKind,
        deadline: impl Into<Deadline>,
    ) -> WriteResult {
        let deadline = deadline.into();
        match self.effective_multiplexer() {
            Some(mux) => self
                .multiplexed(
                    &*mux,
                    OperationRequest::Barrier(request, kind),
                    deadline,
                    |mux, op| mux.take_completed_write_or_barrier(op),
                )
                .unwrap_or_else(WriteResult::failure),
            None => {
                let buffers = request.buffers.clone();
                match self.direct(&OperationRequest::Barrier(request, kind), deadline) {
                    Ok(_) => WriteResult::success(buffers),
                    Err(e) => WriteResult::failure(e),
                }
            }
        }
    }

    fn effective_multiplexer(&self) -> Option<SharedMultiplexer> {
        if !self.multiplexable {
            return None;
        }
        self.multiplexer.clone().or_else(this_thread::multiplexer)
    }

    fn seekable(&self) -> Result<bool> {
        let tag = if self.tag.is_classified() {
            self.tag
        } else {
            sys::classify(self.raw_fd())?
        };
        Ok(tag == HandleTag::SEEKABLE)
    }

    fn direct(&self, request: &OperationRequest, deadline: Deadline) -> Result<usize> {
        request.validate(sys::iov_max())?;
        let seekable = self.seekable()?;
        sys::execute_blocking(self.raw_fd(), seekable, request, deadline)
    }

    /// Runs one operation through `mux` to completion and extracts its
    /// result with `take`. The operation is always released before this
    /// returns, so no operation outlives the caller's buffers.
    fn multiplexed<R>(
        &self,
        mux: &dyn Multiplexer,
        request: OperationRequest,
        deadline: Deadline,
        take: impl FnOnce(&dyn Multiplexer, OperationId) -> Result<IoResult<R>>,
    ) -> Result<IoResult<R>>
    where
        R: IoBuffer,
    {
        let started = Instant::now();
        // SAFETY: the request's buffers are valid for this call, and `retire`
        // below does not return while the operation is still in flight.
        let op = unsafe { mux.init_io_operation(self, None, None, deadline, request)? };

        let waited = mux
            .flush_inited_io_operations()
            .and_then(|()| self.wait(mux, op, deadline));
        let result = match waited {
            Ok(timed_out) => take(mux, op).map(|result| {
                if timed_out && result.error().is_some_and(MultiplexError::is_cancelled) {
                    IoResult::failure(MultiplexError::TimedOut)
                } else {
                    result
                }
            }),
            Err(e) => {
                if let Err(cancel) = mux.cancel_io_operation(op, Deadline::immediate()) {
                    let fd = self.raw_fd();
                    log_operation!(Debug, "handle", op, fd, "not cancelled: {}", cancel);
                }
                Err(e)
            }
        };

        Self::retire(mux, op);
        if logging::enabled(LogLevel::Debug) {
            let what = format!("{op} on fd:{}", self.raw_fd());
            logging::log_timing("handle", &what, started.elapsed());
        }
        result
    }

    /// Releases `op`, first driving it to its finished state if it is still
    /// in flight.
    fn retire(mux: &dyn Multiplexer, op: OperationId) {
        loop {
            match mux.release_io_operation(op) {
                Ok(()) => return,
                Err(MultiplexError::OperationPending) => {}
                Err(e) => {
                    log_warn!("handle", "could not release {}: {}", op, e);
                    return;
                }
            }
            let drained = mux.check_io_operation(op).and_then(|state| {
                if state.is_finished() {
                    Ok(0)
                } else {
                    mux.check_for_any_completed_io(Deadline::after(WAIT_SLICE), usize::MAX)
                }
            });
            if let Err(e) = drained {
                log_warn!("handle", "could not drive {} to completion: {}", op, e);
                return;
            }
        }
    }

    /// Drives `op` until finished. Returns whether it had to be cancelled
    /// because the deadline expired.
    ///
    /// An operation the multiplexer cannot cancel fails with
    /// [`MultiplexError::TimedOut`] once the deadline passes.
    fn wait(&self, mux: &dyn Multiplexer, op: OperationId, deadline: Deadline) -> Result<bool> {
        let fd = self.raw_fd();
        let mut cancelled = false;
        loop {
            let state = mux.check_io_operation(op)?;
            if state.is_finished() {
                return Ok(cancelled);
            }
            if !cancelled && deadline.has_expired() {
                cancelled = true;
                match mux.cancel_io_operation(op, deadline) {
                    Ok(state) => {
                        log_operation!(Debug, "handle", op, fd, "timed out in state {}", state);
                        continue;
                    }
                    Err(MultiplexError::NotSupported(_)) => {
                        log_operation!(Debug, "handle", op, fd, "timed out, cannot cancel");
                        return Err(MultiplexError::TimedOut);
                    }
                    Err(e) => return Err(e),
                }
            }
            let slice = Deadline::after(WAIT_SLICE);
            let until = if cancelled {
                slice
            } else {
                slice.earliest(deadline)
            };
            mux.check_for_any_completed_io(until, usize::MAX)?;
        }
    }
}

impl IoHandle for NativeHandle {
    fn raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    fn is_multiplexable(&self) -> bool {
        self.multiplexable
    }

    fn multiplexer(&self) -> Option<&SharedMultiplexer> {
        self.multiplexer.as_ref()
    }

    fn multiplexer_tag(&self) -> HandleTag {
        self.tag
    }
}

impl AsFd for NativeHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for NativeHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

impl Drop for NativeHandle {
    fn drop(&mut self) {
        if let Some(mux) = self.multiplexer.take() {
            if let Err(e) = mux.do_io_handle_deregister(&*self) {
                log_warn!("handle", "deregistering fd:{} failed: {}", self.raw_fd(), e);
            }
        }
    }
}

impl std::fmt::Debug for NativeHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeHandle")
            .field("fd", &self.raw_fd())
            .field("multiplexable", &self.multiplexable)
            .field("multiplexer", &self.multiplexer.as_ref().map(|m| m.name()))
            .field("tag", &self.tag)
            .finish()
    }
}
