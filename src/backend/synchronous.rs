//! Multiplexer that completes every operation inside its initiation.
//!
//! Initiation performs the syscall directly, waiting for readiness with
//! `poll(2)` no longer than the operation's deadline. Nothing is ever left
//! in flight, so cancellation only applies to operations that have already
//! completed, and draining merely finishes them. Registered buffers are not
//! offered.

use std::alloc::Layout;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use crate::buffer::{ReadResult, RegisteredBuffer, WriteResult};
use crate::deadline::Deadline;
use crate::error::{MultiplexError, Result};
use crate::handle::IoHandle;
use crate::multiplexer::{HandleTag, Multiplexer};
use crate::operation::{
    OperationArena, OperationCore, OperationId, OperationRequest, OperationStateType,
    OperationVisitor, PendingIo, StateCell, SynchronisedState,
};
use crate::{log_debug, log_operation, log_trace, sys};

#[derive(Debug, Default)]
struct WakeState {
    waiters: usize,
    wakes: usize,
}

/// [`Multiplexer`] built on blocking syscalls.
///
/// Available on every Unix. Operation states are lock-guarded, so one
/// instance may be shared between threads.
pub struct SynchronousMultiplexer {
    arena: OperationArena<SynchronisedState>,
    completed: Mutex<VecDeque<OperationId>>,
    wake: Mutex<WakeState>,
    woken: Condvar,
}

impl SynchronousMultiplexer {
    /// Creates a multiplexer holding at most `max_operations` operations
    /// (0 = unbounded).
    pub fn new(max_operations: usize) -> Self {
        log_debug!(
            "synchronous",
            "created synchronous multiplexer (max_operations: {})",
            max_operations
        );
        Self {
            arena: OperationArena::new(max_operations),
            completed: Mutex::new(VecDeque::new()),
            wake: Mutex::new(WakeState::default()),
            woken: Condvar::new(),
        }
    }

    fn seekable(handle: &dyn IoHandle) -> Result<bool> {
        let tag = handle.multiplexer_tag();
        let tag = if tag.is_classified() {
            tag
        } else {
            sys::classify(handle.raw_fd())?
        };
        Ok(tag == HandleTag::SEEKABLE)
    }

    fn finish_completed(&self, max: usize) -> Result<usize> {
        let mut finished = 0;
        while finished < max {
            let Some(op) = self.completed.lock()?.pop_front() else {
                break;
            };
            if let Ok(cell) = self.arena.get(op) {
                if cell.lock().finish() {
                    finished += 1;
                }
            }
        }
        Ok(finished)
    }

    fn enter_drain(&self) -> Result<()> {
        self.wake.lock()?.waiters += 1;
        Ok(())
    }

    /// Stops counting the caller as a drainer. The last one out discards
    /// wake-ups nobody consumed.
    fn leave_drain(&self) -> Result<()> {
        let mut state = self.wake.lock()?;
        state.waiters = state.waiters.saturating_sub(1);
        if state.waiters == 0 {
            state.wakes = 0;
        }
        Ok(())
    }

    /// Sleeps until woken or `deadline` expires.
    fn sleep(&self, deadline: Deadline) -> Result<()> {
        let mut state = self.wake.lock()?;
        loop {
            if state.wakes > 0 {
                state.wakes -= 1;
                return Ok(());
            }
            match deadline.remaining() {
                None => state = self.woken.wait(state)?,
                Some(left) if left.is_zero() => return Ok(()),
                Some(left) => state = self.woken.wait_timeout(state, left)?.0,
            }
        }
    }
}

impl Default for SynchronousMultiplexer {
    fn default() -> Self {
        Self::new(0)
    }
}

impl Multiplexer for SynchronousMultiplexer {
    fn name(&self) -> &'static str {
        "synchronous"
    }

    fn io_state_requirements(&self) -> Layout {
        Layout::new::<SynchronisedState>()
    }

    fn reserve_io_operations(&self, count: usize) -> Result<()> {
        self.arena.reserve(count)
    }

    fn do_io_handle_register(&self, handle: &dyn IoHandle) -> Result<HandleTag> {
        let tag = sys::classify(handle.raw_fd())?;
        log_debug!("synchronous", "registered fd:{}", handle.raw_fd());
        Ok(tag)
    }

    fn do_io_handle_deregister(&self, handle: &dyn IoHandle) -> Result<()> {
        log_debug!("synchronous", "deregistered fd:{}", handle.raw_fd());
        Ok(())
    }

    fn do_io_handle_allocate_registered_buffer(
        &self,
        _handle: &dyn IoHandle,
        _bytes: &mut usize,
    ) -> Result<RegisteredBuffer> {
        Err(MultiplexError::NotSupported(
            "synchronous multiplexer has no registered buffers",
        ))
    }

    unsafe fn init_io_operation(
        &self,
        handle: &dyn IoHandle,
        visitor: Option<Arc<dyn OperationVisitor>>,
        registered: Option<RegisteredBuffer>,
        deadline: Deadline,
        request: OperationRequest,
    ) -> Result<OperationId> {
        request.validate(self.do_io_handle_max_buffers(handle))?;
        let seekable = Self::seekable(handle)?;
        let fd = handle.raw_fd();

        let outcome = sys::execute_blocking(fd, seekable, &request, deadline);
        if let Err(MultiplexError::TimedOut) = outcome {
            log_trace!("synchronous", "operation on fd:{} timed out", fd);
            return Err(MultiplexError::TimedOut);
        }

        let (op, cell) = self.arena.insert(|id| {
            OperationCore::new(
                id,
                fd,
                visitor,
                PendingIo {
                    registered,
                    deadline,
                    request,
                },
            )
        })?;
        {
            let mut core = cell.lock();
            match outcome {
                Ok(n) => core.complete_transfer(Ok(n)),
                Err(MultiplexError::Io(e)) => core.complete_transfer(Err(e)),
                Err(other) => core.complete_error(other),
            };
        }
        self.completed.lock()?.push_back(op);
        log_operation!(Trace, "synchronous", op, fd, "completed");
        Ok(op)
    }

    fn current_state(&self, op: OperationId) -> Result<OperationStateType> {
        self.arena.state(op)
    }

    fn check_io_operation(&self, op: OperationId) -> Result<OperationStateType> {
        let cell = self.arena.get(op)?;
        let mut core = cell.lock();
        if core.state().is_completed() && core.finish() {
            let mut queue = self.completed.lock()?;
            if let Some(at) = queue.iter().position(|queued| *queued == op) {
                queue.remove(at);
            }
        }
        Ok(core.state())
    }

    fn cancel_io_operation(
        &self,
        op: OperationId,
        _deadline: Deadline,
    ) -> Result<OperationStateType> {
        let state = self.arena.state(op)?;
        if state.is_initiated() || state.is_initialised() {
            return Err(MultiplexError::NotSupported(
                "synchronous multiplexer cannot cancel in-flight i/o",
            ));
        }
        Ok(state)
    }

    fn check_for_any_completed_io(
        &self,
        deadline: Deadline,
        max_completions: usize,
    ) -> Result<usize> {
        self.enter_drain()?;
        let drained = self
            .finish_completed(max_completions.max(1))
            .and_then(|finished| {
                if finished == 0 {
                    self.sleep(deadline)?;
                }
                Ok(finished)
            });
        self.leave_drain()?;
        drained
    }

    fn wake_check_for_any_completed_io(&self) -> Result<()> {
        let mut state = self.wake.lock()?;
        if state.waiters > state.wakes {
            state.wakes += 1;
            self.woken.notify_one();
        }
        Ok(())
    }

    fn take_completed_read(&self, op: OperationId) -> Result<ReadResult> {
        self.arena.take_completed_read(op)
    }

    fn take_completed_write_or_barrier(&self, op: OperationId) -> Result<WriteResult> {
        self.arena.take_completed_write_or_barrier(op)
    }

    fn release_io_operation(&self, op: OperationId) -> Result<()> {
        self.arena.release(op)
    }

    fn operations_in_flight(&self) -> usize {
        self.arena.len()
    }
}

impl std::fmt::Debug for SynchronousMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SynchronousMultiplexer")
            .field("operations_in_flight", &self.arena.len())
            .finish()
    }
}

static_assertions::assert_impl_all!(SynchronousMultiplexer: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{Buffer, ConstBuffer, IoRequest};
    use crate::handle::RawHandle;
    use crate::operation::BarrierKind;
    use std::os::fd::AsRawFd;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    #[derive(Default)]
    struct WriteEdges {
        initiated: AtomicUsize,
        completed_from: Mutex<Vec<OperationStateType>>,
    }

    impl OperationVisitor for WriteEdges {
        fn write_initiated(&self, _op: OperationId, _former: OperationStateType) {
            self.initiated.fetch_add(1, Ordering::SeqCst);
        }

        fn write_completed(
            &self,
            _op: OperationId,
            former: OperationStateType,
            result: WriteResult,
        ) -> Option<WriteResult> {
            self.completed_from.lock().unwrap().push(former);
            Some(result)
        }
    }

    #[test]
    fn operations_complete_during_initiation() {
        let mux = SynchronousMultiplexer::new(0);
        let (r, w) = sys::pipe(false).unwrap();
        let reader = RawHandle::new(r.as_raw_fd(), false);
        let writer = RawHandle::new(w.as_raw_fd(), false);

        let request = IoRequest::single(ConstBuffer::new(b"sync"), 0);
        // SAFETY: static data.
        let write = unsafe { mux.init_write(&writer, None, request, Deadline::never()) }.unwrap();
        assert!(mux.current_state(write).unwrap().is_completed());

        let mut storage = [0u8; 8];
        let request = IoRequest::single(Buffer::new(&mut storage), 0);
        // SAFETY: completes before returning; released before `storage` is read.
        let read = unsafe { mux.init_read(&reader, None, request, Deadline::never()) }.unwrap();
        assert_eq!(
            mux.check_for_any_completed_io(Deadline::immediate(), usize::MAX).unwrap(),
            2
        );
        assert_eq!(mux.take_completed_read(read).unwrap().bytes_transferred(), 4);
        for op in [read, write] {
            mux.release_io_operation(op).unwrap();
        }
        assert_eq!(&storage[..4], b"sync");
    }

    #[test]
    fn completion_skips_the_initiated_edge() {
        let mux = SynchronousMultiplexer::new(0);
        let file = tempfile::tempfile().unwrap();
        let handle = RawHandle::new(file.as_raw_fd(), false);
        let edges = Arc::new(WriteEdges::default());

        let request = IoRequest::single(ConstBuffer::new(b"edge"), 0);
        // SAFETY: static data.
        let op = unsafe {
            mux.init_write(&handle, Some(edges.clone()), request, Deadline::never())
        }
        .unwrap();

        assert_eq!(edges.initiated.load(Ordering::SeqCst), 0);
        assert_eq!(
            *edges.completed_from.lock().unwrap(),
            [OperationStateType::WriteInitialised]
        );
        mux.check_io_operation(op).unwrap();
        mux.release_io_operation(op).unwrap();
    }

    #[test]
    fn empty_requests_are_refused() {
        let mux = SynchronousMultiplexer::new(0);
        let file = tempfile::tempfile().unwrap();
        let handle = RawHandle::new(file.as_raw_fd(), false);

        // SAFETY: the requests describe no memory.
        let read = unsafe {
            mux.init_read(&handle, None, IoRequest::new(Vec::new(), 0), Deadline::never())
        };
        // SAFETY: as above.
        let write = unsafe {
            mux.init_write(&handle, None, IoRequest::new(Vec::new(), 0), Deadline::never())
        };
        assert!(matches!(read, Err(MultiplexError::InvalidRequest(_))));
        assert!(matches!(write, Err(MultiplexError::InvalidRequest(_))));

        // Barriers carry no buffers and are still accepted.
        // SAFETY: no buffers.
        let barrier = unsafe {
            mux.init_barrier(
                &handle,
                None,
                IoRequest::new(Vec::new(), 0),
                BarrierKind::WaitDataOnly,
                Deadline::never(),
            )
        }
        .unwrap();
        mux.check_io_operation(barrier).unwrap();
        mux.release_io_operation(barrier).unwrap();
        assert_eq!(mux.operations_in_flight(), 0);
    }

    #[test]
    fn timed_out_read_leaves_nothing_behind() {
        let mux = SynchronousMultiplexer::new(0);
        let (r, _w) = sys::pipe(false).unwrap();
        let reader = RawHandle::new(r.as_raw_fd(), false);
        let mut storage = [0u8; 8];
        let request = IoRequest::single(Buffer::new(&mut storage), 0);
        let deadline = Deadline::after(Duration::from_millis(20));
        // SAFETY: a timed out initiation leaves no operation behind.
        let err = unsafe { mux.init_read(&reader, None, request, deadline) }.unwrap_err();
        assert!(err.is_timed_out());
        assert_eq!(mux.operations_in_flight(), 0);
    }

    #[test]
    fn registered_buffers_are_not_offered() {
        let mux = SynchronousMultiplexer::new(0);
        let handle = RawHandle::new(0, false);
        let mut bytes = 100;
        assert!(matches!(
            mux.do_io_handle_allocate_registered_buffer(&handle, &mut bytes),
            Err(MultiplexError::NotSupported(_))
        ));
    }

    #[test]
    fn wake_releases_a_sleeper() {
        let mux = Arc::new(SynchronousMultiplexer::new(0));
        let sleeper = {
            let mux = mux.clone();
            std::thread::spawn(move || {
                let started = Instant::now();
                let n = mux
                    .check_for_any_completed_io(Deadline::after(Duration::from_secs(30)), 1)
                    .unwrap();
                (n, started.elapsed())
            })
        };
        while mux.wake.lock().unwrap().waiters == 0 {
            std::thread::yield_now();
        }
        mux.wake_check_for_any_completed_io().unwrap();
        let (n, elapsed) = sleeper.join().unwrap();
        assert_eq!(n, 0);
        assert!(elapsed < Duration::from_secs(30));
    }

    #[test]
    fn deadline_bounds_the_sleep() {
        let mux = SynchronousMultiplexer::new(0);
        let started = Instant::now();
        let n = mux
            .check_for_any_completed_io(Deadline::after(Duration::from_millis(30)), 1)
            .unwrap();
        assert_eq!(n, 0);
        assert!(started.elapsed() >= Duration::from_millis(30));
    }
}
