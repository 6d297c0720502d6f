//! epoll-based multiplexer.
//!
//! Operations on pollable descriptors (pipes, sockets, terminals) are tried
//! once at initiation; if the descriptor would block they are queued on a
//! per-descriptor interest entry and the descriptor is armed in the epoll
//! set with `EPOLLONESHOT`. Draining dispatches each readiness event to the
//! queued operations in FIFO order and re-arms the descriptor while anything
//! is still queued. Seekable descriptors are always completed synchronously.
//!
//! Wake-ups use a semaphore-mode eventfd armed one-shot, so each write to it
//! releases exactly one sleeping drainer. A thread counts as a drainer for
//! the whole of `check_for_any_completed_io`, not just while it sleeps, and
//! the last drainer to leave discards tokens nobody consumed.
//!
//! Locking: an operation's state lock may be held while taking the interest
//! lock, never the reverse. Dispatch copies the queued tokens out under the
//! interest lock and then visits each operation without it.

use std::alloc::Layout;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::{Arc, Mutex};

use crate::buffer::{ReadResult, RegisteredBuffer, WriteResult};
use crate::config::MAX_EVENTS_LIMIT;
use crate::deadline::Deadline;
use crate::error::{MultiplexError, Result};
use crate::handle::IoHandle;
use crate::multiplexer::{HandleTag, Multiplexer};
use crate::operation::{
    OperationArena, OperationCore, OperationId, OperationKind, OperationRequest,
    OperationStateType, OperationVisitor, PendingIo, StateCell, SynchronisedState,
    UnsynchronisedState,
};
use crate::{log_debug, log_operation, log_trace, log_warn, sys};

/// epoll data value identifying the wake-up eventfd.
const WAKE_TOKEN: u64 = u64::MAX;

/// epoll multiplexer driven by one thread.
pub type SingleThreadedEpoll = EpollMultiplexer<UnsynchronisedState>;

/// epoll multiplexer that any number of threads may drain concurrently.
pub type MultiThreadedEpoll = EpollMultiplexer<SynchronisedState>;

/// Operations parked on one descriptor.
#[derive(Debug, Default)]
struct Interest {
    readers: VecDeque<OperationId>,
    writers: VecDeque<OperationId>,
    armed: bool,
}

impl Interest {
    fn events(&self) -> u32 {
        let mut events = 0;
        if !self.readers.is_empty() {
            events |= libc::EPOLLIN as u32;
        }
        if !self.writers.is_empty() {
            events |= libc::EPOLLOUT as u32;
        }
        events
    }

    fn queue(&mut self, kind: OperationKind) -> &mut VecDeque<OperationId> {
        if kind.is_read_like() {
            &mut self.readers
        } else {
            &mut self.writers
        }
    }

    fn forget(&mut self, retired: &[OperationId]) {
        self.readers.retain(|id| !retired.contains(id));
        self.writers.retain(|id| !retired.contains(id));
    }
}

struct Drainer<'a, C: StateCell> {
    mux: &'a EpollMultiplexer<C>,
}

impl<C: StateCell> Drop for Drainer<'_, C> {
    fn drop(&mut self) {
        self.mux.leave_drain();
    }
}

/// epoll-backed [`Multiplexer`], generic over how operation states are
/// guarded.
///
/// # Examples
///
/// ```rust,no_run
/// use iomux::backend::SingleThreadedEpoll;
/// use iomux::buffer::{Buffer, ConstBuffer, IoRequest};
/// use iomux::handle::RawHandle;
/// use iomux::{Deadline, Multiplexer};
/// use std::os::fd::AsRawFd;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let mux = SingleThreadedEpoll::new(64, 0)?;
/// let (reader, writer) = std::os::unix::net::UnixStream::pair()?;
/// reader.set_nonblocking(true)?;
/// let reader = RawHandle::new(reader.as_raw_fd(), true);
///
/// let mut storage = [0u8; 16];
/// // SAFETY: `storage` outlives the operation, which is released below.
/// let op = unsafe {
///     mux.init_read(
///         &reader,
///         None,
///         IoRequest::single(Buffer::new(&mut storage), 0),
///         Deadline::never(),
///     )?
/// };
/// std::io::Write::write_all(&mut &writer, b"ping")?;
/// while !mux.check_io_operation(op)?.is_finished() {
///     mux.check_for_any_completed_io(Deadline::never(), usize::MAX)?;
/// }
/// let mut result = mux.take_completed_read(op)?;
/// assert_eq!(result.bytes_transferred(), 4);
/// mux.release_io_operation(op)?;
/// # Ok(())
/// # }
/// ```
pub struct EpollMultiplexer<C: StateCell> {
    epoll: OwnedFd,
    wakeup: OwnedFd,
    max_events: usize,
    arena: OperationArena<C>,
    interests: Mutex<HashMap<RawFd, Interest>>,
    pending_finish: Mutex<VecDeque<OperationId>>,
    drainers: Mutex<usize>,
}

impl<C: StateCell> EpollMultiplexer<C> {
    /// Creates a multiplexer consuming up to `max_events` readiness events
    /// per drain and holding at most `max_operations` operations
    /// (0 = unbounded).
    pub fn new(max_events: usize, max_operations: usize) -> Result<Self> {
        if max_events == 0 || max_events > MAX_EVENTS_LIMIT {
            return Err(MultiplexError::InvalidRequest(
                "max_events must be between 1 and 4096",
            ));
        }

        // SAFETY: epoll_create1 has no memory preconditions.
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd == -1 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: epfd was just created and is owned by nobody else.
        let epoll = unsafe { OwnedFd::from_raw_fd(epfd) };

        // SAFETY: eventfd has no memory preconditions.
        let efd = unsafe {
            libc::eventfd(
                0,
                libc::EFD_CLOEXEC | libc::EFD_NONBLOCK | libc::EFD_SEMAPHORE,
            )
        };
        if efd == -1 {
            return Err(io::Error::last_os_error().into());
        }
        // SAFETY: efd was just created and is owned by nobody else.
        let wakeup = unsafe { OwnedFd::from_raw_fd(efd) };

        let mux = Self {
            epoll,
            wakeup,
            max_events,
            arena: OperationArena::new(max_operations),
            interests: Mutex::new(HashMap::new()),
            pending_finish: Mutex::new(VecDeque::new()),
            drainers: Mutex::new(0),
        };
        mux.ctl(
            libc::EPOLL_CTL_ADD,
            mux.wakeup.as_raw_fd(),
            Self::wake_events(),
            WAKE_TOKEN,
        )?;

        log_debug!(
            "epoll",
            "created epoll fd:{} (synchronised: {}, max_events: {})",
            mux.epoll.as_raw_fd(),
            C::SYNCHRONISED,
            max_events
        );
        Ok(mux)
    }

    fn wake_events() -> u32 {
        (libc::EPOLLIN | libc::EPOLLONESHOT) as u32
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = libc::epoll_event { events, u64: token };
        // SAFETY: event is a valid epoll_event for the duration of the call.
        let ret = unsafe { libc::epoll_ctl(self.epoll.as_raw_fd(), op, fd, &mut event) };
        if ret == -1 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    /// Arms `fd` for whatever its queues are waiting on.
    ///
    /// Descriptors can be closed and their numbers reused behind our back,
    /// so a failed `MOD` retries as `ADD` and vice versa.
    fn arm(&self, fd: RawFd, interest: &mut Interest) -> io::Result<()> {
        let wanted = interest.events();
        let events = wanted | libc::EPOLLONESHOT as u32;
        let token = fd as u64;
        let (first, second) = if interest.armed {
            (libc::EPOLL_CTL_MOD, libc::EPOLL_CTL_ADD)
        } else {
            (libc::EPOLL_CTL_ADD, libc::EPOLL_CTL_MOD)
        };
        match self.ctl(first, fd, events, token) {
            Err(e) if matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EEXIST)) => {
                self.ctl(second, fd, events, token)?
            }
            other => other?,
        }
        interest.armed = true;
        log_trace!("epoll", "armed fd:{} events:{:#x}", fd, wanted);
        Ok(())
    }

    /// Removes `fd` from the epoll set. A descriptor that is already gone
    /// is not an error.
    fn disarm(&self, fd: RawFd) {
        if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, 0, 0) {
            if !matches!(e.raw_os_error(), Some(libc::ENOENT) | Some(libc::EBADF)) {
                log_warn!("epoll", "removing fd:{} failed: {}", fd, e);
            }
        }
        log_trace!("epoll", "disarmed fd:{}", fd);
    }

    /// Queues an initiated operation on its descriptor and arms it.
    fn park(&self, fd: RawFd, kind: OperationKind, op: OperationId) -> Result<()> {
        let mut interests = self.interests.lock()?;
        let interest = interests.entry(fd).or_default();
        interest.queue(kind).push_back(op);
        if let Err(e) = self.arm(fd, interest) {
            interest.forget(&[op]);
            if interest.events() == 0 {
                interests.remove(&fd);
            }
            return Err(e.into());
        }
        Ok(())
    }

    /// Returns true if `op` is next in line on its descriptor.
    fn is_head(&self, fd: RawFd, kind: OperationKind, op: OperationId) -> Result<bool> {
        let mut interests = self.interests.lock()?;
        Ok(interests
            .get_mut(&fd)
            .is_some_and(|interest| interest.queue(kind).front() == Some(&op)))
    }

    /// Drops `retired` tokens from `fd`'s queues, then re-arms the
    /// descriptor if anything is left or forgets it otherwise.
    fn settle(&self, fd: RawFd, retired: &[OperationId]) -> Result<()> {
        let mut interests = self.interests.lock()?;
        let Some(interest) = interests.get_mut(&fd) else {
            return Ok(());
        };
        interest.forget(retired);
        if interest.events() != 0 {
            return self.arm(fd, interest).map_err(MultiplexError::from);
        }
        let armed = interest.armed;
        interests.remove(&fd);
        if armed {
            self.disarm(fd);
        }
        Ok(())
    }

    fn classify(&self, handle: &dyn IoHandle) -> Result<HandleTag> {
        let tag = handle.multiplexer_tag();
        let tag = if tag.is_classified() {
            tag
        } else {
            sys::classify(handle.raw_fd())?
        };
        if tag == HandleTag::POLLABLE && !handle.is_multiplexable() {
            return Err(MultiplexError::NotSupported(
                "pollable handle was not opened in multiplexable mode",
            ));
        }
        Ok(tag)
    }

    /// Finishes up to `max` operations completed outside a drain.
    fn finish_deferred(&self, max: usize) -> Result<usize> {
        let mut finished = 0;
        while finished < max {
            let Some(op) = self.pending_finish.lock()?.pop_front() else {
                break;
            };
            let Ok(cell) = self.arena.get(op) else {
                continue;
            };
            if cell.lock().finish() {
                finished += 1;
            }
        }
        Ok(finished)
    }

    fn defer_finish(&self, op: OperationId) -> Result<()> {
        self.pending_finish.lock()?.push_back(op);
        Ok(())
    }

    /// Runs the queued operations of `fd` that `revents` made ready.
    fn dispatch(&self, fd: RawFd, revents: u32, budget: &mut usize) -> Result<usize> {
        let failure = (libc::EPOLLHUP | libc::EPOLLERR) as u32;
        let readable = revents & (libc::EPOLLIN as u32 | libc::EPOLLRDHUP as u32 | failure) != 0;
        let writable = revents & (libc::EPOLLOUT as u32 | failure) != 0;

        let (readers, writers) = {
            let interests = self.interests.lock()?;
            match interests.get(&fd) {
                Some(interest) => (
                    if readable {
                        interest.readers.iter().copied().collect()
                    } else {
                        Vec::new()
                    },
                    if writable {
                        interest.writers.iter().copied().collect()
                    } else {
                        Vec::new()
                    },
                ),
                None => (Vec::new(), Vec::new()),
            }
        };

        let mut retired = Vec::new();
        let mut finished = 0;
        'queues: for queue in [readers, writers] {
            for op in queue {
                if *budget == 0 {
                    // Left parked; settle re-arms the descriptor.
                    break 'queues;
                }
                let Ok(cell) = self.arena.get(op) else {
                    retired.push(op);
                    continue;
                };
                let mut core = cell.lock();
                if !core.state().is_initiated() {
                    retired.push(op);
                    continue;
                }
                let outcome = match core.request() {
                    Some(request) => sys::execute_request(fd, false, request),
                    None => {
                        retired.push(op);
                        continue;
                    }
                };
                if matches!(&outcome, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
                    // Readiness consumed by earlier operations in this queue.
                    break;
                }
                core.complete_transfer(outcome);
                retired.push(op);
                if core.finish() {
                    finished += 1;
                }
                *budget -= 1;
            }
        }

        log_trace!(
            "epoll",
            "fd:{} revents:{:#x} completed {} operation(s)",
            fd,
            revents,
            retired.len()
        );
        self.settle(fd, &retired)?;
        Ok(finished)
    }

    /// Consumes one wake-up token and re-arms the eventfd.
    fn consume_wake(&self) -> Result<()> {
        let mut value = 0u64;
        // SAFETY: value is 8 writable bytes, the size eventfd reads require.
        let ret = unsafe {
            libc::read(
                self.wakeup.as_raw_fd(),
                (&mut value as *mut u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if ret == -1 {
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::WouldBlock {
                return Err(e.into());
            }
        }
        self.ctl(
            libc::EPOLL_CTL_MOD,
            self.wakeup.as_raw_fd(),
            Self::wake_events(),
            WAKE_TOKEN,
        )?;
        Ok(())
    }

    fn wait_for_events(
        &self,
        deadline: Deadline,
        events: &mut [libc::epoll_event],
    ) -> Result<usize> {
        loop {
            let timeout = deadline.as_poll_timeout();
            // SAFETY: events is a writable array of events.len() entries.
            let ret = unsafe {
                libc::epoll_wait(
                    self.epoll.as_raw_fd(),
                    events.as_mut_ptr(),
                    events.len() as libc::c_int,
                    timeout,
                )
            };
            let error = (ret == -1).then(io::Error::last_os_error);

            match error {
                None => return Ok(ret as usize),
                Some(e) if e.kind() == io::ErrorKind::Interrupted => {
                    if deadline.has_expired() {
                        return Ok(0);
                    }
                }
                Some(e) => return Err(e.into()),
            }
        }
    }

    /// Counts the caller as a drainer until the guard drops, so a wake-up
    /// issued at any point of the drain reaches it.
    fn enter_drain(&self) -> Result<Drainer<'_, C>> {
        *self.drainers.lock()? += 1;
        Ok(Drainer { mux: self })
    }

    /// The last drainer out discards wake-ups nobody consumed, so they do
    /// not cut a later drain short.
    fn leave_drain(&self) {
        let Ok(mut drainers) = self.drainers.lock() else {
            return;
        };
        *drainers = drainers.saturating_sub(1);
        if *drainers == 0 {
            if let Err(e) = self.discard_wakes() {
                log_warn!("epoll", "discarding stale wake-ups failed: {}", e);
            }
        }
    }

    fn discard_wakes(&self) -> Result<()> {
        let mut value = 0u64;
        loop {
            // SAFETY: value is 8 writable bytes, the size eventfd reads require.
            let ret = unsafe {
                libc::read(
                    self.wakeup.as_raw_fd(),
                    (&mut value as *mut u64).cast(),
                    std::mem::size_of::<u64>(),
                )
            };
            if ret == -1 {
                let e = io::Error::last_os_error();
                if e.kind() == io::ErrorKind::WouldBlock {
                    break;
                }
                return Err(e.into());
            }
        }
        self.ctl(
            libc::EPOLL_CTL_MOD,
            self.wakeup.as_raw_fd(),
            Self::wake_events(),
            WAKE_TOKEN,
        )?;
        Ok(())
    }

    fn cancel_core(&self, core: &mut OperationCore) -> bool {
        core.complete_error(MultiplexError::cancelled())
    }
}

impl<C: StateCell> Multiplexer for EpollMultiplexer<C> {
    fn name(&self) -> &'static str {
        "epoll"
    }

    fn io_state_requirements(&self) -> Layout {
        Layout::new::<C>()
    }

    fn reserve_io_operations(&self, count: usize) -> Result<()> {
        self.arena.reserve(count)
    }

    fn do_io_handle_register(&self, handle: &dyn IoHandle) -> Result<HandleTag> {
        let tag = self.classify(handle)?;
        log_debug!(
            "epoll",
            "registered fd:{} as {}",
            handle.raw_fd(),
            if tag == HandleTag::POLLABLE {
                "pollable"
            } else {
                "seekable"
            }
        );
        Ok(tag)
    }

    fn do_io_handle_deregister(&self, handle: &dyn IoHandle) -> Result<()> {
        let fd = handle.raw_fd();
        let removed = self.interests.lock()?.remove(&fd);
        let Some(interest) = removed else {
            log_debug!("epoll", "deregistered fd:{}", fd);
            return Ok(());
        };

        if interest.armed {
            self.disarm(fd);
        }

        let mut cancelled = 0;
        for op in interest.readers.into_iter().chain(interest.writers) {
            let Ok(cell) = self.arena.get(op) else {
                continue;
            };
            let mut core = cell.lock();
            if core.state().is_initiated() && self.cancel_core(&mut core) {
                drop(core);
                self.defer_finish(op)?;
                cancelled += 1;
            }
        }
        log_debug!(
            "epoll",
            "deregistered fd:{}, cancelled {} operation(s)",
            fd,
            cancelled
        );
        Ok(())
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
        let tag = self.classify(handle)?;
        let fd = handle.raw_fd();
        let kind = request.kind();
        let synchronous = tag == HandleTag::SEEKABLE || kind == OperationKind::Barrier;

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

        let mut core = cell.lock();
        let outcome = match core.request() {
            Some(request) => sys::execute_request(fd, synchronous, request),
            None => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };

        if matches!(&outcome, Err(e) if e.kind() == io::ErrorKind::WouldBlock) && !synchronous {
            if deadline.has_expired() {
                drop(core);
                self.arena.remove(op)?;
                log_operation!(Trace, "epoll", op, fd, "would block past its deadline");
                return Err(MultiplexError::TimedOut);
            }
            core.initiated();
            drop(core);
            if let Err(e) = self.park(fd, kind, op) {
                self.arena.remove(op)?;
                return Err(e);
            }
            log_operation!(Trace, "epoll", op, fd, "parked");
            return Ok(op);
        }

        core.complete_transfer(outcome);
        drop(core);
        self.defer_finish(op)?;
        log_operation!(Trace, "epoll", op, fd, "completed immediately");
        Ok(op)
    }

    fn current_state(&self, op: OperationId) -> Result<OperationStateType> {
        self.arena.state(op)
    }

    fn check_io_operation(&self, op: OperationId) -> Result<OperationStateType> {
        let cell = self.arena.get(op)?;
        let mut core = cell.lock();
        if core.state().is_initiated() && self.is_head(core.fd(), core.kind(), op)? {
            let fd = core.fd();
            let outcome = match core.request() {
                Some(request) => sys::execute_request(fd, false, request),
                None => Err(io::Error::from_raw_os_error(libc::EINVAL)),
            };
            if !matches!(&outcome, Err(e) if e.kind() == io::ErrorKind::WouldBlock) {
                core.complete_transfer(outcome);
                core.finish();
                self.settle(fd, &[op])?;
                log_operation!(Trace, "epoll", op, fd, "progressed by check");
            }
            return Ok(core.state());
        }
        if core.state().is_completed() && core.finish() {
            let mut queue = self.pending_finish.lock()?;
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
        let cell = self.arena.get(op)?;
        let mut core = cell.lock();
        let state = core.state();
        if !(state.is_initiated() || state.is_initialised()) {
            return Ok(state);
        }
        self.cancel_core(&mut core);
        core.finish();
        let fd = core.fd();
        let state = core.state();
        drop(core);

        self.settle(fd, &[op])?;
        log_operation!(Debug, "epoll", op, fd, "cancelled");
        Ok(state)
    }

    fn check_for_any_completed_io(
        &self,
        deadline: Deadline,
        max_completions: usize,
    ) -> Result<usize> {
        let max_completions = max_completions.max(1);
        let _drainer = self.enter_drain()?;
        let mut events = vec![libc::epoll_event { events: 0, u64: 0 }; self.max_events];
        loop {
            let mut finished = self.finish_deferred(max_completions)?;
            if finished > 0 {
                return Ok(finished);
            }

            let ready = self.wait_for_events(deadline, &mut events)?;
            let mut budget = max_completions;
            let mut woken = false;
            for event in &events[..ready] {
                let token = event.u64;
                let revents = event.events;
                if token == WAKE_TOKEN {
                    self.consume_wake()?;
                    woken = true;
                    continue;
                }
                finished += self.dispatch(token as RawFd, revents, &mut budget)?;
            }

            if finished > 0 || woken || deadline.has_expired() {
                return Ok(finished);
            }
        }
    }

    fn wake_check_for_any_completed_io(&self) -> Result<()> {
        let drainers = self.drainers.lock()?;
        if *drainers == 0 {
            return Ok(());
        }
        let value = 1u64;
        // SAFETY: value is 8 readable bytes, the size eventfd writes require.
        let ret = unsafe {
            libc::write(
                self.wakeup.as_raw_fd(),
                (&value as *const u64).cast(),
                std::mem::size_of::<u64>(),
            )
        };
        if ret == -1 {
            return Err(io::Error::last_os_error().into());
        }
        log_trace!("epoll", "woke one drainer");
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

impl<C: StateCell> Drop for EpollMultiplexer<C> {
    fn drop(&mut self) {
        let live = self.arena.len();
        if live > 0 {
            log_warn!(
                "epoll",
                "dropping epoll fd:{} with {} unreleased operation(s)",
                self.epoll.as_raw_fd(),
                live
            );
        }
    }
}

impl<C: StateCell> std::fmt::Debug for EpollMultiplexer<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EpollMultiplexer")
            .field("epoll", &self.epoll.as_raw_fd())
            .field("wakeup", &self.wakeup.as_raw_fd())
            .field("max_events", &self.max_events)
            .field("drainers", &self.drainers.lock().map(|d| *d).unwrap_or_default())
            .finish()
    }
}

static_assertions::assert_impl_all!(MultiThreadedEpoll: Send, Sync);
static_assertions::assert_not_impl_any!(SingleThreadedEpoll: Sync);
