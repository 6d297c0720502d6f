//! Thin wrappers over the Unix syscalls the backends issue.
//!
//! Every wrapper retries on `EINTR` and reports failures as `io::Error`
//! carrying the raw OS error, so callers can tell `EAGAIN` apart with
//! [`io::ErrorKind::WouldBlock`].

use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};

use crate::buffer::{Buffer, ConstBuffer, IoBuffer};
use crate::deadline::Deadline;
use crate::error::{MultiplexError, Result};
use crate::multiplexer::HandleTag;
use crate::operation::{BarrierKind, OperationRequest};

/// Fallback when `sysconf(_SC_IOV_MAX)` reports no limit.
const DEFAULT_IOV_MAX: usize = 1024;
/// Fallback when `sysconf(_SC_PAGESIZE)` fails.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Retries `f` while it fails with `EINTR`.
fn retry<T: PartialEq + From<i8>>(mut f: impl FnMut() -> T) -> io::Result<T> {
    loop {
        let ret = f();
        if ret != T::from(-1) {
            return Ok(ret);
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

fn iovecs<T: IoBuffer>(buffers: &[T]) -> Vec<libc::iovec> {
    buffers
        .iter()
        .map(|buffer| libc::iovec {
            iov_base: buffer.as_ptr() as *mut libc::c_void,
            iov_len: buffer.len(),
        })
        .collect()
}

fn iov_count(iov: &[libc::iovec]) -> io::Result<libc::c_int> {
    libc::c_int::try_from(iov.len()).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

fn to_off(offset: u64) -> io::Result<libc::off_t> {
    libc::off_t::try_from(offset).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))
}

/// Scatter read at the current position.
pub(crate) fn readv(fd: RawFd, buffers: &[Buffer]) -> io::Result<usize> {
    let iov = iovecs(buffers);
    let count = iov_count(&iov)?;
    // SAFETY: every iovec describes caller-guaranteed writable memory.
    let n = retry(|| unsafe { libc::readv(fd, iov.as_ptr(), count) })?;
    Ok(n as usize)
}

/// Gather write at the current position.
pub(crate) fn writev(fd: RawFd, buffers: &[ConstBuffer]) -> io::Result<usize> {
    let iov = iovecs(buffers);
    let count = iov_count(&iov)?;
    // SAFETY: every iovec describes caller-guaranteed readable memory.
    let n = retry(|| unsafe { libc::writev(fd, iov.as_ptr(), count) })?;
    Ok(n as usize)
}

/// Scatter read at `offset`.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn preadv(fd: RawFd, buffers: &[Buffer], offset: u64) -> io::Result<usize> {
    let iov = iovecs(buffers);
    let count = iov_count(&iov)?;
    let offset = to_off(offset)?;
    // SAFETY: as for readv.
    let n = retry(|| unsafe { libc::preadv(fd, iov.as_ptr(), count, offset) })?;
    Ok(n as usize)
}

/// Scatter read at `offset`, one `pread` per buffer.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn preadv(fd: RawFd, buffers: &[Buffer], offset: u64) -> io::Result<usize> {
    let mut total = 0usize;
    for buffer in buffers {
        let at = to_off(offset + total as u64)?;
        // SAFETY: the buffer describes caller-guaranteed writable memory.
        let n = retry(|| unsafe {
            libc::pread(fd, buffer.as_mut_ptr() as *mut libc::c_void, buffer.len(), at)
        })? as usize;
        total += n;
        if n < buffer.len() {
            break;
        }
    }
    Ok(total)
}

/// Gather write at `offset`.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
pub(crate) fn pwritev(fd: RawFd, buffers: &[ConstBuffer], offset: u64) -> io::Result<usize> {
    let iov = iovecs(buffers);
    let count = iov_count(&iov)?;
    let offset = to_off(offset)?;
    // SAFETY: as for writev.
    let n = retry(|| unsafe { libc::pwritev(fd, iov.as_ptr(), count, offset) })?;
    Ok(n as usize)
}

/// Gather write at `offset`, one `pwrite` per buffer.
#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
pub(crate) fn pwritev(fd: RawFd, buffers: &[ConstBuffer], offset: u64) -> io::Result<usize> {
    let mut total = 0usize;
    for buffer in buffers {
        let at = to_off(offset + total as u64)?;
        // SAFETY: the buffer describes caller-guaranteed readable memory.
        let n = retry(|| unsafe {
            libc::pwrite(fd, buffer.as_ptr() as *const libc::c_void, buffer.len(), at)
        })? as usize;
        total += n;
        if n < buffer.len() {
            break;
        }
    }
    Ok(total)
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn start_writeback(fd: RawFd, offset: u64, len: u64) -> io::Result<()> {
    let invalid = |_| io::Error::from_raw_os_error(libc::EINVAL);
    let offset = libc::off64_t::try_from(offset).map_err(invalid)?;
    let len = libc::off64_t::try_from(len).map_err(invalid)?;
    // SAFETY: plain syscall on a caller-owned descriptor.
    retry(|| unsafe {
        libc::sync_file_range(fd, offset, len, libc::SYNC_FILE_RANGE_WRITE)
    })?;
    Ok(())
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn start_writeback(fd: RawFd, _offset: u64, _len: u64) -> io::Result<()> {
    data_sync(fd)
}

#[cfg(not(target_vendor = "apple"))]
fn data_sync(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain syscall on a caller-owned descriptor.
    retry(|| unsafe { libc::fdatasync(fd) })?;
    Ok(())
}

#[cfg(target_vendor = "apple")]
fn data_sync(fd: RawFd) -> io::Result<()> {
    full_sync(fd)
}

fn full_sync(fd: RawFd) -> io::Result<()> {
    // SAFETY: plain syscall on a caller-owned descriptor.
    retry(|| unsafe { libc::fsync(fd) })?;
    Ok(())
}

/// Makes written data durable according to `kind`.
///
/// `len == 0` covers everything from `offset` to the end of the file; only
/// [`BarrierKind::NowaitDataOnly`] can honour a range.
pub(crate) fn barrier(fd: RawFd, kind: BarrierKind, offset: u64, len: u64) -> io::Result<()> {
    match kind {
        BarrierKind::NowaitDataOnly => start_writeback(fd, offset, len),
        BarrierKind::WaitDataOnly => data_sync(fd),
        BarrierKind::NowaitAll | BarrierKind::WaitAll => full_sync(fd),
    }
}

/// Performs `request` once without waiting for readiness.
///
/// Seekable descriptors use the positional variants and honour the request
/// offset; streams ignore it. Barriers report zero bytes.
pub(crate) fn execute_request(
    fd: RawFd,
    seekable: bool,
    request: &OperationRequest,
) -> io::Result<usize> {
    match request {
        OperationRequest::Read(req) if seekable => preadv(fd, &req.buffers, req.offset),
        OperationRequest::Read(req) => readv(fd, &req.buffers),
        OperationRequest::Write(req) if seekable => pwritev(fd, &req.buffers, req.offset),
        OperationRequest::Write(req) => writev(fd, &req.buffers),
        OperationRequest::Barrier(req, kind) => {
            barrier(fd, *kind, req.offset, req.total_len() as u64).map(|()| 0)
        }
    }
}

/// Readiness events a request waits for.
pub(crate) fn request_events(request: &OperationRequest) -> libc::c_short {
    match request {
        OperationRequest::Read(_) => libc::POLLIN,
        OperationRequest::Write(_) | OperationRequest::Barrier(..) => libc::POLLOUT,
    }
}

/// Waits until `fd` reports any of `events` or the deadline expires.
///
/// Returns `Ok(false)` on expiry. Hang-ups and errors count as ready so the
/// following syscall can report them.
pub(crate) fn poll_ready(fd: RawFd, events: libc::c_short, deadline: Deadline) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events,
        revents: 0,
    };
    loop {
        let timeout = deadline.as_poll_timeout();
        // SAFETY: pfd is a valid pollfd for the duration of the call.
        let ret = unsafe { libc::poll(&mut pfd, 1, timeout) };
        if ret > 0 {
            return Ok(true);
        }
        if ret == 0 {
            if deadline.has_expired() || timeout == 0 {
                return Ok(false);
            }
            continue;
        }
        let error = io::Error::last_os_error();
        if error.kind() != io::ErrorKind::Interrupted {
            return Err(error);
        }
    }
}

/// Performs `request` to completion, blocking no later than `deadline`.
///
/// Streams are polled for readiness first so a blocking descriptor cannot
/// outlive the deadline; `EAGAIN` from a non-blocking one loops back into
/// the poll. Returns [`MultiplexError::TimedOut`] on expiry.
pub(crate) fn execute_blocking(
    fd: RawFd,
    seekable: bool,
    request: &OperationRequest,
    deadline: Deadline,
) -> Result<usize> {
    let events = request_events(request);
    loop {
        if !seekable && !poll_ready(fd, events, deadline)? {
            return Err(MultiplexError::TimedOut);
        }
        match execute_request(fd, seekable, request) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if deadline.has_expired() {
                    return Err(MultiplexError::TimedOut);
                }
            }
            other => return other.map_err(MultiplexError::from),
        }
    }
}

/// Classifies a descriptor by file type.
///
/// FIFOs, sockets and character devices are pollable streams; everything
/// else is treated as seekable and completed synchronously.
pub(crate) fn classify(fd: RawFd) -> io::Result<HandleTag> {
    let mut stat = std::mem::MaybeUninit::<libc::stat>::uninit();
    // SAFETY: fstat fills the struct on success.
    retry(|| unsafe { libc::fstat(fd, stat.as_mut_ptr()) })?;
    // SAFETY: fstat succeeded.
    let mode = unsafe { stat.assume_init() }.st_mode & libc::S_IFMT;
    Ok(match mode {
        libc::S_IFIFO | libc::S_IFSOCK | libc::S_IFCHR => HandleTag::POLLABLE,
        _ => HandleTag::SEEKABLE,
    })
}

/// Returns true if `fd` has `O_NONBLOCK` set.
pub(crate) fn is_nonblocking(fd: RawFd) -> io::Result<bool> {
    // SAFETY: plain fcntl query.
    let flags = retry(|| unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    Ok(flags & libc::O_NONBLOCK != 0)
}

/// Sets or clears `O_NONBLOCK`.
pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    // SAFETY: plain fcntl calls on a caller-owned descriptor.
    let flags = retry(|| unsafe { libc::fcntl(fd, libc::F_GETFL) })?;
    let wanted = if nonblocking {
        flags | libc::O_NONBLOCK
    } else {
        flags & !libc::O_NONBLOCK
    };
    if wanted != flags {
        retry(|| unsafe { libc::fcntl(fd, libc::F_SETFL, wanted) })?;
    }
    Ok(())
}

/// Creates a close-on-exec pipe, returning `(read end, write end)`.
pub(crate) fn pipe(nonblocking: bool) -> io::Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as libc::c_int; 2];

    #[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
    {
        let mut flags = libc::O_CLOEXEC;
        if nonblocking {
            flags |= libc::O_NONBLOCK;
        }
        // SAFETY: fds has room for two descriptors.
        retry(|| unsafe { libc::pipe2(fds.as_mut_ptr(), flags) })?;
    }

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        // SAFETY: fds has room for two descriptors.
        retry(|| unsafe { libc::pipe(fds.as_mut_ptr()) })?;
        for fd in fds {
            // SAFETY: plain fcntl on a descriptor we just created.
            retry(|| unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) })?;
        }
    }

    // SAFETY: both descriptors were just created and are owned by nobody else.
    let (reader, writer) = unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) };

    #[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
    {
        if nonblocking {
            set_nonblocking(fds[0], true)?;
            set_nonblocking(fds[1], true)?;
        }
    }

    Ok((reader, writer))
}

/// Most buffers one vectored syscall accepts.
pub(crate) fn iov_max() -> usize {
    // SAFETY: sysconf has no preconditions.
    let ret = unsafe { libc::sysconf(libc::_SC_IOV_MAX) };
    if ret > 0 {
        ret as usize
    } else {
        DEFAULT_IOV_MAX
    }
}

/// Size of a memory page.
pub(crate) fn page_size() -> usize {
    // SAFETY: sysconf has no preconditions.
    let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if ret > 0 {
        ret as usize
    } else {
        DEFAULT_PAGE_SIZE
    }
}
