//! Resources that issue i/o through a multiplexer.
//!
//! A multiplexer only needs four things from a resource, captured by
//! [`IoHandle`]. [`NativeHandle`] is the concrete resource this crate
//! provides: an owned descriptor with blocking `read`, `write` and `barrier`
//! entry points that go through a multiplexer when one is available and fall
//! back to direct syscalls otherwise.

mod native;

pub use native::NativeHandle;

use std::os::fd::RawFd;

use crate::multiplexer::{HandleTag, SharedMultiplexer};

/// What a multiplexer needs to know about a resource.
pub trait IoHandle {
    /// The OS descriptor.
    fn raw_fd(&self) -> RawFd;

    /// Whether the descriptor was opened for multiplexed (non-blocking) i/o.
    fn is_multiplexable(&self) -> bool;

    /// The multiplexer this handle is registered with, if any.
    fn multiplexer(&self) -> Option<&SharedMultiplexer>;

    /// The tag returned by the multiplexer at registration.
    fn multiplexer_tag(&self) -> HandleTag;
}

/// A bare descriptor, for driving a multiplexer directly.
///
/// Never registered, so backends classify it on first use.
#[derive(Debug, Clone, Copy)]
pub struct RawHandle {
    fd: RawFd,
    multiplexable: bool,
}

impl RawHandle {
    /// Wraps `fd`. The caller keeps ownership and must keep it open while
    /// operations on it are outstanding.
    pub const fn new(fd: RawFd, multiplexable: bool) -> Self {
        Self { fd, multiplexable }
    }
}

impl IoHandle for RawHandle {
    fn raw_fd(&self) -> RawFd {
        self.fd
    }

    fn is_multiplexable(&self) -> bool {
        self.multiplexable
    }

    fn multiplexer(&self) -> Option<&SharedMultiplexer> {
        None
    }

    fn multiplexer_tag(&self) -> HandleTag {
        HandleTag::UNCLASSIFIED
    }
}
