//! Deadlines for blocking multiplexer calls.

use std::time::{Duration, Instant};

/// Point in time after which a blocking call gives up with
/// [`MultiplexError::TimedOut`](crate::MultiplexError::TimedOut).
///
/// A deadline is either infinite or anchored to a monotonic instant. Relative
/// deadlines are anchored when constructed, so a deadline passed down through
/// several calls keeps counting against the original budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Deadline {
    expires: Option<Instant>,
}

impl Deadline {
    /// A deadline that never expires.
    #[inline]
    pub const fn never() -> Self {
        Self { expires: None }
    }

    /// A deadline that has already expired; blocking calls only poll.
    #[inline]
    pub fn immediate() -> Self {
        Self::at(Instant::now())
    }

    /// A deadline `timeout` from now.
    ///
    /// Durations too large to represent are treated as infinite.
    pub fn after(timeout: Duration) -> Self {
        Self {
            expires: Instant::now().checked_add(timeout),
        }
    }

    /// A deadline at a fixed instant.
    #[inline]
    pub const fn at(instant: Instant) -> Self {
        Self {
            expires: Some(instant),
        }
    }

    /// Returns true if this deadline never expires.
    #[inline]
    pub fn is_infinite(&self) -> bool {
        self.expires.is_none()
    }

    /// Returns true once the deadline has passed.
    pub fn has_expired(&self) -> bool {
        match self.expires {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Time left before expiry, or `None` for an infinite deadline.
    pub fn remaining(&self) -> Option<Duration> {
        self.expires
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Whichever of the two deadlines expires first.
    pub fn earliest(self, other: Deadline) -> Deadline {
        match (self.expires, other.expires) {
            (Some(a), Some(b)) => Self::at(a.min(b)),
            (Some(_), None) => self,
            (None, _) => other,
        }
    }

    /// Converts the remaining time into a `poll(2)`/`epoll_wait(2)` timeout.
    ///
    /// Rounds up to whole milliseconds so a sub-millisecond budget still
    /// sleeps instead of spinning. Infinite deadlines map to `-1`.
    pub(crate) fn as_poll_timeout(&self) -> libc::c_int {
        match self.remaining() {
            None => -1,
            Some(left) if left.is_zero() => 0,
            Some(left) => {
                let millis = left.as_nanos().div_ceil(1_000_000);
                millis.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }
}

impl From<Duration> for Deadline {
    fn from(timeout: Duration) -> Self {
        Self::after(timeout)
    }
}

impl From<Instant> for Deadline {
    fn from(instant: Instant) -> Self {
        Self::at(instant)
    }
}
