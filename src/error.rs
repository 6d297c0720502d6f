//! Error types and handling for multiplexer operations.
//!
//! Every public operation in this crate returns a discriminated [`Result`].
//! Deadline expiry has its own variant so callers can tell it apart from any
//! other failure, and OS errors are carried through untouched.

use std::io;

use thiserror::Error;

use crate::operation::OperationId;

/// Result type alias for multiplexer operations.
pub type Result<T> = std::result::Result<T, MultiplexError>;

/// Error type for multiplexer operations.
///
/// # Design Notes
///
/// - Uses `thiserror` for the `Error` implementation
/// - `std::io::Error` converts automatically via `#[from]` and is never reinterpreted
/// - Partial transfers are not errors; they are successful results with a short byte count
#[derive(Debug, Error)]
pub enum MultiplexError {
    /// The deadline elapsed before the operation could make progress.
    ///
    /// An operation that was already initiated is left pending and may still
    /// be cancelled or polled to completion.
    #[error("Deadline exceeded")]
    TimedOut,

    /// The backend has no capacity left.
    ///
    /// Returned when the operation arena is full or a registered buffer
    /// cannot be allocated.
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// The capability is not available on this backend.
    #[error("Not supported: {0}")]
    NotSupported(&'static str),

    /// The request cannot be issued as given.
    #[error("Invalid request: {0}")]
    InvalidRequest(&'static str),

    /// The operation has not reached the state the call requires.
    ///
    /// Returned when a completed result is requested before completion, or
    /// when an operation is released before it has finished.
    #[error("Operation not completed")]
    OperationPending,

    /// The completed result was already moved out, either by a previous
    /// getter call or by the visitor's completion callback.
    #[error("Completed result already taken")]
    ResultTaken,

    /// The token does not refer to a live operation on this multiplexer.
    #[error("Unknown or released operation {0}")]
    UnknownOperation(OperationId),

    /// An internal mutex was poisoned by a panicking thread.
    #[error("Internal lock poisoned")]
    LockPoisoned,

    /// Underlying operating system error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl MultiplexError {
    /// Returns true if this error reports an elapsed deadline.
    #[inline]
    pub fn is_timed_out(&self) -> bool {
        matches!(self, MultiplexError::TimedOut)
    }

    /// Returns the raw OS error code, if this error wraps one.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            MultiplexError::Io(e) => e.raw_os_error(),
            _ => None,
        }
    }

    /// Returns true if this error is the cancellation error delivered to
    /// operations completed by `cancel_io_operation`.
    pub fn is_cancelled(&self) -> bool {
        self.raw_os_error() == Some(libc::ECANCELED)
    }

    pub(crate) fn cancelled() -> Self {
        MultiplexError::Io(io::Error::from_raw_os_error(libc::ECANCELED))
    }
}

impl<T> From<std::sync::PoisonError<T>> for MultiplexError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        MultiplexError::LockPoisoned
    }
}

// Completions may be delivered on any thread that drains the backend.
static_assertions::assert_impl_all!(MultiplexError: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error;
    use std::io::{Error as IoError, ErrorKind};

    mod error_messages {
        use super::*;

        #[test]
        fn timed_out() {
            assert_eq!(MultiplexError::TimedOut.to_string(), "Deadline exceeded");
        }

        #[test]
        fn resource_exhausted() {
            let error = MultiplexError::ResourceExhausted("operation arena is full");
            assert_eq!(
                error.to_string(),
                "Resource exhausted: operation arena is full"
            );
        }

        #[test]
        fn unknown_operation() {
            let error = MultiplexError::UnknownOperation(OperationId::from_parts(3, 7));
            assert_eq!(error.to_string(), "Unknown or released operation op#3.7");
        }
    }

    mod error_conversion {
        use super::*;

        #[test]
        fn io_error_passes_through_verbatim() {
            let error = MultiplexError::from(IoError::from_raw_os_error(libc::EBADF));

            let MultiplexError::Io(ref e) = error else {
                panic!("Expected Io error variant");
            };
            assert_eq!(e.raw_os_error(), Some(libc::EBADF));
            assert_eq!(error.raw_os_error(), Some(libc::EBADF));
            assert!(error.source().is_some());
        }

        #[test]
        fn timeout_is_distinct_from_os_timeouts() {
            let os_timeout = MultiplexError::from(IoError::new(ErrorKind::TimedOut, "slow"));
            assert!(!os_timeout.is_timed_out());
            assert!(MultiplexError::TimedOut.is_timed_out());
        }

        #[test]
        fn cancellation_error() {
            let error = MultiplexError::cancelled();
            assert!(error.is_cancelled());
            assert!(!error.is_timed_out());
            assert!(!MultiplexError::NotSupported("x").is_cancelled());
        }

        #[test]
        fn poison_maps_to_lock_poisoned() {
            let mutex = std::sync::Arc::new(std::sync::Mutex::new(0));
            let cloned = mutex.clone();
            let _ = std::thread::spawn(move || {
                let _guard = cloned.lock().unwrap();
                panic!("poison the lock");
            })
            .join();

            let error: MultiplexError = mutex.lock().unwrap_err().into();
            assert!(matches!(error, MultiplexError::LockPoisoned));
        }
    }
}
