//! Completed transfer results and byte accounting.

use crate::buffer::{Buffer, ConstBuffer, IoBuffer};
use crate::error::{MultiplexError, Result};

/// Outcome of a completed read, write or barrier.
///
/// On success this carries the request's buffers with each length reduced to
/// the number of bytes actually transferred into or out of it. A transfer
/// shorter than requested is still a success; compare
/// [`bytes_transferred`](Self::bytes_transferred) with the requested length
/// and re-issue for the remainder.
#[derive(Debug)]
pub struct IoResult<T> {
    outcome: Result<Vec<T>>,
    bytes_transferred: Option<usize>,
}

/// Result of a completed read.
pub type ReadResult = IoResult<Buffer>;

/// Result of a completed write or barrier.
pub type WriteResult = IoResult<ConstBuffer>;

impl<T: IoBuffer> IoResult<T> {
    /// A successful result carrying the final per-buffer lengths.
    pub fn success(buffers: Vec<T>) -> Self {
        Self {
            outcome: Ok(buffers),
            bytes_transferred: None,
        }
    }

    /// A failed result.
    pub fn failure(error: MultiplexError) -> Self {
        Self {
            outcome: Err(error),
            bytes_transferred: None,
        }
    }

    /// Builds a successful result by spreading `transferred` bytes over
    /// `buffers` in order: leading buffers are full, the buffer where the
    /// count runs out is shortened, and the rest are emptied.
    pub fn from_transfer(buffers: Vec<T>, transferred: usize) -> Self {
        let mut left = transferred;
        let filled = buffers
            .into_iter()
            .map(|buffer| {
                let take = left.min(buffer.len());
                left -= take;
                buffer.truncated(take)
            })
            .collect();
        Self::success(filled)
    }

    /// Returns true on success.
    #[inline]
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    /// Returns true on failure.
    #[inline]
    pub fn is_err(&self) -> bool {
        self.outcome.is_err()
    }

    /// Final buffers on success.
    pub fn buffers(&self) -> Option<&[T]> {
        self.outcome.as_ref().ok().map(Vec::as_slice)
    }

    /// The error on failure.
    pub fn error(&self) -> Option<&MultiplexError> {
        self.outcome.as_ref().err()
    }

    /// Total bytes transferred: the sum of the final buffer lengths.
    ///
    /// Computed on first call and cached. A failed result transferred
    /// nothing and reports zero.
    pub fn bytes_transferred(&mut self) -> usize {
        if let Some(cached) = self.bytes_transferred {
            return cached;
        }
        let total = match &self.outcome {
            Ok(buffers) => buffers.iter().map(IoBuffer::len).sum(),
            Err(_) => 0,
        };
        self.bytes_transferred = Some(total);
        total
    }

    /// Converts into a plain `Result`.
    pub fn into_result(self) -> Result<Vec<T>> {
        self.outcome
    }
}

impl<T: IoBuffer> From<Result<Vec<T>>> for IoResult<T> {
    fn from(outcome: Result<Vec<T>>) -> Self {
        Self {
            outcome,
            bytes_transferred: None,
        }
    }
}
