//! Requests and the tagged payload an operation carries through its lifecycle.

use crate::buffer::{Buffer, ConstBuffer, IoRequest, ReadResult, RegisteredBuffer, WriteResult};
use crate::deadline::Deadline;
use crate::error::{MultiplexError, Result};
use crate::operation::{BarrierKind, OperationKind};

/// One read, write or barrier request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationRequest {
    /// Fill `buffers` in order, starting at `offset`.
    Read(IoRequest<Buffer>),
    /// Drain `buffers` in order, starting at `offset`.
    Write(IoRequest<ConstBuffer>),
    /// Make previously written data durable.
    ///
    /// The buffers optionally narrow the byte range for backends that
    /// support ranged flushes; an empty list covers the whole resource.
    Barrier(IoRequest<ConstBuffer>, BarrierKind),
}

impl OperationRequest {
    /// Convenience constructor for a read.
    pub fn read(buffers: Vec<Buffer>, offset: u64) -> Self {
        Self::Read(IoRequest::new(buffers, offset))
    }

    /// Convenience constructor for a write.
    pub fn write(buffers: Vec<ConstBuffer>, offset: u64) -> Self {
        Self::Write(IoRequest::new(buffers, offset))
    }

    /// Convenience constructor for a whole-resource barrier.
    pub fn barrier(kind: BarrierKind) -> Self {
        Self::Barrier(IoRequest::new(Vec::new(), 0), kind)
    }

    /// Kind of i/o this request performs.
    pub fn kind(&self) -> OperationKind {
        match self {
            Self::Read(_) => OperationKind::Read,
            Self::Write(_) => OperationKind::Write,
            Self::Barrier(..) => OperationKind::Barrier,
        }
    }

    /// Number of buffers in the request.
    pub fn buffer_count(&self) -> usize {
        match self {
            Self::Read(req) => req.buffers.len(),
            Self::Write(req) | Self::Barrier(req, _) => req.buffers.len(),
        }
    }

    /// Checks the request before it is handed to the OS.
    ///
    /// Reads and writes need at least one buffer; an empty barrier covers
    /// the whole resource. No request may carry more than `max_buffers`.
    pub fn validate(&self, max_buffers: usize) -> Result<()> {
        let count = self.buffer_count();
        if count == 0 && self.kind() != OperationKind::Barrier {
            return Err(MultiplexError::InvalidRequest(
                "read and write requests need at least one buffer",
            ));
        }
        if count > max_buffers {
            return Err(MultiplexError::InvalidRequest(
                "request carries more buffers than the handle accepts",
            ));
        }
        Ok(())
    }

    /// Starting offset of the request.
    pub fn offset(&self) -> u64 {
        match self {
            Self::Read(req) => req.offset,
            Self::Write(req) | Self::Barrier(req, _) => req.offset,
        }
    }
}

/// Parameters held while an operation is initialised or initiated.
#[derive(Debug)]
pub struct PendingIo {
    /// Registered region kept alive for the duration of the i/o.
    pub registered: Option<RegisteredBuffer>,
    /// Deadline the operation was initiated with.
    pub deadline: Deadline,
    /// The request itself.
    pub request: OperationRequest,
}

/// Payload of an operation; the active variant always matches its state.
#[derive(Debug, Default)]
pub enum Payload {
    /// `Unknown`.
    #[default]
    Empty,
    /// `*Initialised` and `*Initiated`.
    Pending(PendingIo),
    /// `ReadCompleted` and `ReadFinished`. `None` once the result was taken.
    CompletedRead(Option<ReadResult>),
    /// `WriteOrBarrierCompleted` and `WriteOrBarrierFinished`. `None` once
    /// the result was taken.
    CompletedWrite(Option<WriteResult>),
}

impl Payload {
    /// The pending parameters, if the operation has not completed.
    pub fn pending(&self) -> Option<&PendingIo> {
        match self {
            Payload::Pending(pending) => Some(pending),
            _ => None,
        }
    }

    /// Takes the pending parameters, leaving the payload empty.
    pub(crate) fn take_pending(&mut self) -> Option<PendingIo> {
        match std::mem::take(self) {
            Payload::Pending(pending) => Some(pending),
            other => {
                *self = other;
                None
            }
        }
    }
}
