//! The per-operation state machine.

use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;

use crate::buffer::{ReadResult, WriteResult};
use crate::error::{MultiplexError, Result};
use crate::log_operation;
use crate::operation::{
    OperationId, OperationKind, OperationRequest, OperationStateType, OperationVisitor, Payload,
    PendingIo,
};

use OperationStateType::*;

/// State, payload and visitor of one operation.
///
/// Transition methods check the current state against the edge's valid
/// predecessors and silently do nothing when it does not match, returning
/// `false`. A valid transition replaces the payload, invokes the visitor with
/// the state being left, then publishes the new state. Callers hold the
/// enclosing [`StateCell`](crate::operation::StateCell) lock throughout.
pub struct OperationCore {
    id: OperationId,
    state: OperationStateType,
    kind: OperationKind,
    fd: RawFd,
    payload: Payload,
    visitor: Option<Arc<dyn OperationVisitor>>,
}

impl OperationCore {
    /// Constructs an operation directly into its `*Initialised` state.
    pub fn new(
        id: OperationId,
        fd: RawFd,
        visitor: Option<Arc<dyn OperationVisitor>>,
        pending: PendingIo,
    ) -> Self {
        let kind = pending.request.kind();
        Self {
            id,
            state: kind.initialised_state(),
            kind,
            fd,
            payload: Payload::Pending(pending),
            visitor,
        }
    }

    /// Token of this operation.
    #[inline]
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Current lifecycle state.
    #[inline]
    pub fn state(&self) -> OperationStateType {
        self.state
    }

    /// Kind of i/o performed.
    #[inline]
    pub fn kind(&self) -> OperationKind {
        self.kind
    }

    /// Descriptor the operation targets.
    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Current payload.
    #[inline]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// The request, while the operation has not completed.
    pub fn request(&self) -> Option<&OperationRequest> {
        self.payload.pending().map(|pending| &pending.request)
    }

    fn published(&mut self, next: OperationStateType) {
        log_operation!(Trace, "operation", self.id, self.fd, "{} -> {}", self.state, next);
        self.state = next;
    }

    /// `ReadInitialised -> ReadInitiated`.
    pub fn read_initiated(&mut self) -> bool {
        if self.state != ReadInitialised {
            return false;
        }
        if let Some(visitor) = &self.visitor {
            visitor.read_initiated(self.id, self.state);
        }
        self.published(ReadInitiated);
        true
    }

    /// `ReadInitialised | ReadInitiated -> ReadCompleted`.
    pub fn read_completed(&mut self, result: ReadResult) -> bool {
        if !matches!(self.state, ReadInitialised | ReadInitiated) {
            return false;
        }
        self.payload = Payload::Empty;
        let kept = match &self.visitor {
            Some(visitor) => visitor.read_completed(self.id, self.state, result),
            None => Some(result),
        };
        self.payload = Payload::CompletedRead(kept);
        self.published(ReadCompleted);
        true
    }

    /// `ReadCompleted -> ReadFinished`.
    pub fn read_finished(&mut self) -> bool {
        if self.state != ReadCompleted {
            return false;
        }
        if let Some(visitor) = &self.visitor {
            visitor.read_finished(self.id, self.state);
        }
        self.published(ReadFinished);
        true
    }

    /// `WriteInitialised -> WriteInitiated`.
    pub fn write_initiated(&mut self) -> bool {
        if self.state != WriteInitialised {
            return false;
        }
        if let Some(visitor) = &self.visitor {
            visitor.write_initiated(self.id, self.state);
        }
        self.published(WriteInitiated);
        true
    }

    /// `WriteInitialised | WriteInitiated -> WriteOrBarrierCompleted`.
    pub fn write_completed(&mut self, result: WriteResult) -> bool {
        if !matches!(self.state, WriteInitialised | WriteInitiated) {
            return false;
        }
        self.payload = Payload::Empty;
        let kept = match &self.visitor {
            Some(visitor) => visitor.write_completed(self.id, self.state, result),
            None => Some(result),
        };
        self.payload = Payload::CompletedWrite(kept);
        self.published(WriteOrBarrierCompleted);
        true
    }

    /// `BarrierInitialised -> BarrierInitiated`.
    pub fn barrier_initiated(&mut self) -> bool {
        if self.state != BarrierInitialised {
            return false;
        }
        if let Some(visitor) = &self.visitor {
            visitor.barrier_initiated(self.id, self.state);
        }
        self.published(BarrierInitiated);
        true
    }

    /// `BarrierInitialised | BarrierInitiated -> WriteOrBarrierCompleted`.
    pub fn barrier_completed(&mut self, result: WriteResult) -> bool {
        if !matches!(self.state, BarrierInitialised | BarrierInitiated) {
            return false;
        }
        self.payload = Payload::Empty;
        let kept = match &self.visitor {
            Some(visitor) => visitor.barrier_completed(self.id, self.state, result),
            None => Some(result),
        };
        self.payload = Payload::CompletedWrite(kept);
        self.published(WriteOrBarrierCompleted);
        true
    }

    /// `WriteOrBarrierCompleted -> WriteOrBarrierFinished`.
    pub fn write_or_barrier_finished(&mut self) -> bool {
        if self.state != WriteOrBarrierCompleted {
            return false;
        }
        if let Some(visitor) = &self.visitor {
            visitor.write_or_barrier_finished(self.id, self.state);
        }
        self.published(WriteOrBarrierFinished);
        true
    }

    /// Moves an initialised operation to its `*Initiated` state.
    pub fn initiated(&mut self) -> bool {
        match self.kind {
            OperationKind::Read => self.read_initiated(),
            OperationKind::Write => self.write_initiated(),
            OperationKind::Barrier => self.barrier_initiated(),
        }
    }

    /// Moves a completed operation to its `*Finished` state.
    pub fn finish(&mut self) -> bool {
        match self.kind {
            OperationKind::Read => self.read_finished(),
            OperationKind::Write | OperationKind::Barrier => self.write_or_barrier_finished(),
        }
    }

    /// Completes a pending operation from the outcome of its syscall.
    ///
    /// A successful byte count is spread over the request's buffers in order;
    /// barriers report their buffers unchanged.
    pub fn complete_transfer(&mut self, outcome: io::Result<usize>) -> bool {
        if !(self.state.is_initialised() || self.state.is_initiated()) {
            return false;
        }
        let Some(pending) = self.payload.take_pending() else {
            return false;
        };
        match (pending.request, outcome) {
            (OperationRequest::Read(req), Ok(n)) => {
                self.read_completed(ReadResult::from_transfer(req.buffers, n))
            }
            (OperationRequest::Read(_), Err(e)) => {
                self.read_completed(ReadResult::failure(MultiplexError::Io(e)))
            }
            (OperationRequest::Write(req), Ok(n)) => {
                self.write_completed(WriteResult::from_transfer(req.buffers, n))
            }
            (OperationRequest::Write(_), Err(e)) => {
                self.write_completed(WriteResult::failure(MultiplexError::Io(e)))
            }
            (OperationRequest::Barrier(req, _), Ok(_)) => {
                self.barrier_completed(WriteResult::success(req.buffers))
            }
            (OperationRequest::Barrier(..), Err(e)) => {
                self.barrier_completed(WriteResult::failure(MultiplexError::Io(e)))
            }
        }
    }

    /// Completes a pending operation with `error`.
    pub fn complete_error(&mut self, error: MultiplexError) -> bool {
        match self.kind {
            OperationKind::Read => self.read_completed(ReadResult::failure(error)),
            OperationKind::Write => self.write_completed(WriteResult::failure(error)),
            OperationKind::Barrier => self.barrier_completed(WriteResult::failure(error)),
        }
    }

    /// Moves the completed read result out.
    pub fn take_completed_read(&mut self) -> Result<ReadResult> {
        if self.kind != OperationKind::Read {
            return Err(MultiplexError::InvalidRequest("operation is not a read"));
        }
        match &mut self.payload {
            Payload::CompletedRead(result) => result.take().ok_or(MultiplexError::ResultTaken),
            _ => Err(MultiplexError::OperationPending),
        }
    }

    /// Moves the completed write or barrier result out.
    pub fn take_completed_write_or_barrier(&mut self) -> Result<WriteResult> {
        if self.kind == OperationKind::Read {
            return Err(MultiplexError::InvalidRequest(
                "operation is not a write or barrier",
            ));
        }
        match &mut self.payload {
            Payload::CompletedWrite(result) => result.take().ok_or(MultiplexError::ResultTaken),
            _ => Err(MultiplexError::OperationPending),
        }
    }
}

impl std::fmt::Debug for OperationCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationCore")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("fd", &self.fd)
            .field("payload", &self.payload)
            .field("visitor", &self.visitor.is_some())
            .finish()
    }
}
