//! Callbacks observing operation state transitions.

use crate::buffer::{ReadResult, WriteResult};
use crate::operation::{OperationId, OperationStateType};

/// Caller-supplied observer invoked at every lifecycle transition.
///
/// Each method corresponds to one transition edge and receives the operation
/// and the state it is leaving. All methods default to doing nothing.
///
/// # Re-entrancy
///
/// Callbacks run synchronously on whichever thread drives the transition,
/// while the operation's lock is held. A callback must not block, and must
/// not call back into the multiplexer for the same operation: with
/// unsynchronised storage that panics on a double borrow, and with
/// lock-guarded storage it spins forever. Calls concerning *other*
/// operations are fine.
///
/// # Completion results
///
/// The `*_completed` callbacks receive the result by value. Returning
/// `Some(result)` hands it back so a later
/// [`take_completed_read`](crate::Multiplexer::take_completed_read) or
/// [`take_completed_write_or_barrier`](crate::Multiplexer::take_completed_write_or_barrier)
/// can retrieve it; returning `None` keeps it, after which the getters report
/// [`ResultTaken`](crate::MultiplexError::ResultTaken).
///
/// # Example
///
/// ```rust
/// use iomux::buffer::ReadResult;
/// use iomux::operation::{OperationId, OperationStateType, OperationVisitor};
/// use std::sync::atomic::{AtomicUsize, Ordering};
///
/// #[derive(Default)]
/// struct CountBytes(AtomicUsize);
///
/// impl OperationVisitor for CountBytes {
///     fn read_completed(
///         &self,
///         _op: OperationId,
///         _former: OperationStateType,
///         mut result: ReadResult,
///     ) -> Option<ReadResult> {
///         self.0.fetch_add(result.bytes_transferred(), Ordering::Relaxed);
///         Some(result)
///     }
/// }
/// ```
pub trait OperationVisitor: Send + Sync {
    /// `ReadInitialised -> ReadInitiated`.
    fn read_initiated(&self, _op: OperationId, _former: OperationStateType) {}

    /// `ReadInitialised | ReadInitiated -> ReadCompleted`.
    fn read_completed(
        &self,
        _op: OperationId,
        _former: OperationStateType,
        result: ReadResult,
    ) -> Option<ReadResult> {
        Some(result)
    }

    /// `ReadCompleted -> ReadFinished`.
    fn read_finished(&self, _op: OperationId, _former: OperationStateType) {}

    /// `WriteInitialised -> WriteInitiated`.
    fn write_initiated(&self, _op: OperationId, _former: OperationStateType) {}

    /// `WriteInitialised | WriteInitiated -> WriteOrBarrierCompleted`.
    fn write_completed(
        &self,
        _op: OperationId,
        _former: OperationStateType,
        result: WriteResult,
    ) -> Option<WriteResult> {
        Some(result)
    }

    /// `BarrierInitialised -> BarrierInitiated`.
    fn barrier_initiated(&self, _op: OperationId, _former: OperationStateType) {}

    /// `BarrierInitialised | BarrierInitiated -> WriteOrBarrierCompleted`.
    fn barrier_completed(
        &self,
        _op: OperationId,
        _former: OperationStateType,
        result: WriteResult,
    ) -> Option<WriteResult> {
        Some(result)
    }

    /// `WriteOrBarrierCompleted -> WriteOrBarrierFinished`.
    fn write_or_barrier_finished(&self, _op: OperationId, _former: OperationStateType) {}
}
