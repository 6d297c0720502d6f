//! Operation state, kind and barrier definitions.

/// Lifecycle state of one i/o operation.
///
/// Every operation starts at [`Unknown`](Self::Unknown), is constructed into
/// an `*Initialised` state by the multiplexer, and ends at a `*Finished`
/// state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum OperationStateType {
    /// No operation has been constructed.
    #[default]
    Unknown = 0,
    /// Read constructed, not yet handed to the backend.
    ReadInitialised = 1,
    /// Read handed to the backend.
    ReadInitiated = 2,
    /// Read result available.
    ReadCompleted = 3,
    /// Read acknowledged as complete; the state may be released.
    ReadFinished = 4,
    /// Write constructed, not yet handed to the backend.
    WriteInitialised = 5,
    /// Write handed to the backend.
    WriteInitiated = 6,
    /// Barrier constructed, not yet handed to the backend.
    BarrierInitialised = 7,
    /// Barrier handed to the backend.
    BarrierInitiated = 8,
    /// Write or barrier result available.
    WriteOrBarrierCompleted = 9,
    /// Write or barrier acknowledged as complete; the state may be released.
    WriteOrBarrierFinished = 10,
}

impl OperationStateType {
    /// Every state, in declaration order.
    pub const ALL: [OperationStateType; 11] = [
        Self::Unknown,
        Self::ReadInitialised,
        Self::ReadInitiated,
        Self::ReadCompleted,
        Self::ReadFinished,
        Self::WriteInitialised,
        Self::WriteInitiated,
        Self::BarrierInitialised,
        Self::BarrierInitiated,
        Self::WriteOrBarrierCompleted,
        Self::WriteOrBarrierFinished,
    ];

    /// Returns true for the `*Initialised` states.
    #[inline]
    pub const fn is_initialised(self) -> bool {
        matches!(
            self,
            Self::ReadInitialised | Self::WriteInitialised | Self::BarrierInitialised
        )
    }

    /// Returns true for the `*Initiated` states.
    #[inline]
    pub const fn is_initiated(self) -> bool {
        matches!(
            self,
            Self::ReadInitiated | Self::WriteInitiated | Self::BarrierInitiated
        )
    }

    /// Returns true for the `*Completed` states.
    #[inline]
    pub const fn is_completed(self) -> bool {
        matches!(self, Self::ReadCompleted | Self::WriteOrBarrierCompleted)
    }

    /// Returns true for the `*Finished` states.
    #[inline]
    pub const fn is_finished(self) -> bool {
        matches!(self, Self::ReadFinished | Self::WriteOrBarrierFinished)
    }

    /// Returns true for [`Unknown`](Self::Unknown), the one state the other
    /// four predicates all reject.
    #[inline]
    pub const fn is_unknown(self) -> bool {
        matches!(self, Self::Unknown)
    }

    /// Returns true once a result is available: completed or finished.
    #[inline]
    pub const fn has_result(self) -> bool {
        self.is_completed() || self.is_finished()
    }

    /// Kind of operation this state belongs to.
    ///
    /// `WriteOrBarrier*` states are shared by writes and barriers and report
    /// [`OperationKind::Write`]; [`Unknown`](Self::Unknown) has no kind.
    pub const fn kind(self) -> Option<OperationKind> {
        match self {
            Self::Unknown => None,
            Self::ReadInitialised
            | Self::ReadInitiated
            | Self::ReadCompleted
            | Self::ReadFinished => Some(OperationKind::Read),
            Self::BarrierInitialised | Self::BarrierInitiated => Some(OperationKind::Barrier),
            Self::WriteInitialised
            | Self::WriteInitiated
            | Self::WriteOrBarrierCompleted
            | Self::WriteOrBarrierFinished => Some(OperationKind::Write),
        }
    }
}

impl std::fmt::Display for OperationStateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Unknown => "unknown",
            Self::ReadInitialised => "read_initialised",
            Self::ReadInitiated => "read_initiated",
            Self::ReadCompleted => "read_completed",
            Self::ReadFinished => "read_finished",
            Self::WriteInitialised => "write_initialised",
            Self::WriteInitiated => "write_initiated",
            Self::BarrierInitialised => "barrier_initialised",
            Self::BarrierInitiated => "barrier_initiated",
            Self::WriteOrBarrierCompleted => "write_or_barrier_completed",
            Self::WriteOrBarrierFinished => "write_or_barrier_finished",
        };
        f.write_str(name)
    }
}

/// Kind of i/o an operation performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum OperationKind {
    /// Scatter read into [`Buffer`](crate::buffer::Buffer)s.
    Read = 0,
    /// Gather write from [`ConstBuffer`](crate::buffer::ConstBuffer)s.
    Write = 1,
    /// Durability barrier.
    Barrier = 2,
}

impl OperationKind {
    /// State an operation of this kind is constructed into.
    #[inline]
    pub const fn initialised_state(self) -> OperationStateType {
        match self {
            Self::Read => OperationStateType::ReadInitialised,
            Self::Write => OperationStateType::WriteInitialised,
            Self::Barrier => OperationStateType::BarrierInitialised,
        }
    }

    /// Returns true if this kind fills buffers.
    #[inline]
    pub const fn is_read_like(self) -> bool {
        matches!(self, Self::Read)
    }
}

impl std::fmt::Display for OperationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Read => write!(f, "read"),
            Self::Write => write!(f, "write"),
            Self::Barrier => write!(f, "barrier"),
        }
    }
}

/// How much a barrier flushes and whether it waits for the flush.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum BarrierKind {
    /// Start writeback of file data only; do not wait for it.
    NowaitDataOnly,
    /// Flush file data only and wait for it to reach storage.
    WaitDataOnly,
    /// Start writeback of data and metadata; do not wait for it.
    NowaitAll,
    /// Flush data and metadata and wait for them to reach storage.
    #[default]
    WaitAll,
}

impl BarrierKind {
    /// Returns true if the barrier only covers file data.
    #[inline]
    pub const fn is_data_only(self) -> bool {
        matches!(self, Self::NowaitDataOnly | Self::WaitDataOnly)
    }

    /// Returns true if the barrier waits for the flush to reach storage.
    #[inline]
    pub const fn waits(self) -> bool {
        matches!(self, Self::WaitDataOnly | Self::WaitAll)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates_partition_states() {
        for state in OperationStateType::ALL {
            let hits = [
                state.is_initialised(),
                state.is_initiated(),
                state.is_completed(),
                state.is_finished(),
                state.is_unknown(),
            ]
            .iter()
            .filter(|&&b| b)
            .count();
            assert_eq!(hits, 1, "{state} matched {hits} predicates");
        }
    }

    #[test]
    fn test_eleven_distinct_states() {
        let all = OperationStateType::ALL;
        for (i, a) in all.iter().enumerate() {
            assert!(all[i + 1..].iter().all(|b| a != b), "{a} listed twice");
        }
        assert_eq!(all.len(), 11);
    }

    #[test]
    fn test_state_kinds() {
        assert_eq!(OperationStateType::Unknown.kind(), None);
        assert_eq!(
            OperationStateType::ReadFinished.kind(),
            Some(OperationKind::Read)
        );
        assert_eq!(
            OperationStateType::BarrierInitiated.kind(),
            Some(OperationKind::Barrier)
        );
        assert_eq!(
            OperationStateType::WriteOrBarrierCompleted.kind(),
            Some(OperationKind::Write)
        );
    }

    #[test]
    fn test_initialised_states() {
        assert_eq!(
            OperationKind::Read.initialised_state(),
            OperationStateType::ReadInitialised
        );
        assert_eq!(
            OperationKind::Barrier.initialised_state(),
            OperationStateType::BarrierInitialised
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(
            OperationStateType::WriteOrBarrierFinished.to_string(),
            "write_or_barrier_finished"
        );
        assert_eq!(OperationKind::Barrier.to_string(), "barrier");
    }

    #[test]
    fn test_barrier_kind_properties() {
        assert!(BarrierKind::NowaitDataOnly.is_data_only());
        assert!(!BarrierKind::NowaitDataOnly.waits());
        assert!(BarrierKind::WaitAll.waits());
        assert!(!BarrierKind::WaitAll.is_data_only());
        assert_eq!(BarrierKind::default(), BarrierKind::WaitAll);
    }
}
