//! Tests for the operation state machine.

use super::*;
use crate::buffer::{Buffer, ConstBuffer, IoBuffer, IoRequest, ReadResult, WriteResult};
use crate::deadline::Deadline;
use crate::error::MultiplexError;
use std::sync::{Arc, Mutex};

// Compile-time assertions to ensure our types have the expected properties
mod compile_time_tests {
    use super::*;
    use static_assertions::*;

    assert_impl_all!(OperationCore: Send);
    assert_impl_all!(OperationId: Send, Sync, Copy);
    assert_impl_all!(OperationRequest: Send, Sync);
    assert_eq_size!(OperationId, u64);
    assert_eq_size!(OperationStateType, u8);
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<(&'static str, OperationStateType)>>,
    keep_results: bool,
}

impl Recorder {
    fn keeping() -> Self {
        Self {
            keep_results: true,
            ..Self::default()
        }
    }

    fn record(&self, event: &'static str, former: OperationStateType) {
        self.events.lock().unwrap().push((event, former));
    }

    fn events(&self) -> Vec<(&'static str, OperationStateType)> {
        self.events.lock().unwrap().clone()
    }
}

impl OperationVisitor for Recorder {
    fn read_initiated(&self, _op: OperationId, former: OperationStateType) {
        self.record("read_initiated", former);
    }

    fn read_completed(
        &self,
        _op: OperationId,
        former: OperationStateType,
        result: ReadResult,
    ) -> Option<ReadResult> {
        self.record("read_completed", former);
        (!self.keep_results).then_some(result)
    }

    fn read_finished(&self, _op: OperationId, former: OperationStateType) {
        self.record("read_finished", former);
    }

    fn write_initiated(&self, _op: OperationId, former: OperationStateType) {
        self.record("write_initiated", former);
    }

    fn write_completed(
        &self,
        _op: OperationId,
        former: OperationStateType,
        result: WriteResult,
    ) -> Option<WriteResult> {
        self.record("write_completed", former);
        (!self.keep_results).then_some(result)
    }

    fn barrier_initiated(&self, _op: OperationId, former: OperationStateType) {
        self.record("barrier_initiated", former);
    }

    fn barrier_completed(
        &self,
        _op: OperationId,
        former: OperationStateType,
        result: WriteResult,
    ) -> Option<WriteResult> {
        self.record("barrier_completed", former);
        (!self.keep_results).then_some(result)
    }

    fn write_or_barrier_finished(&self, _op: OperationId, former: OperationStateType) {
        self.record("write_or_barrier_finished", former);
    }
}

fn core_for(
    request: OperationRequest,
    visitor: Option<Arc<dyn OperationVisitor>>,
) -> OperationCore {
    OperationCore::new(
        OperationId::from_parts(0, 0),
        3,
        visitor,
        PendingIo {
            registered: None,
            deadline: Deadline::never(),
            request,
        },
    )
}

#[test]
fn test_new_core_is_initialised() {
    let mut storage = [0u8; 4];
    let core = core_for(OperationRequest::read(vec![Buffer::new(&mut storage)], 0), None);
    assert_eq!(core.state(), OperationStateType::ReadInitialised);
    assert_eq!(core.kind(), OperationKind::Read);
    assert_eq!(core.fd(), 3);
    assert!(core.request().is_some());

    let core = core_for(OperationRequest::barrier(BarrierKind::WaitDataOnly), None);
    assert_eq!(core.state(), OperationStateType::BarrierInitialised);
}

#[test]
fn test_read_lifecycle_invokes_each_callback_once() {
    let mut storage = *b"abcdefgh";
    let recorder = Arc::new(Recorder::default());
    let mut core = core_for(
        OperationRequest::read(vec![Buffer::new(&mut storage)], 0),
        Some(recorder.clone()),
    );

    assert!(core.initiated());
    assert!(!core.initiated());
    assert_eq!(core.state(), OperationStateType::ReadInitiated);

    assert!(core.complete_transfer(Ok(5)));
    assert!(!core.complete_transfer(Ok(8)));
    assert!(!core.complete_error(MultiplexError::cancelled()));
    assert_eq!(core.state(), OperationStateType::ReadCompleted);

    assert!(core.finish());
    assert!(!core.finish());
    assert_eq!(core.state(), OperationStateType::ReadFinished);

    assert_eq!(
        recorder.events(),
        vec![
            ("read_initiated", OperationStateType::ReadInitialised),
            ("read_completed", OperationStateType::ReadInitiated),
            ("read_finished", OperationStateType::ReadCompleted),
        ]
    );

    let mut result = core.take_completed_read().unwrap();
    assert_eq!(result.bytes_transferred(), 5);
    assert_eq!(unsafe { result.buffers().unwrap()[0].as_slice() }, b"abcde");
}

#[test]
fn test_synchronous_completion_skips_initiated() {
    let data = *b"hello";
    let recorder = Arc::new(Recorder::default());
    let mut core = core_for(
        OperationRequest::write(vec![ConstBuffer::new(&data)], 0),
        Some(recorder.clone()),
    );

    assert!(core.complete_transfer(Ok(5)));
    assert!(!core.initiated());
    assert_eq!(core.state(), OperationStateType::WriteOrBarrierCompleted);
    assert_eq!(
        recorder.events(),
        vec![("write_completed", OperationStateType::WriteInitialised)]
    );
}

#[test]
fn test_result_taken_once() {
    let data = *b"xyz";
    let mut core = core_for(OperationRequest::write(vec![ConstBuffer::new(&data)], 0), None);

    assert!(matches!(
        core.take_completed_write_or_barrier(),
        Err(MultiplexError::OperationPending)
    ));

    core.complete_transfer(Ok(3));
    assert!(core.take_completed_write_or_barrier().is_ok());
    assert!(matches!(
        core.take_completed_write_or_barrier(),
        Err(MultiplexError::ResultTaken)
    ));
}

#[test]
fn test_visitor_may_keep_result() {
    let mut storage = [0u8; 4];
    let recorder = Arc::new(Recorder::keeping());
    let mut core = core_for(
        OperationRequest::read(vec![Buffer::new(&mut storage)], 0),
        Some(recorder),
    );

    core.complete_transfer(Ok(4));
    assert!(matches!(
        core.take_completed_read(),
        Err(MultiplexError::ResultTaken)
    ));
}

#[test]
fn test_getter_checks_kind() {
    let mut storage = [0u8; 4];
    let mut core = core_for(OperationRequest::read(vec![Buffer::new(&mut storage)], 0), None);
    core.complete_transfer(Ok(0));
    assert!(matches!(
        core.take_completed_write_or_barrier(),
        Err(MultiplexError::InvalidRequest(_))
    ));
}

#[test]
fn test_barrier_lifecycle() {
    let recorder = Arc::new(Recorder::default());
    let mut core = core_for(
        OperationRequest::barrier(BarrierKind::WaitAll),
        Some(recorder.clone()),
    );

    assert!(core.initiated());
    assert!(core.complete_transfer(Ok(0)));
    assert!(core.finish());
    assert_eq!(core.state(), OperationStateType::WriteOrBarrierFinished);
    assert_eq!(
        recorder.events(),
        vec![
            ("barrier_initiated", OperationStateType::BarrierInitialised),
            ("barrier_completed", OperationStateType::BarrierInitiated),
            (
                "write_or_barrier_finished",
                OperationStateType::WriteOrBarrierCompleted
            ),
        ]
    );
    assert!(core.take_completed_write_or_barrier().unwrap().is_ok());
}

#[test]
fn test_error_completion_carries_os_error() {
    let mut storage = [0u8; 4];
    let mut core = core_for(OperationRequest::read(vec![Buffer::new(&mut storage)], 0), None);
    core.initiated();
    assert!(core.complete_transfer(Err(std::io::Error::from_raw_os_error(libc::EBADF))));

    let mut result = core.take_completed_read().unwrap();
    assert_eq!(result.error().unwrap().raw_os_error(), Some(libc::EBADF));
    assert_eq!(result.bytes_transferred(), 0);
}

#[test]
fn test_cancellation_after_completion_is_ignored() {
    let data = *b"done";
    let recorder = Arc::new(Recorder::default());
    let mut core = core_for(
        OperationRequest::write(vec![ConstBuffer::new(&data)], 0),
        Some(recorder.clone()),
    );
    core.initiated();
    core.complete_transfer(Ok(4));
    assert!(!core.complete_error(MultiplexError::cancelled()));

    let completions = recorder
        .events()
        .iter()
        .filter(|(event, _)| *event == "write_completed")
        .count();
    assert_eq!(completions, 1);
    assert!(core.take_completed_write_or_barrier().unwrap().is_ok());
}

#[test]
fn test_scatter_read_fills_in_order() {
    let mut first = [0u8; 2];
    let mut second = [0u8; 4];
    let mut core = core_for(
        OperationRequest::Read(IoRequest::new(
            vec![Buffer::new(&mut first), Buffer::new(&mut second)],
            0,
        )),
        None,
    );
    core.complete_transfer(Ok(3));
    let result = core.take_completed_read().unwrap();
    let lengths: Vec<usize> = result.buffers().unwrap().iter().map(|b| b.len()).collect();
    assert_eq!(lengths, vec![2, 1]);
}

#[test]
fn test_storage_strategies_guard_the_same_core() {
    fn drive<C: StateCell>() {
        let mut storage = [0u8; 4];
        let cell = C::new(core_for(
            OperationRequest::read(vec![Buffer::new(&mut storage)], 0),
            None,
        ));
        {
            let mut core = cell.lock();
            core.initiated();
            assert!(cell.try_lock().is_none());
        }
        assert_eq!(cell.lock().state(), OperationStateType::ReadInitiated);
        assert!(cell.try_lock().is_some());
    }

    drive::<UnsynchronisedState>();
    drive::<SynchronisedState>();
    assert!(SynchronisedState::SYNCHRONISED);
    assert!(!UnsynchronisedState::SYNCHRONISED);
}

#[test]
fn test_request_validation() {
    let mut storage = [0u8; 4];
    let empty_read = OperationRequest::read(Vec::new(), 0);
    let empty_write = OperationRequest::write(Vec::new(), 0);
    assert!(matches!(
        empty_read.validate(8),
        Err(MultiplexError::InvalidRequest(_))
    ));
    assert!(matches!(
        empty_write.validate(8),
        Err(MultiplexError::InvalidRequest(_))
    ));

    // A barrier without buffers covers the whole resource.
    assert!(OperationRequest::barrier(BarrierKind::WaitAll).validate(8).is_ok());

    let read = OperationRequest::read(vec![Buffer::new(&mut storage); 3], 0);
    assert!(read.validate(3).is_ok());
    assert!(matches!(
        read.validate(2),
        Err(MultiplexError::InvalidRequest(_))
    ));
}
