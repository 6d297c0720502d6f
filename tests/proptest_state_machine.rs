//! Property-based tests for state predicates, byte accounting and the
//! operation lifecycle using proptest.

use iomux::backend::SynchronousMultiplexer;
use iomux::buffer::{Buffer, ConstBuffer, IoBuffer, IoRequest, ReadResult};
use iomux::handle::NativeHandle;
use iomux::{Deadline, Multiplexer, OperationStateType};
use proptest::prelude::*;

/// Every state satisfies at most one lifecycle predicate, and exactly one
/// once `is_unknown` is included.
#[test]
fn test_state_predicates_partition() {
    for state in OperationStateType::ALL {
        let hits = [
            state.is_initialised(),
            state.is_initiated(),
            state.is_completed(),
            state.is_finished(),
        ]
        .iter()
        .filter(|hit| **hit)
        .count();
        assert!(hits <= 1, "{state} satisfies {hits} predicates");
        assert_eq!(hits == 0, state.is_unknown(), "{state}");
        assert_eq!(
            state.has_result(),
            state.is_completed() || state.is_finished(),
            "{state}"
        );
    }
}

/// A transfer fills buffers in order and never reports more than requested.
#[test]
fn test_transfer_accounting() {
    proptest!(|(
        lens in prop::collection::vec(0usize..64, 1..8),
        fraction in 0.0f64..=1.0
    )| {
        let mut storage: Vec<Vec<u8>> = lens.iter().map(|len| vec![0u8; *len]).collect();
        let buffers: Vec<Buffer> = storage.iter_mut().map(|s| Buffer::new(s)).collect();
        let total: usize = lens.iter().sum();
        let transferred = (total as f64 * fraction) as usize;

        let mut result = ReadResult::from_transfer(buffers, transferred);
        prop_assert_eq!(result.bytes_transferred(), transferred);

        let filled = result.buffers().unwrap();
        prop_assert_eq!(filled.len(), lens.len());
        let mut left = transferred;
        for (buffer, len) in filled.iter().zip(&lens) {
            let expected = left.min(*len);
            prop_assert_eq!(buffer.len(), expected);
            left -= expected;
        }
    });
}

/// Writes issued at arbitrary offsets through a multiplexer land where the
/// request says, and every operation can be released once finished.
#[test]
fn test_positional_writes_round_trip() {
    proptest!(ProptestConfig::with_cases(32), |(
        chunks in prop::collection::vec(
            (0u64..4096, prop::collection::vec(any::<u8>(), 1..64)),
            1..16,
        )
    )| {
        let mux = SynchronousMultiplexer::new(0);
        let file = tempfile::tempfile().unwrap();
        let handle = NativeHandle::from_file(file, false).unwrap();
        let mut image = vec![0u8; 4096 + 64];

        for (offset, bytes) in &chunks {
            // SAFETY: the payload outlives the operation.
            let op = unsafe {
                mux.init_write(
                    &handle,
                    None,
                    IoRequest::single(ConstBuffer::new(bytes), *offset),
                    Deadline::never(),
                )
            }
            .unwrap();
            prop_assert!(mux.check_io_operation(op).unwrap().is_finished());
            let mut result = mux.take_completed_write_or_barrier(op).unwrap();
            prop_assert_eq!(result.bytes_transferred(), bytes.len());
            mux.release_io_operation(op).unwrap();
            image[*offset as usize..*offset as usize + bytes.len()].copy_from_slice(bytes);
        }
        prop_assert_eq!(mux.operations_in_flight(), 0);

        let end = chunks
            .iter()
            .map(|(offset, bytes)| *offset as usize + bytes.len())
            .max()
            .unwrap();
        let mut readback = vec![0u8; end];
        // SAFETY: the read buffer outlives the operation.
        let op = unsafe {
            mux.init_read(
                &handle,
                None,
                IoRequest::single(Buffer::new(&mut readback), 0),
                Deadline::never(),
            )
        }
        .unwrap();
        mux.check_io_operation(op).unwrap();
        let mut result = mux.take_completed_read(op).unwrap();
        prop_assert_eq!(result.bytes_transferred(), end);
        mux.release_io_operation(op).unwrap();
        prop_assert_eq!(&readback[..], &image[..end]);
    });
}
