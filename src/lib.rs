//! # iomux: multiplexed byte i/o for Unix
//!
//! A multiplexer tracks many read, write and barrier operations on OS
//! descriptors and completes them without dedicating a thread to each. Every
//! operation moves through a small state machine
//! (initialised, initiated, completed, finished) and an optional
//! [`OperationVisitor`] is told about each edge as it happens.
//!
//! ## Building blocks
//!
//! - [`Multiplexer`]: the backend contract. Operations are identified by
//!   generation-checked [`OperationId`] tokens, never by references.
//! - [`backend`]: an epoll backend in single- and multi-threaded flavours,
//!   plus a synchronous backend that completes everything at initiation.
//! - [`handle::NativeHandle`]: an owned descriptor with blocking `read`,
//!   `write` and `barrier` calls that run through its multiplexer, the
//!   calling thread's multiplexer from [`this_thread`], or direct syscalls.
//! - [`Deadline`]: every blocking call takes one.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use iomux::backend::create_multiplexer;
//! use iomux::buffer::{Buffer, ConstBuffer, IoRequest};
//! use iomux::config::MultiplexerConfig;
//! use iomux::handle::NativeHandle;
//! use iomux::Deadline;
//! use std::time::Duration;
//!
//! # fn main() -> iomux::Result<()> {
//! let mux = create_multiplexer(&MultiplexerConfig::single_threaded())?;
//! let (mut reader, mut writer) = NativeHandle::anonymous_pipe(true)?;
//! reader.set_multiplexer(Some(mux.clone()))?;
//! writer.set_multiplexer(Some(mux))?;
//!
//! writer
//!     .write(IoRequest::single(ConstBuffer::new(b"hello"), 0), Deadline::never())
//!     .into_result()?;
//!
//! let mut storage = [0u8; 16];
//! let mut read = reader.read(
//!     IoRequest::single(Buffer::new(&mut storage), 0),
//!     Duration::from_secs(1),
//! );
//! assert_eq!(read.bytes_transferred(), 5);
//! # Ok(())
//! # }
//! ```
//!
//! ## Driving a multiplexer directly
//!
//! ```rust,no_run
//! use iomux::backend::MultiThreadedEpoll;
//! use iomux::buffer::{Buffer, IoRequest};
//! use iomux::handle::RawHandle;
//! use iomux::{Deadline, Multiplexer};
//!
//! # fn main() -> iomux::Result<()> {
//! # let fd = 0;
//! let mux = MultiThreadedEpoll::new(256, 0)?;
//! let handle = RawHandle::new(fd, true);
//! let mut storage = [0u8; 4096];
//! // SAFETY: `storage` outlives the operation, which is released below.
//! let op = unsafe {
//!     mux.init_read(
//!         &handle,
//!         None,
//!         IoRequest::single(Buffer::new(&mut storage), 0),
//!         Deadline::never(),
//!     )?
//! };
//! while !mux.check_io_operation(op)?.is_finished() {
//!     mux.check_for_any_completed_io(Deadline::never(), usize::MAX)?;
//! }
//! let result = mux.take_completed_read(op)?;
//! mux.release_io_operation(op)?;
//! # drop(result);
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Support
//!
//! - **Linux**: epoll and synchronous backends
//! - **Other Unix**: synchronous backend only
//!
//! ## Buffer lifetimes
//!
//! Requests carry raw [`buffer::Buffer`] views. The memory they describe must
//! outlive the operation and must not be touched until it is released, which
//! is why [`Multiplexer::init_io_operation`] and its conveniences are
//! `unsafe`. The blocking [`handle::NativeHandle`] calls are safe because
//! they return only once their operation has been released.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs, rust_2018_idioms)]
#![cfg_attr(docsrs, feature(doc_cfg))]

// Core modules
pub mod buffer;
pub mod deadline;
pub mod error;
pub mod multiplexer;
pub mod operation;

// Backends and resources built on the core
pub mod backend;
pub mod handle;
pub mod this_thread;

// Ambient support
pub mod config;
pub mod logging;
pub(crate) mod sys;

pub use backend::{
    create_multiplexer, create_sync_multiplexer, detect_backend, BackendKind,
    SynchronousMultiplexer,
};
#[cfg(target_os = "linux")]
pub use backend::{MultiThreadedEpoll, SingleThreadedEpoll};
pub use buffer::{
    Buffer, ConstBuffer, IoRequest, IoResult, ReadResult, RegisteredBuffer, WriteResult,
};
pub use config::{ConfigBuilder, LoggingConfig, MultiplexerConfig};
pub use deadline::Deadline;
pub use error::{MultiplexError, Result};
pub use handle::{IoHandle, NativeHandle, RawHandle};
pub use logging::{LogLevel, Logger};
pub use multiplexer::{HandleTag, Multiplexer, SharedMultiplexer, SyncMultiplexer};
pub use operation::{
    BarrierKind, OperationId, OperationKind, OperationRequest, OperationStateType,
    OperationVisitor,
};
