//! Operation state management.
//!
//! Every read, write or barrier issued through a [`Multiplexer`] is tracked
//! by one operation state moving through a fixed lifecycle:
//!
//! ```text
//! read:    ReadInitialised    -> ReadInitiated    -> ReadCompleted -> ReadFinished
//! write:   WriteInitialised   -> WriteInitiated   -> WOBCompleted  -> WOBFinished
//! barrier: BarrierInitialised -> BarrierInitiated -> WOBCompleted  -> WOBFinished
//! ```
//!
//! `WOB` abbreviates `WriteOrBarrier`. An operation satisfied immediately
//! inside the initiating call skips the initiated state. Each edge is
//! idempotent: applying it to a state that is not one of its predecessors
//! does nothing, so racing completions resolve to exactly one visitor
//! callback.
//!
//! States live in a multiplexer-owned arena and are addressed by
//! [`OperationId`]. They can be released only once finished.
//!
//! [`Multiplexer`]: crate::Multiplexer

// Public modules
pub mod types;

// Internal modules
mod arena;
mod core;
mod payload;
mod storage;
mod visitor;

// Test module
#[cfg(test)]
mod tests;

pub(crate) use arena::OperationArena;

// Re-exports for public API
pub use self::core::OperationCore;
pub use arena::OperationId;
pub use payload::{OperationRequest, Payload, PendingIo};
pub use storage::{StateCell, SynchronisedState, UnsynchronisedState};
pub use types::{BarrierKind, OperationKind, OperationStateType};
pub use visitor::OperationVisitor;
