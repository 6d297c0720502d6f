//! Generation-checked tokens and the arena that owns operation states.
//!
//! Backends never hand out references to operation states. They hand out an
//! [`OperationId`], a slot index plus the slot's generation at insertion. A
//! released slot bumps its generation, so a stale token is reported as
//! [`UnknownOperation`](MultiplexError::UnknownOperation) instead of
//! aliasing whatever reuses the slot.

use std::sync::{Arc, Mutex};

use crate::buffer::{ReadResult, WriteResult};
use crate::error::{MultiplexError, Result};
use crate::operation::{OperationCore, OperationStateType, StateCell};

/// Opaque handle to one operation on one multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationId {
    index: u32,
    generation: u32,
}

impl OperationId {
    /// Reassembles a token from its parts.
    #[inline]
    pub const fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// Arena slot.
    #[inline]
    pub const fn index(self) -> u32 {
        self.index
    }

    /// Generation of the slot when the operation was inserted.
    #[inline]
    pub const fn generation(self) -> u32 {
        self.generation
    }
}

impl std::fmt::Display for OperationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "op#{}.{}", self.index, self.generation)
    }
}

struct Slot<C> {
    generation: u32,
    cell: Option<Arc<C>>,
}

struct Slots<C> {
    entries: Vec<Slot<C>>,
    free: Vec<u32>,
    live: usize,
}

/// Owns every live operation state of a multiplexer.
///
/// States are held by `Arc`, so a state being driven by one thread stays
/// alive and in place even if another thread releases its slot.
pub(crate) struct OperationArena<C> {
    slots: Mutex<Slots<C>>,
    limit: usize,
}

impl<C: StateCell> OperationArena<C> {
    /// Creates an arena holding at most `limit` operations (0 = unbounded).
    pub fn new(limit: usize) -> Self {
        Self {
            slots: Mutex::new(Slots {
                entries: Vec::new(),
                free: Vec::new(),
                live: 0,
            }),
            limit,
        }
    }

    /// Preallocates room for `additional` more operations.
    pub fn reserve(&self, additional: usize) -> Result<()> {
        let mut slots = self.slots.lock()?;
        let spare = slots.free.len();
        if additional > spare {
            let grow = additional - spare;
            slots.entries.reserve(grow);
            slots.free.reserve(grow);
        }
        Ok(())
    }

    /// Inserts the state built by `make`, which receives the new token.
    pub fn insert(
        &self,
        make: impl FnOnce(OperationId) -> OperationCore,
    ) -> Result<(OperationId, Arc<C>)> {
        let mut slots = self.slots.lock()?;
        if self.limit != 0 && slots.live >= self.limit {
            return Err(MultiplexError::ResourceExhausted("operation arena is full"));
        }

        let index = match slots.free.pop() {
            Some(index) => index,
            None => {
                let index = u32::try_from(slots.entries.len())
                    .map_err(|_| MultiplexError::ResourceExhausted("operation arena is full"))?;
                slots.entries.push(Slot {
                    generation: 0,
                    cell: None,
                });
                index
            }
        };

        let slot = &mut slots.entries[index as usize];
        let id = OperationId::from_parts(index, slot.generation);
        let cell = Arc::new(C::new(make(id)));
        slot.cell = Some(cell.clone());
        slots.live += 1;
        Ok((id, cell))
    }

    /// Looks up a live operation.
    pub fn get(&self, id: OperationId) -> Result<Arc<C>> {
        let slots = self.slots.lock()?;
        slots
            .entries
            .get(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.cell.clone())
            .ok_or(MultiplexError::UnknownOperation(id))
    }

    /// Removes an operation regardless of its state.
    pub fn remove(&self, id: OperationId) -> Result<Arc<C>> {
        let mut slots = self.slots.lock()?;
        let slot = slots
            .entries
            .get_mut(id.index as usize)
            .filter(|slot| slot.generation == id.generation)
            .ok_or(MultiplexError::UnknownOperation(id))?;
        let cell = slot
            .cell
            .take()
            .ok_or(MultiplexError::UnknownOperation(id))?;
        slot.generation = slot.generation.wrapping_add(1);
        slots.free.push(id.index);
        slots.live -= 1;
        Ok(cell)
    }

    /// Number of live operations.
    pub fn len(&self) -> usize {
        self.slots.lock().map(|slots| slots.live).unwrap_or(0)
    }

    /// Current state of an operation.
    pub fn state(&self, id: OperationId) -> Result<OperationStateType> {
        let cell = self.get(id)?;
        let state = cell.lock().state();
        Ok(state)
    }

    /// Moves a completed read result out of an operation.
    pub fn take_completed_read(&self, id: OperationId) -> Result<ReadResult> {
        let cell = self.get(id)?;
        let result = cell.lock().take_completed_read();
        result
    }

    /// Moves a completed write or barrier result out of an operation.
    pub fn take_completed_write_or_barrier(&self, id: OperationId) -> Result<WriteResult> {
        let cell = self.get(id)?;
        let result = cell.lock().take_completed_write_or_barrier();
        result
    }

    /// Disposes of an operation that has finished.
    pub fn release(&self, id: OperationId) -> Result<()> {
        let state = self.state(id)?;
        if !(state.is_finished() || state.is_unknown()) {
            return Err(MultiplexError::OperationPending);
        }
        self.remove(id).map(drop)
    }
}
