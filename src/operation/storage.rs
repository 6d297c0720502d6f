//! Storage strategies guarding an [`OperationCore`].
//!
//! A multiplexer picks one strategy for all of its operations:
//!
//! - [`UnsynchronisedState`]: a `RefCell`, for multiplexers driven by a
//!   single thread. No atomics on the transition path.
//! - [`SynchronisedState`]: a spin lock, for multiplexers drained by several
//!   threads at once. Critical sections are a payload swap plus a visitor
//!   call, so spinning beats parking.

use std::cell::{RefCell, RefMut};
use std::ops::DerefMut;

use crate::operation::OperationCore;

/// Interior-mutable home of one operation.
pub trait StateCell: Sized {
    /// Exclusive access to the core; transitions happen through this guard.
    type Guard<'a>: DerefMut<Target = OperationCore>
    where
        Self: 'a;

    /// Whether concurrent `lock` calls from several threads are safe.
    const SYNCHRONISED: bool;

    /// Wraps a freshly constructed core.
    fn new(core: OperationCore) -> Self;

    /// Acquires exclusive access.
    ///
    /// Re-entrant acquisition from a visitor panics for
    /// [`UnsynchronisedState`] and deadlocks for [`SynchronisedState`].
    fn lock(&self) -> Self::Guard<'_>;

    /// Acquires exclusive access if nobody else holds it.
    fn try_lock(&self) -> Option<Self::Guard<'_>>;
}

/// Single-threaded storage.
#[derive(Debug)]
pub struct UnsynchronisedState {
    core: RefCell<OperationCore>,
}

impl StateCell for UnsynchronisedState {
    type Guard<'a> = RefMut<'a, OperationCore>;

    const SYNCHRONISED: bool = false;

    fn new(core: OperationCore) -> Self {
        Self {
            core: RefCell::new(core),
        }
    }

    #[inline]
    fn lock(&self) -> Self::Guard<'_> {
        self.core.borrow_mut()
    }

    #[inline]
    fn try_lock(&self) -> Option<Self::Guard<'_>> {
        self.core.try_borrow_mut().ok()
    }
}

/// Lock-guarded storage, safe to drive from any thread.
#[derive(Debug)]
pub struct SynchronisedState {
    core: spin::Mutex<OperationCore>,
}

impl StateCell for SynchronisedState {
    type Guard<'a> = spin::MutexGuard<'a, OperationCore>;

    const SYNCHRONISED: bool = true;

    fn new(core: OperationCore) -> Self {
        Self {
            core: spin::Mutex::new(core),
        }
    }

    #[inline]
    fn lock(&self) -> Self::Guard<'_> {
        self.core.lock()
    }

    #[inline]
    fn try_lock(&self) -> Option<Self::Guard<'_>> {
        self.core.try_lock()
    }
}

static_assertions::assert_impl_all!(SynchronisedState: Send, Sync);
static_assertions::assert_not_impl_any!(UnsynchronisedState: Sync);
