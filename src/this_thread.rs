//! The calling thread's current multiplexer.
//!
//! Handles without a multiplexer of their own consult this binding to decide
//! between multiplexed i/o and direct blocking syscalls.
//!
//! ```rust,no_run
//! use iomux::backend::SingleThreadedEpoll;
//! use iomux::{this_thread, SharedMultiplexer};
//! use std::sync::Arc;
//!
//! # fn main() -> iomux::Result<()> {
//! let mux: SharedMultiplexer = Arc::new(SingleThreadedEpoll::new(64, 0)?);
//! {
//!     let _binding = this_thread::bind(mux.clone());
//!     assert!(this_thread::multiplexer().is_some());
//! }
//! assert!(this_thread::multiplexer().is_none());
//! # Ok(())
//! # }
//! ```

use std::cell::RefCell;
use std::marker::PhantomData;

use crate::multiplexer::SharedMultiplexer;

thread_local! {
    static CURRENT: RefCell<Option<SharedMultiplexer>> = const { RefCell::new(None) };
}

/// The multiplexer bound to the calling thread, if any.
pub fn multiplexer() -> Option<SharedMultiplexer> {
    CURRENT.with(|current| current.borrow().clone())
}

/// Binds `multiplexer` to the calling thread, returning the previous binding.
pub fn set_multiplexer(multiplexer: Option<SharedMultiplexer>) -> Option<SharedMultiplexer> {
    CURRENT.with(|current| std::mem::replace(&mut *current.borrow_mut(), multiplexer))
}

/// Binds `multiplexer` until the returned guard is dropped.
pub fn bind(multiplexer: SharedMultiplexer) -> MultiplexerBinding {
    MultiplexerBinding {
        previous: set_multiplexer(Some(multiplexer)),
        _not_send: PhantomData,
    }
}

/// Restores the previous thread binding on drop.
///
/// Bound to the thread that created it.
#[must_use = "the binding is undone when the guard is dropped"]
pub struct MultiplexerBinding {
    previous: Option<SharedMultiplexer>,
    _not_send: PhantomData<*const ()>,
}

impl Drop for MultiplexerBinding {
    fn drop(&mut self) {
        set_multiplexer(self.previous.take());
    }
}

impl std::fmt::Debug for MultiplexerBinding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiplexerBinding")
            .field("restores", &self.previous.as_ref().map(|m| m.name()))
            .finish()
    }
}

#[cfg(all(test, target_os = "linux"))]
mod tests {
    use super::*;
    use crate::backend::SingleThreadedEpoll;
    use std::sync::Arc;

    fn epoll() -> SharedMultiplexer {
        Arc::new(SingleThreadedEpoll::new(8, 0).unwrap())
    }

    #[test]
    fn default_is_unbound() {
        assert!(std::thread::spawn(|| multiplexer().is_none()).join().unwrap());
    }

    #[test]
    fn set_returns_previous() {
        let first = epoll();
        let second = epoll();
        assert!(set_multiplexer(Some(first.clone())).is_none());
        let previous = set_multiplexer(Some(second.clone())).unwrap();
        assert!(Arc::ptr_eq(&previous, &first));
        let previous = set_multiplexer(None).unwrap();
        assert!(Arc::ptr_eq(&previous, &second));
        assert!(multiplexer().is_none());
    }

    #[test]
    fn bindings_nest() {
        let outer = epoll();
        let inner = epoll();
        let _outer = bind(outer.clone());
        {
            let _inner = bind(inner.clone());
            assert!(Arc::ptr_eq(&multiplexer().unwrap(), &inner));
        }
        assert!(Arc::ptr_eq(&multiplexer().unwrap(), &outer));
    }

    #[test]
    fn binding_keeps_multiplexer_alive() {
        let mux = epoll();
        let _binding = bind(mux.clone());
        assert_eq!(Arc::strong_count(&mux), 2);
    }
}
