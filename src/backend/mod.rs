//! Concrete multiplexers.
//!
//! Two backends implement [`Multiplexer`](crate::Multiplexer):
//!
//! - **epoll** (Linux): readiness-based. Pollable descriptors park their
//!   operations until `epoll_wait` reports them ready; seekable ones are
//!   completed synchronously at initiation. Comes in a single-threaded and a
//!   multi-threaded flavour differing only in how operation states are
//!   guarded.
//! - **synchronous** (any Unix): completes every operation inside
//!   initiation, waiting with `poll(2)` up to the deadline. Useful where
//!   epoll is unavailable and as a reference for the contract.

use std::sync::Arc;

use crate::config::MultiplexerConfig;
use crate::error::Result;
use crate::logging;
use crate::multiplexer::{SharedMultiplexer, SyncMultiplexer};
use crate::{log_debug, log_info};

#[cfg(target_os = "linux")]
pub mod epoll;
pub mod synchronous;

#[cfg(target_os = "linux")]
pub use epoll::{EpollMultiplexer, MultiThreadedEpoll, SingleThreadedEpoll};
pub use synchronous::SynchronousMultiplexer;

/// Backends this crate can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// `epoll(7)`, Linux only.
    Epoll,
    /// Blocking syscalls with `poll(2)` deadlines.
    Synchronous,
}

impl BackendKind {
    /// Returns true if this backend can be constructed on this platform.
    pub fn is_available(self) -> bool {
        match self {
            BackendKind::Epoll => cfg!(target_os = "linux"),
            BackendKind::Synchronous => true,
        }
    }

    /// Short name, matching [`Multiplexer::name`](crate::Multiplexer::name).
    pub fn name(self) -> &'static str {
        match self {
            BackendKind::Epoll => "epoll",
            BackendKind::Synchronous => "synchronous",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Detect the best backend available on the current system.
///
/// # Examples
///
/// ```rust
/// # use iomux::backend::{detect_backend, BackendKind};
/// let backend = detect_backend();
/// assert!(backend.is_available());
/// # #[cfg(target_os = "linux")]
/// assert_eq!(backend, BackendKind::Epoll);
/// ```
pub fn detect_backend() -> BackendKind {
    if BackendKind::Epoll.is_available() {
        BackendKind::Epoll
    } else {
        BackendKind::Synchronous
    }
}

/// Builds the multiplexer described by `config`.
///
/// Configurations for more than one thread get the same thread-safe
/// multiplexer as [`create_sync_multiplexer`]. Installs the global logger
/// first when `config.logging` enables it.
///
/// # Errors
///
/// Returns [`InvalidRequest`](crate::MultiplexError::InvalidRequest) or
/// [`NotSupported`](crate::MultiplexError::NotSupported) if the
/// configuration does not validate, or the OS error if the backend's
/// descriptors cannot be created.
///
/// # Examples
///
/// ```rust,no_run
/// # use iomux::backend::create_multiplexer;
/// # use iomux::config::MultiplexerConfig;
/// # fn main() -> iomux::Result<()> {
/// let mux = create_multiplexer(&MultiplexerConfig::single_threaded())?;
/// println!("using {}", mux.name());
/// # Ok(())
/// # }
/// ```
pub fn create_multiplexer(config: &MultiplexerConfig) -> Result<SharedMultiplexer> {
    if config.is_multi_threaded() {
        let mux: SharedMultiplexer = create_sync_multiplexer(config)?;
        return Ok(mux);
    }
    prepare(config)?;

    let mux: SharedMultiplexer = match config.backend {
        #[cfg(target_os = "linux")]
        BackendKind::Epoll => Arc::new(SingleThreadedEpoll::new(
            config.max_events,
            config.max_operations,
        )?),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Epoll => return Err(epoll_unsupported()),
        BackendKind::Synchronous => Arc::new(SynchronousMultiplexer::new(config.max_operations)),
    };
    announce(mux.name(), config);
    Ok(mux)
}

/// Builds a multiplexer that any number of threads may drive, whatever
/// `config.threads` says.
///
/// The epoll backend is built with lock-guarded operation states. The
/// result coerces into a [`SharedMultiplexer`] for attaching to handles.
///
/// # Examples
///
/// ```rust,no_run
/// # use iomux::backend::create_sync_multiplexer;
/// # use iomux::config::MultiplexerConfig;
/// # use iomux::Deadline;
/// # fn main() -> iomux::Result<()> {
/// let mux = create_sync_multiplexer(&MultiplexerConfig::multi_threaded(4))?;
/// let drainer = {
///     let mux = mux.clone();
///     std::thread::spawn(move || mux.check_for_any_completed_io(Deadline::never(), 64))
/// };
/// mux.wake_check_for_any_completed_io()?;
/// # drop(drainer);
/// # Ok(())
/// # }
/// ```
pub fn create_sync_multiplexer(config: &MultiplexerConfig) -> Result<SyncMultiplexer> {
    prepare(config)?;

    let mux: SyncMultiplexer = match config.backend {
        #[cfg(target_os = "linux")]
        BackendKind::Epoll => Arc::new(MultiThreadedEpoll::new(
            config.max_events,
            config.max_operations,
        )?),
        #[cfg(not(target_os = "linux"))]
        BackendKind::Epoll => return Err(epoll_unsupported()),
        BackendKind::Synchronous => Arc::new(SynchronousMultiplexer::new(config.max_operations)),
    };
    announce(mux.name(), config);
    Ok(mux)
}

fn prepare(config: &MultiplexerConfig) -> Result<()> {
    config.validate()?;
    if config.logging.enabled {
        logging::init_logger_with(&config.logging);
    }
    Ok(())
}

fn announce(name: &str, config: &MultiplexerConfig) {
    log_info!(
        "backend",
        "created {} multiplexer for {} thread(s)",
        name,
        config.threads
    );
    log_debug!(
        "backend",
        "max_events={} max_operations={}",
        config.max_events,
        config.max_operations
    );
}

#[cfg(not(target_os = "linux"))]
fn epoll_unsupported() -> crate::error::MultiplexError {
    crate::error::MultiplexError::NotSupported("epoll backend is only supported on Linux")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deadline::Deadline;
    use std::time::Duration;

    fn drive_from_two_threads(mux: SyncMultiplexer) {
        let sleeper = {
            let mux = mux.clone();
            std::thread::spawn(move || {
                mux.check_for_any_completed_io(Deadline::after(Duration::from_secs(10)), 1)
                    .unwrap()
            })
        };
        while !sleeper.is_finished() {
            mux.wake_check_for_any_completed_io().unwrap();
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(sleeper.join().unwrap(), 0);

        let shared: SharedMultiplexer = mux;
        assert_eq!(shared.operations_in_flight(), 0);
    }

    #[test]
    fn synchronous_is_always_available() {
        assert!(BackendKind::Synchronous.is_available());
        assert_eq!(BackendKind::Synchronous.to_string(), "synchronous");
        assert_eq!(BackendKind::Epoll.to_string(), "epoll");
    }

    #[test]
    fn create_validates_first() {
        let config = MultiplexerConfig {
            threads: 0,
            ..MultiplexerConfig::default()
        };
        assert!(create_multiplexer(&config).is_err());
    }

    #[test]
    fn create_synchronous() {
        let config = MultiplexerConfig {
            backend: BackendKind::Synchronous,
            ..MultiplexerConfig::default()
        };
        let mux = create_multiplexer(&config).unwrap();
        assert_eq!(mux.name(), "synchronous");
        assert_eq!(mux.operations_in_flight(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn create_epoll_by_thread_count() {
        let single = create_multiplexer(&MultiplexerConfig::single_threaded()).unwrap();
        assert_eq!(single.name(), "epoll");
        let multi = create_multiplexer(&MultiplexerConfig::multi_threaded(4)).unwrap();
        assert_eq!(multi.name(), "epoll");
        let core = std::mem::size_of::<crate::operation::OperationCore>();
        assert!(single.io_state_requirements().size() >= core);
        assert!(multi.io_state_requirements().size() >= core);
    }

    #[test]
    fn sync_multiplexer_is_driven_across_threads() {
        let config = MultiplexerConfig {
            backend: BackendKind::Synchronous,
            ..MultiplexerConfig::multi_threaded(2)
        };
        let mux = create_sync_multiplexer(&config).unwrap();
        assert_eq!(mux.name(), "synchronous");
        drive_from_two_threads(mux);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn multi_threaded_epoll_is_driven_across_threads() {
        let mux = create_sync_multiplexer(&MultiplexerConfig::multi_threaded(2)).unwrap();
        assert_eq!(mux.name(), "epoll");
        assert_eq!(
            mux.io_state_requirements(),
            std::alloc::Layout::new::<crate::operation::SynchronisedState>()
        );
        drive_from_two_threads(mux);
    }
}
