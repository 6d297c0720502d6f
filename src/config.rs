//! Configuration for constructing multiplexers.
//!
//! A [`MultiplexerConfig`] selects the backend, the state storage strategy
//! (through the number of threads expected to drive the multiplexer) and the
//! capacity limits. Use a preset, the [`ConfigBuilder`], or struct update
//! syntax over [`Default`].

use crate::backend::{detect_backend, BackendKind};
use crate::error::{MultiplexError, Result};
use crate::logging::LogLevel;

/// Upper bound on `max_events`, the size of the event buffer each drain
/// allocates.
pub const MAX_EVENTS_LIMIT: usize = 4096;

/// Complete configuration for a multiplexer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MultiplexerConfig {
    /// Backend to construct
    pub backend: BackendKind,
    /// Number of threads that will drive completions.
    ///
    /// `1` selects unsynchronised operation states; anything larger selects
    /// the lock-guarded ones.
    pub threads: usize,
    /// Most readiness events consumed by one drain
    pub max_events: usize,
    /// Most operations that may exist at once (0 = unbounded)
    pub max_operations: usize,
    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Enable logging
    pub enabled: bool,
    /// Minimum log level
    pub level: LogLevel,
    /// Use JSON format for logs
    pub json_format: bool,
}

impl Default for MultiplexerConfig {
    fn default() -> Self {
        Self {
            backend: detect_backend(),
            threads: 1,
            max_events: 64,
            max_operations: 0,
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            level: LogLevel::Info,
            json_format: false,
        }
    }
}

impl MultiplexerConfig {
    /// Configuration for a multiplexer driven by its creating thread only.
    pub fn single_threaded() -> Self {
        Self::default()
    }

    /// Configuration for a multiplexer drained by `threads` threads at once.
    pub fn multi_threaded(threads: usize) -> Self {
        Self {
            threads: threads.max(2),
            max_events: 256,
            ..Self::default()
        }
    }

    /// Configuration with debug logging and a bounded arena, so leaks of
    /// unreleased operations surface as errors early.
    pub fn development() -> Self {
        Self {
            max_events: 16,
            max_operations: 1024,
            logging: LoggingConfig {
                enabled: true,
                level: LogLevel::Debug,
                json_format: false,
            },
            ..Self::default()
        }
    }

    /// Configuration sized for this machine: the best available backend and
    /// one driving thread per available CPU.
    pub fn auto_detect() -> Result<Self> {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let config = if cpus > 1 {
            Self::multi_threaded(cpus)
        } else {
            Self::single_threaded()
        };
        config.validate()?;
        Ok(config)
    }

    /// Returns true if operation states must be lock-guarded.
    #[inline]
    pub fn is_multi_threaded(&self) -> bool {
        self.threads > 1
    }

    /// Validate the configuration for consistency.
    pub fn validate(&self) -> Result<()> {
        if self.threads == 0 {
            return Err(MultiplexError::InvalidRequest(
                "threads must be greater than 0",
            ));
        }

        if self.max_events == 0 {
            return Err(MultiplexError::InvalidRequest(
                "max_events must be greater than 0",
            ));
        }

        if self.max_events > MAX_EVENTS_LIMIT {
            return Err(MultiplexError::InvalidRequest(
                "max_events should not exceed 4096",
            ));
        }

        if self.max_operations > u32::MAX as usize {
            return Err(MultiplexError::InvalidRequest(
                "max_operations must fit in 32 bits",
            ));
        }

        if !self.backend.is_available() {
            return Err(MultiplexError::NotSupported(
                "configured backend is not available on this platform",
            ));
        }

        Ok(())
    }
}

/// Configuration builder for fluent configuration creation.
#[derive(Debug)]
pub struct ConfigBuilder {
    config: MultiplexerConfig,
}

impl ConfigBuilder {
    /// Start from the default configuration.
    pub fn new() -> Self {
        Self {
            config: MultiplexerConfig::default(),
        }
    }

    /// Set the backend.
    pub fn backend(mut self, backend: BackendKind) -> Self {
        self.config.backend = backend;
        self
    }

    /// Set the number of driving threads.
    pub fn threads(mut self, threads: usize) -> Self {
        self.config.threads = threads;
        self
    }

    /// Set the per-drain event limit.
    pub fn max_events(mut self, max_events: usize) -> Self {
        self.config.max_events = max_events;
        self
    }

    /// Bound the number of live operations.
    pub fn max_operations(mut self, max_operations: usize) -> Self {
        self.config.max_operations = max_operations;
        self
    }

    /// Set logging configuration.
    pub fn logging(mut self, logging: LoggingConfig) -> Self {
        self.config.logging = logging;
        self
    }

    /// Validate and return the configuration.
    pub fn build(self) -> Result<MultiplexerConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MultiplexerConfig::default();
        assert!(config.validate().is_ok());
        assert!(!config.is_multi_threaded());
        assert!(!config.logging.enabled);
    }

    #[test]
    fn test_multi_threaded_config() {
        let config = MultiplexerConfig::multi_threaded(8);
        assert!(config.validate().is_ok());
        assert_eq!(config.threads, 8);
        assert!(config.is_multi_threaded());

        // A "multi-threaded" request for one thread still gets locking.
        assert_eq!(MultiplexerConfig::multi_threaded(1).threads, 2);
    }

    #[test]
    fn test_development_config() {
        let config = MultiplexerConfig::development();
        assert!(config.validate().is_ok());
        assert!(config.logging.enabled);
        assert_eq!(config.logging.level, LogLevel::Debug);
        assert_eq!(config.max_operations, 1024);
    }

    #[test]
    fn test_config_validation() {
        let mut config = MultiplexerConfig::default();
        assert!(config.validate().is_ok());

        config.threads = 0;
        assert!(config.validate().is_err());

        config.threads = 1;
        config.max_events = 0;
        assert!(config.validate().is_err());

        config.max_events = MAX_EVENTS_LIMIT + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_builder() {
        let config = ConfigBuilder::new()
            .backend(BackendKind::Synchronous)
            .threads(4)
            .max_operations(32)
            .build()
            .unwrap();

        assert_eq!(config.backend, BackendKind::Synchronous);
        assert_eq!(config.threads, 4);
        assert_eq!(config.max_operations, 32);

        assert!(ConfigBuilder::new().threads(0).build().is_err());
    }

    #[test]
    fn test_auto_detect_config() {
        let config = MultiplexerConfig::auto_detect().unwrap();
        assert!(config.validate().is_ok());
        assert!(config.threads >= 1);
    }
}
