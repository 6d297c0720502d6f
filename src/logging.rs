//! Structured logging for multiplexer operations.
//!
//! Nothing is emitted until [`init_logger`] (or [`init_logger_with`]) installs
//! the process-global logger. Entries can be written to stderr as text or
//! JSON, or forwarded to the `tracing` ecosystem through [`TracingOutput`].

use crate::config::LoggingConfig;
use crate::error::{MultiplexError, Result};
use crate::operation::OperationId;
use std::collections::HashMap;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Log level for multiplexer events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// State transitions and per-operation progress
    Trace = 0,
    /// Registration, cancellation, timeouts
    Debug = 1,
    /// Lifecycle of multiplexers
    Info = 2,
    /// Unexpected OS failures that were recovered from
    Warn = 3,
    /// Failures surfaced to the caller
    Error = 4,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "TRACE"),
            LogLevel::Debug => write!(f, "DEBUG"),
            LogLevel::Info => write!(f, "INFO"),
            LogLevel::Warn => write!(f, "WARN"),
            LogLevel::Error => write!(f, "ERROR"),
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = MultiplexError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(MultiplexError::InvalidRequest("unknown log level")),
        }
    }
}

/// One structured log record.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Wall-clock time of the event
    pub timestamp: SystemTime,
    /// Severity
    pub level: LogLevel,
    /// Emitting component, e.g. `"epoll"` or `"handle"`
    pub component: String,
    /// Operation the event concerns, if any
    pub operation_id: Option<OperationId>,
    /// Descriptor the event concerns, if any
    pub fd: Option<RawFd>,
    /// Message content
    pub message: String,
    /// Additional key/value context
    pub metadata: HashMap<String, String>,
    /// Elapsed time, for timing events
    pub duration: Option<Duration>,
}

impl LogEntry {
    /// Create a new log entry.
    pub fn new(level: LogLevel, component: &str, message: &str) -> Self {
        Self {
            timestamp: SystemTime::now(),
            level,
            component: component.to_string(),
            operation_id: None,
            fd: None,
            message: message.to_string(),
            metadata: HashMap::new(),
            duration: None,
        }
    }

    /// Attach the operation this entry concerns.
    pub fn with_operation_id(mut self, operation_id: OperationId) -> Self {
        self.operation_id = Some(operation_id);
        self
    }

    /// Attach the descriptor this entry concerns.
    pub fn with_fd(mut self, fd: RawFd) -> Self {
        self.fd = Some(fd);
        self
    }

    /// Add metadata to the log entry.
    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Add duration to the log entry.
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }

    fn millis_since_epoch(&self) -> u128 {
        self.timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis()
    }

    /// Format the log entry as a human-readable line.
    pub fn format(&self) -> String {
        let mut parts = vec![
            format!("[{}]", self.millis_since_epoch()),
            self.level.to_string(),
            self.component.clone(),
        ];

        if let Some(op) = self.operation_id {
            parts.push(op.to_string());
        }

        if let Some(fd) = self.fd {
            parts.push(format!("fd:{fd}"));
        }

        parts.push(self.message.clone());

        if let Some(duration) = self.duration {
            parts.push(format!("duration:{}us", duration.as_micros()));
        }

        if !self.metadata.is_empty() {
            let mut pairs: Vec<_> = self
                .metadata
                .iter()
                .map(|(k, v)| format!("{k}:{v}"))
                .collect();
            pairs.sort();
            parts.push(format!("metadata:{{{}}}", pairs.join(",")));
        }

        parts.join(" ")
    }

    /// Format the log entry as a single JSON object.
    pub fn format_json(&self) -> String {
        let mut fields = vec![
            format!("\"timestamp\":{}", self.millis_since_epoch()),
            format!("\"level\":\"{}\"", self.level),
            format!("\"component\":\"{}\"", escape_json(&self.component)),
            format!("\"message\":\"{}\"", escape_json(&self.message)),
        ];

        if let Some(op) = self.operation_id {
            fields.push(format!("\"operation_id\":\"{op}\""));
        }

        if let Some(fd) = self.fd {
            fields.push(format!("\"fd\":{fd}"));
        }

        if let Some(duration) = self.duration {
            fields.push(format!("\"duration_us\":{}", duration.as_micros()));
        }

        if !self.metadata.is_empty() {
            let mut pairs: Vec<_> = self
                .metadata
                .iter()
                .map(|(k, v)| format!("\"{}\":\"{}\"", escape_json(k), escape_json(v)))
                .collect();
            pairs.sort();
            fields.push(format!("\"metadata\":{{{}}}", pairs.join(",")));
        }

        format!("{{{}}}", fields.join(","))
    }
}

fn escape_json(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        match c {
            '"' => escaped.push_str("\\\""),
            '\\' => escaped.push_str("\\\\"),
            '\n' => escaped.push_str("\\n"),
            '\r' => escaped.push_str("\\r"),
            '\t' => escaped.push_str("\\t"),
            c if (c as u32) < 0x20 => escaped.push_str(&format!("\\u{:04x}", c as u32)),
            c => escaped.push(c),
        }
    }
    escaped
}

/// Destination for log entries.
pub trait LogOutput: Send + Sync {
    /// Write a log entry to the output.
    fn write(&self, entry: &LogEntry) -> Result<()>;

    /// Flush any buffered output.
    fn flush(&self) -> Result<()>;
}

/// Writes entries to stderr.
#[derive(Debug, Default)]
pub struct ConsoleOutput {
    json_format: bool,
}

impl ConsoleOutput {
    /// Text output.
    pub fn new() -> Self {
        Self { json_format: false }
    }

    /// JSON output, one object per line.
    pub fn new_json() -> Self {
        Self { json_format: true }
    }
}

impl LogOutput for ConsoleOutput {
    fn write(&self, entry: &LogEntry) -> Result<()> {
        let formatted = if self.json_format {
            entry.format_json()
        } else {
            entry.format()
        };

        eprintln!("{formatted}");
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        use std::io::Write;
        std::io::stderr().flush()?;
        Ok(())
    }
}

/// Forwards entries to the `tracing` crate.
///
/// Operation and descriptor context become event fields, so a subscriber
/// can filter on them.
#[derive(Debug, Default)]
pub struct TracingOutput;

impl TracingOutput {
    /// Create a tracing forwarder.
    pub fn new() -> Self {
        Self
    }
}

macro_rules! forward_event {
    ($level:expr, $entry:expr) => {{
        let entry = $entry;
        let op = entry.operation_id.map(|op| op.to_string());
        match $level {
            LogLevel::Trace => tracing::trace!(
                component = %entry.component,
                operation = ?op,
                fd = ?entry.fd,
                "{}",
                entry.message
            ),
            LogLevel::Debug => tracing::debug!(
                component = %entry.component,
                operation = ?op,
                fd = ?entry.fd,
                "{}",
                entry.message
            ),
            LogLevel::Info => tracing::info!(
                component = %entry.component,
                operation = ?op,
                fd = ?entry.fd,
                "{}",
                entry.message
            ),
            LogLevel::Warn => tracing::warn!(
                component = %entry.component,
                operation = ?op,
                fd = ?entry.fd,
                "{}",
                entry.message
            ),
            LogLevel::Error => tracing::error!(
                component = %entry.component,
                operation = ?op,
                fd = ?entry.fd,
                "{}",
                entry.message
            ),
        }
    }};
}

impl LogOutput for TracingOutput {
    fn write(&self, entry: &LogEntry) -> Result<()> {
        forward_event!(entry.level, entry);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        Ok(())
    }
}

/// Fans entries out to a set of outputs above a minimum level.
pub struct Logger {
    min_level: LogLevel,
    outputs: Vec<Box<dyn LogOutput>>,
}

impl Logger {
    /// Create a logger writing text to stderr at `Info` and above.
    pub fn new() -> Self {
        Self {
            min_level: LogLevel::Info,
            outputs: vec![Box::new(ConsoleOutput::new())],
        }
    }

    /// Create a logger from configuration. A disabled configuration yields a
    /// logger with no outputs.
    pub fn from_config(config: &LoggingConfig) -> Self {
        let outputs: Vec<Box<dyn LogOutput>> = if !config.enabled {
            Vec::new()
        } else if config.json_format {
            vec![Box::new(ConsoleOutput::new_json())]
        } else {
            vec![Box::new(ConsoleOutput::new())]
        };
        Self {
            min_level: config.level,
            outputs,
        }
    }

    /// Set the minimum log level.
    pub fn set_level(&mut self, level: LogLevel) {
        self.min_level = level;
    }

    /// Minimum level that is written.
    pub fn level(&self) -> LogLevel {
        self.min_level
    }

    /// Add an output destination.
    pub fn add_output(&mut self, output: Box<dyn LogOutput>) {
        self.outputs.push(output);
    }

    /// Remove every output destination.
    pub fn clear_outputs(&mut self) {
        self.outputs.clear();
    }

    /// Returns true if an entry at `level` would be written somewhere.
    pub fn enabled(&self, level: LogLevel) -> bool {
        level >= self.min_level && !self.outputs.is_empty()
    }

    /// Log a message at the specified level.
    pub fn log(&self, level: LogLevel, component: &str, message: &str) {
        if self.enabled(level) {
            self.write_entry(&LogEntry::new(level, component, message));
        }
    }

    /// Log a message about one operation.
    pub fn log_operation(
        &self,
        level: LogLevel,
        component: &str,
        operation_id: OperationId,
        fd: Option<RawFd>,
        message: &str,
    ) {
        if self.enabled(level) {
            let mut entry =
                LogEntry::new(level, component, message).with_operation_id(operation_id);
            if let Some(fd) = fd {
                entry = entry.with_fd(fd);
            }
            self.write_entry(&entry);
        }
    }

    /// Log a timing measurement at debug level.
    pub fn log_timing(&self, component: &str, what: &str, duration: Duration) {
        if self.enabled(LogLevel::Debug) {
            let entry = LogEntry::new(LogLevel::Debug, component, &format!("{what} completed"))
                .with_duration(duration);
            self.write_entry(&entry);
        }
    }

    fn write_entry(&self, entry: &LogEntry) {
        for output in &self.outputs {
            if let Err(e) = output.write(entry) {
                eprintln!("Failed to write log entry: {e}");
            }
        }
    }

    /// Flush all outputs.
    pub fn flush(&self) {
        for output in &self.outputs {
            if let Err(e) = output.flush() {
                eprintln!("Failed to flush log output: {e}");
            }
        }
    }
}

impl Default for Logger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger")
            .field("min_level", &self.min_level)
            .field("outputs", &self.outputs.len())
            .finish()
    }
}

static GLOBAL_LOGGER: OnceLock<Arc<Mutex<Logger>>> = OnceLock::new();

/// Install the global logger with default settings, or return the existing one.
pub fn init_logger() -> Arc<Mutex<Logger>> {
    GLOBAL_LOGGER
        .get_or_init(|| Arc::new(Mutex::new(Logger::new())))
        .clone()
}

/// Install the global logger from configuration. If a logger is already
/// installed it is reconfigured in place.
pub fn init_logger_with(config: &LoggingConfig) -> Arc<Mutex<Logger>> {
    let mut installed = false;
    let logger = GLOBAL_LOGGER.get_or_init(|| {
        installed = true;
        Arc::new(Mutex::new(Logger::from_config(config)))
    });
    if !installed {
        if let Ok(mut existing) = logger.lock() {
            *existing = Logger::from_config(config);
        }
    }
    logger.clone()
}

/// Returns true if the global logger would write an entry at `level`.
pub fn enabled(level: LogLevel) -> bool {
    GLOBAL_LOGGER
        .get()
        .and_then(|logger| logger.lock().ok().map(|l| l.enabled(level)))
        .unwrap_or(false)
}

/// Log a message using the global logger.
pub fn log(level: LogLevel, component: &str, message: &str) {
    if let Some(logger) = GLOBAL_LOGGER.get() {
        if let Ok(logger) = logger.lock() {
            logger.log(level, component, message);
        }
    }
}

/// Log an operation event using the global logger.
pub fn log_operation(
    level: LogLevel,
    component: &str,
    operation_id: OperationId,
    fd: Option<RawFd>,
    message: &str,
) {
    if let Some(logger) = GLOBAL_LOGGER.get() {
        if let Ok(logger) = logger.lock() {
            logger.log_operation(level, component, operation_id, fd, message);
        }
    }
}

/// Log timing using the global logger.
pub fn log_timing(component: &str, what: &str, duration: Duration) {
    if let Some(logger) = GLOBAL_LOGGER.get() {
        if let Ok(logger) = logger.lock() {
            logger.log_timing(component, what, duration);
        }
    }
}

/// Log a trace-level message using the global logger.
#[macro_export]
macro_rules! log_trace {
    ($component:expr, $($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Trace) {
            $crate::logging::log($crate::logging::LogLevel::Trace, $component, &format!($($arg)*))
        }
    };
}

/// Log a debug-level message using the global logger.
#[macro_export]
macro_rules! log_debug {
    ($component:expr, $($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Debug) {
            $crate::logging::log($crate::logging::LogLevel::Debug, $component, &format!($($arg)*))
        }
    };
}

/// Log an info-level message using the global logger.
#[macro_export]
macro_rules! log_info {
    ($component:expr, $($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Info) {
            $crate::logging::log($crate::logging::LogLevel::Info, $component, &format!($($arg)*))
        }
    };
}

/// Log a warning-level message using the global logger.
#[macro_export]
macro_rules! log_warn {
    ($component:expr, $($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Warn) {
            $crate::logging::log($crate::logging::LogLevel::Warn, $component, &format!($($arg)*))
        }
    };
}

/// Log an error-level message using the global logger.
#[macro_export]
macro_rules! log_error {
    ($component:expr, $($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::Error) {
            $crate::logging::log($crate::logging::LogLevel::Error, $component, &format!($($arg)*))
        }
    };
}

/// Log a message about one operation on one descriptor using the global
/// logger. The operation id and descriptor land in the entry's structured
/// fields rather than in the message text.
///
/// ```rust
/// use iomux::{log_operation, OperationId};
///
/// let op = OperationId::from_parts(0, 1);
/// log_operation!(Trace, "epoll", op, 7, "parked");
/// ```
#[macro_export]
macro_rules! log_operation {
    ($level:ident, $component:expr, $op:expr, $fd:expr, $($arg:tt)*) => {
        if $crate::logging::enabled($crate::logging::LogLevel::$level) {
            $crate::logging::log_operation(
                $crate::logging::LogLevel::$level,
                $component,
                $op,
                Some($fd),
                &format!($($arg)*),
            )
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingOutput(Arc<AtomicUsize>);

    impl LogOutput for CountingOutput {
        fn write(&self, _entry: &LogEntry) -> Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_log_entry_creation() {
        let op = OperationId::from_parts(2, 1);
        let entry = LogEntry::new(LogLevel::Info, "epoll", "armed")
            .with_operation_id(op)
            .with_fd(4)
            .with_metadata("events", "in")
            .with_duration(Duration::from_millis(10));

        assert_eq!(entry.level, LogLevel::Info);
        assert_eq!(entry.component, "epoll");
        assert_eq!(entry.operation_id, Some(op));
        assert_eq!(entry.fd, Some(4));
        assert_eq!(entry.metadata.get("events"), Some(&"in".to_string()));
        assert_eq!(entry.duration, Some(Duration::from_millis(10)));
    }

    #[test]
    fn test_log_entry_formatting() {
        let entry = LogEntry::new(LogLevel::Debug, "handle", "timed out")
            .with_operation_id(OperationId::from_parts(0, 3))
            .with_fd(9);
        let formatted = entry.format();

        assert!(formatted.contains("DEBUG"));
        assert!(formatted.contains("handle"));
        assert!(formatted.contains("op#0.3"));
        assert!(formatted.contains("fd:9"));
        assert!(formatted.contains("timed out"));
    }

    #[test]
    fn test_log_entry_json_escaping() {
        let entry = LogEntry::new(LogLevel::Warn, "epoll", "bad \"fd\"\nretry");
        let json = entry.format_json();

        assert!(json.contains("\"level\":\"WARN\""));
        assert!(json.contains("\"message\":\"bad \\\"fd\\\"\\nretry\""));
        assert!(json.starts_with('{') && json.ends_with('}'));
    }

    #[test]
    fn test_level_filtering() {
        let count = Arc::new(AtomicUsize::new(0));
        let mut logger = Logger::new();
        logger.clear_outputs();
        logger.add_output(Box::new(CountingOutput(count.clone())));
        logger.set_level(LogLevel::Debug);

        logger.log(LogLevel::Trace, "test", "dropped");
        logger.log(LogLevel::Debug, "test", "kept");
        logger.log_operation(
            LogLevel::Error,
            "test",
            OperationId::from_parts(1, 1),
            None,
            "kept",
        );
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[derive(Default)]
    struct CapturingOutput(Mutex<Vec<LogEntry>>);

    impl LogOutput for Arc<CapturingOutput> {
        fn write(&self, entry: &LogEntry) -> Result<()> {
            self.0.lock().unwrap().push(entry.clone());
            Ok(())
        }

        fn flush(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_operation_and_timing_fields() {
        let captured = Arc::new(CapturingOutput::default());
        let mut logger = Logger::new();
        logger.clear_outputs();
        logger.add_output(Box::new(captured.clone()));
        logger.set_level(LogLevel::Trace);

        let op = OperationId::from_parts(3, 2);
        logger.log_operation(LogLevel::Trace, "epoll", op, Some(11), "parked");
        logger.log_timing("handle", "read", Duration::from_millis(7));

        let entries = captured.0.lock().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].operation_id, Some(op));
        assert_eq!(entries[0].fd, Some(11));
        assert_eq!(entries[1].duration, Some(Duration::from_millis(7)));
        assert!(entries[1].message.contains("read"));
    }

    #[test]
    fn test_disabled_config_has_no_outputs() {
        let config = LoggingConfig {
            enabled: false,
            ..LoggingConfig::default()
        };
        let logger = Logger::from_config(&config);
        assert!(!logger.enabled(LogLevel::Error));
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("TRACE".parse::<LogLevel>().unwrap(), LogLevel::Trace);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_tracing_output_accepts_every_level() {
        let output = TracingOutput::new();
        for level in [
            LogLevel::Trace,
            LogLevel::Debug,
            LogLevel::Info,
            LogLevel::Warn,
            LogLevel::Error,
        ] {
            let entry = LogEntry::new(level, "test", "forwarded").with_fd(3);
            assert!(output.write(&entry).is_ok());
        }
    }

    #[test]
    fn test_global_logger() {
        let _logger = init_logger();

        log(LogLevel::Info, "test", "test message");
        log_operation(
            LogLevel::Debug,
            "test",
            OperationId::from_parts(0, 1),
            Some(4),
            "operation message",
        );
        log_timing("test", "read", Duration::from_millis(10));
    }
}
