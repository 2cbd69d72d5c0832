//! Injected logging capability.
//!
//! Every component receives a [`SharedLogger`] at construction instead of
//! reaching for a process-wide logger. The default [`TracingLogger`] forwards
//! to `tracing`, so a subscriber installed by the binary sees everything.

use std::sync::Arc;

use parking_lot::Mutex;

/// Severity used by [`MemoryLogger`] records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LogLevel {
    Verbose,
    Info,
    Warn,
    Error,
}

/// Logging capability handed to each component.
pub trait Logger: Send + Sync {
    fn info(&self, message: &str);
    fn warn(&self, message: &str);
    fn error(&self, message: &str);
    /// Chatty protocol detail (request/response lines, datagrams).
    fn verbose(&self, message: &str);
}

/// Shared handle to a logger.
pub type SharedLogger = Arc<dyn Logger>;

/// Logger that forwards to the `tracing` macros, tagged with a component name.
#[derive(Debug, Clone)]
pub struct TracingLogger {
    component: &'static str,
}

impl TracingLogger {
    pub fn new(component: &'static str) -> Self {
        Self { component }
    }

    /// Convenience constructor returning a [`SharedLogger`].
    pub fn shared(component: &'static str) -> SharedLogger {
        Arc::new(Self::new(component))
    }

    pub fn component(&self) -> &'static str {
        self.component
    }
}

impl Default for TracingLogger {
    fn default() -> Self {
        Self::new("satip")
    }
}

impl Logger for TracingLogger {
    fn info(&self, message: &str) {
        tracing::info!(component = self.component, "{}", message);
    }

    fn warn(&self, message: &str) {
        tracing::warn!(component = self.component, "{}", message);
    }

    fn error(&self, message: &str) {
        tracing::error!(component = self.component, "{}", message);
    }

    fn verbose(&self, message: &str) {
        tracing::debug!(component = self.component, "{}", message);
    }
}

/// Logger that keeps every record in memory.
///
/// Handy for embedding applications that show a log pane, and for asserting
/// on logged failures in tests.
#[derive(Debug, Default)]
pub struct MemoryLogger {
    records: Mutex<Vec<(LogLevel, String)>>,
}

impl MemoryLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<(LogLevel, String)> {
        self.records.lock().clone()
    }

    /// Messages logged at exactly `level`.
    pub fn messages(&self, level: LogLevel) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }

    pub fn contains(&self, level: LogLevel, needle: &str) -> bool {
        self.records
            .lock()
            .iter()
            .any(|(l, m)| *l == level && m.contains(needle))
    }

    fn push(&self, level: LogLevel, message: &str) {
        self.records.lock().push((level, message.to_string()));
    }
}

impl Logger for MemoryLogger {
    fn info(&self, message: &str) {
        self.push(LogLevel::Info, message);
    }

    fn warn(&self, message: &str) {
        self.push(LogLevel::Warn, message);
    }

    fn error(&self, message: &str) {
        self.push(LogLevel::Error, message);
    }

    fn verbose(&self, message: &str) {
        self.push(LogLevel::Verbose, message);
    }
}
