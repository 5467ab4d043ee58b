//! Engine log sink.
//!
//! The procedural engine logs through its session callbacks. Every message
//! is forwarded to `tracing` at the matching level and also kept in a
//! bounded buffer, so a host can show "generation finished with N warnings,
//! M errors" and drain the messages into its own UI.

use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

/// Severity of an engine log message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LogLevel {
    /// Trace.
    Trace,
    /// Debug.
    Debug,
    /// Info.
    Info,
    /// Warning.
    Warning,
    /// Error.
    Error,
    /// Fatal.
    Fatal,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// One retained message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogMessage {
    /// Severity.
    pub level: LogLevel,
    /// Text.
    pub message: String,
}

/// Warning and error counts of the retained messages.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LogSummary {
    /// Messages at `Warning`.
    pub warnings: usize,
    /// Messages at `Error` or `Fatal`.
    pub errors: usize,
}

/// Bounded, thread-safe engine log.
pub struct EngineLog {
    messages: Mutex<VecDeque<LogMessage>>,
    capacity: usize,
    min_level: LogLevel,
}

impl EngineLog {
    /// Creates a log that retains up to `capacity` messages at `Info` or above.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self::with_min_level(capacity, LogLevel::Info)
    }

    /// Creates a log with an explicit retention threshold.
    #[must_use]
    pub fn with_min_level(capacity: usize, min_level: LogLevel) -> Self {
        Self {
            messages: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
            min_level,
        }
    }

    /// Forwards a message to `tracing` and retains it if it is severe enough.
    ///
    /// When full, the oldest message is dropped.
    pub fn record(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Trace => tracing::trace!(target: "lotgen::engine", "{message}"),
            LogLevel::Debug => tracing::debug!(target: "lotgen::engine", "{message}"),
            LogLevel::Info => tracing::info!(target: "lotgen::engine", "{message}"),
            LogLevel::Warning => tracing::warn!(target: "lotgen::engine", "{message}"),
            LogLevel::Error | LogLevel::Fatal => {
                tracing::error!(target: "lotgen::engine", %level, "{message}");
            }
        }

        if level < self.min_level || self.capacity == 0 {
            return;
        }
        let mut messages = self.messages.lock();
        if messages.len() >= self.capacity {
            messages.pop_front();
        }
        messages.push_back(LogMessage { level, message });
    }

    /// Takes every retained message, oldest first.
    pub fn pop_messages(&self) -> Vec<LogMessage> {
        self.messages.lock().drain(..).collect()
    }

    /// Counts warnings and errors without draining.
    pub fn summary(&self) -> LogSummary {
        let messages = self.messages.lock();
        messages.iter().fold(LogSummary::default(), |mut s, m| {
            match m.level {
                LogLevel::Warning => s.warnings += 1,
                LogLevel::Error | LogLevel::Fatal => s.errors += 1,
                _ => {}
            }
            s
        })
    }

    /// Number of retained messages.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Returns true if nothing is retained.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

impl Default for EngineLog {
    fn default() -> Self {
        Self::new(256)
    }
}

impl fmt::Debug for EngineLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineLog")
            .field("retained", &self.len())
            .field("capacity", &self.capacity)
            .field("min_level", &self.min_level)
            .finish()
    }
}
