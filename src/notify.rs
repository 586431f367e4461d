//! Notification interface consumed by the display layer.
//!
//! The core never formats for display; it classifies every message with a
//! [`Signal`] and hands it to a [`Notifier`]. Two notifiers are provided:
//! [`TracingNotifier`] forwards to `tracing`, and [`LogBuffer`] additionally keeps a
//! bounded history for a log panel or for test assertions.

use chrono::{DateTime, Local};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

const MAX_LOG_ENTRIES: usize = 1000;

/// Fixed vocabulary of notification classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// State transitions and progress
    Info,
    /// Recovered or surfaced failures
    Error,
    /// Diagnostic detail
    Debug,
    /// A line received from a device
    Raw,
    /// A line written to a device
    Echo,
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Signal::Info => "info",
            Signal::Error => "error",
            Signal::Debug => "debug",
            Signal::Raw => "raw",
            Signal::Echo => "echo",
        };
        f.write_str(name)
    }
}

/// Receives one call per state transition or recovered error.
pub trait Notifier: Send + Sync {
    /// Record `message` under `signal`.
    fn log(&self, signal: Signal, message: &str);
}

/// Shared notifier handle.
pub type SharedNotifier = Arc<dyn Notifier>;

fn emit(signal: Signal, message: &str) {
    match signal {
        Signal::Info => tracing::info!("{}", message),
        Signal::Error => tracing::error!("{}", message),
        Signal::Debug => tracing::debug!("{}", message),
        Signal::Raw => tracing::trace!(target: "rig_control::raw", "{}", message),
        Signal::Echo => tracing::trace!(target: "rig_control::echo", "{}", message),
    }
}

/// Notifier that only emits `tracing` events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn log(&self, signal: Signal, message: &str) {
        emit(signal, message);
    }
}

/// Represents a single notification.
#[derive(Debug, Clone)]
pub struct LogEntry {
    /// Local time the entry was recorded
    pub timestamp: DateTime<Local>,
    /// Category
    pub signal: Signal,
    /// Message text
    pub message: String,
}

/// A thread-safe, fixed-capacity notification buffer.
#[derive(Clone, Default)]
pub struct LogBuffer(Arc<Mutex<VecDeque<LogEntry>>>);

impl LogBuffer {
    /// Empty buffer.
    pub fn new() -> Self {
        Self(Arc::new(Mutex::new(VecDeque::with_capacity(
            MAX_LOG_ENTRIES,
        ))))
    }

    /// Snapshot of the buffered entries, oldest first.
    pub fn entries(&self) -> Vec<LogEntry> {
        self.0.lock().iter().cloned().collect()
    }

    /// Messages recorded under `signal`, oldest first.
    pub fn messages(&self, signal: Signal) -> Vec<String> {
        self.0
            .lock()
            .iter()
            .filter(|entry| entry.signal == signal)
            .map(|entry| entry.message.clone())
            .collect()
    }

    /// Number of entries under `signal` whose message contains `needle`.
    pub fn count_containing(&self, signal: Signal, needle: &str) -> usize {
        self.0
            .lock()
            .iter()
            .filter(|entry| entry.signal == signal && entry.message.contains(needle))
            .count()
    }

    /// Drop every entry.
    pub fn clear(&self) {
        self.0.lock().clear();
    }
}

impl Notifier for LogBuffer {
    fn log(&self, signal: Signal, message: &str) {
        emit(signal, message);

        let mut buffer = self.0.lock();
        if buffer.len() >= MAX_LOG_ENTRIES {
            buffer.pop_front();
        }
        buffer.push_back(LogEntry {
            timestamp: Local::now(),
            signal,
            message: message.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    fn test_buffer_filters_by_signal() {
        let buffer = LogBuffer::new();
        buffer.log(Signal::Info, "machine idle");
        buffer.log(Signal::Echo, "G90");
        buffer.log(Signal::Info, "machine busy");

        assert_eq!(buffer.messages(Signal::Info), vec!["machine idle", "machine busy"]);
        assert_eq!(buffer.count_containing(Signal::Echo, "G90"), 1);
        assert_eq!(buffer.entries().len(), 3);
    }

    #[test]
    fn test_buffer_is_bounded() {
        let buffer = LogBuffer::new();
        for i in 0..(MAX_LOG_ENTRIES + 5) {
            buffer.log(Signal::Raw, &format!("line {i}"));
        }
        let entries = buffer.entries();
        assert_eq!(entries.len(), MAX_LOG_ENTRIES);
        assert_eq!(entries[0].message, "line 5");
    }

    #[test]
    fn test_clones_share_storage() {
        let buffer = LogBuffer::new();
        let clone = buffer.clone();
        clone.log(Signal::Error, "port busy");
        assert_eq!(buffer.messages(Signal::Error), vec!["port busy"]);
        buffer.clear();
        assert!(clone.entries().is_empty());
    }

    #[test]
    #[traced_test]
    fn test_notifications_reach_tracing() {
        TracingNotifier.log(Signal::Info, "machine ready");
        LogBuffer::new().log(Signal::Error, "Lost connection to COM1");
        assert!(logs_contain("machine ready"));
        assert!(logs_contain("Lost connection to COM1"));
    }
}
