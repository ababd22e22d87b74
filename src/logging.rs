//! Logging setup and the diagnostic failure log
//!
//! Regular logging goes through `tracing`. Orchestrator failures are also
//! appended to a [`LogSink`] so the UI can offer them for diagnostics.

use chrono::{DateTime, Local};
use std::sync::{Mutex, PoisonError};
use tracing_subscriber::{fmt, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins when set; otherwise `level` applies to this crate.
/// Returns false if a subscriber was already installed.
pub fn init_logging(level: &str) -> bool {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("basedvpn={},libbasedvpn={}", level, level)));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_ansi(atty::is(atty::Stream::Stdout))
        .try_init()
        .is_ok()
}

/// One recorded failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub message: String,
}

impl LogEntry {
    pub fn render(&self) -> String {
        format!("{} : {}", self.timestamp.format("%d.%m.%Y %H:%M:%S %z"), self.message)
    }
}

/// Append-only failure log
pub trait LogSink: Send + Sync {
    fn append(&self, entry: LogEntry);

    /// All entries as text, oldest first, separated by a blank line
    fn dump(&self) -> String;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Record `message` now
    fn write(&self, message: &str) {
        self.append(LogEntry {
            timestamp: Local::now(),
            message: message.to_string(),
        });
    }
}

/// In-memory [`LogSink`]
#[derive(Default)]
pub struct MemoryLogSink {
    entries: Mutex<Vec<LogEntry>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).clear();
    }
}

impl LogSink for MemoryLogSink {
    fn append(&self, entry: LogEntry) {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).push(entry);
    }

    fn dump(&self) -> String {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(LogEntry::render)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_render_entry() {
        let entry = LogEntry {
            timestamp: Local.with_ymd_and_hms(2024, 3, 9, 14, 5, 7).unwrap(),
            message: "Start V2Ray error".to_string(),
        };
        let rendered = entry.render();
        assert!(rendered.starts_with("09.03.2024 14:05:07 "));
        assert!(rendered.ends_with(" : Start V2Ray error"));
    }

    #[test]
    fn test_sink_dump() {
        let sink = MemoryLogSink::new();
        assert!(sink.is_empty());
        assert_eq!(sink.dump(), "");

        sink.write("first");
        sink.write("second");
        assert_eq!(sink.len(), 2);

        let dump = sink.dump();
        let parts: Vec<&str> = dump.split("\n\n").collect();
        assert_eq!(parts.len(), 2);
        assert!(parts[0].ends_with(": first"));
        assert!(parts[1].ends_with(": second"));

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_init_logging_twice() {
        init_logging("debug");
        assert!(!init_logging("info"));
    }
}
