//! Console and page-error collection

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum EventKind {
    Console { level: String },
    PageError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
    pub text: String,
}

impl fmt::Display for LogEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let stamp = self.at.format("%H:%M:%S%.3f");
        match &self.kind {
            EventKind::Console { level } => write!(f, "{} [console.{}] {}", stamp, level, self.text),
            EventKind::PageError => write!(f, "{} [pageerror] {}", stamp, self.text),
        }
    }
}

/// Append-only, ordered log shared between a session's event pumps and the
/// runner. Cloning shares the underlying buffer.
#[derive(Debug, Clone, Default)]
pub struct EventLog {
    entries: Arc<Mutex<Vec<LogEntry>>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn console(&self, level: impl Into<String>, text: impl Into<String>) {
        let kind = EventKind::Console {
            level: level.into(),
        };
        self.push(kind, text.into());
    }

    pub fn page_error(&self, text: impl Into<String>) {
        self.push(EventKind::PageError, text.into());
    }

    fn push(&self, kind: EventKind, text: String) {
        self.entries.lock().push(LogEntry {
            at: Utc::now(),
            kind,
            text,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<LogEntry> {
        self.entries.lock().clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries.lock().iter().map(ToString::to_string).collect()
    }

    pub fn error_count(&self) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| match &e.kind {
                EventKind::PageError => true,
                EventKind::Console { level } => level == "error",
            })
            .count()
    }
}
