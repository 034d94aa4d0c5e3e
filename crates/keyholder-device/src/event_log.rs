//! Bounded in-memory event log served by `GET /log`.

use std::collections::VecDeque;

use chrono::Utc;
use keyholder_core::LogLine;

/// Lines kept before the oldest is dropped.
pub const DEFAULT_CAPACITY: usize = 200;

/// Ring of recent device events, oldest first.
#[derive(Debug, Clone)]
pub struct EventLog {
    lines: VecDeque<LogLine>,
    capacity: usize,
}

impl Default for EventLog {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl EventLog {
    /// Empty log holding at most `capacity` lines.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Append a line stamped now.
    pub fn push(&mut self, message: impl Into<String>) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(LogLine {
            at_utc: Utc::now(),
            message: message.into(),
        });
    }

    /// Copy of every line, oldest first.
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.iter().cloned().collect()
    }

    /// Number of lines held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.len()
    }

    /// Whether the log is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}
