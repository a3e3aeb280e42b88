//! Bounded ring of recent log lines for crash dumps.
//!
//! Internal and unknown errors snapshot this ring so that the surrounding
//! context survives even when the propagated message is generic.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;

/// A single captured log line
#[derive(Debug, Clone)]
pub struct LogLine {
    /// Capture timestamp
    pub timestamp: DateTime<Utc>,
    /// Log level as a string (trace/debug/info/warn/error)
    pub level: String,
    /// Message text (already redacted by the caller)
    pub message: String,
}

/// Bounded in-memory ring of recent log lines
#[derive(Debug)]
pub struct LogRing {
    lines: Mutex<VecDeque<LogLine>>,
    capacity: usize,
}

impl LogRing {
    /// Create a ring holding at most `capacity` lines
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity,
        }
    }

    /// Append a line, evicting the oldest when full
    pub fn push(&self, level: impl Into<String>, message: impl Into<String>) {
        let mut lines = self.lines.lock();
        if lines.len() >= self.capacity {
            lines.pop_front();
        }
        lines.push_back(LogLine {
            timestamp: Utc::now(),
            level: level.into(),
            message: message.into(),
        });
    }

    /// Snapshot the current contents, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<LogLine> {
        self.lines.lock().iter().cloned().collect()
    }

    /// Number of captured lines
    #[must_use]
    pub fn len(&self) -> usize {
        self.lines.lock().len()
    }

    /// Whether the ring is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lines.lock().is_empty()
    }
}

impl Default for LogRing {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ring_bounds() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push("info", format!("line {i}"));
        }
        let snapshot = ring.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].message, "line 2");
        assert_eq!(snapshot[2].message, "line 4");
    }

    #[test]
    fn test_empty_ring() {
        let ring = LogRing::default();
        assert!(ring.is_empty());
        assert!(ring.snapshot().is_empty());
    }
}
