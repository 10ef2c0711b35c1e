use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::SystemTime;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// One captured line of child output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub timestamp: SystemTime,
    pub stream: StreamKind,
    pub text: String,
}

/// Selection applied by [`LogBuffer::query`]. The default selects everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogFilter {
    pub stream: Option<StreamKind>,
    /// Substring the line must contain
    pub contains: Option<String>,
    /// Only entries captured at or after this instant
    pub since: Option<SystemTime>,
    /// Keep only the newest `limit` matches
    pub limit: Option<usize>,
}

impl LogFilter {
    pub fn stream(mut self, stream: StreamKind) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn contains(mut self, needle: impl Into<String>) -> Self {
        self.contains = Some(needle.into());
        self
    }

    pub fn since(mut self, since: SystemTime) -> Self {
        self.since = Some(since);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    fn matches(&self, entry: &LogEntry) -> bool {
        self.stream.is_none_or(|stream| entry.stream == stream)
            && self.since.is_none_or(|since| entry.timestamp >= since)
            && self
                .contains
                .as_deref()
                .is_none_or(|needle| entry.text.contains(needle))
    }
}

/// Bounded ring buffer of captured child output.
///
/// Once full, each push evicts the oldest entry.
pub struct LogBuffer {
    capacity: usize,
    entries: Mutex<VecDeque<LogEntry>>,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity.min(1024))),
        }
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<LogEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, stream: StreamKind, text: impl Into<String>) {
        let entry = LogEntry {
            timestamp: SystemTime::now(),
            stream,
            text: text.into(),
        };
        let mut entries = self.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn query(&self, filter: &LogFilter) -> Vec<LogEntry> {
        let entries = self.lock();
        let mut selected: Vec<LogEntry> = entries
            .iter()
            .filter(|entry| filter.matches(entry))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            let excess = selected.len().saturating_sub(limit);
            selected.drain(..excess);
        }
        selected
    }

    /// Text of every line captured at or after `since`, oldest first
    pub fn lines_since(&self, since: SystemTime) -> Vec<String> {
        self.query(&LogFilter::default().since(since))
            .into_iter()
            .map(|entry| entry.text)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&self) {
        self.lock().clear();
    }
}
