//! Bounded in-memory log of recently dispatched messages.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Entries kept when no capacity (or zero) is given.
pub const DEFAULT_HISTORY_CAPACITY: usize = 200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryEntry {
    pub from: String,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub summary: String,
}

/// Ring of the most recent entries, oldest first. Shared by every session.
pub struct HistoryLog {
    entries: Mutex<VecDeque<HistoryEntry>>,
    capacity: usize,
}

impl HistoryLog {
    pub fn new(capacity: usize) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_HISTORY_CAPACITY
        } else {
            capacity
        };
        Self {
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Append, evicting from the front once over capacity.
    pub fn add(&self, entry: HistoryEntry) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push_back(entry);
        while entries.len() > self.capacity {
            entries.pop_front();
        }
    }

    /// The newest `limit` entries in arrival order. `0` means all of them.
    pub fn list(&self, limit: usize) -> Vec<HistoryEntry> {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let skip = if limit == 0 || limit >= entries.len() {
            0
        } else {
            entries.len() - limit
        };
        entries.iter().skip(skip).cloned().collect()
    }

    pub fn total(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl Default for HistoryLog {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}
