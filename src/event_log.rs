//! Event Log - begrenzte Diagnose-Spur
//!
//! Hält die letzten Einträge (Standard: 50) in Einfügereihenfolge.
//! Ältere Einträge werden verdrängt. Beeinflusst nie den Kontrollfluss.

use chrono::Utc;
use serde::Serialize;
use std::collections::VecDeque;
use uuid::Uuid;

/// Standard-Kapazität des Logs
pub const DEFAULT_CAPACITY: usize = 50;

/// Ein Eintrag im Event Log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EventLogEntry {
    pub id: Uuid,
    pub message: String,
    pub timestamp_ms: i64,
}

#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<EventLogEntry>,
    capacity: usize,
}

impl EventLog {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Fügt einen Eintrag mit aktuellem Zeitstempel hinzu
    pub fn append(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::debug!(target: "callsession::event_log", "{}", message);

        self.entries.push_back(EventLogEntry {
            id: Uuid::new_v4(),
            message,
            timestamp_ms: Utc::now().timestamp_millis(),
        });

        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }

    /// Einträge von alt nach neu
    pub fn entries(&self) -> impl Iterator<Item = &EventLogEntry> {
        self.entries.iter()
    }

    pub fn latest(&self) -> Option<&EventLogEntry> {
        self.entries.back()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn to_vec(&self) -> Vec<EventLogEntry> {
        self.entries.iter().cloned().collect()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_keeps_order() {
        let mut log = EventLog::new();
        log.append("first");
        log.append("second");

        let messages: Vec<_> = log.entries().map(|e| e.message.as_str()).collect();
        assert_eq!(messages, vec!["first", "second"]);
        assert_eq!(log.latest().map(|e| e.message.as_str()), Some("second"));
    }

    #[test]
    fn test_never_exceeds_capacity() {
        let mut log = EventLog::new();
        for i in 0..175 {
            log.append(format!("entry {}", i));
            assert!(log.len() <= DEFAULT_CAPACITY);
        }

        assert_eq!(log.len(), DEFAULT_CAPACITY);
        // Die ältesten Einträge wurden verdrängt
        assert_eq!(
            log.entries().next().map(|e| e.message.as_str()),
            Some("entry 125")
        );
        assert_eq!(
            log.latest().map(|e| e.message.as_str()),
            Some("entry 174")
        );
    }

    #[test]
    fn test_entries_have_unique_ids_and_timestamps() {
        let mut log = EventLog::with_capacity(3);
        log.append("a");
        log.append("b");

        let entries = log.to_vec();
        assert_ne!(entries[0].id, entries[1].id);
        assert!(entries[0].timestamp_ms <= entries[1].timestamp_ms);
    }

    #[test]
    fn test_zero_capacity_is_clamped() {
        let mut log = EventLog::with_capacity(0);
        log.append("only");
        log.append("newest");
        assert_eq!(log.capacity(), 1);
        assert_eq!(log.len(), 1);
        assert_eq!(log.latest().map(|e| e.message.as_str()), Some("newest"));
    }
}
