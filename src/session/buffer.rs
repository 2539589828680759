//! Puffer für Negotiation-Payloads, die vor dem Peer eintreffen

use crate::signaling::CallId;
use serde_json::Value;
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq)]
pub struct BufferedSignal {
    /// Call ID aus dem Event, falls vorhanden
    pub call_id: Option<CallId>,
    pub data: Value,
}

/// FIFO-Queue in Empfangsreihenfolge
#[derive(Debug, Default)]
pub struct PendingSignalBuffer {
    queue: VecDeque<BufferedSignal>,
}

impl PendingSignalBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, call_id: Option<CallId>, data: Value) {
        self.queue.push_back(BufferedSignal { call_id, data });
    }

    /// Leert den Puffer und liefert die Payloads für `call_id` in Reihenfolge
    ///
    /// Payloads mit abweichender Call ID werden verworfen; ihre Anzahl steht
    /// im zweiten Wert.
    pub fn drain_for(&mut self, call_id: &CallId) -> (Vec<Value>, usize) {
        let mut matching = Vec::with_capacity(self.queue.len());
        let mut discarded = 0;
        for signal in self.queue.drain(..) {
            match signal.call_id {
                Some(ref id) if id != call_id => discarded += 1,
                _ => matching.push(signal.data),
            }
        }
        (matching, discarded)
    }

    pub fn clear(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

// ============================================================================
// TESTS
// ============================================================================
