//! Seeded event bus.
//!
//! A priority queue of scheduled events keyed by `(due_time,
//! insertion_sequence)`. The sequence number is a strict tie-break, so
//! events due at the same instant always pop in the order they were
//! scheduled, independent of the heap's internal layout.

use crate::error::KernelError;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BTreeMap, BinaryHeap};
use vei_env::LogicalTime;

/// An event waiting for delivery to a connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledEvent {
    /// Logical time at which the event becomes deliverable
    pub due_time: LogicalTime,

    /// Connector the payload is delivered to
    pub target: String,

    /// Connector-specific payload
    pub payload: Value,

    /// Monotonic insertion counter (tie-break)
    pub insertion_sequence: u64,
}

/// Handle returned by `schedule`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct EventHandle {
    pub due_time: LogicalTime,
    pub sequence: u64,
}

/// Heap entry; ordering is reversed so `BinaryHeap` pops the minimum.
#[derive(Debug)]
struct Queued(ScheduledEvent);

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Queued {}

impl Queued {
    fn key(&self) -> (LogicalTime, u64) {
        (self.0.due_time, self.0.insertion_sequence)
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of scheduled events.
#[derive(Debug, Default)]
pub struct EventBus {
    heap: BinaryHeap<Queued>,
    next_sequence: u64,
}

impl EventBus {
    /// Creates an empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules an event `delay_ms` after `now`.
    ///
    /// Fails with `InvalidArgument` for a negative delay.
    pub fn schedule(
        &mut self,
        now: LogicalTime,
        delay_ms: i64,
        target: impl Into<String>,
        payload: Value,
    ) -> Result<EventHandle, KernelError> {
        if delay_ms < 0 {
            return Err(KernelError::invalid_argument(format!(
                "delay_ms must be >= 0, got {}",
                delay_ms
            )));
        }
        let due_time = now
            .checked_add(delay_ms as u64)
            .ok_or_else(|| KernelError::invalid_argument("due time overflows"))?;
        Ok(self.schedule_at(due_time, target, payload))
    }

    /// Schedules an event at an absolute logical time.
    pub fn schedule_at(
        &mut self,
        due_time: LogicalTime,
        target: impl Into<String>,
        payload: Value,
    ) -> EventHandle {
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.heap.push(Queued(ScheduledEvent {
            due_time,
            target: target.into(),
            payload,
            insertion_sequence: sequence,
        }));
        EventHandle { due_time, sequence }
    }

    /// Pops the lowest `(due_time, sequence)` event due at or before `now`.
    pub fn pop_due(&mut self, now: LogicalTime) -> Option<ScheduledEvent> {
        match self.heap.peek() {
            Some(top) if top.0.due_time <= now => self.heap.pop().map(|q| q.0),
            _ => None,
        }
    }

    /// Pops up to `limit` due events (all due events when `limit` is `None`).
    pub fn drain(&mut self, now: LogicalTime, limit: Option<usize>) -> Vec<ScheduledEvent> {
        let mut out = Vec::new();
        while limit.map_or(true, |max| out.len() < max) {
            match self.pop_due(now) {
                Some(event) => out.push(event),
                None => break,
            }
        }
        out
    }

    /// Due time of the next event, if any.
    pub fn peek_due_time(&self) -> Option<LogicalTime> {
        self.heap.peek().map(|q| q.0.due_time)
    }

    /// Pending events per connector. Does not touch ordering.
    pub fn pending_counts(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for queued in self.heap.iter() {
            *counts.entry(queued.0.target.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Pending events in delivery order (for inspection).
    pub fn pending_events(&self) -> Vec<ScheduledEvent> {
        let mut events: Vec<ScheduledEvent> = self.heap.iter().map(|q| q.0.clone()).collect();
        events.sort_by_key(|e| (e.due_time, e.insertion_sequence));
        events
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn test_pop_due_respects_time() {
        let mut bus = EventBus::new();
        bus.schedule(0, 5_000, "mail", json!({"n": 1})).unwrap();
        assert!(bus.pop_due(4_999).is_none());
        let event = bus.pop_due(5_000).unwrap();
        assert_eq!(event.target, "mail");
        assert_eq!(event.due_time, 5_000);
        assert!(bus.is_empty());
    }

    #[test]
    fn test_negative_delay_rejected() {
        let mut bus = EventBus::new();
        let err = bus.schedule(100, -1, "slack", json!({})).unwrap_err();
        assert_eq!(err.code(), "invalid_argument");
        assert!(bus.is_empty());
    }

    #[test]
    fn test_earlier_due_pops_first() {
        let mut bus = EventBus::new();
        bus.schedule(0, 9_000, "slack", json!({"n": "late"})).unwrap();
        bus.schedule(0, 1_000, "mail", json!({"n": "early"})).unwrap();
        let first = bus.pop_due(10_000).unwrap();
        assert_eq!(first.payload["n"], "early");
    }

    #[test]
    fn test_pending_counts_do_not_mutate() {
        let mut bus = EventBus::new();
        bus.schedule(0, 10, "slack", json!({})).unwrap();
        bus.schedule(0, 10, "mail", json!({})).unwrap();
        bus.schedule(0, 20, "mail", json!({})).unwrap();
        let counts = bus.pending_counts();
        assert_eq!(counts.get("mail"), Some(&2));
        assert_eq!(counts.get("slack"), Some(&1));
        assert_eq!(bus.len(), 3);
        assert_eq!(bus.pop_due(10).unwrap().target, "slack");
    }

    #[test]
    fn test_drain_with_limit() {
        let mut bus = EventBus::new();
        for i in 0..5 {
            bus.schedule(0, 0, "mail", json!({ "i": i })).unwrap();
        }
        assert_eq!(bus.drain(0, Some(1)).len(), 1);
        assert_eq!(bus.drain(0, Some(2)).len(), 2);
        assert_eq!(bus.drain(0, None).len(), 2);
        assert!(bus.drain(0, None).is_empty());
    }

    proptest! {
        #[test]
        fn prop_equal_due_times_pop_fifo(n in 1usize..200, delay in 0i64..100_000) {
            let mut bus = EventBus::new();
            for i in 0..n {
                bus.schedule(0, delay, "slack", json!({ "i": i })).unwrap();
            }
            let delivered: Vec<u64> = bus
                .drain(delay as u64, None)
                .iter()
                .map(|e| e.payload["i"].as_u64().unwrap())
                .collect();
            let expected: Vec<u64> = (0..n as u64).collect();
            prop_assert_eq!(delivered, expected);
        }

        #[test]
        fn prop_delivery_order_is_sorted(delays in proptest::collection::vec(0i64..1_000, 1..100)) {
            let mut bus = EventBus::new();
            for (i, d) in delays.iter().enumerate() {
                bus.schedule(0, *d, "mail", json!({ "i": i })).unwrap();
            }
            let events = bus.drain(1_000, None);
            prop_assert_eq!(events.len(), delays.len());
            for pair in events.windows(2) {
                prop_assert!(
                    (pair[0].due_time, pair[0].insertion_sequence)
                        < (pair[1].due_time, pair[1].insertion_sequence)
                );
            }
        }
    }
}
