//! Reconfiguration events.
//!
//! An [`Event`] is a named command (`action` plus JSON params) delivered to
//! one filter. Events become eligible `delay` after they were issued and
//! are drained strictly between processing iterations, earliest-eligible
//! first, so a filter never observes a reconfiguration mid-frame.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;

/// A time-stamped named command with parameters.
#[derive(Debug, Clone)]
pub struct Event {
    action: String,
    params: Value,
    timestamp: Instant,
    delay: Duration,
}

impl Event {
    /// An immediately eligible event.
    #[must_use]
    pub fn new(action: impl Into<String>, params: Value) -> Self {
        Self {
            action: action.into(),
            params,
            timestamp: Instant::now(),
            delay: Duration::ZERO,
        }
    }

    /// An event eligible `delay` after now.
    #[must_use]
    pub fn with_delay(action: impl Into<String>, params: Value, delay: Duration) -> Self {
        Self {
            action: action.into(),
            params,
            timestamp: Instant::now(),
            delay,
        }
    }

    /// Parses the wire shape `{"action": ..., "params": ..., "delay_ms": ...}`.
    /// Returns `None` when `action` is missing or empty.
    #[must_use]
    pub fn from_json(value: &Value) -> Option<Self> {
        let action = value.get("action")?.as_str()?;
        if action.is_empty() {
            return None;
        }
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        let delay = Duration::from_millis(
            value
                .get("delay_ms")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );
        Some(Self::with_delay(action, params, delay))
    }

    #[must_use]
    pub fn action(&self) -> &str {
        &self.action
    }

    #[must_use]
    pub fn params(&self) -> &Value {
        &self.params
    }

    /// True once `now - timestamp > delay`.
    #[must_use]
    pub fn can_be_executed(&self, now: Instant) -> bool {
        now.duration_since(self.timestamp) > self.delay
    }

    fn eligible_at(&self) -> Instant {
        self.timestamp + self.delay
    }
}

// Ordered so the binary heap pops the earliest-eligible event first.
impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.eligible_at() == other.eligible_at()
    }
}

impl Eq for Event {}

impl PartialOrd for Event {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Event {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.eligible_at().cmp(&self.eligible_at())
    }
}

/// Min-priority queue of events keyed by earliest-eligible time.
///
/// Internally synchronized: pushes may come from any thread while the
/// owning filter drains between iterations.
pub struct EventQueue {
    heap: Mutex<BinaryHeap<Event>>,
}

impl EventQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            heap: Mutex::new(BinaryHeap::new()),
        }
    }

    pub fn push(&self, event: Event) {
        self.heap.lock().push(event);
    }

    /// Pops the top event if it is eligible at `now`.
    pub fn pop_ready(&self, now: Instant) -> Option<Event> {
        let mut heap = self.heap.lock();
        if heap.peek().is_some_and(|e| e.can_be_executed(now)) {
            heap.pop()
        } else {
            None
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.lock().is_empty()
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}
