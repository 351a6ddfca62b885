//! One-shot timer service.
//!
//! A cancelable timer queue for event-driven code: callers schedule an
//! event for a deadline and get back a key they can cancel with. The
//! queue is driven externally: the owner calls [`TimerQueue::pop_due`]
//! once per event-loop iteration with the current time.

use slotmap::{new_key_type, SlotMap};
use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::Instant;

new_key_type! {
    /// Handle to a scheduled timer, used for cancellation.
    pub struct TimerKey;
}

/// A queue of cancelable one-shot timers carrying events of type `E`.
///
/// Cancellation is lazy: `cancel` removes the entry, and stale heap
/// nodes are skipped when they surface in `pop_due`.
pub struct TimerQueue<E> {
    /// Live timer entries.
    entries: SlotMap<TimerKey, TimerEntry<E>>,
    /// Deadline-ordered heap; may contain keys already canceled.
    heap: BinaryHeap<Reverse<(Instant, TimerKey)>>,
}

struct TimerEntry<E> {
    deadline: Instant,
    event: E,
}

impl<E> TimerQueue<E> {
    /// Create an empty timer queue.
    pub fn new() -> Self {
        Self {
            entries: SlotMap::with_key(),
            heap: BinaryHeap::new(),
        }
    }

    /// Schedule `event` to fire at `deadline`.
    pub fn schedule(&mut self, deadline: Instant, event: E) -> TimerKey {
        let key = self.entries.insert(TimerEntry { deadline, event });
        self.heap.push(Reverse((deadline, key)));
        key
    }

    /// Cancel a scheduled timer. Canceling an already-fired or
    /// already-canceled timer is a no-op.
    pub fn cancel(&mut self, key: TimerKey) {
        self.entries.remove(key);
    }

    /// Whether a timer is still pending.
    pub fn is_pending(&self, key: TimerKey) -> bool {
        self.entries.contains_key(key)
    }

    /// Remove and return every event whose deadline is at or before
    /// `now`, in deadline order.
    pub fn pop_due(&mut self, now: Instant) -> Vec<E> {
        let mut due = Vec::new();
        while let Some(&Reverse((deadline, key))) = self.heap.peek() {
            if deadline > now {
                break;
            }
            self.heap.pop();
            // Canceled entries are already gone from the slotmap.
            if let Some(entry) = self.entries.remove(key) {
                due.push(entry.event);
            }
        }
        due
    }

    /// The earliest pending deadline, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries.values().map(|e| e.deadline).min()
    }

    /// Number of pending timers.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no timers are pending.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<E> Default for TimerQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_fires_in_deadline_order() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(now + Duration::from_millis(20), "b");
        timers.schedule(now + Duration::from_millis(10), "a");
        timers.schedule(now + Duration::from_millis(30), "c");

        let due = timers.pop_due(now + Duration::from_millis(25));
        assert_eq!(due, vec!["a", "b"]);
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_not_due_yet() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        timers.schedule(now + Duration::from_secs(1), 1u32);
        assert!(timers.pop_due(now).is_empty());
        assert_eq!(timers.len(), 1);
    }

    #[test]
    fn test_cancel_is_idempotent() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        let key = timers.schedule(now, 7u32);
        timers.cancel(key);
        timers.cancel(key);
        assert!(timers.pop_due(now + Duration::from_secs(1)).is_empty());
        assert!(timers.is_empty());
    }

    #[test]
    fn test_next_deadline() {
        let mut timers = TimerQueue::new();
        let now = Instant::now();
        assert!(timers.next_deadline().is_none());
        let early = timers.schedule(now + Duration::from_millis(5), 0u8);
        timers.schedule(now + Duration::from_millis(50), 1u8);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(5)));
        timers.cancel(early);
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(50)));
    }
}
