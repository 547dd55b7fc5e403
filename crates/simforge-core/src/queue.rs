//! Deterministic event queue.
//!
//! A `BTreeMap` keyed by [`EventHandle`] gives ordered pops and O(log n)
//! removal by handle. The queue does not know the simulation clock; the
//! past-time check lives in [`Simulation::schedule`](crate::simulation::Simulation::schedule).

use std::collections::BTreeMap;

use crate::event::{Event, EventHandle};
use crate::id::EventSeq;

/// Time/priority/sequence ordered set of pending events.
#[derive(Debug, Default)]
pub struct EventQueue {
    events: BTreeMap<EventHandle, Event>,
    /// Next insertion sequence number.
    next_seq: u64,
    /// Pending events with `app_event == true`.
    app_events: usize,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an event and return its handle.
    pub fn insert(&mut self, event: Event) -> EventHandle {
        let handle = EventHandle::new(event.time, event.priority, EventSeq(self.next_seq));
        self.next_seq += 1;
        if event.app_event {
            self.app_events += 1;
        }
        self.events.insert(handle, event);
        handle
    }

    /// Remove a pending event. Returns `None` if it already ran or was removed.
    pub fn remove(&mut self, handle: &EventHandle) -> Option<Event> {
        let event = self.events.remove(handle)?;
        if event.app_event {
            self.app_events -= 1;
        }
        Some(event)
    }

    /// Pop the earliest event.
    pub fn pop_next(&mut self) -> Option<(EventHandle, Event)> {
        let (handle, event) = self.events.pop_first()?;
        if event.app_event {
            self.app_events -= 1;
        }
        Some((handle, event))
    }

    /// Peek at the handle of the earliest event.
    pub fn peek_next(&self) -> Option<&EventHandle> {
        self.events.keys().next()
    }

    pub fn contains(&self, handle: &EventHandle) -> bool {
        self.events.contains_key(handle)
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn app_event_count(&self) -> usize {
        self.app_events
    }

    pub fn utility_event_count(&self) -> usize {
        self.events.len() - self.app_events
    }

    /// Discard every pending event. Returns how many were dropped.
    pub fn clear(&mut self) -> usize {
        let dropped = self.events.len();
        self.events.clear();
        self.app_events = 0;
        dropped
    }

    /// Pop everything in dispatch order.
    pub fn drain_ordered(&mut self) -> Vec<(EventHandle, Event)> {
        let mut out = Vec::with_capacity(self.events.len());
        while let Some(entry) = self.pop_next() {
            out.push(entry);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{PRIO_HIGH, PRIO_NORMAL};

    fn labelled(time: f64, label: &str) -> Event {
        Event::new(time, |_| Ok(())).described(label)
    }

    fn labels(queue: &mut EventQueue) -> Vec<String> {
        queue
            .drain_ordered()
            .into_iter()
            .map(|(_, e)| e.description.unwrap_or_default())
            .collect()
    }

    #[test]
    fn fifo_at_same_time_and_priority() {
        let mut queue = EventQueue::new();
        queue.insert(labelled(10.0, "first"));
        queue.insert(labelled(10.0, "second"));
        queue.insert(labelled(10.0, "third"));
        assert_eq!(labels(&mut queue), ["first", "second", "third"]);
    }

    #[test]
    fn time_then_priority_ordering() {
        let mut queue = EventQueue::new();
        queue.insert(labelled(30.0, "late"));
        queue.insert(labelled(10.0, "early-normal").with_priority(PRIO_NORMAL));
        queue.insert(labelled(10.0, "early-high").with_priority(PRIO_HIGH));
        queue.insert(labelled(20.0, "mid"));
        assert_eq!(
            labels(&mut queue),
            ["early-high", "early-normal", "mid", "late"]
        );
    }

    #[test]
    fn remove_by_handle() {
        let mut queue = EventQueue::new();
        let a = queue.insert(labelled(1.0, "a"));
        let b = queue.insert(labelled(2.0, "b"));
        assert!(queue.remove(&a).is_some());
        assert!(queue.remove(&a).is_none(), "second removal is a no-op");
        assert!(queue.contains(&b));
        assert_eq!(labels(&mut queue), ["b"]);
    }

    #[test]
    fn app_event_accounting() {
        let mut queue = EventQueue::new();
        let app = queue.insert(labelled(1.0, "app"));
        queue.insert(labelled(2.0, "util").utility());
        assert_eq!(queue.app_event_count(), 1);
        assert_eq!(queue.utility_event_count(), 1);

        queue.remove(&app);
        assert_eq!(queue.app_event_count(), 0);

        let (_, event) = queue.pop_next().unwrap();
        assert!(!event.app_event);
        assert_eq!(queue.utility_event_count(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn clear_resets_counters() {
        let mut queue = EventQueue::new();
        queue.insert(labelled(1.0, "a"));
        queue.insert(labelled(1.0, "b").utility());
        assert_eq!(queue.clear(), 2);
        assert_eq!(queue.app_event_count(), 0);
        assert!(queue.peek_next().is_none());
    }

    #[test]
    fn sequence_keeps_growing_after_pops() {
        let mut queue = EventQueue::new();
        let first = queue.insert(labelled(1.0, "a"));
        queue.pop_next();
        let second = queue.insert(labelled(1.0, "b"));
        assert!(first.sequence() < second.sequence());
    }
}
