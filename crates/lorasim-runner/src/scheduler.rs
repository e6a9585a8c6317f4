//! Priority queue of pending events with owner-checked lazy cancellation.
//!
//! Events pop in `(time, id)` order. Cancelling only records a tombstone;
//! the event is discarded when it reaches the head of the queue.

use lorasim_common::{EntityId, Event, EventId, SimError, SimTime};
use std::collections::{BTreeMap, BTreeSet, BinaryHeap};

/// Min-heap of events keyed on `(time, id)`.
#[derive(Default)]
pub struct Scheduler {
    queue: BinaryHeap<Event>,
    /// Live events and the entity that created each one.
    pending: BTreeMap<EventId, EntityId>,
    cancelled: BTreeSet<EventId>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue an event. The event's `source` owns it.
    pub fn schedule(&mut self, event: Event) -> EventId {
        let id = event.id;
        self.pending.insert(id, event.source);
        self.queue.push(event);
        id
    }

    /// Cancel a pending event on behalf of `requester`.
    ///
    /// Fails for unknown, already dispatched or already cancelled events and
    /// for events created by another entity. The queue is left untouched on
    /// failure.
    pub fn cancel(&mut self, id: EventId, requester: EntityId) -> Result<(), SimError> {
        if self.cancelled.contains(&id) {
            return Err(conflict(id, "already cancelled"));
        }
        match self.pending.get(&id) {
            None => Err(conflict(id, "not pending")),
            Some(owner) if *owner != requester => Err(conflict(
                id,
                format!("owned by {:?}, cancel requested by {:?}", owner, requester),
            )),
            Some(_) => {
                self.pending.remove(&id);
                self.cancelled.insert(id);
                Ok(())
            }
        }
    }

    /// Remove and return the earliest live event.
    pub fn pop(&mut self) -> Option<Event> {
        while let Some(event) = self.queue.pop() {
            if self.cancelled.remove(&event.id) {
                continue;
            }
            self.pending.remove(&event.id);
            return Some(event);
        }
        None
    }

    /// Time of the earliest live event.
    pub fn peek_time(&mut self) -> Option<SimTime> {
        while let Some(head) = self.queue.peek() {
            if !self.cancelled.contains(&head.id) {
                return Some(head.time);
            }
            let id = head.id;
            self.queue.pop();
            self.cancelled.remove(&id);
        }
        None
    }

    /// True while `id` is scheduled and not cancelled.
    pub fn is_pending(&self, id: EventId) -> bool {
        self.pending.contains_key(&id)
    }

    /// Number of live events.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

fn conflict(event: EventId, reason: impl Into<String>) -> SimError {
    SimError::SchedulingConflict {
        event,
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lorasim_common::EventPayload;
    use proptest::prelude::*;

    const A: EntityId = EntityId(1);
    const B: EntityId = EntityId(2);

    fn event(id: u64, time_us: u64, source: EntityId) -> Event {
        Event {
            id: EventId(id),
            time: SimTime::from_micros(time_us),
            source,
            targets: vec![source],
            payload: EventPayload::Timer { timer_id: id },
        }
    }

    fn drain(s: &mut Scheduler) -> Vec<u64> {
        std::iter::from_fn(|| s.pop()).map(|e| e.id.0).collect()
    }

    #[test]
    fn test_pops_in_time_then_id_order() {
        let mut s = Scheduler::new();
        s.schedule(event(3, 10, A));
        s.schedule(event(1, 20, A));
        s.schedule(event(2, 10, B));
        s.schedule(event(0, 30, B));
        assert_eq!(s.len(), 4);
        assert_eq!(s.peek_time(), Some(SimTime::from_micros(10)));
        assert_eq!(drain(&mut s), vec![2, 3, 1, 0]);
        assert!(s.is_empty());
    }

    #[test]
    fn test_cancel_by_owner() {
        let mut s = Scheduler::new();
        s.schedule(event(0, 10, A));
        s.schedule(event(1, 20, A));
        s.cancel(EventId(0), A).unwrap();
        assert!(!s.is_pending(EventId(0)));
        assert_eq!(s.len(), 1);
        assert_eq!(s.peek_time(), Some(SimTime::from_micros(20)));
        assert_eq!(drain(&mut s), vec![1]);
    }

    #[test]
    fn test_cancel_conflicts() {
        let mut s = Scheduler::new();
        s.schedule(event(0, 10, A));
        s.schedule(event(1, 20, A));

        // someone else's event
        assert!(matches!(s.cancel(EventId(0), B), Err(SimError::SchedulingConflict { .. })));
        assert!(s.is_pending(EventId(0)));

        // unknown
        assert!(s.cancel(EventId(42), A).is_err());

        // twice
        s.cancel(EventId(1), A).unwrap();
        assert!(matches!(
            s.cancel(EventId(1), A),
            Err(SimError::SchedulingConflict { reason, .. }) if reason == "already cancelled"
        ));

        // already dispatched
        assert_eq!(s.pop().map(|e| e.id), Some(EventId(0)));
        assert!(s.cancel(EventId(0), A).is_err());
        assert!(s.pop().is_none());
    }

    proptest! {
        #[test]
        fn test_pop_order_is_sorted(times in proptest::collection::vec(0u64..1_000, 1..64)) {
            let mut s = Scheduler::new();
            for (i, t) in times.iter().enumerate() {
                s.schedule(event(i as u64, *t, A));
            }
            let mut last = (0u64, 0u64);
            let mut first = true;
            while let Some(e) = s.pop() {
                let key = (e.time.as_micros(), e.id.0);
                prop_assert!(first || key > last);
                last = key;
                first = false;
            }
        }

        #[test]
        fn test_cancelled_events_never_pop(
            times in proptest::collection::vec(0u64..1_000, 1..64),
            mask in proptest::collection::vec(any::<bool>(), 64),
        ) {
            let mut s = Scheduler::new();
            for (i, t) in times.iter().enumerate() {
                s.schedule(event(i as u64, *t, A));
            }
            let mut kept = Vec::new();
            for i in 0..times.len() {
                if mask[i] {
                    s.cancel(EventId(i as u64), A).unwrap();
                } else {
                    kept.push(i as u64);
                }
            }
            prop_assert_eq!(s.len(), kept.len());
            let mut popped = drain(&mut s);
            popped.sort_unstable();
            prop_assert_eq!(popped, kept);
        }
    }
}
