//! Thread-safe FIFO for dialog events.
//!
//! `crossbeam_channel`'s bounded channel blocks the sender once full, which
//! is wrong here — a slow consumer (the dialog state machine mid-transition)
//! must never stall the capture callback's producer thread. Instead the
//! bus holds a small ring with an explicit overflow policy: a full queue
//! drops its oldest non-critical entry to make room; critical events
//! (`Event::is_critical`) are never dropped and instead evict the oldest
//! non-critical entry they find.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::events::Event;

struct Inner {
    queue: Mutex<VecDeque<Event>>,
    capacity: usize,
    not_empty: Condvar,
}

/// A cloneable handle to a shared event queue.
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                queue: Mutex::new(VecDeque::with_capacity(capacity)),
                capacity,
                not_empty: Condvar::new(),
            }),
        }
    }

    /// Push an event, applying the overflow policy if the queue is full.
    pub fn push(&self, event: Event) {
        let mut queue = self.inner.queue.lock();
        if queue.len() >= self.inner.capacity {
            if let Some(idx) = queue.iter().position(|e| !e.is_critical()) {
                queue.remove(idx);
            } else if !event.is_critical() {
                warn!("event bus full of critical events, dropping new non-critical event");
                return;
            } else {
                warn!("event bus full of critical events, dropping oldest to admit a new one");
                queue.pop_front();
            }
        }
        queue.push_back(event);
        self.inner.not_empty.notify_one();
    }

    /// Block until an event is available and return it.
    pub fn recv(&self) -> Event {
        let mut queue = self.inner.queue.lock();
        loop {
            if let Some(event) = queue.pop_front() {
                return event;
            }
            self.inner.not_empty.wait(&mut queue);
        }
    }

    /// Non-blocking pop.
    pub fn try_recv(&self) -> Option<Event> {
        self.inner.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::InputDoneReason;

    #[test]
    fn fifo_order_preserved() {
        let bus = EventBus::new(8);
        bus.push(Event::Wake);
        bus.push(Event::InputDone(InputDoneReason::Silence));
        assert!(matches!(bus.recv(), Event::Wake));
        assert!(matches!(bus.recv(), Event::InputDone(InputDoneReason::Silence)));
    }

    #[test]
    fn full_queue_drops_oldest_non_critical() {
        let bus = EventBus::new(2);
        bus.push(Event::Wake);
        bus.push(Event::InputDone(InputDoneReason::Silence));
        bus.push(Event::InputTimeout);
        assert_eq!(bus.len(), 2);
        assert!(matches!(bus.recv(), Event::InputDone(InputDoneReason::Silence)));
        assert!(matches!(bus.recv(), Event::InputTimeout));
    }

    #[test]
    fn critical_events_survive_overflow() {
        let bus = EventBus::new(1);
        bus.push(Event::Wake);
        bus.push(Event::Panic("boom".into()));
        assert_eq!(bus.len(), 1);
        assert!(matches!(bus.recv(), Event::Panic(_)));
    }
}
