//! Bounded queue for events produced while no session is active

use proxyfarm_proto::Event;
use std::collections::VecDeque;

/// Default number of buffered events
pub const DEFAULT_OUTBOX_CAPACITY: usize = 1000;

/// FIFO buffer that drops its oldest entry when full
#[derive(Debug)]
pub struct Outbox {
    events: VecDeque<Event>,
    capacity: usize,
    dropped: u64,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity.min(64)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Queue an event. Returns the evicted event if the buffer was full.
    pub fn push(&mut self, event: Event) -> Option<Event> {
        let evicted = if self.events.len() >= self.capacity {
            self.dropped += 1;
            self.events.pop_front()
        } else {
            None
        };
        self.events.push_back(event);
        evicted
    }

    /// Take every queued event, oldest first
    pub fn drain(&mut self) -> Vec<Event> {
        self.events.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// Total events evicted since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

impl Default for Outbox {
    fn default() -> Self {
        Self::new(DEFAULT_OUTBOX_CAPACITY)
    }
}
