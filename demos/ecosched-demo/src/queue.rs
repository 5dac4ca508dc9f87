use std::cmp::Ordering;
use std::collections::BinaryHeap;

use dslab_ecosched::common::Time;

pub struct QueuedEvent<E> {
    pub id: u64,
    pub time: Time,
    pub data: E,
}

impl<E> Eq for QueuedEvent<E> {}

impl<E> PartialEq for QueuedEvent<E> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<E> Ord for QueuedEvent<E> {
    fn cmp(&self, other: &Self) -> Ordering {
        other.time.total_cmp(&self.time).then_with(|| other.id.cmp(&self.id))
    }
}

impl<E> PartialOrd for QueuedEvent<E> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Time-ordered event queue, events with equal time are popped in insertion order.
pub struct EventQueue<E> {
    events: BinaryHeap<QueuedEvent<E>>,
    next_id: u64,
}

impl<E> EventQueue<E> {
    pub fn new() -> Self {
        Self {
            events: BinaryHeap::new(),
            next_id: 0,
        }
    }

    pub fn push(&mut self, time: Time, data: E) {
        self.events.push(QueuedEvent {
            id: self.next_id,
            time,
            data,
        });
        self.next_id += 1;
    }

    pub fn pop(&mut self) -> Option<QueuedEvent<E>> {
        self.events.pop()
    }
}
