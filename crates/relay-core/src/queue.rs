//! Priority queue of pending messages.
//!
//! Messages are ordered by `(priority, sequence)`: the numerically smallest
//! priority comes out first, and equal priorities come out in the order they
//! were pushed. The queue is not synchronized; callers hold the topic lock.

use crate::message::{Message, MessageId};
use std::cmp::Ordering;
use std::collections::BinaryHeap;

/// Heap entry with an inverted ordering so `BinaryHeap` behaves as a min-heap.
#[derive(Debug)]
struct Entry(Message);

impl Entry {
    fn key(&self) -> (i64, u64) {
        (self.0.priority, self.0.sequence)
    }
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Smaller (priority, sequence) ranks higher
        other.key().cmp(&self.key())
    }
}

/// A priority-ordered collection of messages for one topic.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    heap: BinaryHeap<Entry>,
    next_sequence: u64,
}

impl PriorityQueue {
    /// Create an empty queue.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty queue with room for `capacity` messages.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            next_sequence: 0,
        }
    }

    /// Enqueue a message, assigning it the next sequence number.
    ///
    /// Returns the identifier of the new message.
    pub fn push(&mut self, content: impl Into<String>, priority: i64) -> MessageId {
        let message = Message::new(content, priority, self.next_sequence);
        self.next_sequence += 1;
        let id = message.id;
        self.heap.push(Entry(message));
        id
    }

    /// Remove and return the message with the smallest `(priority, sequence)`.
    pub fn pop(&mut self) -> Option<Message> {
        self.heap.pop().map(|entry| entry.0)
    }

    /// Look at the next message without removing it.
    #[must_use]
    pub fn peek(&self) -> Option<&Message> {
        self.heap.peek().map(|entry| &entry.0)
    }

    /// Number of pending messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check if there are no pending messages.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Discard every pending message, returning how many were dropped.
    pub fn clear(&mut self) -> usize {
        let discarded = self.heap.len();
        self.heap.clear();
        discarded
    }

    /// Pop every pending message in delivery order.
    pub fn drain_ordered(&mut self) -> DrainOrdered<'_> {
        DrainOrdered { queue: self }
    }
}

/// Iterator returned by [`PriorityQueue::drain_ordered`].
#[derive(Debug)]
pub struct DrainOrdered<'a> {
    queue: &'a mut PriorityQueue,
}

impl Iterator for DrainOrdered<'_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        self.queue.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let len = self.queue.len();
        (len, Some(len))
    }
}
