//! Topic abstraction for Relay.
//!
//! A topic pairs a priority queue of pending messages with the connections
//! currently subscribed to it. Messages are pushed to subscribers as soon as
//! every subscriber has room for them; with no subscribers, or while a
//! subscriber's outbox is full, they stay buffered in priority order.

use crate::connection::{ConnectionHandle, ConnectionId, Unavailable};
use crate::error::RelayError;
use crate::message::{Delivery, Message, MessageId};
use crate::queue::PriorityQueue;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, trace, warn};

/// Default limit on pending messages per topic.
pub const DEFAULT_MAX_PENDING: usize = 1024;

/// Outcome of a successful publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Published {
    /// Identifier assigned to the message.
    pub id: MessageId,
    /// Number of subscriber deliveries made by this publish.
    pub deliveries: usize,
}

/// A named topic.
#[derive(Debug)]
pub struct Topic {
    name: Arc<str>,
    queue: PriorityQueue,
    subscribers: HashMap<ConnectionId, ConnectionHandle>,
    max_pending: usize,
    closed: bool,
}

impl Topic {
    /// Create a new topic with the default pending limit.
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self::with_limit(name, DEFAULT_MAX_PENDING)
    }

    /// Create a new topic holding at most `max_pending` undelivered messages.
    #[must_use]
    pub fn with_limit(name: &str, max_pending: usize) -> Self {
        Self {
            name: Arc::from(name),
            queue: PriorityQueue::new(),
            subscribers: HashMap::new(),
            max_pending,
            closed: false,
        }
    }

    /// Get the topic name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Number of buffered, undelivered messages.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Get the number of subscribers.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Check if a connection is subscribed.
    #[must_use]
    pub fn is_subscribed(&self, connection_id: &ConnectionId) -> bool {
        self.subscribers.contains_key(connection_id)
    }

    /// Check if the topic has been closed by a shutdown.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Enqueue a message and push it to current subscribers.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is closed or its queue is full.
    pub fn publish(
        &mut self,
        content: impl Into<String>,
        priority: i64,
    ) -> Result<Published, RelayError> {
        if self.closed {
            return Err(RelayError::ShuttingDown);
        }
        if self.queue.len() >= self.max_pending {
            warn!(topic = %self.name, pending = self.queue.len(), "Topic queue full");
            return Err(RelayError::QueueFull(self.name.to_string()));
        }

        let id = self.queue.push(content, priority);
        let deliveries = self.flush();
        trace!(topic = %self.name, %id, priority, deliveries, "Published message");

        Ok(Published { id, deliveries })
    }

    /// Subscribe a connection to this topic.
    ///
    /// Returns `true` if the connection was not already subscribed. A new
    /// subscriber receives any buffered backlog in priority order.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic is closed.
    pub fn subscribe(&mut self, handle: ConnectionHandle) -> Result<bool, RelayError> {
        if self.closed {
            return Err(RelayError::ShuttingDown);
        }
        if self.subscribers.contains_key(handle.id()) {
            return Ok(false);
        }

        debug!(topic = %self.name, connection = %handle.id(), "Connection subscribed");
        self.subscribers.insert(handle.id().clone(), handle);
        self.flush();
        Ok(true)
    }

    /// Unsubscribe a connection from this topic.
    ///
    /// Returns `true` if the connection was subscribed. Messages the
    /// connection was holding back go to the remaining subscribers.
    pub fn unsubscribe(&mut self, connection_id: &ConnectionId) -> bool {
        let removed = self.subscribers.remove(connection_id).is_some();
        if removed {
            debug!(topic = %self.name, connection = %connection_id, "Connection unsubscribed");
            self.flush();
        }
        removed
    }

    /// Remove and return the next buffered message.
    pub fn pop(&mut self) -> Option<Message> {
        self.queue.pop()
    }

    /// Detach every subscriber and discard pending messages.
    ///
    /// Returns the number of discarded messages.
    pub fn close(&mut self) -> usize {
        self.closed = true;
        self.subscribers.clear();
        let discarded = self.queue.clear();
        if discarded > 0 {
            warn!(topic = %self.name, discarded, "Discarded pending messages on close");
        }
        discarded
    }

    /// Move queued messages into subscriber outboxes.
    ///
    /// A message leaves the queue only once every subscriber has reserved a
    /// slot for it. A full outbox stalls the topic on that subscriber; the
    /// message stays queued and the subscriber's handler flushes again after
    /// draining. Subscribers that have gone away are dropped.
    ///
    /// Returns the number of deliveries made.
    pub fn flush(&mut self) -> usize {
        let mut deliveries = 0;

        while !self.queue.is_empty() && !self.subscribers.is_empty() {
            let mut slots = Vec::with_capacity(self.subscribers.len());
            let mut gone = Vec::new();
            let mut stalled = false;

            for (id, handle) in &self.subscribers {
                match handle.reserve() {
                    Ok(slot) => slots.push(slot),
                    Err(Unavailable::Full) => {
                        handle.stall(&self.name);
                        stalled = true;
                    }
                    Err(Unavailable::Disconnected) => gone.push(id.clone()),
                }
            }

            if stalled || !gone.is_empty() {
                drop(slots);
                for id in gone {
                    debug!(topic = %self.name, connection = %id, "Dropping closed subscriber");
                    self.subscribers.remove(&id);
                }
                if stalled {
                    trace!(topic = %self.name, pending = self.queue.len(), "Waiting for a full outbox");
                    break;
                }
                continue;
            }

            let Some(message) = self.queue.pop() else {
                break;
            };
            let delivery = Arc::new(Delivery::new(Arc::clone(&self.name), message));
            deliveries += slots.len();
            for slot in slots {
                slot.send(Arc::clone(&delivery));
            }
        }

        deliveries
    }
}
