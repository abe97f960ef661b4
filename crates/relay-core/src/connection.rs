//! Connection handles shared between the broker, topics and handler tasks.
//!
//! Each accepted connection is represented by two halves:
//!
//! - [`ConnectionHandle`] - cloned into the broker registry and into every
//!   topic the connection subscribes to. Used to queue deliveries and to
//!   request that the connection close.
//! - [`ConnectionInbox`] - owned by the handler task. Receives deliveries and
//!   observes state changes.
//!
//! A topic only takes a message off its queue once every subscriber has a
//! free outbox slot. A topic held back by a full outbox records itself as
//! stalled on the handle, and the handler flushes it after draining.
//!
//! The state tag is the single source of truth for whether I/O may still be
//! attempted on the connection.

use crate::message::Delivery;
use dashmap::DashSet;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::{self, error::TrySendError, Permit};
use tokio::sync::{watch, Notify};
use uuid::Uuid;

/// Unique identifier for a connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    /// Generate a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(format!("conn_{}", Uuid::new_v4().simple()))
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ConnectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ConnectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Lifecycle of a connection.
///
/// `Open -> Closing -> Closed`, or `Open -> Closed` when the peer goes away.
/// `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Requests and deliveries flow normally.
    Open,
    /// Close requested by the client or by a broker shutdown.
    Closing,
    /// The handler has stopped; no further I/O is attempted.
    Closed,
}

/// Why a connection cannot take a delivery right now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unavailable {
    /// The outbox is at capacity.
    Full,
    /// The connection is no longer open.
    Disconnected,
}

/// A reserved outbox slot.
pub type DeliverySlot<'a> = Permit<'a, Arc<Delivery>>;

/// Topics waiting for this connection's outbox to drain.
#[derive(Debug, Default)]
struct Stalls {
    topics: DashSet<Arc<str>>,
    notify: Notify,
}

/// Shared handle to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    outbox: mpsc::Sender<Arc<Delivery>>,
    state: Arc<watch::Sender<ConnectionState>>,
    stalls: Arc<Stalls>,
}

/// Handler-side half of a connection.
#[derive(Debug)]
pub struct ConnectionInbox {
    /// Deliveries queued by topics, in the order they were dispatched.
    pub deliveries: mpsc::Receiver<Arc<Delivery>>,
    /// Observes the connection state tag.
    pub state: watch::Receiver<ConnectionState>,
}

/// Create the two halves of a connection with an outbox of `capacity`
/// pending deliveries.
#[must_use]
pub fn channel(id: ConnectionId, capacity: usize) -> (ConnectionHandle, ConnectionInbox) {
    let (outbox, deliveries) = mpsc::channel(capacity.max(1));
    let (state_tx, state_rx) = watch::channel(ConnectionState::Open);

    let handle = ConnectionHandle {
        id,
        outbox,
        state: Arc::new(state_tx),
        stalls: Arc::new(Stalls::default()),
    };
    let inbox = ConnectionInbox {
        deliveries,
        state: state_rx,
    };
    (handle, inbox)
}

impl ConnectionHandle {
    /// Get the connection's unique identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Current state of the connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Reserve one outbox slot without waiting.
    ///
    /// Never blocks, so it is safe to call while holding a topic guard.
    /// Dropping the slot unused gives the capacity back.
    ///
    /// # Errors
    ///
    /// Returns [`Unavailable::Full`] if the outbox is at capacity and
    /// [`Unavailable::Disconnected`] if the connection is no longer open.
    pub fn reserve(&self) -> Result<DeliverySlot<'_>, Unavailable> {
        if !self.is_open() {
            return Err(Unavailable::Disconnected);
        }

        self.outbox.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => Unavailable::Full,
            TrySendError::Closed(()) => Unavailable::Disconnected,
        })
    }

    /// Record that `topic` is holding messages back until this outbox
    /// drains.
    pub fn stall(&self, topic: &Arc<str>) {
        self.stalls.topics.insert(Arc::clone(topic));
        self.stalls.notify.notify_one();
    }

    /// Wait until some topic has stalled on this connection.
    ///
    /// A stall recorded while nobody is waiting wakes the next call.
    pub async fn stalled(&self) {
        self.stalls.notify.notified().await;
    }

    /// Take the topics that stalled on this connection.
    pub fn take_stalled(&self) -> Vec<Arc<str>> {
        let mut topics = Vec::new();
        self.stalls.topics.retain(|topic| {
            topics.push(Arc::clone(topic));
            false
        });
        topics
    }

    /// Request that the connection close.
    ///
    /// Returns `true` if this call moved the connection from `Open` to
    /// `Closing`.
    pub fn close(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        })
    }

    /// Record that the handler has stopped.
    pub fn mark_closed(&self) {
        self.state.send_replace(ConnectionState::Closed);
    }
}

impl ConnectionInbox {
    /// Current state of the connection.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Check if the connection is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }
}
