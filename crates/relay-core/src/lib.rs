//! # relay-core
//!
//! Core types and the topic registry for the Relay message broker.
//!
//! This crate provides the fundamental building blocks:
//!
//! - **PriorityQueue** - Pending messages ordered by `(priority, sequence)`
//! - **Topic** - A queue paired with its subscribed connections
//! - **Broker** - The registry of topics and live connections
//! - **ConnectionHandle** - Outbox and state tag shared with a handler task
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐     ┌─────────────┐     ┌─────────────┐
//! │  Handler    │────▶│   Broker    │────▶│   Topic     │
//! └─────────────┘     └─────────────┘     └─────────────┘
//!        ▲                                       │
//!        │            ┌─────────────┐            │
//!        └────────────│   Outbox    │◀───────────┘
//!                     └─────────────┘
//! ```

pub mod broker;
pub mod connection;
pub mod error;
pub mod message;
pub mod queue;
pub mod topic;

pub use broker::{Broker, BrokerConfig, BrokerStats, ShutdownReport, TopicGuard};
pub use connection::{ConnectionHandle, ConnectionId, ConnectionInbox, ConnectionState};
pub use error::RelayError;
pub use message::{Delivery, Message, MessageId};
pub use queue::PriorityQueue;
pub use topic::{Published, Topic};
