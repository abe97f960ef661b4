//! Broker operation errors.

use thiserror::Error;

/// Errors returned by topic and broker operations.
///
/// These are reported back to the client as an error response; none of them
/// terminate the connection.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Invalid topic name.
    #[error("invalid topic name: {0}")]
    InvalidTopic(&'static str),

    /// The topic already holds its maximum number of pending messages.
    #[error("topic '{0}' queue is full")]
    QueueFull(String),

    /// Maximum number of topics reached.
    #[error("topic limit reached")]
    TopicLimitReached,

    /// The broker is shutting down or the topic has been closed.
    #[error("broker is shutting down")]
    ShuttingDown,
}
