//! The broker: registry of topics and live connections.
//!
//! Topics live in a sharded map; the entry guard returned by
//! [`Broker::get_or_create_topic`] is the lock for that topic's queue and
//! subscriber set. Guards are never held across an `.await`.

use crate::connection::{ConnectionHandle, ConnectionId};
use crate::error::RelayError;
use crate::message::Message;
use crate::topic::{Published, Topic, DEFAULT_MAX_PENDING};
use dashmap::mapref::entry::Entry;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Maximum topic name length.
pub const MAX_TOPIC_NAME_LENGTH: usize = 256;

/// Exclusive access to one topic.
pub type TopicGuard<'a> = RefMut<'a, String, Topic>;

/// Validate a topic name.
///
/// # Errors
///
/// Returns an error message if the topic name is invalid.
pub fn validate_topic_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("topic name cannot be empty");
    }
    if name.len() > MAX_TOPIC_NAME_LENGTH {
        return Err("topic name too long");
    }
    if name.chars().any(char::is_control) {
        return Err("topic name contains control characters");
    }
    Ok(())
}

/// Broker configuration.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Maximum number of topics.
    pub max_topics: usize,
    /// Maximum undelivered messages buffered per topic.
    pub max_pending_per_topic: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            max_topics: 10_000,
            max_pending_per_topic: DEFAULT_MAX_PENDING,
        }
    }
}

/// Broker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerStats {
    /// Number of topics.
    pub topic_count: usize,
    /// Number of registered connections.
    pub connection_count: usize,
    /// Total number of subscriptions across topics.
    pub total_subscriptions: usize,
    /// Total number of buffered messages across topics.
    pub pending_messages: usize,
}

/// What a shutdown tore down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Topics closed.
    pub topics_closed: usize,
    /// Pending messages discarded.
    pub messages_discarded: usize,
    /// Connections asked to close.
    pub connections_closed: usize,
}

/// The message broker.
///
/// Constructed once and shared by reference (usually `Arc<Broker>`) with the
/// acceptor and every connection handler.
pub struct Broker {
    topics: DashMap<String, Topic>,
    topic_count: AtomicUsize,
    connections: DashMap<ConnectionId, ConnectionHandle>,
    shutting_down: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    config: BrokerConfig,
}

impl Broker {
    /// Create a new broker with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(BrokerConfig::default())
    }

    /// Create a new broker with custom configuration.
    #[must_use]
    pub fn with_config(config: BrokerConfig) -> Self {
        info!("Creating broker with config: {:?}", config);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            topics: DashMap::new(),
            topic_count: AtomicUsize::new(0),
            connections: DashMap::new(),
            shutting_down: AtomicBool::new(false),
            shutdown_tx,
            config,
        }
    }

    /// Get the broker configuration.
    #[must_use]
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Check if [`Broker::shutdown`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Receiver that flips to `true` once shutdown begins.
    #[must_use]
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    fn ensure_running(&self) -> Result<(), RelayError> {
        if self.is_shutting_down() {
            Err(RelayError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Look up a topic, creating it if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the name is invalid, the topic limit is reached,
    /// or the broker is shutting down.
    pub fn get_or_create_topic(&self, name: &str) -> Result<TopicGuard<'_>, RelayError> {
        validate_topic_name(name).map_err(RelayError::InvalidTopic)?;
        self.ensure_running()?;

        if let Some(topic) = self.topics.get_mut(name) {
            return Ok(topic);
        }

        let mut topic = match self.topics.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_ref(),
            Entry::Vacant(entry) => {
                // Claim a slot first so racing creations cannot overshoot
                if self.topic_count.fetch_add(1, Ordering::SeqCst) >= self.config.max_topics {
                    self.topic_count.fetch_sub(1, Ordering::SeqCst);
                    warn!(topic = %name, max = self.config.max_topics, "Topic limit reached");
                    return Err(RelayError::TopicLimitReached);
                }
                debug!(topic = %name, "Creating new topic");
                entry.insert(Topic::with_limit(name, self.config.max_pending_per_topic))
            }
        };

        // Shutdown may have swept the map before this entry existed.
        if self.is_shutting_down() {
            topic.close();
            return Err(RelayError::ShuttingDown);
        }

        Ok(topic)
    }

    /// Publish a message to a topic, creating the topic if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic cannot be created or rejects the message.
    pub fn publish(
        &self,
        topic: &str,
        content: impl Into<String>,
        priority: i64,
    ) -> Result<Published, RelayError> {
        let mut topic = self.get_or_create_topic(topic)?;
        topic.publish(content, priority)
    }

    /// Subscribe a connection to a topic, creating the topic if needed.
    ///
    /// Returns `true` if the connection was newly subscribed.
    ///
    /// # Errors
    ///
    /// Returns an error if the topic cannot be created or is closed.
    pub fn subscribe(&self, topic: &str, handle: &ConnectionHandle) -> Result<bool, RelayError> {
        let mut topic = self.get_or_create_topic(topic)?;
        topic.subscribe(handle.clone())
    }

    /// Unsubscribe a connection from a topic.
    ///
    /// Unknown topics and connections that were not subscribed are a no-op.
    pub fn unsubscribe(&self, topic: &str, connection_id: &ConnectionId) -> bool {
        self.topics
            .get_mut(topic)
            .map(|mut t| t.unsubscribe(connection_id))
            .unwrap_or(false)
    }

    /// Unsubscribe a connection from all topics.
    pub fn unsubscribe_all(&self, connection_id: &ConnectionId) {
        for mut topic in self.topics.iter_mut() {
            topic.unsubscribe(connection_id);
        }
        debug!(connection = %connection_id, "Unsubscribed from all topics");
    }

    /// Push a topic's backlog to subscribers that have room again.
    ///
    /// Unknown topics are a no-op. Returns the number of deliveries made.
    pub fn flush(&self, topic: &str) -> usize {
        self.topics
            .get_mut(topic)
            .map(|mut t| t.flush())
            .unwrap_or(0)
    }

    /// Remove and return the next buffered message of a topic.
    pub fn pop(&self, topic: &str) -> Option<Message> {
        self.topics.get_mut(topic).and_then(|mut t| t.pop())
    }

    /// Track a newly accepted connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker is shutting down; the handle is then
    /// moved to `Closing`.
    pub fn register(&self, handle: ConnectionHandle) -> Result<(), RelayError> {
        if let Err(e) = self.ensure_running() {
            handle.close();
            return Err(e);
        }

        let id = handle.id().clone();
        self.connections.insert(id.clone(), handle);

        // Shutdown may have swept the registry before the insert.
        if self.is_shutting_down() {
            if let Some((_, handle)) = self.connections.remove(&id) {
                handle.close();
            }
            return Err(RelayError::ShuttingDown);
        }

        debug!(connection = %id, "Connection registered");
        Ok(())
    }

    /// Forget a connection whose handler has stopped.
    pub fn deregister(&self, connection_id: &ConnectionId) {
        if let Some((_, handle)) = self.connections.remove(connection_id) {
            handle.mark_closed();
        }
        self.unsubscribe_all(connection_id);
    }

    /// Detach a connection from every topic and ask it to close.
    ///
    /// Returns `true` if the connection was open.
    pub fn close_connection(&self, connection_id: &ConnectionId) -> bool {
        self.unsubscribe_all(connection_id);
        self.connections
            .get(connection_id)
            .map(|handle| handle.close())
            .unwrap_or(false)
    }

    /// Stop the broker.
    ///
    /// Closes every topic (dropping subscribers and pending messages), asks
    /// every known connection to close and wakes the acceptor. Returns `None`
    /// if shutdown had already started.
    pub fn shutdown(&self) -> Option<ShutdownReport> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!("Broker shutting down");

        let mut report = ShutdownReport::default();

        for mut topic in self.topics.iter_mut() {
            report.messages_discarded += topic.close();
            report.topics_closed += 1;
        }

        for handle in self.connections.iter() {
            if handle.close() {
                report.connections_closed += 1;
            }
        }

        self.shutdown_tx.send_replace(true);
        self.topics.clear();
        self.topic_count.store(0, Ordering::SeqCst);

        info!(
            topics = report.topics_closed,
            discarded = report.messages_discarded,
            connections = report.connections_closed,
            "Broker shut down"
        );
        Some(report)
    }

    /// Number of live topics.
    #[must_use]
    pub fn topic_count(&self) -> usize {
        self.topic_count.load(Ordering::SeqCst)
    }

    /// Check if a topic exists.
    #[must_use]
    pub fn topic_exists(&self, name: &str) -> bool {
        self.topics.contains_key(name)
    }

    /// Get the number of buffered messages in a topic.
    #[must_use]
    pub fn pending(&self, name: &str) -> usize {
        self.topics.get(name).map(|t| t.pending()).unwrap_or(0)
    }

    /// Get the subscriber count for a topic.
    #[must_use]
    pub fn subscriber_count(&self, name: &str) -> usize {
        self.topics
            .get(name)
            .map(|t| t.subscriber_count())
            .unwrap_or(0)
    }

    /// Get all topic names.
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        self.topics.iter().map(|e| e.key().clone()).collect()
    }

    /// Get broker statistics.
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let mut stats = BrokerStats {
            connection_count: self.connections.len(),
            ..BrokerStats::default()
        };
        for topic in self.topics.iter() {
            stats.topic_count += 1;
            stats.total_subscriptions += topic.subscriber_count();
            stats.pending_messages += topic.pending();
        }
        stats
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new()
    }
}
