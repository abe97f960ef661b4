//! Connection handlers for Relay server.
//!
//! This module runs the acceptor loop, the connection lifecycle and request
//! dispatch.

use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::Result;
use relay_core::connection::{self, ConnectionHandle};
use relay_core::{Broker, ConnectionId, Delivery, RelayError};
use relay_protocol::{codec, PublishMessage, PushFrame, Request, Response, ServerFrame};
use relay_transport::{Connection, TcpTransport, Transport, TransportError};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Back-off after a failed accept.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Shared server state.
pub struct AppState {
    /// The message broker.
    pub broker: Broker,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            broker: Broker::with_config(config.broker_config()),
            config,
        }
    }
}

/// What the handler does after answering a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// Why a connection handler stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CloseReason {
    PeerClosed,
    Requested,
    StateChanged,
    IdleTimeout,
    WriteTimeout,
    Malformed,
    TransportError,
}

impl CloseReason {
    fn as_str(self) -> &'static str {
        match self {
            CloseReason::PeerClosed => "peer closed",
            CloseReason::Requested => "closed by request",
            CloseReason::StateChanged => "closing",
            CloseReason::IdleTimeout => "idle timeout",
            CloseReason::WriteTimeout => "write timeout",
            CloseReason::Malformed => "malformed frame",
            CloseReason::TransportError => "transport error",
        }
    }
}

/// Run the TCP server until the broker shuts down.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let transport = TcpTransport::new(config.tcp_config()?).await?;
    let state = Arc::new(AppState::new(config));

    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C");
                signal_state.broker.shutdown();
            }
            Err(e) => error!("Failed to listen for Ctrl-C: {}", e),
        }
    });

    serve(transport, state).await
}

/// Accept connections from `transport` until the broker shuts down, then
/// wait for the connection handlers to finish.
///
/// # Errors
///
/// Currently infallible once the transport is bound.
pub async fn serve<T: Transport>(transport: T, state: Arc<AppState>) -> Result<()> {
    let mut shutdown = state.broker.shutdown_signal();
    let permits = Arc::new(Semaphore::new(state.config.limits.max_connections));
    let mut handlers = JoinSet::new();

    info!(
        transport = transport.name(),
        addr = ?transport.local_addr(),
        max_connections = state.config.limits.max_connections,
        "Relay server accepting connections"
    );

    loop {
        if *shutdown.borrow() {
            break;
        }

        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() {
                    break;
                }
            }

            accepted = transport.accept() => match accepted {
                Ok(conn) => match Arc::clone(&permits).try_acquire_owned() {
                    Ok(permit) => {
                        let state = Arc::clone(&state);
                        handlers.spawn(async move {
                            handle_connection(conn, state).await;
                            drop(permit);
                        });
                    }
                    Err(_) => {
                        warn!(
                            remote = conn.remote_addr().as_deref().unwrap_or("unknown"),
                            "Connection limit reached, rejecting connection"
                        );
                        metrics::record_rejection();
                        handlers.spawn(reject_connection(conn));
                    }
                },
                Err(e) => {
                    warn!("Failed to accept connection: {}", e);
                    metrics::record_error("accept");
                    tokio::time::sleep(ACCEPT_BACKOFF).await;
                }
            },

            Some(joined) = handlers.join_next(), if !handlers.is_empty() => log_join(joined),
        }
    }

    // Stop listening before draining
    drop(transport);
    info!(active = handlers.len(), "Acceptor stopped, waiting for connections to close");

    let grace = state.config.shutdown_grace();
    if tokio::time::timeout(grace, drain_handlers(&mut handlers))
        .await
        .is_err()
    {
        warn!(
            remaining = handlers.len(),
            "Shutdown grace period elapsed, aborting connections"
        );
        handlers.abort_all();
        drain_handlers(&mut handlers).await;
    }

    info!("Relay server stopped");
    Ok(())
}

async fn drain_handlers(handlers: &mut JoinSet<()>) {
    while let Some(joined) = handlers.join_next().await {
        log_join(joined);
    }
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("Connection handler panicked: {}", e);
        }
    }
}

/// Tell a connection over the limit why it is being dropped.
async fn reject_connection(mut conn: Box<dyn Connection>) {
    let frame = ServerFrame::Response(Response::error("connection limit reached"));
    if let Err(e) = send_frame(conn.as_mut(), &frame).await {
        debug!(connection = %conn.id(), error = %e, "Failed to send rejection");
    }
    if let Err(e) = conn.close().await {
        debug!(connection = %conn.id(), error = %e, "Failed to close rejected connection");
    }
}

/// Handle a connection from registration until it closes.
pub async fn handle_connection(mut conn: Box<dyn Connection>, state: Arc<AppState>) {
    let _metrics_guard = ConnectionMetricsGuard::new();

    let connection_id = conn.id().clone();
    let (handle, mut inbox) =
        connection::channel(connection_id.clone(), state.config.limits.outbox_capacity);

    if let Err(e) = state.broker.register(handle.clone()) {
        debug!(connection = %connection_id, error = %e, "Refusing connection");
        let frame = ServerFrame::Response(Response::error(e.to_string()));
        if let Err(e) = send_frame(conn.as_mut(), &frame).await {
            debug!(connection = %connection_id, error = %e, "Failed to send refusal");
        }
        if let Err(e) = conn.close().await {
            debug!(connection = %connection_id, error = %e, "Failed to close connection");
        }
        return;
    }

    debug!(
        connection = %connection_id,
        remote = conn.remote_addr().as_deref().unwrap_or("unknown"),
        "Connection opened"
    );

    let idle_timeout = state.config.idle_timeout();
    let write_timeout = state.config.write_timeout();

    let reason = loop {
        if !inbox.is_open() {
            break CloseReason::StateChanged;
        }

        let idle = async move {
            match idle_timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            received = conn.recv() => match received {
                Ok(Some(value)) => {
                    let start = Instant::now();
                    let (response, flow) = handle_request(value, &handle, &state);
                    metrics::record_latency(start.elapsed().as_secs_f64());

                    // A processed request is answered even if the connection
                    // started closing while it ran.
                    let frame = ServerFrame::Response(response);
                    let written = write_frame(conn.as_mut(), &frame, write_timeout).await;
                    if flow == Flow::Close {
                        break CloseReason::Requested;
                    }
                    if let Err(reason) = written {
                        break reason;
                    }
                }
                Ok(None) => break CloseReason::PeerClosed,
                Err(TransportError::Protocol(e)) => {
                    warn!(connection = %connection_id, error = %e, "Malformed frame");
                    metrics::record_error("decode");

                    let frame = ServerFrame::Response(Response::error(format!("malformed frame: {}", e)));
                    let _ = write_frame(conn.as_mut(), &frame, write_timeout).await;
                    break CloseReason::Malformed;
                }
                Err(e) => {
                    debug!(connection = %connection_id, error = %e, "Receive failed");
                    metrics::record_error("transport");
                    break CloseReason::TransportError;
                }
            },

            Some(delivery) = inbox.deliveries.recv() => {
                if !inbox.is_open() {
                    break CloseReason::StateChanged;
                }
                if let Err(reason) = write_frame(conn.as_mut(), &push_frame(&delivery), write_timeout).await {
                    break reason;
                }
                metrics::record_delivery();
            }

            // Topics held back by a full outbox resume once it has drained
            _ = handle.stalled(), if inbox.deliveries.is_empty() => {
                for topic in handle.take_stalled() {
                    let deliveries = state.broker.flush(&topic);
                    trace!(connection = %connection_id, topic = %topic, deliveries, "Flushed stalled topic");
                }
            }

            changed = inbox.state.changed() => {
                if changed.is_err() {
                    break CloseReason::StateChanged;
                }
            }

            _ = idle => {
                debug!(connection = %connection_id, "Idle timeout");
                break CloseReason::IdleTimeout;
            }
        }
    };

    if reason == CloseReason::WriteTimeout {
        warn!(connection = %connection_id, "Peer stopped reading, closing connection");
        metrics::record_eviction();
    }

    state.broker.deregister(&connection_id);
    metrics::set_active_topics(state.broker.topic_count());

    let undelivered = inbox.deliveries.len();
    if undelivered > 0 {
        debug!(connection = %connection_id, undelivered, "Discarding messages queued for a closed connection");
    }

    if let Err(e) = conn.close().await {
        debug!(connection = %connection_id, error = %e, "Failed to close connection");
    }

    debug!(connection = %connection_id, reason = reason.as_str(), "Connection closed");
}

/// Execute one decoded request against the broker.
fn handle_request(value: Value, handle: &ConnectionHandle, state: &AppState) -> (Response, Flow) {
    let connection_id = handle.id();

    let request = match Request::try_from(value) {
        Ok(request) => request,
        Err(e) => {
            debug!(connection = %connection_id, error = %e, "Invalid request");
            metrics::record_error("request");
            return (Response::error(e.to_string()), Flow::Continue);
        }
    };
    metrics::record_request(request.action().as_str());

    match request {
        Request::Publish(PublishMessage {
            topic,
            content,
            priority,
        }) => {
            let size = content.len();
            match state.broker.publish(&topic, content, priority) {
                Ok(published) => {
                    debug!(
                        connection = %connection_id,
                        topic = %topic,
                        id = %published.id,
                        priority,
                        deliveries = published.deliveries,
                        "Published"
                    );
                    metrics::record_published();
                    metrics::record_bytes(size, "published");
                    metrics::set_active_topics(state.broker.topic_count());
                    (Response::ok(), Flow::Continue)
                }
                Err(e) => operation_failed(connection_id, &topic, e),
            }
        }

        Request::Subscribe { topic } => match state.broker.subscribe(&topic, handle) {
            Ok(added) => {
                debug!(connection = %connection_id, topic = %topic, added, "Subscribe");
                metrics::set_active_topics(state.broker.topic_count());
                (Response::ok(), Flow::Continue)
            }
            Err(e) => operation_failed(connection_id, &topic, e),
        },

        Request::Unsubscribe { topic } => {
            let removed = state.broker.unsubscribe(&topic, connection_id);
            debug!(connection = %connection_id, topic = %topic, removed, "Unsubscribe");
            (Response::ok(), Flow::Continue)
        }

        Request::Shutdown => {
            info!(connection = %connection_id, "Shutdown requested");
            state.broker.shutdown();
            (Response::ok(), Flow::Close)
        }

        Request::CloseConnection => {
            state.broker.close_connection(connection_id);
            (Response::ok(), Flow::Close)
        }
    }
}

fn operation_failed(connection_id: &ConnectionId, topic: &str, e: RelayError) -> (Response, Flow) {
    warn!(connection = %connection_id, topic = %topic, error = %e, "Request failed");
    metrics::record_error(error_kind(&e));
    (Response::error(e.to_string()), Flow::Continue)
}

fn error_kind(e: &RelayError) -> &'static str {
    match e {
        RelayError::InvalidTopic(_) => "invalid_topic",
        RelayError::QueueFull(_) => "queue_full",
        RelayError::TopicLimitReached => "topic_limit",
        RelayError::ShuttingDown => "shutting_down",
    }
}

fn push_frame(delivery: &Delivery) -> ServerFrame {
    let message = &delivery.message;
    ServerFrame::Push(PushFrame::message(
        &*delivery.topic,
        message.id.to_string(),
        message.content.clone(),
        message.priority,
    ))
}

/// Write a frame, giving up once `limit` has elapsed.
async fn write_frame(
    conn: &mut dyn Connection,
    frame: &ServerFrame,
    limit: Option<Duration>,
) -> Result<(), CloseReason> {
    let written = match limit {
        Some(limit) => match tokio::time::timeout(limit, send_frame(&mut *conn, frame)).await {
            Ok(written) => written,
            Err(_) => return Err(CloseReason::WriteTimeout),
        },
        None => send_frame(&mut *conn, frame).await,
    };

    written.map_err(|e| {
        debug!(connection = %conn.id(), error = %e, "Failed to write frame");
        CloseReason::TransportError
    })
}

/// Encode and write a frame.
async fn send_frame(conn: &mut dyn Connection, frame: &ServerFrame) -> Result<(), TransportError> {
    let data = codec::encode(frame)?;
    metrics::record_bytes(data.len(), "outbound");
    conn.send_raw(data).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::{Bytes, BytesMut};
    use metrics_exporter_prometheus::PrometheusBuilder;
    use relay_transport::{TcpConfig, TcpConnection};
    use serde_json::json;
    use std::collections::{HashMap, HashSet};
    use std::net::SocketAddr;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        let mut config = Config::default();
        config.metrics.enabled = false;
        config.timeouts.shutdown_grace_ms = 1_000;
        config
    }

    async fn start(config: Config) -> (SocketAddr, Arc<AppState>, JoinHandle<Result<()>>) {
        let transport = TcpTransport::new(TcpConfig {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            max_frame_size: config.limits.max_frame_size,
        })
        .await
        .unwrap();
        let addr = transport.local_addr().unwrap();
        let state = Arc::new(AppState::new(config));
        let server = tokio::spawn(serve(transport, Arc::clone(&state)));
        (addr, state, server)
    }

    async fn connect(addr: SocketAddr) -> TcpConnection {
        TcpConnection::connect(addr).await.unwrap()
    }

    async fn send<T: serde::Serialize>(client: &mut TcpConnection, request: &T) {
        client
            .send_raw(codec::encode(request).unwrap())
            .await
            .unwrap();
    }

    async fn next_frame(client: &mut TcpConnection) -> Value {
        timeout(WAIT, client.recv())
            .await
            .expect("timed out waiting for a frame")
            .unwrap()
            .expect("connection closed")
    }

    async fn call<T: serde::Serialize>(client: &mut TcpConnection, request: &T) -> Value {
        send(client, request).await;
        next_frame(client).await
    }

    /// Read until the server closes the connection, returning any frames
    /// received on the way.
    async fn assert_closed(client: &mut TcpConnection) -> Vec<Value> {
        let mut frames = Vec::new();
        loop {
            match timeout(WAIT, client.recv())
                .await
                .expect("connection was not closed in time")
            {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) | Err(_) => return frames,
            }
        }
    }

    fn ok() -> Value {
        json!({"status": "ok"})
    }

    /// Publish `count` 32 KiB messages straight into the broker.
    fn flood(state: &AppState, topic: &str, count: usize) {
        let content = "x".repeat(32 * 1024);
        for _ in 0..count {
            state.broker.publish(topic, content.as_str(), 0).unwrap();
        }
    }

    #[tokio::test]
    async fn test_backlog_delivered_in_priority_order() {
        let (addr, state, _server) = start(test_config()).await;

        let mut publisher = connect(addr).await;
        for (content, priority) in [("low", 5), ("high", 1), ("high-2", 1), ("mid", 3)] {
            let response = call(&mut publisher, &Request::publish("jobs", content, priority)).await;
            assert_eq!(response, ok());
        }
        assert_eq!(state.broker.pending("jobs"), 4);

        let mut subscriber = connect(addr).await;
        assert_eq!(call(&mut subscriber, &Request::subscribe("jobs")).await, ok());

        let mut received = Vec::new();
        for _ in 0..4 {
            let frame = next_frame(&mut subscriber).await;
            assert_eq!(frame["type"], "message");
            assert_eq!(frame["topic"], "jobs");
            received.push(frame["content"].as_str().unwrap().to_string());
        }
        assert_eq!(received, ["high", "high-2", "mid", "low"]);
        assert_eq!(state.broker.pending("jobs"), 0);
    }

    #[tokio::test]
    async fn test_live_fan_out_to_every_subscriber() {
        let (addr, _state, _server) = start(test_config()).await;

        let mut a = connect(addr).await;
        let mut b = connect(addr).await;
        assert_eq!(call(&mut a, &Request::subscribe("news")).await, ok());
        assert_eq!(call(&mut b, &Request::subscribe("news")).await, ok());

        let mut publisher = connect(addr).await;
        assert_eq!(
            call(&mut publisher, &Request::publish("news", "extra", 2)).await,
            ok()
        );

        for subscriber in [&mut a, &mut b] {
            let frame = next_frame(subscriber).await;
            assert_eq!(frame["content"], "extra");
            assert_eq!(frame["priority"], 2);
            assert!(frame["id"].as_str().is_some());
        }
    }

    #[tokio::test]
    async fn test_subscribe_twice_delivers_once() {
        let (addr, state, _server) = start(test_config()).await;

        let mut subscriber = connect(addr).await;
        assert_eq!(call(&mut subscriber, &Request::subscribe("t")).await, ok());
        assert_eq!(call(&mut subscriber, &Request::subscribe("t")).await, ok());
        assert_eq!(state.broker.subscriber_count("t"), 1);

        let mut publisher = connect(addr).await;
        call(&mut publisher, &Request::publish("t", "one", 0)).await;
        call(&mut publisher, &Request::publish("t", "two", 0)).await;

        assert_eq!(next_frame(&mut subscriber).await["content"], "one");
        assert_eq!(next_frame(&mut subscriber).await["content"], "two");
    }

    #[tokio::test]
    async fn test_unsubscribe_unknown_topic_is_ok() {
        let (addr, state, _server) = start(test_config()).await;

        let mut client = connect(addr).await;
        assert_eq!(call(&mut client, &Request::unsubscribe("ghost")).await, ok());
        assert!(!state.broker.topic_exists("ghost"));

        assert_eq!(call(&mut client, &Request::subscribe("t")).await, ok());
        assert_eq!(call(&mut client, &Request::unsubscribe("t")).await, ok());
        assert_eq!(call(&mut client, &Request::unsubscribe("t")).await, ok());

        // No subscribers left, so the message stays buffered
        assert_eq!(call(&mut client, &Request::publish("t", "kept", 1)).await, ok());
        assert_eq!(state.broker.pending("t"), 1);
    }

    #[tokio::test]
    async fn test_invalid_requests_keep_connection_open() {
        let (addr, _state, _server) = start(test_config()).await;
        let mut client = connect(addr).await;

        let cases = [
            (json!({"action": "fly"}), "unknown action"),
            (json!({"action": "publish"}), "message is required"),
            (json!({"action": "subscribe"}), "topic is required"),
            (
                json!({"action": "publish", "message": {"topic": "t", "priority": 1}}),
                "message content is required",
            ),
            (
                json!({"action": "publish", "message": {"topic": "t", "content": "x"}}),
                "priority is required",
            ),
        ];

        for (request, expected) in cases {
            assert_eq!(call(&mut client, &request).await, json!({"error": expected}));
        }

        let response = call(&mut client, &Request::subscribe("")).await;
        assert!(response["error"].is_string());

        assert_eq!(call(&mut client, &Request::publish("t", "x", 1)).await, ok());
    }

    #[tokio::test]
    async fn test_malformed_json_closes_only_that_connection() {
        let (addr, _state, _server) = start(test_config()).await;

        let mut good = connect(addr).await;
        let mut bad = connect(addr).await;

        bad.send_raw(Bytes::from_static(b"{oops}\n")).await.unwrap();
        let frame = next_frame(&mut bad).await;
        assert!(frame["error"]
            .as_str()
            .unwrap()
            .starts_with("malformed frame"));
        assert_closed(&mut bad).await;

        assert_eq!(call(&mut good, &Request::publish("t", "fine", 1)).await, ok());
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let mut config = test_config();
        config.limits.max_frame_size = 64;
        let (addr, _state, _server) = start(config).await;

        let mut client = connect(addr).await;
        send(&mut client, &Request::publish("t", "x".repeat(200), 1)).await;

        // The reset may race the error frame, but the connection must close
        for frame in assert_closed(&mut client).await {
            assert!(frame["error"].is_string());
        }
    }

    #[tokio::test]
    async fn test_concurrent_publishers_lose_nothing() {
        let (addr, state, _server) = start(test_config()).await;

        let mut subscriber = connect(addr).await;
        assert_eq!(call(&mut subscriber, &Request::subscribe("firehose")).await, ok());

        let mut publishers = JoinSet::new();
        for p in 0..8 {
            publishers.spawn(async move {
                let mut client = TcpConnection::connect(addr).await.unwrap();
                for i in 0..25 {
                    let request = Request::publish("firehose", format!("{}-{}", p, i), i);
                    assert_eq!(call(&mut client, &request).await, ok());
                }
            });
        }
        while let Some(joined) = publishers.join_next().await {
            joined.unwrap();
        }

        let mut seen = HashSet::new();
        for _ in 0..200 {
            let frame = next_frame(&mut subscriber).await;
            assert!(seen.insert(frame["id"].as_str().unwrap().to_string()));
        }
        assert_eq!(seen.len(), 200);
        assert_eq!(state.broker.pending("firehose"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_every_connection() {
        let (addr, state, server) = start(test_config()).await;

        let mut idle = connect(addr).await;
        assert_eq!(call(&mut idle, &Request::subscribe("t")).await, ok());
        assert_eq!(call(&mut idle, &Request::publish("other", "lost", 1)).await, ok());

        let mut admin = connect(addr).await;
        assert_eq!(call(&mut admin, &Request::Shutdown).await, ok());

        assert_closed(&mut admin).await;
        assert_closed(&mut idle).await;

        timeout(WAIT, server)
            .await
            .expect("server did not stop")
            .unwrap()
            .unwrap();
        assert!(state.broker.is_shutting_down());
        assert_eq!(state.broker.stats().topic_count, 0);
        assert!(TcpConnection::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_close_connection_only_closes_caller() {
        let (addr, state, _server) = start(test_config()).await;

        let mut leaving = connect(addr).await;
        let mut staying = connect(addr).await;
        assert_eq!(call(&mut leaving, &Request::subscribe("t")).await, ok());

        assert_eq!(call(&mut leaving, &Request::CloseConnection).await, ok());
        assert_closed(&mut leaving).await;

        assert_eq!(call(&mut staying, &Request::publish("t", "m", 1)).await, ok());
        assert!(!state.broker.is_shutting_down());
        assert_eq!(state.broker.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_connection_limit_rejects_excess() {
        let mut config = test_config();
        config.limits.max_connections = 1;
        let (addr, _state, _server) = start(config).await;

        let mut first = connect(addr).await;
        assert_eq!(call(&mut first, &Request::publish("t", "m", 1)).await, ok());

        let mut second = connect(addr).await;
        assert_eq!(
            next_frame(&mut second).await,
            json!({"error": "connection limit reached"})
        );
        assert_closed(&mut second).await;

        assert_eq!(call(&mut first, &Request::publish("t", "m", 1)).await, ok());
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let mut config = test_config();
        config.timeouts.idle_timeout_ms = 100;
        let (addr, state, _server) = start(config).await;

        let mut client = connect(addr).await;
        assert_closed(&mut client).await;
        assert_eq!(state.broker.stats().connection_count, 0);
    }

    #[tokio::test]
    async fn test_disconnect_removes_subscriptions() {
        let (addr, state, _server) = start(test_config()).await;

        let mut subscriber = connect(addr).await;
        assert_eq!(call(&mut subscriber, &Request::subscribe("t")).await, ok());
        subscriber.close().await.unwrap();

        timeout(WAIT, async {
            while state.broker.subscriber_count("t") > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("subscription was not removed");

        let mut publisher = connect(addr).await;
        assert_eq!(call(&mut publisher, &Request::publish("t", "m", 1)).await, ok());
        assert_eq!(state.broker.pending("t"), 1);
    }

    #[tokio::test]
    async fn test_pipelined_subscribes_receive_every_backlog() {
        let (addr, state, _server) = start(test_config()).await;
        let max_pending = state.config.limits.max_pending_per_topic;
        let topics: Vec<String> = (0..5).map(|t| format!("backlog-{}", t)).collect();

        // Together the backlogs overflow one outbox
        for topic in &topics {
            for i in 0..max_pending {
                let priority = (max_pending - 1 - i) as i64;
                state.broker.publish(topic, format!("{}", priority), priority).unwrap();
            }
        }
        assert!(topics.len() * max_pending > state.config.limits.outbox_capacity);

        let mut subscriber = connect(addr).await;
        let mut batch = BytesMut::new();
        for topic in &topics {
            codec::encode_into(&Request::subscribe(topic.as_str()), &mut batch).unwrap();
        }
        subscriber.send_raw(batch.freeze()).await.unwrap();

        let mut responses = 0;
        let mut pushed = 0;
        let mut priorities: HashMap<String, Vec<i64>> = HashMap::new();
        while responses < topics.len() || pushed < topics.len() * max_pending {
            let frame = next_frame(&mut subscriber).await;
            if frame.get("type").is_some() {
                let topic = frame["topic"].as_str().unwrap().to_string();
                priorities
                    .entry(topic)
                    .or_default()
                    .push(frame["priority"].as_i64().unwrap());
                pushed += 1;
            } else {
                assert_eq!(frame, ok());
                responses += 1;
            }
        }

        let expected: Vec<i64> = (0..max_pending as i64).collect();
        for topic in &topics {
            assert_eq!(priorities[topic], expected, "topic {}", topic);
            assert_eq!(state.broker.pending(topic), 0);
        }
        assert_eq!(state.broker.stats().connection_count, 1);
    }

    #[tokio::test]
    async fn test_backlog_larger_than_outbox_is_answered_and_delivered() {
        let mut config = test_config();
        config.limits.outbox_capacity = 2;
        let (addr, state, _server) = start(config).await;

        for (content, priority) in [("e", 5), ("a", 1), ("d", 4), ("b", 2), ("c", 3)] {
            state.broker.publish("small", content, priority).unwrap();
        }

        let mut subscriber = connect(addr).await;
        assert_eq!(call(&mut subscriber, &Request::subscribe("small")).await, ok());

        let mut received = Vec::new();
        for _ in 0..5 {
            let frame = next_frame(&mut subscriber).await;
            received.push(frame["content"].as_str().unwrap().to_string());
        }
        assert_eq!(received, ["a", "b", "c", "d", "e"]);
        assert_eq!(state.broker.pending("small"), 0);

        // Still open for business
        assert_eq!(call(&mut subscriber, &Request::unsubscribe("small")).await, ok());
    }

    #[tokio::test]
    async fn test_close_connection_racing_shutdown() {
        for _ in 0..10 {
            let (addr, state, server) = start(test_config()).await;

            let mut leaving = connect(addr).await;
            let mut admin = connect(addr).await;
            assert_eq!(call(&mut leaving, &Request::subscribe("t")).await, ok());
            assert_eq!(call(&mut admin, &Request::subscribe("t")).await, ok());

            tokio::join!(
                send(&mut leaving, &Request::CloseConnection),
                send(&mut admin, &Request::Shutdown),
            );

            // A request overtaken by the shutdown may go unanswered
            for frames in [
                assert_closed(&mut leaving).await,
                assert_closed(&mut admin).await,
            ] {
                assert!(frames.len() <= 1);
                assert!(frames.iter().all(|frame| *frame == ok()));
            }

            timeout(WAIT, server)
                .await
                .expect("server did not stop")
                .expect("server task panicked")
                .unwrap();
            assert!(state.broker.is_shutting_down());
        }
    }

    #[tokio::test]
    async fn test_shutdown_aborts_handler_stuck_writing() {
        let mut config = test_config();
        config.timeouts.write_timeout_ms = 0;
        config.timeouts.shutdown_grace_ms = 300;
        let (addr, state, server) = start(config).await;

        // Subscribes, then never reads again
        let mut stuck = connect(addr).await;
        assert_eq!(call(&mut stuck, &Request::subscribe("big")).await, ok());

        // Far more than the socket buffers hold
        flood(&state, "big", 1024);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let start = Instant::now();
        assert!(state.broker.shutdown().is_some());
        timeout(WAIT, server)
            .await
            .expect("server did not stop after the grace period")
            .unwrap()
            .unwrap();
        assert!(start.elapsed() >= Duration::from_millis(250));
        drop(stuck);
    }

    #[tokio::test]
    async fn test_write_timeout_closes_reader_that_stopped() {
        let mut config = test_config();
        config.timeouts.write_timeout_ms = 200;
        let (addr, state, _server) = start(config).await;

        let mut stuck = connect(addr).await;
        let mut reader = connect(addr).await;
        assert_eq!(call(&mut stuck, &Request::subscribe("big")).await, ok());
        assert_eq!(call(&mut reader, &Request::subscribe("big")).await, ok());

        let reading = tokio::spawn(async move {
            for _ in 0..1024 {
                let frame = next_frame(&mut reader).await;
                assert_eq!(frame["topic"], "big");
            }
            reader
        });

        flood(&state, "big", 1024);
        let mut reader = timeout(WAIT * 4, reading)
            .await
            .expect("reader did not get every message")
            .unwrap();

        timeout(WAIT, async {
            while state.broker.subscriber_count("big") > 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("stalled reader was not closed");
        assert_eq!(state.broker.stats().connection_count, 1);

        assert_eq!(call(&mut reader, &Request::unsubscribe("big")).await, ok());
        drop(stuck);
    }

    #[test]
    fn test_topic_gauge_follows_requests() {
        let recorder = PrometheusBuilder::new().build_recorder();
        let prometheus = recorder.handle();
        let state = AppState::new(test_config());
        let (handle, _inbox) = connection::channel("c1".into(), 16);

        ::metrics::with_local_recorder(&recorder, || {
            let publish = serde_json::to_value(Request::publish("a", "m", 1)).unwrap();
            let subscribe = serde_json::to_value(Request::subscribe("b")).unwrap();
            assert!(handle_request(publish, &handle, &state).0.is_ok());
            assert!(handle_request(subscribe, &handle, &state).0.is_ok());
        });

        let rendered = prometheus.render();
        let gauge = rendered
            .lines()
            .find_map(|line| line.strip_prefix("relay_topics_active "))
            .expect("topic gauge not exported");
        assert_eq!(gauge.trim().parse::<f64>().unwrap(), 2.0);
    }
}
