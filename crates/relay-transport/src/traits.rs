//! Transport abstraction traits for Relay.
//!
//! These traits define the interface that all transport implementations must provide,
//! allowing the server to be transport-agnostic.

use async_trait::async_trait;
use bytes::Bytes;
use relay_core::ConnectionId;
use relay_protocol::{ProtocolError, ServerFrame};
use serde_json::Value;
use std::net::SocketAddr;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Connection was closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The peer closed the stream in the middle of a frame.
    #[error("Connection closed with {0} bytes of an incomplete frame")]
    TruncatedFrame(usize),

    /// Protocol error.
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A transport that can accept connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Accept a new connection.
    ///
    /// This method waits until a new connection is available or an error occurs.
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError>;

    /// Get the transport name (e.g., "tcp").
    fn name(&self) -> &'static str;

    /// Get the local address the transport is bound to.
    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }
}

/// An active connection over a transport.
///
/// Connections handle the bidirectional flow of frames between
/// the server and a single client.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Get the connection's unique identifier.
    fn id(&self) -> &ConnectionId;

    /// Receive the next decoded JSON frame.
    ///
    /// Returns `None` if the peer closed the stream cleanly. Cancel-safe:
    /// a cancelled call loses no buffered bytes.
    async fn recv(&mut self) -> Result<Option<Value>, TransportError>;

    /// Send a frame to the connection.
    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError>;

    /// Send raw bytes to the connection.
    ///
    /// This is useful for pre-encoded frames to avoid re-encoding.
    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError>;

    /// Close the connection gracefully.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get the remote address of the connection, if available.
    fn remote_addr(&self) -> Option<String> {
        None
    }

    /// Check if the connection is still open.
    fn is_open(&self) -> bool;
}
