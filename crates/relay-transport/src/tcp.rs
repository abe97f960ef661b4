//! TCP transport implementation.
//!
//! Each connection is a raw TCP stream carrying JSON frames. Incoming frames
//! are split with the streaming decoder from `relay-protocol`.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use relay_core::ConnectionId;
use relay_protocol::{codec::DEFAULT_MAX_FRAME_SIZE, FrameCodec, ServerFrame};
use serde_json::Value;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::traits::{Connection, Transport, TransportError};

/// Minimum free space kept in the read buffer before each read.
const READ_CHUNK: usize = 4096;

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum size of a single frame in bytes.
    pub max_frame_size: usize,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 7878)),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }
}

/// TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpTransport {
    /// Create a new TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;

        info!(
            "TCP transport listening on {}",
            listener.local_addr().unwrap_or(config.bind_addr)
        );

        Ok(Self { listener, config })
    }

    /// Create a new TCP transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(TcpConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Box<dyn Connection>, TransportError> {
        let (stream, addr) = self.listener.accept().await.map_err(TransportError::Io)?;

        if let Err(e) = stream.set_nodelay(true) {
            warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
        }

        debug!("Accepted TCP connection from {}", addr);

        let conn = TcpConnection::new(stream, addr, self.config.max_frame_size);
        Ok(Box::new(conn))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        TcpTransport::local_addr(self)
    }
}

/// A TCP connection.
pub struct TcpConnection {
    id: ConnectionId,
    stream: TcpStream,
    remote_addr: SocketAddr,
    is_open: AtomicBool,
    read_buffer: BytesMut,
    codec: FrameCodec,
}

impl TcpConnection {
    /// Wrap an established stream.
    #[must_use]
    pub fn new(stream: TcpStream, remote_addr: SocketAddr, max_frame_size: usize) -> Self {
        Self {
            id: ConnectionId::generate(),
            stream,
            remote_addr,
            is_open: AtomicBool::new(true),
            read_buffer: BytesMut::with_capacity(READ_CHUNK),
            codec: FrameCodec::with_max_frame_size(max_frame_size),
        }
    }

    /// Open a client connection to a server.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection cannot be established.
    pub async fn connect(addr: SocketAddr) -> Result<Self, TransportError> {
        let stream = TcpStream::connect(addr).await.map_err(TransportError::Io)?;
        stream.set_nodelay(true).map_err(TransportError::Io)?;
        Ok(Self::new(stream, addr, DEFAULT_MAX_FRAME_SIZE))
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    async fn recv(&mut self) -> Result<Option<Value>, TransportError> {
        loop {
            if let Some(frame) = self.codec.decode_from(&mut self.read_buffer)? {
                return Ok(Some(frame));
            }

            self.read_buffer.reserve(READ_CHUNK);
            let n = match self.stream.read_buf(&mut self.read_buffer).await {
                Ok(n) => n,
                Err(e) => {
                    self.is_open.store(false, Ordering::SeqCst);
                    return Err(TransportError::Io(e));
                }
            };

            if n == 0 {
                debug!("TCP stream ended for {}", self.id);
                self.is_open.store(false, Ordering::SeqCst);

                // decode_from clears whitespace-only remainders
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                return Err(TransportError::TruncatedFrame(self.read_buffer.len()));
            }
        }
    }

    async fn send(&mut self, frame: &ServerFrame) -> Result<(), TransportError> {
        let data = self.codec.encode(frame)?;
        self.send_raw(data).await
    }

    async fn send_raw(&mut self, data: Bytes) -> Result<(), TransportError> {
        if !self.is_open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }

        if let Err(e) = self.stream.write_all(&data).await {
            self.is_open.store(false, Ordering::SeqCst);
            return Err(TransportError::Io(e));
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.is_open.swap(false, Ordering::SeqCst) {
            return Ok(()); // Already closed
        }

        match self.stream.shutdown().await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(TransportError::Io(e)),
        }
    }

    fn remote_addr(&self) -> Option<String> {
        Some(self.remote_addr.to_string())
    }

    fn is_open(&self) -> bool {
        self.is_open.load(Ordering::SeqCst)
    }
}
