//! # relay-transport
//!
//! Transport abstraction layer for the Relay message broker.
//!
//! The server only talks to the `Transport` and `Connection` traits; the
//! TCP implementation carries a stream of self-delimiting JSON frames.
//!
//! ```rust,ignore
//! use relay_transport::{Connection, Transport};
//!
//! async fn handle_connection(mut conn: Box<dyn Connection>) {
//!     while let Ok(Some(frame)) = conn.recv().await {
//!         // Process frame
//!     }
//! }
//! ```

pub mod tcp;
pub mod traits;

pub use tcp::{TcpConfig, TcpConnection, TcpTransport};
pub use traits::{Connection, Transport, TransportError};
