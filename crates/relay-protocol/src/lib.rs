//! # relay-protocol
//!
//! Wire protocol definitions for the Relay message broker.
//!
//! Clients and the server exchange a stream of self-delimiting JSON values
//! over TCP. The server writes one value per line.
//!
//! ## Frame Types
//!
//! - `Request` - `publish`, `subscribe`, `unsubscribe`, `shutdown`,
//!   `close_connection`
//! - `Response` - `{"status":"ok"}` or `{"error":"..."}`, one per request
//! - `PushFrame` - `{"type":"message",...}`, an out-of-band delivery to a
//!   subscriber
//!
//! ## Example
//!
//! ```rust
//! use relay_protocol::{codec, Request};
//!
//! let request = Request::publish("orders", "hello", 1);
//! let encoded = codec::encode(&request).unwrap();
//! let value: serde_json::Value = codec::decode(&encoded).unwrap();
//! assert_eq!(Request::try_from(value).unwrap(), request);
//! ```

pub mod codec;
pub mod frames;

pub use codec::{decode, encode, FrameCodec, ProtocolError};
pub use frames::{
    Action, PublishMessage, PushFrame, Request, RequestError, Response, ServerFrame,
};
