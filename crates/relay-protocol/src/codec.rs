//! Codec for encoding and decoding Relay frames.
//!
//! Frames are JSON values. JSON is self-delimiting, so the decoder accepts
//! values back to back or separated by any whitespace; the encoder terminates
//! each value with a newline.
//!
//! [`FrameCodec`] scans incoming bytes once, tracking nesting and string
//! state, and only hands a frame to `serde_json` when its closing byte has
//! arrived.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// Default maximum size of a single undecoded frame (64 KiB).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024;

/// Protocol errors that can occur during encoding/decoding.
///
/// Any of these on the read side ends the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Buffered, still incomplete frame exceeds the maximum size.
    #[error("Frame size {size} exceeds maximum {max}")]
    FrameTooLarge {
        /// Bytes buffered so far.
        size: usize,
        /// Configured maximum.
        max: usize,
    },

    /// JSON encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[source] serde_json::Error),

    /// Malformed JSON.
    #[error("Decoding error: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Encode a frame to bytes.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode<T: Serialize>(frame: &T) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(frame, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a frame into an existing buffer.
///
/// # Errors
///
/// Returns an error if serialization fails.
pub fn encode_into<T: Serialize>(frame: &T, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    serde_json::to_writer((&mut *buf).writer(), frame).map_err(ProtocolError::Encode)?;
    buf.put_u8(b'\n');
    Ok(())
}

/// Decode exactly one frame from bytes.
///
/// # Errors
///
/// Returns an error if the data is not a single valid JSON value.
pub fn decode<T: DeserializeOwned>(data: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(data).map_err(ProtocolError::Decode)
}

/// What the scanner has seen of the frame at the front of the buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
enum Shape {
    /// Only whitespace so far.
    #[default]
    Empty,
    /// An object or array.
    Nested,
    /// A top-level string.
    Str,
    /// A top-level number or literal.
    Bare,
}

/// Incremental scan state, resumed on every call.
#[derive(Debug, Clone, Copy, Default)]
struct Scan {
    /// Bytes of the buffer already examined.
    offset: usize,
    shape: Shape,
    depth: usize,
    in_string: bool,
    escaped: bool,
}

impl Scan {
    /// Continue scanning `buf`, returning the end of the first complete
    /// value once it is known.
    fn frame_end(&mut self, buf: &[u8]) -> Option<usize> {
        while self.offset < buf.len() {
            let byte = buf[self.offset];
            self.offset += 1;

            if self.in_string {
                if self.escaped {
                    self.escaped = false;
                } else if byte == b'\\' {
                    self.escaped = true;
                } else if byte == b'"' {
                    self.in_string = false;
                    if self.shape == Shape::Str {
                        return Some(self.offset);
                    }
                }
                continue;
            }

            match self.shape {
                Shape::Empty => match byte {
                    b' ' | b'\t' | b'\n' | b'\r' => {}
                    b'{' | b'[' => {
                        self.shape = Shape::Nested;
                        self.depth = 1;
                    }
                    b'"' => {
                        self.shape = Shape::Str;
                        self.in_string = true;
                    }
                    // Stray closer; let the parser report it
                    b'}' | b']' | b',' | b':' => return Some(self.offset),
                    _ => self.shape = Shape::Bare,
                },
                Shape::Nested => match byte {
                    b'"' => self.in_string = true,
                    b'{' | b'[' => self.depth += 1,
                    b'}' | b']' => {
                        self.depth -= 1;
                        if self.depth == 0 {
                            return Some(self.offset);
                        }
                    }
                    _ => {}
                },
                Shape::Bare => {
                    if matches!(
                        byte,
                        b' ' | b'\t' | b'\n' | b'\r' | b'{' | b'}' | b'[' | b']' | b'"' | b','
                    ) {
                        self.offset -= 1;
                        return Some(self.offset);
                    }
                }
                Shape::Str => {}
            }
        }
        None
    }
}

/// Codec for streaming frame encoding/decoding.
///
/// Holds the scan position of a partially received frame, so one codec
/// belongs to one read buffer.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_size: usize,
    scan: Scan,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameCodec {
    /// Create a new codec with the default frame size limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a new codec with a custom frame size limit.
    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            scan: Scan::default(),
        }
    }

    /// Get the frame size limit.
    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Encode a frame to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode<T: Serialize>(&self, frame: &T) -> Result<Bytes, ProtocolError> {
        encode(frame)
    }

    /// Try to decode a frame from a buffer, advancing it if successful.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was decoded, `Ok(None)`
    /// if more data is needed, or `Err` on protocol error. Between calls the
    /// buffer may only be appended to; bytes already scanned are not
    /// examined again.
    ///
    /// # Errors
    ///
    /// Returns an error if the buffered data is malformed or an incomplete
    /// frame grows beyond the frame size limit.
    pub fn decode_from<T: DeserializeOwned>(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<T>, ProtocolError> {
        if self.scan.offset == 0 {
            let blank = buf
                .iter()
                .take_while(|b| matches!(b, b' ' | b'\t' | b'\n' | b'\r'))
                .count();
            buf.advance(blank);
        }

        let Some(end) = self.scan.frame_end(buf) else {
            if buf.len() > self.max_frame_size {
                return Err(ProtocolError::FrameTooLarge {
                    size: buf.len(),
                    max: self.max_frame_size,
                });
            }
            return Ok(None);
        };

        self.scan = Scan::default();
        if end > self.max_frame_size {
            return Err(ProtocolError::FrameTooLarge {
                size: end,
                max: self.max_frame_size,
            });
        }

        let frame = serde_json::from_slice(&buf[..end]).map_err(ProtocolError::Decode);
        buf.advance(end);
        frame.map(Some)
    }
}
