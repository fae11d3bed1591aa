//! One decoded frame: header plus payload.
//!
//! The payload is a `Bytes` slice of the read buffer, so handing a frame to a
//! call's queue does not copy it.
//!
//! # Example
//!
//! ```
//! use procwire_dispatch::protocol::{Frame, Header, kind, flags};
//! use bytes::Bytes;
//!
//! let header = Header::new(kind::DATA, flags::END_STREAM, 42, 5);
//! let frame = Frame::new(header, Bytes::from_static(b"hello"));
//!
//! assert_eq!(frame.call_id(), 42);
//! assert!(frame.is_end_stream());
//! assert_eq!(frame.payload(), b"hello");
//! ```

use bytes::Bytes;

use super::wire_format::{kind, Header, HEADER_SIZE};

/// A frame as read from the wire.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Validated header.
    pub header: Header,
    /// `header.payload_length` bytes.
    pub payload: Bytes,
}

impl Frame {
    /// Pair a header with its payload.
    pub fn new(header: Header, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Payload as a byte slice.
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Payload size in bytes.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Frame kind (see [`kind`]).
    #[inline]
    pub fn kind(&self) -> u8 {
        self.header.kind
    }

    /// Call this frame belongs to; 0 for HELLO.
    #[inline]
    pub fn call_id(&self) -> u32 {
        self.header.call_id
    }

    /// Whether the sender's side of the call ends with this frame.
    #[inline]
    pub fn is_end_stream(&self) -> bool {
        self.header.is_end_stream()
    }

    /// Whether the payload is deflated.
    #[inline]
    pub fn is_compressed(&self) -> bool {
        self.header.is_compressed()
    }

    /// DATA frame.
    #[inline]
    pub fn is_data(&self) -> bool {
        self.header.kind == kind::DATA
    }

    /// TRAILER frame.
    #[inline]
    pub fn is_trailer(&self) -> bool {
        self.header.kind == kind::TRAILER
    }

    /// An empty DATA frame with END_STREAM marks end of input and carries no value.
    #[inline]
    pub fn is_eos_marker(&self) -> bool {
        self.is_data() && self.is_end_stream() && self.payload.is_empty()
    }
}

/// Header and payload in one contiguous buffer.
///
/// The writer task never needs this; it is for tests and tooling.
///
/// # Example
///
/// ```
/// use procwire_dispatch::protocol::{build_frame, Header, kind};
///
/// let header = Header::new(kind::DATA, 0, 42, 5);
/// let bytes = build_frame(&header, b"hello");
/// assert_eq!(bytes.len(), 10 + 5); // header + payload
/// ```
pub fn build_frame(header: &Header, payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
    buf.extend_from_slice(&header.encode());
    buf.extend_from_slice(payload);
    buf
}
