//! Reassembly of frames from a byte stream.
//!
//! Socket reads split frames at arbitrary points. [`FrameBuffer`] keeps the
//! unconsumed bytes in one `BytesMut` and hands out complete frames. A header
//! is validated as soon as its 10 bytes are present, so an oversized or
//! malformed frame is rejected before its payload is buffered.
//!
//! # Example
//!
//! ```
//! use procwire_dispatch::protocol::{build_frame, FrameBuffer, Header, kind};
//!
//! let bytes = build_frame(&Header::new(kind::DATA, 0, 7, 2), b"hi");
//!
//! let mut buffer = FrameBuffer::new();
//! assert!(buffer.push(&bytes[..4]).unwrap().is_empty());
//!
//! let frames = buffer.push(&bytes[4..]).unwrap();
//! assert_eq!(frames[0].call_id(), 7);
//! ```

use bytes::{Buf, BytesMut};

use super::wire_format::{Header, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE};
use super::Frame;
use crate::error::Result;

const INITIAL_CAPACITY: usize = 64 * 1024;

/// Accumulates inbound bytes and splits them into frames.
///
/// An `Err` from [`push`](Self::push) is fatal for the connection; the
/// buffer's contents are unspecified afterwards.
pub struct FrameBuffer {
    buffer: BytesMut,
    /// Header of the frame whose payload is still arriving.
    pending: Option<Header>,
    max_payload_size: u32,
}

impl FrameBuffer {
    /// Buffer accepting payloads up to [`DEFAULT_MAX_PAYLOAD_SIZE`].
    pub fn new() -> Self {
        Self::with_max_payload(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Buffer rejecting payloads larger than `max_payload_size`.
    pub fn with_max_payload(max_payload_size: u32) -> Self {
        Self {
            buffer: BytesMut::with_capacity(INITIAL_CAPACITY),
            pending: None,
            max_payload_size,
        }
    }

    /// Append `data` and return every frame it completes, in order.
    pub fn push(&mut self, data: &[u8]) -> Result<Vec<Frame>> {
        self.buffer.extend_from_slice(data);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        let header = match self.pending.take() {
            Some(header) => header,
            None => {
                let Some(header) = Header::decode(&self.buffer) else {
                    return Ok(None);
                };
                header.validate(self.max_payload_size)?;
                self.buffer.advance(HEADER_SIZE);
                header
            }
        };

        let len = header.payload_length as usize;
        if self.buffer.len() < len {
            self.buffer.reserve(len - self.buffer.len());
            self.pending = Some(header);
            return Ok(None);
        }
        Ok(Some(Frame::new(header, self.buffer.split_to(len).freeze())))
    }

    /// Bytes buffered but not yet returned as frames.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// True when no partial frame is buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty() && self.pending.is_none()
    }

    /// Drop buffered bytes and any partially received frame.
    pub fn clear(&mut self) {
        self.buffer.clear();
        self.pending = None;
    }
}

impl Default for FrameBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for FrameBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameBuffer")
            .field("buffered", &self.buffer.len())
            .field("pending", &self.pending)
            .field("max_payload_size", &self.max_payload_size)
            .finish()
    }
}
