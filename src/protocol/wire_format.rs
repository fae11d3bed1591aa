//! Frame header layout.
//!
//! ```text
//! offset  0      1       2..6      6..10
//!         kind   flags   call id   payload length   (u32 fields big-endian)
//! ```
//!
//! Call id 0 is the connection control slot and only carries HELLO.

use crate::error::{DispatchError, Result};

/// Encoded header length.
pub const HEADER_SIZE: usize = 10;

/// Payload cap applied when none is configured (64 MiB).
pub const DEFAULT_MAX_PAYLOAD_SIZE: u32 = 64 * 1024 * 1024;

/// Slot used by HELLO and nothing else.
pub const CONTROL_CALL_ID: u32 = 0;

/// Values of the kind byte.
pub mod kind {
    /// Handshake, both directions, call id 0.
    pub const HELLO: u8 = 1;
    /// Opens a call; payload is a `CallHead`.
    pub const OPEN: u8 = 2;
    /// One encoded value (command, stream item or result).
    pub const DATA: u8 = 3;
    /// Final status of a call, sent by the server.
    pub const TRAILER: u8 = 4;
    /// Caller abandons a call; empty payload.
    pub const CANCEL: u8 = 5;
    /// Grants the peer more stream items on a call; 4-byte increment.
    pub const WINDOW: u8 = 6;

    /// HELLO through WINDOW.
    #[inline]
    pub fn is_known(kind: u8) -> bool {
        (HELLO..=WINDOW).contains(&kind)
    }

    /// Human-readable name for logs.
    pub fn name(kind: u8) -> &'static str {
        match kind {
            HELLO => "HELLO",
            OPEN => "OPEN",
            DATA => "DATA",
            TRAILER => "TRAILER",
            CANCEL => "CANCEL",
            WINDOW => "WINDOW",
            _ => "UNKNOWN",
        }
    }
}

/// Bits of the flags byte.
pub mod flags {
    /// Last frame the sender will emit on this call direction.
    pub const END_STREAM: u8 = 0b0000_0001;
    /// Payload is deflated.
    pub const COMPRESSED: u8 = 0b0000_0010;

    /// Must be zero; a peer setting any of these is dropped.
    pub const RESERVED_MASK: u8 = 0b1111_1100;

    /// `flag` is set in `flags`.
    #[inline]
    pub fn has_flag(flags: u8, flag: u8) -> bool {
        flags & flag != 0
    }
}

/// The fixed-size prefix of every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    /// One of [`kind`].
    pub kind: u8,
    /// Combination of [`flags`].
    pub flags: u8,
    /// Assigned by the caller, unique on its connection.
    pub call_id: u32,
    /// Bytes following the header.
    pub payload_length: u32,
}

impl Header {
    pub fn new(kind: u8, flags: u8, call_id: u32, payload_length: u32) -> Self {
        Self {
            kind,
            flags,
            call_id,
            payload_length,
        }
    }

    /// ```
    /// use procwire_dispatch::protocol::{flags, kind, Header};
    ///
    /// let bytes = Header::new(kind::TRAILER, flags::END_STREAM, 3, 0).encode();
    /// assert_eq!(bytes, [4, 1, 0, 0, 0, 3, 0, 0, 0, 0]);
    /// ```
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        self.encode_into(&mut buf);
        buf
    }

    /// Write the header into the first [`HEADER_SIZE`] bytes of `buf`.
    pub fn encode_into(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= HEADER_SIZE);
        buf[0] = self.kind;
        buf[1] = self.flags;
        buf[2..6].copy_from_slice(&self.call_id.to_be_bytes());
        buf[6..10].copy_from_slice(&self.payload_length.to_be_bytes());
    }

    /// Read a header from the start of `buf`, or `None` while fewer than
    /// [`HEADER_SIZE`] bytes are available. No validation happens here.
    pub fn decode(buf: &[u8]) -> Option<Self> {
        if buf.len() < HEADER_SIZE {
            return None;
        }
        Some(Self {
            kind: buf[0],
            flags: buf[1],
            call_id: u32::from_be_bytes([buf[2], buf[3], buf[4], buf[5]]),
            payload_length: u32::from_be_bytes([buf[6], buf[7], buf[8], buf[9]]),
        })
    }

    /// Reject headers no conforming peer sends: unknown kinds, reserved
    /// flag bits, oversized payloads, HELLO off the control slot (or anything
    /// else on it), CANCEL with a payload and malformed WINDOW increments.
    pub fn validate(&self, max_payload_size: u32) -> Result<()> {
        if !kind::is_known(self.kind) {
            return Err(DispatchError::Protocol(format!(
                "Unknown frame kind {}",
                self.kind
            )));
        }

        if self.flags & flags::RESERVED_MASK != 0 {
            return Err(DispatchError::Protocol(
                "Reserved flag bits must be 0".to_string(),
            ));
        }

        if self.payload_length > max_payload_size {
            return Err(DispatchError::Protocol(format!(
                "Payload size {} exceeds maximum {}",
                self.payload_length, max_payload_size
            )));
        }

        let control = self.call_id == CONTROL_CALL_ID;
        if control != (self.kind == kind::HELLO) {
            return Err(DispatchError::Protocol(format!(
                "{} frame on call id {}",
                kind::name(self.kind),
                self.call_id
            )));
        }

        if self.kind == kind::CANCEL && self.payload_length != 0 {
            return Err(DispatchError::Protocol(
                "CANCEL frame must not carry a payload".to_string(),
            ));
        }

        if self.kind == kind::WINDOW && self.payload_length != 4 {
            return Err(DispatchError::Protocol(
                "WINDOW frame must carry a 4-byte increment".to_string(),
            ));
        }

        Ok(())
    }

    #[inline]
    pub fn is_end_stream(&self) -> bool {
        flags::has_flag(self.flags, flags::END_STREAM)
    }

    #[inline]
    pub fn is_compressed(&self) -> bool {
        flags::has_flag(self.flags, flags::COMPRESSED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_is_big_endian() {
        let header = Header::new(kind::DATA, flags::COMPRESSED, 0x0405_0607, 0x0809_0A0B);
        let bytes = header.encode();
        assert_eq!(bytes, [3, 2, 4, 5, 6, 7, 8, 9, 0x0A, 0x0B]);
        assert_eq!(Header::decode(&bytes), Some(header));
    }

    #[test]
    fn test_decode_waits_for_ten_bytes() {
        let bytes = Header::new(kind::OPEN, 0, 1, 20).encode();
        assert!(Header::decode(&bytes[..HEADER_SIZE - 1]).is_none());

        let mut longer = bytes.to_vec();
        longer.extend_from_slice(b"payload follows");
        assert_eq!(Header::decode(&longer).map(|h| h.payload_length), Some(20));
    }

    #[test]
    fn test_validate_unknown_kind() {
        let header = Header::new(9, 0, 1, 0);
        let err = header.validate(DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(err.to_string().contains("Unknown frame kind 9"));
    }

    #[test]
    fn test_validate_payload_too_large() {
        let header = Header::new(kind::DATA, 0, 1, 1_000_000);
        let err = header.validate(100).unwrap_err();
        assert!(err.to_string().contains("exceeds maximum"));
    }

    #[test]
    fn test_validate_reserved_bits_must_be_zero() {
        let header = Header::new(kind::DATA, 0b1000_0000, 1, 0);
        let err = header.validate(DEFAULT_MAX_PAYLOAD_SIZE).unwrap_err();
        assert!(err.to_string().contains("Reserved flag bits"));
    }

    #[test]
    fn test_validate_control_slot() {
        assert!(Header::new(kind::HELLO, 0, 0, 10)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_ok());
        assert!(Header::new(kind::HELLO, 0, 7, 10)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_err());
        assert!(Header::new(kind::DATA, 0, 0, 10)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_err());
    }

    #[test]
    fn test_validate_cancel_is_empty() {
        assert!(Header::new(kind::CANCEL, 0, 3, 0)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_ok());
        assert!(Header::new(kind::CANCEL, 0, 3, 1)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_err());
    }

    #[test]
    fn test_validate_window_increment() {
        assert!(Header::new(kind::WINDOW, 0, 3, 4)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_ok());
        assert!(Header::new(kind::WINDOW, 0, 3, 0)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_err());
        assert!(Header::new(kind::WINDOW, 0, 0, 4)
            .validate(DEFAULT_MAX_PAYLOAD_SIZE)
            .is_err());
    }

    #[test]
    fn test_flag_accessors() {
        let header = Header::new(kind::DATA, flags::END_STREAM | flags::COMPRESSED, 1, 0);
        assert!(header.is_end_stream());
        assert!(header.is_compressed());

        let plain = Header::new(kind::DATA, 0, 1, 0);
        assert!(!plain.is_end_stream());
        assert!(!plain.is_compressed());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(kind::name(kind::TRAILER), "TRAILER");
        assert_eq!(kind::name(0), "UNKNOWN");
        assert!(!kind::is_known(0));
        assert!(kind::is_known(kind::CANCEL));
        assert!(kind::is_known(kind::WINDOW));
        assert!(!kind::is_known(kind::WINDOW + 1));
    }
}
