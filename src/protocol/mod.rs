//! Protocol module - wire format, framing, and control messages.
//!
//! This module implements the binary protocol between a channel and a server:
//! - 10-byte header encoding/decoding
//! - Frame buffer for accumulating partial reads
//! - Frame struct with typed accessors
//! - HELLO / OPEN / TRAILER payloads
//!
//! A call is `OPEN`, then `DATA` frames from the caller (the first is the
//! command), then `DATA` frames from the server followed by one `TRAILER`.
//! `CANCEL` may be sent by the caller at any time. `WINDOW` frames return
//! stream credit in either direction (see [`flow`]).

pub mod flow;
mod frame;
mod frame_buffer;
mod messages;
mod wire_format;

pub use flow::{WindowGrant, INITIAL_WINDOW};
pub use frame::{build_frame, Frame};
pub use frame_buffer::FrameBuffer;
pub use messages::{CallHead, CommandDescriptor, Hello, Status, Trailer, PROTOCOL_VERSION};
pub use wire_format::{
    flags, kind, Header, CONTROL_CALL_ID, DEFAULT_MAX_PAYLOAD_SIZE, HEADER_SIZE,
};
