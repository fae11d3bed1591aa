//! Transport module - byte streams under the protocol.
//!
//! Provides:
//! - [`Address`] parsing for TCP and Unix Domain Socket endpoints
//! - the [`Connector`] hook a channel dials through
//! - a [`Listener`] for the handler server

mod address;
mod connector;
mod listener;

pub use address::{generate_socket_path, Address};
pub use connector::{AsyncStream, BoxedStream, Connector, DefaultConnector};
pub use listener::Listener;
