//! # procwire-dispatch
//!
//! Command dispatch core: execute a typed command without knowing whether
//! its handler runs in this process or on a remote handler server.
//!
//! ## Architecture
//!
//! - **Registry**: command identity to a local handler or a remote [`Channel`]
//! - **Dispatcher**: resolves the binding and runs the call, locally with no
//!   serialization or remotely over a multiplexed binary protocol
//! - **ExecutionContext**: per-call cancellation, deadline, metadata and the
//!   validation error accumulator, identical for local and remote handlers
//! - **Server**: the remote end, serving a registry over TCP or unix sockets
//!
//! Three call shapes are supported: single result ([`Command`]), server
//! streaming ([`ServerStreamCommand`]) and client streaming
//! ([`ClientStreamCommand`]).
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use procwire_dispatch::transport::Listener;
//! use procwire_dispatch::{Channel, ChannelOptions, Command, Dispatcher, Registry, Server};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Echo(String);
//!
//! impl Command for Echo {
//!     const NAME: &'static str = "echo";
//!     type Output = String;
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // Remote side
//!     let server = Server::builder()
//!         .handle_fn::<Echo, _, _>(|cmd, _ctx| async move { Ok(cmd.0) })
//!         .build()?;
//!     let listener = Listener::bind("127.0.0.1:0").await?;
//!     let address = listener.local_address();
//!     server.spawn(listener);
//!
//!     // Caller side
//!     let registry = Arc::new(Registry::new());
//!     let channel = Channel::open(address, ChannelOptions::default());
//!     registry.register_remote::<Echo>(&channel)?;
//!
//!     let dispatcher = Dispatcher::new(registry);
//!     let reply = dispatcher.execute(Echo("hi".into())).await?;
//!     assert_eq!(reply, "hi");
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod codec;
pub mod command;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod protocol;
pub mod server;
pub mod transport;
pub mod writer;

pub use channel::{BackoffPolicy, Channel, ChannelOptions, ChannelPool, TlsOptions};
pub use codec::{Codec, Compression};
pub use command::{CallShape, ClientStreamCommand, Command, ServerStreamCommand};
pub use context::{CallOptions, ErrorPayload, ExecutionContext, FieldErrors};
pub use dispatch::{ClientStreamCall, Dispatcher, ResultStream};
pub use error::{DispatchError, Result, SerializationError, TransportError};
pub use handler::{
    Binding, ChunkStream, ClientStreamHandler, CommandHandler, DuplicatePolicy, HandlerResult,
    Registry, ServerStreamHandler, StreamSink,
};
pub use server::{Server, ServerBuilder};
