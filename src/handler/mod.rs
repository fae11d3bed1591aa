//! Handlers and the registry that binds them to command identities.
//!
//! Provides:
//! - [`Registry`] - command identity to local handler or remote channel
//! - [`CommandHandler`], [`ServerStreamHandler`], [`ClientStreamHandler`] -
//!   one trait per call shape, all implemented for async closures
//! - [`StreamSink`] / [`ChunkStream`] - the streaming endpoints handlers see
//!
//! # Example
//!
//! ```
//! use procwire_dispatch::{Registry, ServerStreamCommand};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Countdown(u32);
//!
//! impl ServerStreamCommand for Countdown {
//!     const NAME: &'static str = "countdown";
//!     type Item = u32;
//! }
//!
//! let registry = Registry::new();
//! registry
//!     .register_server_stream_fn::<Countdown, _, _>(|cmd, mut sink, _ctx| async move {
//!         for i in (0..cmd.0).rev() {
//!             sink.send(i).await?;
//!         }
//!         Ok(())
//!     })
//!     .unwrap();
//! ```

mod erased;
mod registry;
mod stream;
mod traits;

pub(crate) use erased::{run_guarded, run_handler, WireHandler};
pub(crate) use stream::FrameSink;
pub use registry::{Binding, DuplicatePolicy, LocalBinding, Registry, RemoteBinding};
pub use stream::{ChunkStream, StreamSink};
pub use traits::{
    ClientStreamHandler, CommandHandler, FnHandler, HandlerResult, ServerStreamHandler,
};
