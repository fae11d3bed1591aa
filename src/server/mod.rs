//! Handler server: the remote end of a [`Channel`](crate::Channel).
//!
//! The [`ServerBuilder`] registers handlers with the same API as the
//! [`Registry`] and configures limits. The [`Server`] then:
//! 1. Accepts connections from a [`Listener`] (or serves a pre-connected stream)
//! 2. Answers each client's HELLO with its command list
//! 3. Runs every call on its own task, at most `max_concurrent_calls` at once
//! 4. Stops accepting and cancels running calls on shutdown
//!
//! # Example
//!
//! ```no_run
//! use procwire_dispatch::transport::Listener;
//! use procwire_dispatch::{Command, Server};
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
//!     let server = Server::builder()
//!         .handle_fn::<Echo, _, _>(|cmd, _ctx| async move { Ok(cmd.0) })
//!         .max_concurrent_calls(64)
//!         .build()?;
//!
//!     server.serve(Listener::bind("127.0.0.1:7400").await?).await?;
//!     Ok(())
//! }
//! ```

mod call;
mod connection;

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Codec, Compression};
use crate::command::{ClientStreamCommand, Command, ServerStreamCommand};
use crate::context::ExecutionContext;
use crate::error::{DispatchError, Result};
use crate::handler::{
    ChunkStream, ClientStreamHandler, CommandHandler, HandlerResult, Registry, ServerStreamHandler,
    StreamSink,
};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;
use crate::transport::{AsyncStream, Listener};
use crate::writer::WriterConfig;

pub(crate) use call::ServerCall;

/// Default maximum number of calls running at once.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

/// State shared by every connection of a server.
pub(crate) struct Shared {
    pub(crate) registry: Arc<Registry>,
    pub(crate) writer_config: WriterConfig,
    pub(crate) codec: Codec,
    pub(crate) max_payload_size: u32,
    pub(crate) semaphore: Arc<Semaphore>,
}

/// Builder for a [`Server`].
///
/// Registration errors (a duplicate under `DuplicatePolicy::Reject`) are
/// kept and reported by [`build`](Self::build).
pub struct ServerBuilder {
    registry: Arc<Registry>,
    writer_config: WriterConfig,
    compression: Compression,
    max_concurrent_calls: usize,
    max_payload_size: u32,
    error: Option<DispatchError>,
}

impl ServerBuilder {
    /// Create a builder with an empty registry.
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Registry::new()),
            writer_config: WriterConfig::default(),
            compression: Compression::default(),
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            error: None,
        }
    }

    /// Serve the local bindings of an existing registry.
    ///
    /// Handlers registered on the builder afterwards go into this registry.
    pub fn registry(mut self, registry: Arc<Registry>) -> Self {
        self.registry = registry;
        self
    }

    fn record(mut self, result: Result<()>) -> Self {
        if let Err(e) = result {
            self.error.get_or_insert(e);
        }
        self
    }

    /// Register a handler for a single-result command.
    pub fn handle<C, H>(self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let result = self.registry.register_local::<C, H>(handler);
        self.record(result)
    }

    /// Register an async closure for a single-result command.
    pub fn handle_fn<C, F, Fut>(self, f: F) -> Self
    where
        C: Command,
        F: Fn(C, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<C::Output>> + Send + 'static,
    {
        let result = self.registry.register_fn::<C, F, Fut>(f);
        self.record(result)
    }

    /// Register a server-streaming handler.
    pub fn handle_server_stream<C, H>(self, handler: H) -> Self
    where
        C: ServerStreamCommand,
        H: ServerStreamHandler<C>,
    {
        let result = self.registry.register_server_stream::<C, H>(handler);
        self.record(result)
    }

    /// Register an async closure producing a stream.
    pub fn handle_server_stream_fn<C, F, Fut>(self, f: F) -> Self
    where
        C: ServerStreamCommand,
        F: Fn(C, StreamSink<C::Item>, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        let result = self.registry.register_server_stream_fn::<C, F, Fut>(f);
        self.record(result)
    }

    /// Register a client-streaming handler.
    pub fn handle_client_stream<C, H>(self, handler: H) -> Self
    where
        C: ClientStreamCommand,
        H: ClientStreamHandler<C>,
    {
        let result = self.registry.register_client_stream::<C, H>(handler);
        self.record(result)
    }

    /// Register an async closure consuming a stream.
    pub fn handle_client_stream_fn<C, F, Fut>(self, f: F) -> Self
    where
        C: ClientStreamCommand,
        F: Fn(C, ChunkStream<C::Item>, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<C::Output>> + Send + 'static,
    {
        let result = self.registry.register_client_stream_fn::<C, F, Fut>(f);
        self.record(result)
    }

    /// Set the maximum number of calls running at once.
    ///
    /// Further calls wait for a free slot.
    pub fn max_concurrent_calls(mut self, limit: usize) -> Self {
        self.max_concurrent_calls = limit;
        self
    }

    /// Set the writer configuration used for every connection.
    pub fn writer_config(mut self, config: WriterConfig) -> Self {
        self.writer_config = config;
        self
    }

    /// Set the compression applied to results and stream items.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the largest accepted frame payload.
    pub fn max_payload_size(mut self, limit: u32) -> Self {
        self.max_payload_size = limit;
        self
    }

    /// Finish configuration.
    pub fn build(self) -> Result<Server> {
        if let Some(e) = self.error {
            return Err(e);
        }
        let codec =
            Codec::new(self.compression).with_max_decoded_size(self.max_payload_size as usize);
        Ok(Server {
            shared: Arc::new(Shared {
                registry: self.registry,
                writer_config: self.writer_config,
                codec,
                max_payload_size: self.max_payload_size,
                semaphore: Arc::new(Semaphore::new(self.max_concurrent_calls)),
            }),
            shutdown: CancellationToken::new(),
        })
    }
}

impl Default for ServerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// A running or ready-to-run handler server.
///
/// Cheap to clone; clones share handlers, limits and the shutdown signal.
#[derive(Clone)]
pub struct Server {
    shared: Arc<Shared>,
    shutdown: CancellationToken,
}

impl Server {
    /// Create a new server builder.
    pub fn builder() -> ServerBuilder {
        ServerBuilder::new()
    }

    /// Registry the server executes against.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.shared.registry
    }

    /// Accept connections until [`shutdown`](Self::shutdown) is called.
    pub async fn serve(&self, listener: Listener) -> Result<()> {
        debug!(address = %listener.local_address(), "handler server listening");
        loop {
            let stream = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(error = %e, "accept failed");
                        continue;
                    }
                },
            };

            let server = self.clone();
            tokio::spawn(async move {
                if let Err(e) = server.serve_connection(stream).await {
                    debug!(error = %e, "connection ended with error");
                }
            });
        }
        debug!("handler server stopped accepting");
        Ok(())
    }

    /// Run [`serve`](Self::serve) on a background task.
    pub fn spawn(&self, listener: Listener) -> JoinHandle<Result<()>> {
        let server = self.clone();
        tokio::spawn(async move { server.serve(listener).await })
    }

    /// Serve one already-connected stream until it closes.
    pub async fn serve_connection<S: AsyncStream>(&self, stream: S) -> Result<()> {
        connection::serve(stream, self.shared.clone(), self.shutdown.clone()).await
    }

    /// Stop accepting connections and cancel every running call.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Token cancelled on shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("commands", &self.shared.registry.len())
            .field("max_payload_size", &self.shared.max_payload_size)
            .field("shutdown", &self.shutdown.is_cancelled())
            .finish()
    }
}
