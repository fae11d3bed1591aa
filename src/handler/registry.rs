//! Command registry: command identity to binding.
//!
//! A binding is either a local handler (stored type-erased) or a remote
//! [`Channel`]. Registration is thread-safe and may happen while dispatches
//! are in flight; a dispatch resolves its binding once, at the start.
//!
//! # Example
//!
//! ```
//! use procwire_dispatch::{Command, Registry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Ping;
//!
//! impl Command for Ping {
//!     const NAME: &'static str = "ping";
//!     type Output = String;
//! }
//!
//! let registry = Registry::new();
//! registry
//!     .register_fn::<Ping, _, _>(|_, _| async { Ok("pong".to_string()) })
//!     .unwrap();
//! assert!(registry.contains("ping"));
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use super::erased::{ClientStreamEntry, ServerStreamEntry, UnaryEntry, WireHandler};
use super::stream::{ChunkStream, StreamSink};
use super::traits::{
    ClientStreamHandler, CommandHandler, FnHandler, HandlerResult, ServerStreamHandler,
};
use crate::channel::Channel;
use crate::command::{CallShape, ClientStreamCommand, Command, ServerStreamCommand};
use crate::context::ExecutionContext;
use crate::error::{DispatchError, Result};
use crate::protocol::CommandDescriptor;

/// What happens when a command identity is registered twice.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DuplicatePolicy {
    /// The new binding replaces the old one.
    #[default]
    Replace,
    /// The second registration fails with `DuplicateRegistration`.
    Reject,
}

/// A handler living in this process.
#[derive(Clone)]
pub struct LocalBinding {
    shape: CallShape,
    type_name: &'static str,
    entry: Arc<dyn Any + Send + Sync>,
    wire: Arc<dyn WireHandler>,
}

impl LocalBinding {
    fn new<E>(shape: CallShape, type_name: &'static str, entry: E) -> Self
    where
        E: WireHandler + Any + Send + Sync,
    {
        let entry = Arc::new(entry);
        Self {
            shape,
            type_name,
            entry: entry.clone(),
            wire: entry,
        }
    }

    /// Call shape the handler was registered with.
    pub fn shape(&self) -> CallShape {
        self.shape
    }

    /// Rust type name of the registered command.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub(crate) fn wire(&self) -> Arc<dyn WireHandler> {
        self.wire.clone()
    }

    fn expect_shape(&self, command: &str, expected: CallShape) -> Result<()> {
        if self.shape != expected {
            return Err(DispatchError::shape_mismatch(command, expected, self.shape));
        }
        Ok(())
    }

    fn downcast<E: Any>(&self, command: &str, requested: &'static str) -> Result<&E> {
        self.entry
            .downcast_ref::<E>()
            .ok_or_else(|| DispatchError::BindingMismatch {
                command: command.to_string(),
                expected: requested.to_string(),
                found: self.type_name.to_string(),
            })
    }

    pub(crate) fn unary<C: Command>(&self) -> Result<Arc<dyn CommandHandler<C>>> {
        self.expect_shape(C::NAME, CallShape::Unary)?;
        let entry = self.downcast::<UnaryEntry<C>>(C::NAME, std::any::type_name::<C>())?;
        Ok(entry.handler())
    }

    pub(crate) fn server_stream<C: ServerStreamCommand>(
        &self,
    ) -> Result<Arc<dyn ServerStreamHandler<C>>> {
        self.expect_shape(C::NAME, CallShape::ServerStreaming)?;
        let entry = self.downcast::<ServerStreamEntry<C>>(C::NAME, std::any::type_name::<C>())?;
        Ok(entry.handler())
    }

    pub(crate) fn client_stream<C: ClientStreamCommand>(
        &self,
    ) -> Result<Arc<dyn ClientStreamHandler<C>>> {
        self.expect_shape(C::NAME, CallShape::ClientStreaming)?;
        let entry = self.downcast::<ClientStreamEntry<C>>(C::NAME, std::any::type_name::<C>())?;
        Ok(entry.handler())
    }
}

/// A command forwarded to a handler server.
#[derive(Clone, Debug)]
pub struct RemoteBinding {
    channel: Channel,
    shape: CallShape,
}

impl RemoteBinding {
    /// Channel the command is sent over.
    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Call shape the command was bound with.
    pub fn shape(&self) -> CallShape {
        self.shape
    }

    pub(crate) fn expect_shape(&self, command: &str, expected: CallShape) -> Result<()> {
        if self.shape != expected {
            return Err(DispatchError::shape_mismatch(command, expected, self.shape));
        }
        Ok(())
    }
}

/// Where a command goes.
#[derive(Clone)]
pub enum Binding {
    /// Handled in this process.
    Local(LocalBinding),
    /// Forwarded over a channel.
    Remote(RemoteBinding),
}

impl Binding {
    /// Call shape of the binding.
    pub fn shape(&self) -> CallShape {
        match self {
            Binding::Local(local) => local.shape,
            Binding::Remote(remote) => remote.shape,
        }
    }

    /// Whether the command is handled in this process.
    pub fn is_local(&self) -> bool {
        matches!(self, Binding::Local(_))
    }
}

impl std::fmt::Debug for Binding {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Binding::Local(local) => f
                .debug_struct("Local")
                .field("shape", &local.shape)
                .field("type_name", &local.type_name)
                .finish(),
            Binding::Remote(remote) => f
                .debug_struct("Remote")
                .field("shape", &remote.shape)
                .field("address", &remote.channel.address())
                .finish(),
        }
    }
}

/// Maps command identities to bindings.
#[derive(Default)]
pub struct Registry {
    bindings: RwLock<HashMap<&'static str, Binding>>,
    policy: DuplicatePolicy,
}

impl Registry {
    /// Create an empty registry that replaces duplicates.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty registry with an explicit duplicate policy.
    pub fn with_policy(policy: DuplicatePolicy) -> Self {
        Self {
            bindings: RwLock::new(HashMap::new()),
            policy,
        }
    }

    /// Duplicate policy in effect.
    pub fn policy(&self) -> DuplicatePolicy {
        self.policy
    }

    /// Bind a command to a handler instance shared by every call.
    pub fn register_local<C, H>(&self, handler: H) -> Result<()>
    where
        C: Command,
        H: CommandHandler<C>,
    {
        let handler: Arc<dyn CommandHandler<C>> = Arc::new(handler);
        self.register_local_factory::<C, _>(move || handler.clone())
    }

    /// Bind a command to a factory producing a fresh handler per call.
    pub fn register_local_factory<C, F>(&self, factory: F) -> Result<()>
    where
        C: Command,
        F: Fn() -> Arc<dyn CommandHandler<C>> + Send + Sync + 'static,
    {
        let entry = UnaryEntry::<C>::new(Arc::new(factory));
        self.insert(
            C::NAME,
            Binding::Local(LocalBinding::new(
                CallShape::Unary,
                std::any::type_name::<C>(),
                entry,
            )),
        )
    }

    /// Bind a command to an async closure.
    pub fn register_fn<C, F, Fut>(&self, f: F) -> Result<()>
    where
        C: Command,
        F: Fn(C, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<C::Output>> + Send + 'static,
    {
        self.register_local::<C, _>(FnHandler::new(f))
    }

    /// Bind a server-streaming command to a handler.
    pub fn register_server_stream<C, H>(&self, handler: H) -> Result<()>
    where
        C: ServerStreamCommand,
        H: ServerStreamHandler<C>,
    {
        let handler: Arc<dyn ServerStreamHandler<C>> = Arc::new(handler);
        self.register_server_stream_factory::<C, _>(move || handler.clone())
    }

    /// Bind a server-streaming command to a factory producing a fresh
    /// handler per call.
    pub fn register_server_stream_factory<C, F>(&self, factory: F) -> Result<()>
    where
        C: ServerStreamCommand,
        F: Fn() -> Arc<dyn ServerStreamHandler<C>> + Send + Sync + 'static,
    {
        let entry = ServerStreamEntry::<C>::new(Arc::new(factory));
        self.insert(
            C::NAME,
            Binding::Local(LocalBinding::new(
                CallShape::ServerStreaming,
                std::any::type_name::<C>(),
                entry,
            )),
        )
    }

    /// Bind a server-streaming command to an async closure.
    pub fn register_server_stream_fn<C, F, Fut>(&self, f: F) -> Result<()>
    where
        C: ServerStreamCommand,
        F: Fn(C, StreamSink<C::Item>, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        self.register_server_stream::<C, _>(FnHandler::new(f))
    }

    /// Bind a client-streaming command to a handler.
    pub fn register_client_stream<C, H>(&self, handler: H) -> Result<()>
    where
        C: ClientStreamCommand,
        H: ClientStreamHandler<C>,
    {
        let handler: Arc<dyn ClientStreamHandler<C>> = Arc::new(handler);
        self.register_client_stream_factory::<C, _>(move || handler.clone())
    }

    /// Bind a client-streaming command to a factory producing a fresh
    /// handler per call.
    pub fn register_client_stream_factory<C, F>(&self, factory: F) -> Result<()>
    where
        C: ClientStreamCommand,
        F: Fn() -> Arc<dyn ClientStreamHandler<C>> + Send + Sync + 'static,
    {
        let entry = ClientStreamEntry::<C>::new(Arc::new(factory));
        self.insert(
            C::NAME,
            Binding::Local(LocalBinding::new(
                CallShape::ClientStreaming,
                std::any::type_name::<C>(),
                entry,
            )),
        )
    }

    /// Bind a client-streaming command to an async closure.
    pub fn register_client_stream_fn<C, F, Fut>(&self, f: F) -> Result<()>
    where
        C: ClientStreamCommand,
        F: Fn(C, ChunkStream<C::Item>, ExecutionContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<C::Output>> + Send + 'static,
    {
        self.register_client_stream::<C, _>(FnHandler::new(f))
    }

    /// Forward a command to the handler server behind `channel`.
    pub fn register_remote<C: Command>(&self, channel: &Channel) -> Result<()> {
        self.insert_remote(C::NAME, channel, CallShape::Unary)
    }

    /// Forward a server-streaming command over `channel`.
    pub fn register_remote_server_stream<C: ServerStreamCommand>(
        &self,
        channel: &Channel,
    ) -> Result<()> {
        self.insert_remote(C::NAME, channel, CallShape::ServerStreaming)
    }

    /// Forward a client-streaming command over `channel`.
    pub fn register_remote_client_stream<C: ClientStreamCommand>(
        &self,
        channel: &Channel,
    ) -> Result<()> {
        self.insert_remote(C::NAME, channel, CallShape::ClientStreaming)
    }

    fn insert_remote(&self, name: &'static str, channel: &Channel, shape: CallShape) -> Result<()> {
        self.insert(
            name,
            Binding::Remote(RemoteBinding {
                channel: channel.clone(),
                shape,
            }),
        )
    }

    fn insert(&self, name: &'static str, binding: Binding) -> Result<()> {
        let mut bindings = self.bindings.write();
        if self.policy == DuplicatePolicy::Reject && bindings.contains_key(name) {
            return Err(DispatchError::DuplicateRegistration(name.to_string()));
        }

        if let Binding::Remote(remote) = &binding {
            remote.channel.bind(name);
        }
        if let Some(previous) = bindings.insert(name, binding) {
            debug!(command = name, "replacing existing binding");
            release(name, previous, bindings.get(name));
        }
        Ok(())
    }

    /// Current binding for `name`.
    pub fn resolve(&self, name: &str) -> Result<Binding> {
        self.bindings
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnregisteredCommand(name.to_string()))
    }

    /// Remove the binding for `name`, returning it.
    pub fn unregister(&self, name: &str) -> Option<Binding> {
        let mut bindings = self.bindings.write();
        let (key, binding) = bindings.remove_entry(name)?;
        release(key, binding.clone(), None);
        Some(binding)
    }

    /// Whether `name` is bound.
    pub fn contains(&self, name: &str) -> bool {
        self.bindings.read().contains_key(name)
    }

    /// Number of bindings.
    pub fn len(&self) -> usize {
        self.bindings.read().len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.bindings.read().is_empty()
    }

    /// Local commands, sorted by identity, as advertised in HELLO.
    pub fn descriptors(&self) -> Vec<CommandDescriptor> {
        let mut out: Vec<CommandDescriptor> = self
            .bindings
            .read()
            .iter()
            .filter_map(|(name, binding)| match binding {
                Binding::Local(local) => Some(CommandDescriptor {
                    name: name.to_string(),
                    shape: local.shape,
                }),
                Binding::Remote(_) => None,
            })
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        out
    }
}

/// Detach a replaced or removed remote binding from its channel, unless
/// the binding now in place uses the same channel.
fn release(name: &'static str, previous: Binding, current: Option<&Binding>) {
    if let Binding::Remote(old) = previous {
        let still_bound = matches!(
            current,
            Some(Binding::Remote(new)) if new.channel.same_channel(&old.channel)
        );
        if !still_bound {
            old.channel.unbind(name);
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("policy", &self.policy)
            .field("bindings", &*self.bindings.read())
            .finish()
    }
}
