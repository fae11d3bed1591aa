//! Handler traits, one per call shape.
//!
//! Handlers return `anyhow::Result`: any error becomes
//! [`DispatchError::HandlerThrown`](crate::DispatchError::HandlerThrown)
//! unless it is a `DispatchError` for cancellation, a deadline or a
//! validation failure. Validation problems are normally reported through
//! [`ExecutionContext::add_error`] and friends instead.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;

use super::stream::{ChunkStream, StreamSink};
use crate::command::{ClientStreamCommand, Command, ServerStreamCommand};
use crate::context::ExecutionContext;

/// Result type for handler functions.
pub type HandlerResult<T> = anyhow::Result<T>;

/// Handles a single-result command.
#[async_trait]
pub trait CommandHandler<C: Command>: Send + Sync + 'static {
    /// Produce the result for `command`.
    async fn handle(&self, command: C, ctx: ExecutionContext) -> HandlerResult<C::Output>;
}

/// Produces a sequence of items for a command.
#[async_trait]
pub trait ServerStreamHandler<C: ServerStreamCommand>: Send + Sync + 'static {
    /// Push items into `sink`; returning ends the sequence.
    async fn handle(
        &self,
        command: C,
        sink: StreamSink<C::Item>,
        ctx: ExecutionContext,
    ) -> HandlerResult<()>;
}

/// Consumes a caller-produced sequence and answers once.
#[async_trait]
pub trait ClientStreamHandler<C: ClientStreamCommand>: Send + Sync + 'static {
    /// Read `items` to the end and produce the result.
    async fn handle(
        &self,
        command: C,
        items: ChunkStream<C::Item>,
        ctx: ExecutionContext,
    ) -> HandlerResult<C::Output>;
}

/// Adapts an async closure to the handler traits.
pub struct FnHandler<F, Fut> {
    f: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnHandler<F, Fut> {
    /// Wrap a closure.
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<C, F, Fut> CommandHandler<C> for FnHandler<F, Fut>
where
    C: Command,
    F: Fn(C, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<C::Output>> + Send + 'static,
{
    async fn handle(&self, command: C, ctx: ExecutionContext) -> HandlerResult<C::Output> {
        (self.f)(command, ctx).await
    }
}

#[async_trait]
impl<C, F, Fut> ServerStreamHandler<C> for FnHandler<F, Fut>
where
    C: ServerStreamCommand,
    F: Fn(C, StreamSink<C::Item>, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<()>> + Send + 'static,
{
    async fn handle(
        &self,
        command: C,
        sink: StreamSink<C::Item>,
        ctx: ExecutionContext,
    ) -> HandlerResult<()> {
        (self.f)(command, sink, ctx).await
    }
}

#[async_trait]
impl<C, F, Fut> ClientStreamHandler<C> for FnHandler<F, Fut>
where
    C: ClientStreamCommand,
    F: Fn(C, ChunkStream<C::Item>, ExecutionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult<C::Output>> + Send + 'static,
{
    async fn handle(
        &self,
        command: C,
        items: ChunkStream<C::Item>,
        ctx: ExecutionContext,
    ) -> HandlerResult<C::Output> {
        (self.f)(command, items, ctx).await
    }
}
