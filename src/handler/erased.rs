//! Type-erased handler entries.
//!
//! The registry stores each local handler twice behind one allocation: as
//! `dyn Any` for typed in-process dispatch (downcast back to the entry for
//! the command type) and as [`WireHandler`] for the handler server, which
//! only ever sees bytes.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;

use super::traits::{ClientStreamHandler, CommandHandler, HandlerResult, ServerStreamHandler};
use crate::command::{ClientStreamCommand, Command, ServerStreamCommand};
use crate::context::ExecutionContext;
use crate::error::{DispatchError, Result};
use crate::server::ServerCall;

type Factory<H> = Arc<dyn Fn() -> Arc<H> + Send + Sync>;

/// Serves one call arriving over the wire.
pub(crate) trait WireHandler: Send + Sync + 'static {
    fn serve(&self, call: ServerCall) -> BoxFuture<'static, ()>;
}

/// Await a handler future, mapping its error into the dispatch taxonomy.
///
/// A panic in the handler becomes [`DispatchError::HandlerThrown`], so the
/// call still completes with an outcome.
pub(crate) async fn run_handler<T>(fut: impl Future<Output = HandlerResult<T>>) -> Result<T> {
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result.map_err(DispatchError::from_handler),
        Err(panic) => Err(DispatchError::HandlerThrown(panic_message(panic.as_ref()))),
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    let detail = panic
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| panic.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload");
    format!("handler panicked: {detail}")
}

/// [`run_handler`] under the context's cancellation and deadline.
pub(crate) async fn run_guarded<T>(
    ctx: &ExecutionContext,
    fut: impl Future<Output = HandlerResult<T>>,
) -> Result<T> {
    ctx.guard(run_handler(fut)).await
}

pub(crate) struct UnaryEntry<C: Command> {
    factory: Factory<dyn CommandHandler<C>>,
}

impl<C: Command> UnaryEntry<C> {
    pub(crate) fn new(factory: Factory<dyn CommandHandler<C>>) -> Self {
        Self { factory }
    }

    /// Handler instance for one call.
    pub(crate) fn handler(&self) -> Arc<dyn CommandHandler<C>> {
        (self.factory)()
    }
}

impl<C: Command> WireHandler for UnaryEntry<C> {
    fn serve(&self, call: ServerCall) -> BoxFuture<'static, ()> {
        Box::pin(call.serve_unary(self.handler()))
    }
}

pub(crate) struct ServerStreamEntry<C: ServerStreamCommand> {
    factory: Factory<dyn ServerStreamHandler<C>>,
}

impl<C: ServerStreamCommand> ServerStreamEntry<C> {
    pub(crate) fn new(factory: Factory<dyn ServerStreamHandler<C>>) -> Self {
        Self { factory }
    }

    pub(crate) fn handler(&self) -> Arc<dyn ServerStreamHandler<C>> {
        (self.factory)()
    }
}

impl<C: ServerStreamCommand> WireHandler for ServerStreamEntry<C> {
    fn serve(&self, call: ServerCall) -> BoxFuture<'static, ()> {
        Box::pin(call.serve_server_stream(self.handler()))
    }
}

pub(crate) struct ClientStreamEntry<C: ClientStreamCommand> {
    factory: Factory<dyn ClientStreamHandler<C>>,
}

impl<C: ClientStreamCommand> ClientStreamEntry<C> {
    pub(crate) fn new(factory: Factory<dyn ClientStreamHandler<C>>) -> Self {
        Self { factory }
    }

    pub(crate) fn handler(&self) -> Arc<dyn ClientStreamHandler<C>> {
        (self.factory)()
    }
}

impl<C: ClientStreamCommand> WireHandler for ClientStreamEntry<C> {
    fn serve(&self, call: ServerCall) -> BoxFuture<'static, ()> {
        Box::pin(call.serve_client_stream(self.handler()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_panic_becomes_handler_thrown() {
        let err = run_handler(async {
            if true {
                panic!("ledger corrupted");
            }
            Ok::<u32, anyhow::Error>(1)
        })
        .await
        .unwrap_err();
        assert!(matches!(&err, DispatchError::HandlerThrown(m) if m == "handler panicked: ledger corrupted"));

        let formatted = run_handler(async {
            if true {
                panic!("slot {} missing", 7);
            }
            Ok::<u32, anyhow::Error>(1)
        })
        .await
        .unwrap_err();
        assert!(matches!(&formatted, DispatchError::HandlerThrown(m) if m.ends_with("slot 7 missing")));
    }

    #[tokio::test]
    async fn test_handler_errors_pass_through() {
        let ok = run_handler(async { Ok::<u32, anyhow::Error>(3) }).await.unwrap();
        assert_eq!(ok, 3);

        let err = run_handler(async { Err::<u32, _>(anyhow::anyhow!("db down")) })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::HandlerThrown(m) if m == "db down"));
    }
}
