//! Dispatch facade.
//!
//! [`Dispatcher`] resolves a command's binding in the [`Registry`] and runs
//! the call in-process or over the binding's channel. Callers see one
//! result type either way:
//!
//! ```text
//! resolve ──► Local  ──► handler ─────────────────────────┐
//!         └─► Remote ──► connect ─► send ─► await/receive ─┴─► settle ─► result
//! ```
//!
//! Every call runs inside a `dispatch` tracing span carrying the command
//! identity.
//!
//! # Example
//!
//! ```
//! # async fn run() -> procwire_dispatch::Result<()> {
//! use std::sync::Arc;
//! use procwire_dispatch::{Command, Dispatcher, Registry};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Double(i32);
//!
//! impl Command for Double {
//!     const NAME: &'static str = "double";
//!     type Output = i32;
//! }
//!
//! let registry = Arc::new(Registry::new());
//! registry.register_fn::<Double, _, _>(|cmd, _ctx| async move { Ok(cmd.0 * 2) })?;
//!
//! let dispatcher = Dispatcher::new(registry);
//! assert_eq!(dispatcher.execute(Double(21)).await?, 42);
//! # Ok(())
//! # }
//! ```

mod local;
mod remote;
mod stream;

use std::sync::Arc;

use futures::stream::{self as futures_stream, StreamExt};
use tracing::{debug, debug_span, Instrument};

use crate::command::{ClientStreamCommand, Command, ServerStreamCommand};
use crate::context::{CallOptions, ExecutionContext};
use crate::error::{DispatchError, Result};
use crate::handler::{Binding, Registry};

use stream::ClientStreamInner;
pub use stream::{ClientStreamCall, ResultStream};

/// Entry point for executing commands.
///
/// Cheap to clone; clones share the registry.
#[derive(Clone, Debug)]
pub struct Dispatcher {
    registry: Arc<Registry>,
}

impl Dispatcher {
    /// Create a dispatcher over `registry`.
    pub fn new(registry: Arc<Registry>) -> Self {
        Self { registry }
    }

    /// The registry this dispatcher resolves against.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Execute a command with a fresh context.
    pub async fn execute<C: Command>(&self, command: C) -> Result<C::Output> {
        self.execute_with(command, &ExecutionContext::new()).await
    }

    /// Execute a command with call options and a fresh context.
    pub async fn execute_with_options<C: Command>(
        &self,
        command: C,
        options: CallOptions,
    ) -> Result<C::Output> {
        self.execute_with(command, &ExecutionContext::with_options(options))
            .await
    }

    /// Execute a command within `ctx`.
    ///
    /// Errors the handler records in its context are visible through `ctx`
    /// afterwards, whether the handler ran locally or remotely.
    pub async fn execute_with<C: Command>(
        &self,
        command: C,
        ctx: &ExecutionContext,
    ) -> Result<C::Output> {
        let span = debug_span!("dispatch", command = C::NAME);
        async {
            ctx.check_cancelled()?;
            let result = match self.registry.resolve(C::NAME)? {
                Binding::Local(binding) => {
                    debug!("executing locally");
                    local::execute(binding.unary::<C>()?, command, ctx).await
                }
                Binding::Remote(binding) => {
                    debug!(address = binding.channel().address(), "executing remotely");
                    remote::execute(&binding, command, ctx).await
                }
            };
            if let Err(e) = &result {
                debug!(error = %e, "dispatch failed");
            }
            result
        }
        .instrument(span)
        .await
    }

    /// Start a server-streaming call.
    ///
    /// Resolution and connection happen on the first poll; failures there are
    /// yielded as the only item.
    pub fn stream<C: ServerStreamCommand>(
        &self,
        command: C,
        ctx: &ExecutionContext,
    ) -> ResultStream<C::Item> {
        let span = debug_span!("dispatch", command = C::NAME);
        let registry = self.registry.clone();
        let ctx = ctx.clone();

        let open = async move {
            ctx.check_cancelled()?;
            Ok::<_, DispatchError>(match registry.resolve(C::NAME)? {
                Binding::Local(binding) => {
                    debug!("streaming locally");
                    local::server_stream(binding.server_stream::<C>()?, command, &ctx)
                }
                Binding::Remote(binding) => {
                    debug!(address = binding.channel().address(), "streaming remotely");
                    remote::server_stream(binding, command, ctx)
                }
            })
        };

        let items = futures_stream::once(open.instrument(span))
            .flat_map(|opened| match opened {
                Ok(items) => items,
                Err(e) => futures_stream::once(async move { Err(e) }).boxed(),
            })
            .boxed();
        ResultStream::new(items)
    }

    /// Open a client-streaming call.
    pub async fn open_client_stream<C: ClientStreamCommand>(
        &self,
        command: C,
        ctx: &ExecutionContext,
    ) -> Result<ClientStreamCall<C::Item, C::Output>> {
        let span = debug_span!("dispatch", command = C::NAME);
        async {
            ctx.check_cancelled()?;
            let inner = match self.registry.resolve(C::NAME)? {
                Binding::Local(binding) => {
                    debug!("opening local client stream");
                    ClientStreamInner::Local(local::client_stream(
                        binding.client_stream::<C>()?,
                        command,
                        ctx,
                    ))
                }
                Binding::Remote(binding) => {
                    debug!(address = binding.channel().address(), "opening remote client stream");
                    ClientStreamInner::Remote(remote::client_stream(&binding, command, ctx).await?)
                }
            };
            Ok(ClientStreamCall::new(inner))
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{ChunkStream, StreamSink};
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Serialize, Deserialize)]
    struct Greet {
        name: String,
    }

    impl Command for Greet {
        const NAME: &'static str = "greet";
        type Output = String;
    }

    #[derive(Serialize, Deserialize)]
    struct Range {
        count: u32,
    }

    impl ServerStreamCommand for Range {
        const NAME: &'static str = "range";
        type Item = u32;
    }

    #[derive(Serialize, Deserialize)]
    struct Sum;

    impl ClientStreamCommand for Sum {
        const NAME: &'static str = "sum";
        type Item = i64;
        type Output = i64;
    }

    #[derive(Serialize, Deserialize)]
    struct Sleepy;

    impl Command for Sleepy {
        const NAME: &'static str = "sleepy";
        type Output = ();
    }

    fn dispatcher() -> Dispatcher {
        let registry = Arc::new(Registry::new());
        registry
            .register_fn::<Greet, _, _>(|cmd, ctx| async move {
                if cmd.name.is_empty() {
                    ctx.add_field_error("name", "required");
                }
                Ok(format!("hello {}", cmd.name))
            })
            .unwrap();
        registry
            .register_server_stream_fn::<Range, _, _>(
                |cmd, mut sink: StreamSink<u32>, _ctx| async move {
                    for i in 0..cmd.count {
                        sink.send(i).await?;
                    }
                    Ok(())
                },
            )
            .unwrap();
        registry
            .register_client_stream_fn::<Sum, _, _>(
                |_, mut items: ChunkStream<i64>, _ctx| async move {
                    let mut total = 0;
                    while let Some(item) = items.next().await {
                        total += item?;
                    }
                    Ok(total)
                },
            )
            .unwrap();
        registry
            .register_fn::<Sleepy, _, _>(|_, _| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(())
            })
            .unwrap();
        Dispatcher::new(registry)
    }

    #[tokio::test]
    async fn test_execute_local() {
        let out = dispatcher()
            .execute(Greet { name: "ada".into() })
            .await
            .unwrap();
        assert_eq!(out, "hello ada");
    }

    #[tokio::test]
    async fn test_local_validation_failure() {
        let ctx = ExecutionContext::new();
        let err = dispatcher()
            .execute_with(Greet { name: String::new() }, &ctx)
            .await
            .unwrap_err();

        match err {
            DispatchError::ValidationFailed(payload) => {
                assert_eq!(payload.field("name").unwrap(), ["required"]);
            }
            other => panic!("unexpected: {other:?}"),
        }
        assert!(ctx.has_errors());
    }

    #[tokio::test]
    async fn test_unregistered() {
        let dispatcher = Dispatcher::new(Arc::new(Registry::new()));
        let err = dispatcher
            .execute(Greet { name: "x".into() })
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::UnregisteredCommand(name) if name == "greet"));
    }

    #[tokio::test]
    async fn test_local_stream_order() {
        let items = dispatcher()
            .stream(Range { count: 50 }, &ExecutionContext::new())
            .collect_all()
            .await
            .unwrap();
        assert_eq!(items, (0..50).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_local_client_stream() {
        let mut call = dispatcher()
            .open_client_stream(Sum, &ExecutionContext::new())
            .await
            .unwrap();
        for i in 1..=10 {
            call.send(i).await.unwrap();
        }
        assert_eq!(call.sent(), 10);
        assert_eq!(call.finish().await.unwrap(), 55);
    }

    #[tokio::test]
    async fn test_cancel_local_handler() {
        let dispatcher = dispatcher();
        let ctx = ExecutionContext::new();
        let canceller = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let err = dispatcher.execute_with(Sleepy, &ctx).await.unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn test_pre_cancelled_context() {
        let ctx = ExecutionContext::new();
        ctx.cancel();
        let err = dispatcher()
            .execute_with(Greet { name: "x".into() }, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::Cancelled));
    }

    #[tokio::test]
    async fn test_local_deadline() {
        let err = dispatcher()
            .execute_with_options(Sleepy, CallOptions::new().timeout(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, DispatchError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_shape_mismatch_local() {
        #[derive(Serialize, Deserialize)]
        struct RangeAsUnary;

        impl Command for RangeAsUnary {
            const NAME: &'static str = "range";
            type Output = Vec<u32>;
        }

        let err = dispatcher().execute(RangeAsUnary).await.unwrap_err();
        assert!(matches!(err, DispatchError::BindingMismatch { .. }));
    }
}
