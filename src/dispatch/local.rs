//! In-process execution. No serialization on this path.

use std::marker::PhantomData;
use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::DropGuard;
use tracing::debug;

use crate::command::{ClientStreamCommand, Command, ServerStreamCommand};
use crate::context::ExecutionContext;
use crate::error::{DispatchError, Result};
use crate::handler::{
    run_guarded, ChunkStream, ClientStreamHandler, CommandHandler, ServerStreamHandler, StreamSink,
};

/// Items buffered between a local streaming handler and its consumer.
pub(crate) const LOCAL_STREAM_BUFFER: usize = 32;

pub(crate) async fn execute<C: Command>(
    handler: Arc<dyn CommandHandler<C>>,
    command: C,
    ctx: &ExecutionContext,
) -> Result<C::Output> {
    let result = run_guarded(ctx, handler.handle(command, ctx.clone())).await;
    ctx.settle(result)
}

struct LocalItems<T> {
    rx: mpsc::Receiver<Result<T>>,
    _guard: DropGuard,
}

/// Run a server-streaming handler on its own task.
///
/// The returned stream owns a guard on the call token; dropping it stops the
/// handler.
pub(crate) fn server_stream<C: ServerStreamCommand>(
    handler: Arc<dyn ServerStreamHandler<C>>,
    command: C,
    ctx: &ExecutionContext,
) -> BoxStream<'static, Result<C::Item>> {
    let (tx, rx) = mpsc::channel(LOCAL_STREAM_BUFFER);
    let call_token = ctx.cancellation_token().child_token();
    let guard = call_token.clone().drop_guard();
    let ctx = ctx.clone();

    tokio::spawn(async move {
        let sink = StreamSink::local(tx.clone());
        let outcome = tokio::select! {
            biased;
            _ = call_token.cancelled() => Err(DispatchError::Cancelled),
            result = run_guarded(&ctx, handler.handle(command, sink, ctx.clone())) => {
                ctx.settle(result)
            }
        };
        if let Err(e) = outcome {
            // Fails only when the consumer is gone, which is how it cancels.
            if tx.send(Err(e)).await.is_err() {
                debug!(command = C::NAME, "stream consumer dropped");
            }
        }
    });

    stream::unfold(LocalItems { rx, _guard: guard }, |mut items| async move {
        let item = items.rx.recv().await?;
        Some((item, items))
    })
    .boxed()
}

/// Caller half of a local client-streaming call.
pub(crate) struct LocalClientStream<I, O> {
    tx: Option<mpsc::Sender<Result<I>>>,
    done: oneshot::Receiver<Result<O>>,
    ctx: ExecutionContext,
    _guard: DropGuard,
    _output: PhantomData<fn() -> O>,
}

pub(crate) fn client_stream<C: ClientStreamCommand>(
    handler: Arc<dyn ClientStreamHandler<C>>,
    command: C,
    ctx: &ExecutionContext,
) -> LocalClientStream<C::Item, C::Output> {
    let (tx, rx) = mpsc::channel(LOCAL_STREAM_BUFFER);
    let (done_tx, done) = oneshot::channel();
    let call_token = ctx.cancellation_token().child_token();
    let guard = call_token.clone().drop_guard();
    let task_ctx = ctx.clone();

    tokio::spawn(async move {
        let ctx = task_ctx;
        let outcome = tokio::select! {
            biased;
            _ = call_token.cancelled() => Err(DispatchError::Cancelled),
            result = run_guarded(&ctx, handler.handle(command, ChunkStream::new(rx), ctx.clone())) => {
                ctx.settle(result)
            }
        };
        let _ = done_tx.send(outcome);
    });

    LocalClientStream {
        tx: Some(tx),
        done,
        ctx: ctx.clone(),
        _guard: guard,
        _output: PhantomData,
    }
}

impl<I, O> LocalClientStream<I, O> {
    pub(crate) async fn send(&mut self, item: I) -> Result<()> {
        self.ctx.check_cancelled()?;
        if let Some(tx) = &self.tx {
            // A handler that stopped reading has already decided its result;
            // extra input is dropped and `finish` reports that result.
            if tx.send(Ok(item)).await.is_err() {
                debug!("client stream handler stopped reading");
                self.tx = None;
            }
        }
        Ok(())
    }

    pub(crate) async fn finish(mut self) -> Result<O> {
        drop(self.tx.take());
        match self.done.await {
            Ok(result) => result,
            Err(_) => Err(DispatchError::HandlerThrown(
                "handler task ended without a result".to_string(),
            )),
        }
    }
}
