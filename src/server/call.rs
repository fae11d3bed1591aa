//! Server side of one call: decode the command, run the handler, answer.
//!
//! Every call that is not cancelled ends with exactly one TRAILER, including
//! calls whose handler panicked. Unary and client-streaming successes send
//! one DATA frame with the result first.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::codec::Codec;
use crate::command::{ClientStreamCommand, Command, ServerStreamCommand};
use crate::context::ExecutionContext;
use crate::error::{DispatchError, Result};
use crate::handler::{
    run_handler, ChunkStream, ClientStreamHandler, CommandHandler, FrameSink, ServerStreamHandler,
    StreamSink,
};
use crate::protocol::{flags, kind, Frame, Trailer, WindowGrant};
use crate::writer::{OutboundFrame, WriterHandle};

/// Items buffered between the connection and a client-streaming handler.
const CLIENT_STREAM_BUFFER: usize = 32;

/// One call accepted by the server, ready to be served.
pub(crate) struct ServerCall {
    pub(crate) call_id: u32,
    pub(crate) command: String,
    pub(crate) writer: WriterHandle,
    pub(crate) inbound: mpsc::Receiver<Frame>,
    /// Credit for server-stream items, replenished by the caller's WINDOW frames.
    pub(crate) credit: Arc<Semaphore>,
    pub(crate) ctx: ExecutionContext,
    pub(crate) codec: Codec,
    pub(crate) deadline: Option<Instant>,
}

/// Everything needed to answer a call once the handler is done.
struct Responder {
    call_id: u32,
    command: String,
    writer: WriterHandle,
    ctx: ExecutionContext,
    codec: Codec,
}

impl ServerCall {
    fn split(self) -> (Responder, mpsc::Receiver<Frame>, Option<Instant>) {
        let responder = Responder {
            call_id: self.call_id,
            command: self.command,
            writer: self.writer,
            ctx: self.ctx,
            codec: self.codec,
        };
        (responder, self.inbound, self.deadline)
    }

    pub(crate) async fn serve_unary<C: Command>(self, handler: Arc<dyn CommandHandler<C>>) {
        let (responder, mut inbound, deadline) = self.split();
        let ctx = &responder.ctx;
        let codec = responder.codec;

        let result = ctx
            .guard_until(deadline, async {
                let command: C = read_command(&mut inbound, &codec, ctx).await?;
                run_handler(handler.handle(command, ctx.clone())).await
            })
            .await;
        let result = ctx.settle(result);
        responder.respond(result.map(Some)).await;
    }

    pub(crate) async fn serve_server_stream<C: ServerStreamCommand>(
        self,
        handler: Arc<dyn ServerStreamHandler<C>>,
    ) {
        let credit = self.credit.clone();
        let (responder, mut inbound, deadline) = self.split();
        let ctx = &responder.ctx;
        let codec = responder.codec;
        let sink = StreamSink::remote(FrameSink {
            writer: responder.writer.clone(),
            call_id: responder.call_id,
            codec,
            cancel: ctx.cancellation_token().clone(),
            credit,
        });

        let result = ctx
            .guard_until(deadline, async {
                let command: C = read_command(&mut inbound, &codec, ctx).await?;
                run_handler(handler.handle(command, sink, ctx.clone())).await
            })
            .await;
        let result = ctx.settle(result);
        responder.respond(result.map(|()| None::<()>)).await;
    }

    pub(crate) async fn serve_client_stream<C: ClientStreamCommand>(
        self,
        handler: Arc<dyn ClientStreamHandler<C>>,
    ) {
        let (responder, mut inbound, deadline) = self.split();
        let ctx = &responder.ctx;

        let result = ctx
            .guard_until(
                deadline,
                run_client_stream(handler, &mut inbound, &responder),
            )
            .await;
        let result = ctx.settle(result);
        responder.respond(result.map(Some)).await;
    }
}

/// First DATA frame of a call: the command value.
async fn read_command<T: DeserializeOwned>(
    inbound: &mut mpsc::Receiver<Frame>,
    codec: &Codec,
    ctx: &ExecutionContext,
) -> Result<T> {
    match inbound.recv().await {
        Some(frame) if frame.is_eos_marker() => Err(DispatchError::Protocol(
            "end of stream before the command".to_string(),
        )),
        Some(frame) => Ok(codec.decode_frame(&frame)?),
        None if ctx.is_cancelled() => Err(DispatchError::Cancelled),
        None => Err(DispatchError::Protocol(
            "call closed before the command arrived".to_string(),
        )),
    }
}

/// Run a client-streaming handler while pumping input frames into it.
///
/// Credit goes back to the caller as items are handed to the handler (or
/// dropped, once it stops reading). The result is returned only after the
/// caller's end of input, even when the handler finishes first.
async fn run_client_stream<C: ClientStreamCommand>(
    handler: Arc<dyn ClientStreamHandler<C>>,
    inbound: &mut mpsc::Receiver<Frame>,
    responder: &Responder,
) -> Result<C::Output> {
    let ctx = &responder.ctx;
    let codec = responder.codec;
    let command: C = read_command(inbound, &codec, ctx).await?;
    let (tx, rx) = mpsc::channel(CLIENT_STREAM_BUFFER);

    let pump = async move {
        let mut grant = WindowGrant::new();
        let mut handler_reading = true;
        while let Some(frame) = inbound.recv().await {
            if handler_reading {
                let item = codec.decode_frame(&frame).map_err(DispatchError::from);
                handler_reading = tx.send(item).await.is_ok();
            }
            if let Some(increment) = grant.consume() {
                responder.send_window(increment).await;
            }
        }
    };

    let (result, ()) = tokio::join!(
        run_handler(handler.handle(command, ChunkStream::new(rx), ctx.clone())),
        pump
    );
    result
}

/// Answer a call whose task panicked outside the handler.
pub(crate) async fn send_panic_trailer(writer: &WriterHandle, call_id: u32, command: &str) {
    let err = DispatchError::HandlerThrown("call task panicked".to_string());
    warn!(call_id, command, "call task panicked");
    let sent = async {
        let payload = Trailer::from_error(&err, Default::default()).encode()?;
        writer
            .send(OutboundFrame::new(
                kind::TRAILER,
                flags::END_STREAM,
                call_id,
                payload.into(),
            )?)
            .await?;
        Ok::<_, DispatchError>(())
    };
    if let Err(e) = sent.await {
        debug!(call_id, error = %e, "could not send trailer");
    }
}

impl Responder {
    async fn respond<T: Serialize>(&self, result: Result<Option<T>>) {
        let trailer = match result {
            Err(DispatchError::Cancelled) => {
                debug!(call_id = self.call_id, command = %self.command, "call cancelled");
                return;
            }
            Ok(value) => match self.send_value(value).await {
                Ok(()) => Trailer::ok(),
                Err(DispatchError::Transport(e)) => {
                    debug!(call_id = self.call_id, error = %e, "could not send result");
                    return;
                }
                Err(e) => Trailer::from_error(&e, self.ctx.errors()),
            },
            Err(e) => {
                if let DispatchError::HandlerThrown(message) = &e {
                    warn!(call_id = self.call_id, command = %self.command, error = %message, "handler failed");
                } else {
                    debug!(call_id = self.call_id, command = %self.command, error = %e, "call failed");
                }
                Trailer::from_error(&e, self.ctx.errors())
            }
        };

        if let Err(e) = self.send_trailer(&trailer).await {
            debug!(call_id = self.call_id, error = %e, "could not send trailer");
        }
    }

    async fn send_value<T: Serialize>(&self, value: Option<T>) -> Result<()> {
        let Some(value) = value else {
            return Ok(());
        };
        let encoded = self.codec.encode(&value)?;
        let frame_flags = if encoded.compressed {
            flags::COMPRESSED
        } else {
            0
        };
        self.writer
            .send(OutboundFrame::new(
                kind::DATA,
                frame_flags,
                self.call_id,
                encoded.bytes,
            )?)
            .await?;
        Ok(())
    }

    async fn send_window(&self, increment: u32) {
        if let Err(e) = self
            .writer
            .send(OutboundFrame::window(self.call_id, increment))
            .await
        {
            debug!(call_id = self.call_id, error = %e, "could not send WINDOW");
        }
    }

    async fn send_trailer(&self, trailer: &Trailer) -> Result<()> {
        let payload = trailer.encode()?;
        self.writer
            .send(OutboundFrame::new(
                kind::TRAILER,
                flags::END_STREAM,
                self.call_id,
                payload.into(),
            )?)
            .await?;
        Ok(())
    }
}
