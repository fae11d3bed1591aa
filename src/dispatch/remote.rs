//! Execution over a [`Channel`](crate::Channel).
//!
//! The trailer of every call carries the handler's error accumulator; it is
//! merged into the caller's context so local and remote failures look the
//! same to the caller.

use std::marker::PhantomData;

use futures::stream::{self, BoxStream, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::channel::{await_reply, Call, UnaryReply};
use crate::codec::{Codec, MsgPackCodec};
use crate::command::{CallShape, ClientStreamCommand, Command, ServerStreamCommand};
use crate::context::ExecutionContext;
use crate::error::{DispatchError, Result, TransportError};
use crate::handler::RemoteBinding;
use crate::protocol::{Frame, Status, Trailer};

pub(crate) async fn execute<C: Command>(
    remote: &RemoteBinding,
    command: C,
    ctx: &ExecutionContext,
) -> Result<C::Output> {
    remote.expect_shape(C::NAME, CallShape::Unary)?;
    let channel = remote.channel();
    let payload = channel.codec().encode(&command)?;

    let reply = ctx
        .guard(channel.unary(C::NAME, &payload, ctx.options(), ctx.cancellation_token()))
        .await?;
    finish_reply(channel.codec(), ctx, C::NAME, reply)
}

/// Apply a trailer to the caller's context and turn it into the outcome.
fn settle_trailer(ctx: &ExecutionContext, command: &str, mut trailer: Trailer) -> Result<()> {
    // A validation payload is folded in by `settle`; any other status may
    // still carry errors the handler recorded before failing.
    if trailer.status != Status::ValidationFailed {
        ctx.merge_errors(std::mem::take(&mut trailer.errors));
    }
    ctx.settle(trailer.into_result(command))
}

fn finish_reply<T: DeserializeOwned>(
    codec: &Codec,
    ctx: &ExecutionContext,
    command: &str,
    reply: UnaryReply,
) -> Result<T> {
    settle_trailer(ctx, command, reply.trailer)?;
    let frame = reply.data.ok_or_else(|| {
        DispatchError::Protocol(format!("`{command}` completed without a result"))
    })?;
    Ok(codec.decode_frame(&frame)?)
}

fn decode_trailer(frame: &Frame) -> Result<Trailer> {
    Ok(MsgPackCodec::decode(frame.payload())?)
}

struct RemoteItems<T> {
    call: Call,
    first: Option<Frame>,
    codec: Codec,
    ctx: ExecutionContext,
    command: &'static str,
    deadline: Option<Instant>,
    done: bool,
    _item: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> RemoteItems<T> {
    async fn next_item(&mut self) -> Option<Result<T>> {
        if self.done {
            return None;
        }

        let frame = match self.first.take() {
            Some(frame) => Ok(frame),
            None => {
                self.ctx
                    .guard_until(self.deadline, self.call.recv())
                    .await
            }
        };

        let item = match frame {
            Ok(frame) if frame.is_trailer() => {
                self.done = true;
                match decode_trailer(&frame)
                    .and_then(|trailer| settle_trailer(&self.ctx, self.command, trailer))
                {
                    Ok(()) => return None,
                    Err(e) => Err(e),
                }
            }
            Ok(frame) => {
                self.call.item_consumed().await;
                self.codec.decode_frame(&frame).map_err(DispatchError::from)
            }
            Err(e) => Err(e),
        };

        if item.is_err() {
            self.done = true;
            // Drops the queue and tells the server to stop.
            self.call.cancel();
        }
        Some(item)
    }
}

/// Open a server-streaming call and stream its items.
///
/// Opening (connect, send, first frame) is retried by the channel; once the
/// first frame has arrived the call is never retried.
pub(crate) fn server_stream<C: ServerStreamCommand>(
    remote: RemoteBinding,
    command: C,
    ctx: ExecutionContext,
) -> BoxStream<'static, Result<C::Item>> {
    let open = async move {
        remote.expect_shape(C::NAME, CallShape::ServerStreaming)?;
        let channel = remote.channel();
        let payload = channel.codec().encode(&command)?;
        let deadline = ctx.deadline();

        let (call, first) = ctx
            .guard_until(
                deadline,
                channel.server_streaming(
                    C::NAME,
                    &payload,
                    ctx.options(),
                    ctx.cancellation_token(),
                ),
            )
            .await?;
        debug!(command = C::NAME, "server stream open");

        Ok::<_, DispatchError>(RemoteItems::<C::Item> {
            call,
            first: Some(first),
            codec: *channel.codec(),
            ctx,
            command: C::NAME,
            deadline,
            done: false,
            _item: PhantomData,
        })
    };

    stream::once(open)
        .flat_map(|opened| match opened {
            Ok(items) => stream::unfold(items, |mut items| async move {
                let item = items.next_item().await?;
                Some((item, items))
            })
            .boxed(),
            Err(e) => stream::once(async move { Err(e) }).boxed(),
        })
        .boxed()
}

/// Caller half of a remote client-streaming call.
pub(crate) struct RemoteClientStream<I, O> {
    call: Call,
    codec: Codec,
    ctx: ExecutionContext,
    command: &'static str,
    deadline: Option<Instant>,
    /// Trailer the server sent before the input ended.
    early: Option<Trailer>,
    _types: PhantomData<fn(I) -> O>,
}

pub(crate) async fn client_stream<C: ClientStreamCommand>(
    remote: &RemoteBinding,
    command: C,
    ctx: &ExecutionContext,
) -> Result<RemoteClientStream<C::Item, C::Output>> {
    remote.expect_shape(C::NAME, CallShape::ClientStreaming)?;
    let channel = remote.channel();
    let payload = channel.codec().encode(&command)?;
    let deadline = ctx.deadline();

    let call = ctx
        .guard_until(
            deadline,
            channel.client_streaming(C::NAME, &payload, ctx.options(), ctx.cancellation_token()),
        )
        .await?;

    Ok(RemoteClientStream {
        call,
        codec: *channel.codec(),
        ctx: ctx.clone(),
        command: C::NAME,
        deadline,
        early: None,
        _types: PhantomData,
    })
}

impl<I, O> RemoteClientStream<I, O>
where
    I: Serialize,
    O: DeserializeOwned,
{
    pub(crate) async fn send(&mut self, item: I) -> Result<()> {
        if let Some(trailer) = &self.early {
            return Err(early_error(self.command, trailer.clone()));
        }
        if self.ctx.is_cancelled() {
            self.call.cancel();
            return Err(DispatchError::Cancelled);
        }

        self.check_early()?;

        let encoded = self.codec.encode(&item)?;
        let call = &self.call;
        let sent = self
            .ctx
            .guard_until(self.deadline, call.send_item(&encoded))
            .await?;
        if !sent {
            // Credit stops when the server ends the call or the connection drops.
            self.check_early()?;
            return Err(TransportError::ResponseInterrupted.into());
        }
        Ok(())
    }

    /// Fail if the server has already ended the call.
    fn check_early(&mut self) -> Result<()> {
        let Some(frame) = self.call.try_recv()? else {
            return Ok(());
        };
        let trailer = if frame.is_trailer() {
            decode_trailer(&frame)?
        } else {
            Trailer {
                status: Status::Protocol,
                message: Some("result arrived before the end of input".to_string()),
                errors: Default::default(),
            }
        };
        self.call.cancel();
        let err = early_error(self.command, trailer.clone());
        self.early = Some(trailer);
        Err(err)
    }

    pub(crate) async fn finish(mut self) -> Result<O> {
        if let Some(trailer) = self.early.take() {
            settle_trailer(&self.ctx, self.command, trailer)?;
            return Err(DispatchError::Protocol(format!(
                "`{}` ended before the end of input",
                self.command
            )));
        }

        let ctx = &self.ctx;
        let call = &mut self.call;
        let reply = ctx
            .guard_until(self.deadline, async {
                call.end_stream().await?;
                await_reply(call).await
            })
            .await?;
        finish_reply(&self.codec, &self.ctx, self.command, reply)
    }
}

/// Error for a call the server ended while input was still being sent.
fn early_error(command: &str, trailer: Trailer) -> DispatchError {
    match trailer.into_result(command) {
        Err(e) => e,
        Ok(()) => DispatchError::Protocol("result arrived before the end of input".to_string()),
    }
}
