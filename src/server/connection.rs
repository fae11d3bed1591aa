//! Per-connection loop of the handler server.
//!
//! 1. Split the stream and spawn the writer task
//! 2. Answer the client's HELLO with the local command list
//! 3. Read frames: OPEN starts a call, DATA feeds it, WINDOW grants it
//!    stream credit, CANCEL aborts it
//! 4. On exit cancel every call still running on this connection

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures::FutureExt;
use tokio::io::AsyncReadExt;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::call::{send_panic_trailer, ServerCall};
use super::Shared;
use crate::codec::MsgPackCodec;
use crate::command::identity_from_path;
use crate::context::{CallOptions, ExecutionContext};
use crate::error::{DispatchError, Result};
use crate::handler::Binding;
use crate::protocol::flow::{self, INITIAL_WINDOW};
use crate::protocol::{
    flags, kind, CallHead, Frame, FrameBuffer, Hello, Trailer, CONTROL_CALL_ID,
};
use crate::transport::AsyncStream;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterHandle};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// The command frame plus a full window of client-stream items.
const CALL_QUEUE_CAPACITY: usize = INITIAL_WINDOW as usize + 1;

struct CallEntry {
    /// `None` once the caller's input has ended.
    inbound: Option<mpsc::Sender<Frame>>,
    cancel: CancellationToken,
    /// Credit for server-stream items sent to the caller.
    credit: Arc<Semaphore>,
}

type CallTable = Arc<parking_lot::Mutex<HashMap<u32, CallEntry>>>;

struct ConnectionState {
    shared: Arc<Shared>,
    writer: WriterHandle,
    calls: CallTable,
    token: CancellationToken,
    semaphore: Arc<Semaphore>,
    greeted: bool,
}

/// Serve one connection until the peer disconnects or the server shuts down.
pub(crate) async fn serve<S: AsyncStream>(
    stream: S,
    shared: Arc<Shared>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (mut reader, write_half) = tokio::io::split(stream);
    let (writer, _writer_task) = spawn_writer_task(write_half, shared.writer_config.clone());

    let mut state = ConnectionState {
        semaphore: shared.semaphore.clone(),
        shared,
        writer,
        calls: Arc::new(parking_lot::Mutex::new(HashMap::new())),
        token: shutdown.child_token(),
        greeted: false,
    };

    let mut buffer = FrameBuffer::with_max_payload(state.shared.max_payload_size);
    let mut buf = vec![0u8; READ_BUFFER_SIZE];

    let outcome = loop {
        let n = tokio::select! {
            _ = state.token.cancelled() => break Ok(()),
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("client closed the connection");
                    break Ok(());
                }
                Ok(n) => n,
                Err(e) => break Err(DispatchError::from(e)),
            },
        };

        let frames = match buffer.push(&buf[..n]) {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "protocol error from client, dropping connection");
                break Err(e);
            }
        };
        if let Err(e) = process_frames(&mut state, frames).await {
            warn!(error = %e, "dropping connection");
            break Err(e);
        }
    };

    state.token.cancel();
    let in_flight = {
        let mut table = state.calls.lock();
        let n = table.len();
        table.clear();
        n
    };
    if in_flight > 0 {
        debug!(in_flight, "connection ended with calls in flight");
    }
    outcome
}

async fn process_frames(state: &mut ConnectionState, frames: Vec<Frame>) -> Result<()> {
    for frame in frames {
        if !state.greeted {
            greet(state, &frame).await?;
            continue;
        }

        match frame.kind() {
            kind::OPEN => open_call(state, frame).await?,
            kind::DATA => feed(state, frame).await?,
            kind::WINDOW => grant(state, &frame),
            kind::CANCEL => cancel(state, frame.call_id()),
            other => warn!(
                call_id = frame.call_id(),
                kind = kind::name(other),
                "unexpected frame from client"
            ),
        }
    }
    Ok(())
}

async fn greet(state: &mut ConnectionState, frame: &Frame) -> Result<()> {
    if frame.kind() != kind::HELLO {
        return Err(DispatchError::Protocol(format!(
            "expected HELLO, got {}",
            kind::name(frame.kind())
        )));
    }
    let hello: Hello = MsgPackCodec::decode(frame.payload())?;
    hello.check_compatible()?;

    let reply = Hello::server(state.shared.registry.descriptors())
        .with_max_payload_size(state.shared.max_payload_size);
    debug!(
        peer_version = %hello.version,
        commands = reply.commands.len(),
        "handshake"
    );
    let payload = MsgPackCodec::encode(&reply)?;
    state
        .writer
        .send(OutboundFrame::new(
            kind::HELLO,
            0,
            CONTROL_CALL_ID,
            Bytes::from(payload),
        )?)
        .await?;
    state.greeted = true;
    Ok(())
}

async fn open_call(state: &mut ConnectionState, frame: Frame) -> Result<()> {
    let call_id = frame.call_id();
    if call_id == CONTROL_CALL_ID || state.calls.lock().contains_key(&call_id) {
        return Err(DispatchError::Protocol(format!(
            "OPEN with invalid or reused call id {call_id}"
        )));
    }

    let head: CallHead = match MsgPackCodec::decode(frame.payload()) {
        Ok(head) => head,
        Err(e) => {
            let err = DispatchError::Protocol(format!("invalid call head: {e}"));
            return reject(state, call_id, &err).await;
        }
    };

    let Some(command) = identity_from_path(&head.path) else {
        let err = DispatchError::Protocol(format!("invalid path `{}`", head.path));
        return reject(state, call_id, &err).await;
    };

    let wire = match state.shared.registry.resolve(command) {
        Ok(Binding::Local(binding)) => {
            if let Some(requested) = head.shape {
                if requested != binding.shape() {
                    let err = DispatchError::shape_mismatch(command, requested, binding.shape());
                    return reject(state, call_id, &err).await;
                }
            }
            binding.wire()
        }
        // A server only runs its own handlers; it never forwards.
        Ok(Binding::Remote(_)) | Err(_) => {
            debug!(call_id, command, "no local handler");
            let err = DispatchError::UnregisteredCommand(command.to_string());
            return reject(state, call_id, &err).await;
        }
    };

    let call_token = state.token.child_token();
    let options = CallOptions {
        timeout: head.timeout_ms.map(Duration::from_millis),
        metadata: head.metadata,
    };
    let ctx = ExecutionContext::with_token(call_token.clone(), options);
    let (tx, rx) = mpsc::channel(CALL_QUEUE_CAPACITY);
    let credit = flow::initial_credit();
    state.calls.lock().insert(
        call_id,
        CallEntry {
            inbound: Some(tx),
            cancel: call_token,
            credit: credit.clone(),
        },
    );

    let call = ServerCall {
        call_id,
        command: command.to_string(),
        writer: state.writer.clone(),
        inbound: rx,
        credit,
        deadline: ctx.deadline(),
        ctx,
        codec: state.shared.codec,
    };
    debug!(call_id, command, "call opened");

    let semaphore = state.semaphore.clone();
    let calls = state.calls.clone();
    let writer = state.writer.clone();
    let command = command.to_string();
    tokio::spawn(async move {
        // Held until the call completes.
        let _permit = match semaphore.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => return,
        };
        if AssertUnwindSafe(wire.serve(call)).catch_unwind().await.is_err() {
            send_panic_trailer(&writer, call_id, &command).await;
        }
        calls.lock().remove(&call_id);
    });
    Ok(())
}

/// Answer an OPEN that cannot be served with a failing trailer.
async fn reject(state: &ConnectionState, call_id: u32, err: &DispatchError) -> Result<()> {
    debug!(call_id, error = %err, "rejecting call");
    let trailer = Trailer::from_error(err, Default::default()).encode()?;
    state
        .writer
        .send(OutboundFrame::new(
            kind::TRAILER,
            flags::END_STREAM,
            call_id,
            Bytes::from(trailer),
        )?)
        .await?;
    Ok(())
}

async fn feed(state: &ConnectionState, frame: Frame) -> Result<()> {
    let call_id = frame.call_id();
    {
        let mut table = state.calls.lock();
        let Some(entry) = table.get_mut(&call_id) else {
            debug!(call_id, "DATA for unknown or finished call");
            return Ok(());
        };
        let Some(tx) = entry.inbound.as_ref() else {
            debug!(call_id, "DATA after end of input");
            return Ok(());
        };

        if frame.is_eos_marker() {
            entry.inbound = None;
            return Ok(());
        }
        let end = frame.is_end_stream();
        match tx.try_send(frame) {
            // A closed queue means the call task has finished already.
            Ok(()) | Err(mpsc::error::TrySendError::Closed(_)) => {
                if end {
                    entry.inbound = None;
                }
                return Ok(());
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!(call_id, "client overran the stream window, failing the call");
                if let Some(entry) = table.remove(&call_id) {
                    entry.cancel.cancel();
                }
            }
        }
    }

    let err = DispatchError::Protocol("stream window exceeded".to_string());
    reject(state, call_id, &err).await
}

fn grant(state: &ConnectionState, frame: &Frame) {
    let call_id = frame.call_id();
    let table = state.calls.lock();
    let Some(entry) = table.get(&call_id) else {
        debug!(call_id, "WINDOW for unknown or finished call");
        return;
    };
    match flow::decode_increment(frame.payload()) {
        Ok(increment) => {
            if !flow::add_credit(&entry.credit, increment) {
                warn!(call_id, increment, "ignoring WINDOW beyond the credit limit");
            }
        }
        Err(e) => warn!(call_id, error = %e, "ignoring malformed WINDOW"),
    }
}

fn cancel(state: &ConnectionState, call_id: u32) {
    if let Some(entry) = state.calls.lock().remove(&call_id) {
        debug!(call_id, "call cancelled by client");
        entry.cancel.cancel();
    }
}
