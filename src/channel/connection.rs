//! One established, handshaken connection and the calls multiplexed on it.
//!
//! A reader task demultiplexes inbound DATA and TRAILER frames by call id
//! into per-call queues. Outbound frames go through the shared writer task.
//! When the connection ends every queue is dropped, so each in-flight call
//! observes the loss on its next receive.
//!
//! Queues are bounded by the stream window: the server may only have
//! [`INITIAL_WINDOW`] items outstanding per call, and the caller returns
//! credit as its consumer takes items. A server that overruns the window
//! fails that call alone.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::codec::{Encoded, MsgPackCodec};
use crate::command::CallShape;
use crate::error::{DispatchError, Result, TransportError};
use crate::protocol::flow::{self, WindowGrant, INITIAL_WINDOW};
use crate::protocol::{flags, kind, CallHead, Frame, FrameBuffer, Hello, CONTROL_CALL_ID};
use crate::transport::BoxedStream;
use crate::writer::{spawn_writer_task, OutboundFrame, WriterConfig, WriterHandle};

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A full window of items plus the result and the trailer.
const CALL_QUEUE_CAPACITY: usize = INITIAL_WINDOW as usize + 2;

struct CallSlot {
    inbound: mpsc::Sender<Frame>,
    /// Credit for stream items sent to the server.
    credit: Arc<Semaphore>,
}

impl CallSlot {
    /// Wake any sender waiting for credit; none will arrive.
    fn close(self) {
        self.credit.close();
    }
}

type CallTable = Mutex<HashMap<u32, CallSlot>>;

pub(crate) struct Connection {
    writer: WriterHandle,
    calls: Arc<CallTable>,
    next_call_id: AtomicU32,
    commands: HashMap<String, CallShape>,
    /// Largest payload the server reads.
    max_payload: usize,
    closed: CancellationToken,
}

impl Connection {
    /// Run the HELLO exchange on `stream` and start the reader and writer tasks.
    pub(crate) async fn establish(
        stream: BoxedStream,
        writer_config: WriterConfig,
        handshake_timeout: Duration,
    ) -> Result<Arc<Self>> {
        let (mut reader, write_half) = tokio::io::split(stream);
        let (writer, _writer_task) = spawn_writer_task(write_half, writer_config);

        let hello = MsgPackCodec::encode(&Hello::client())?;
        writer
            .send(OutboundFrame::new(
                kind::HELLO,
                0,
                CONTROL_CALL_ID,
                Bytes::from(hello),
            )?)
            .await?;

        let mut buffer = FrameBuffer::new();
        let mut pending = Vec::new();
        let reply = tokio::time::timeout(
            handshake_timeout,
            read_hello(&mut reader, &mut buffer, &mut pending),
        )
        .await
        .map_err(|_| TransportError::ConnectTimeout(handshake_timeout))??;

        reply.check_compatible()?;
        let max_payload = reply.payload_limit() as usize;
        debug!(
            version = %reply.version,
            commands = reply.commands.len(),
            max_payload,
            "channel handshake complete"
        );

        let connection = Arc::new(Self {
            writer,
            calls: Arc::new(Mutex::new(HashMap::new())),
            next_call_id: AtomicU32::new(1),
            commands: reply
                .commands
                .into_iter()
                .map(|c| (c.name, c.shape))
                .collect(),
            max_payload,
            closed: CancellationToken::new(),
        });

        tokio::spawn(read_loop(
            reader,
            buffer,
            pending,
            connection.calls.clone(),
            connection.closed.clone(),
        ));

        Ok(connection)
    }

    /// Shape the server advertised for `command`, if any.
    pub(crate) fn shape_of(&self, command: &str) -> Option<CallShape> {
        self.commands.get(command).copied()
    }

    /// Fail unless `encoded` fits in a frame the server accepts.
    pub(crate) fn check_payload(&self, encoded: &Encoded) -> Result<()> {
        Ok(encoded.check_size(self.max_payload)?)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.is_cancelled() || self.writer.is_closed()
    }

    pub(crate) fn close(&self) {
        self.closed.cancel();
    }

    /// Allocate a call id and register its inbound queue.
    pub(crate) fn open_call(&self) -> Result<Call> {
        let id = loop {
            let id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
            if id != CONTROL_CALL_ID {
                break id;
            }
        };

        let (tx, rx) = mpsc::channel(CALL_QUEUE_CAPACITY);
        let credit = flow::initial_credit();
        self.calls.lock().insert(
            id,
            CallSlot {
                inbound: tx,
                credit: credit.clone(),
            },
        );

        // The reader clears the table after marking the connection closed,
        // so a call inserted before that point is always cleared with it.
        if self.is_closed() {
            self.calls.lock().remove(&id);
            return Err(TransportError::ConnectionClosed.into());
        }

        Ok(Call {
            id,
            writer: self.writer.clone(),
            calls: self.calls.clone(),
            inbound: rx,
            credit,
            grant: WindowGrant::new(),
            max_payload: self.max_payload,
            received_any: false,
            finished: false,
        })
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

async fn read_hello<R>(
    reader: &mut R,
    buffer: &mut FrameBuffer,
    pending: &mut Vec<Frame>,
) -> Result<Hello>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            return Err(TransportError::ConnectionClosed.into());
        }

        let mut frames = buffer.push(&buf[..n])?.into_iter();
        if let Some(first) = frames.next() {
            if first.kind() != kind::HELLO {
                return Err(DispatchError::Protocol(format!(
                    "expected HELLO, got {}",
                    kind::name(first.kind())
                )));
            }
            pending.extend(frames);
            return Ok(MsgPackCodec::decode(first.payload())?);
        }
    }
}

async fn read_loop<R>(
    mut reader: R,
    mut buffer: FrameBuffer,
    pending: Vec<Frame>,
    calls: Arc<CallTable>,
    closed: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    for frame in pending {
        route(&calls, frame);
    }

    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = tokio::select! {
            _ = closed.cancelled() => break,
            read = reader.read(&mut buf) => match read {
                Ok(0) => {
                    debug!("server closed the connection");
                    break;
                }
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "connection read failed");
                    break;
                }
            },
        };

        match buffer.push(&buf[..n]) {
            Ok(frames) => {
                for frame in frames {
                    route(&calls, frame);
                }
            }
            Err(e) => {
                warn!(error = %e, "protocol error from server, dropping connection");
                break;
            }
        }
    }

    closed.cancel();
    let in_flight = {
        let mut table = calls.lock();
        let n = table.len();
        table.drain().for_each(|(_, slot)| slot.close());
        n
    };
    if in_flight > 0 {
        debug!(in_flight, "connection lost with calls in flight");
    }
}

fn route(calls: &CallTable, frame: Frame) {
    let call_id = frame.call_id();
    match frame.kind() {
        kind::DATA | kind::TRAILER => {
            let mut table = calls.lock();
            let Some(slot) = table.get(&call_id) else {
                debug!(call_id, "frame for unknown or finished call");
                return;
            };
            let is_trailer = frame.is_trailer();
            let finished = match slot.inbound.try_send(frame) {
                Ok(()) => is_trailer,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(call_id, "server overran the stream window, failing the call");
                    true
                }
                Err(mpsc::error::TrySendError::Closed(_)) => true,
            };
            if finished {
                if let Some(slot) = table.remove(&call_id) {
                    slot.close();
                }
            }
        }
        kind::WINDOW => {
            let table = calls.lock();
            let Some(slot) = table.get(&call_id) else {
                return;
            };
            match flow::decode_increment(frame.payload()) {
                Ok(increment) => {
                    if !flow::add_credit(&slot.credit, increment) {
                        warn!(call_id, increment, "ignoring WINDOW beyond the credit limit");
                    }
                }
                Err(e) => warn!(call_id, error = %e, "ignoring malformed WINDOW"),
            }
        }
        other => warn!(
            call_id,
            kind = kind::name(other),
            "unexpected frame from server"
        ),
    }
}

/// Caller side of one multiplexed call.
///
/// Dropping an unfinished call sends CANCEL so the server stops work on it.
pub(crate) struct Call {
    id: u32,
    writer: WriterHandle,
    calls: Arc<CallTable>,
    inbound: mpsc::Receiver<Frame>,
    /// Credit for client-stream items.
    credit: Arc<Semaphore>,
    /// Credit owed back for server-stream items.
    grant: WindowGrant,
    max_payload: usize,
    received_any: bool,
    finished: bool,
}

impl Call {
    #[cfg(test)]
    pub(crate) fn id(&self) -> u32 {
        self.id
    }

    pub(crate) async fn send_open(&self, head: &CallHead) -> Result<()> {
        let payload = MsgPackCodec::encode(head)?;
        self.writer
            .send(OutboundFrame::new(kind::OPEN, 0, self.id, Bytes::from(payload))?)
            .await?;
        Ok(())
    }

    /// Send one encoded value.
    pub(crate) async fn send_data(&self, encoded: &Encoded, end_stream: bool) -> Result<()> {
        encoded.check_size(self.max_payload)?;
        let mut frame_flags = 0;
        if end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if encoded.compressed {
            frame_flags |= flags::COMPRESSED;
        }
        self.writer
            .send(OutboundFrame::new(
                kind::DATA,
                frame_flags,
                self.id,
                encoded.bytes.clone(),
            )?)
            .await?;
        Ok(())
    }

    /// Send one client-stream item once the server has granted credit for it.
    ///
    /// Returns `false` without sending when credit can no longer arrive: the
    /// server ended the call or the connection is gone.
    pub(crate) async fn send_item(&self, encoded: &Encoded) -> Result<bool> {
        encoded.check_size(self.max_payload)?;
        match self.credit.acquire().await {
            Ok(permit) => permit.forget(),
            Err(_) => return Ok(false),
        }
        self.send_data(encoded, false).await?;
        Ok(true)
    }

    /// Hand credit back once the consumer has taken a server-stream item.
    pub(crate) async fn item_consumed(&mut self) {
        let Some(increment) = self.grant.consume() else {
            return;
        };
        if self.finished {
            return;
        }
        if let Err(e) = self
            .writer
            .send(OutboundFrame::window(self.id, increment))
            .await
        {
            // The read side reports the loss.
            debug!(call_id = self.id, error = %e, "could not send WINDOW");
        }
    }

    /// Mark the end of the caller's input with an empty END_STREAM DATA frame.
    pub(crate) async fn end_stream(&self) -> Result<()> {
        self.writer
            .send(OutboundFrame::empty(kind::DATA, flags::END_STREAM, self.id))
            .await?;
        Ok(())
    }

    /// Next frame from the server.
    ///
    /// Connection loss before any frame is `ConnectionClosed` (retryable);
    /// after the first frame it is `ResponseInterrupted`.
    pub(crate) async fn recv(&mut self) -> Result<Frame> {
        match self.inbound.recv().await {
            Some(frame) => Ok(self.observe(frame)),
            None => Err(self.lost()),
        }
    }

    /// Frame already queued, without waiting.
    pub(crate) fn try_recv(&mut self) -> Result<Option<Frame>> {
        match self.inbound.try_recv() {
            Ok(frame) => Ok(Some(self.observe(frame))),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(self.lost()),
        }
    }

    fn observe(&mut self, frame: Frame) -> Frame {
        self.received_any = true;
        if frame.is_trailer() {
            self.finished = true;
        }
        frame
    }

    fn lost(&mut self) -> DispatchError {
        self.finished = true;
        if self.received_any {
            TransportError::ResponseInterrupted.into()
        } else {
            TransportError::ConnectionClosed.into()
        }
    }

    /// Abort the call on the server.
    pub(crate) fn cancel(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.calls.lock().remove(&self.id);
        if let Err(e) = self
            .writer
            .try_send(OutboundFrame::empty(kind::CANCEL, 0, self.id))
        {
            debug!(call_id = self.id, error = %e, "could not send CANCEL");
        }
    }
}

impl Drop for Call {
    fn drop(&mut self) {
        self.cancel();
        self.calls.lock().remove(&self.id);
    }
}
