//! Dedicated writer task per connection.
//!
//! Every call on a connection (and the reader task, for control replies)
//! sends frames through a cloneable [`WriterHandle`]. One task owns the write
//! half, drains the queue in batches and writes each batch with vectored
//! writes.
//!
//! ```text
//! Call 1 ─┐
//! Call 2 ─┼─► WriterHandle ─► queue ─► writer task ─► socket
//! Call N ─┘
//! ```
//!
//! Backpressure is a budget of `max_pending_frames` credits. A frame takes one
//! credit when queued and returns it once written, so a stalled peer makes
//! senders wait (up to `backpressure_timeout`) instead of growing the queue.
//!
//! Frames of one call are enqueued in order by that call, so they reach the
//! wire in order. Frames of different calls may interleave.

use std::io::IoSlice;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;

use crate::error::{SerializationError, TransportError};
use crate::protocol::{flow, kind, Header, HEADER_SIZE};

/// Frames a connection may have queued before senders wait.
pub const DEFAULT_MAX_PENDING_FRAMES: usize = 1024;

/// Bound of the queue feeding the writer task.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// How long `send` waits for queue credit before failing.
pub const DEFAULT_BACKPRESSURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Maximum frames written per batch.
const MAX_BATCH_SIZE: usize = 64;

type WriteResult<T> = std::result::Result<T, TransportError>;

/// A frame ready to be written.
#[derive(Debug)]
pub struct OutboundFrame {
    /// Encoded header.
    pub header: [u8; HEADER_SIZE],
    /// Payload bytes (empty for CANCEL and end-of-stream markers).
    pub payload: Bytes,
}

impl OutboundFrame {
    /// Build a frame; the header length is taken from `payload`.
    ///
    /// Fails if the payload length does not fit the 32-bit length field.
    #[inline]
    pub fn new(
        kind: u8,
        flags: u8,
        call_id: u32,
        payload: Bytes,
    ) -> Result<Self, SerializationError> {
        let length = u32::try_from(payload.len()).map_err(|_| SerializationError::PayloadTooLarge {
            size: payload.len(),
            limit: u32::MAX as usize,
        })?;
        Ok(Self {
            header: Header::new(kind, flags, call_id, length).encode(),
            payload,
        })
    }

    /// Build a frame with no payload.
    #[inline]
    pub fn empty(kind: u8, flags: u8, call_id: u32) -> Self {
        Self {
            header: Header::new(kind, flags, call_id, 0).encode(),
            payload: Bytes::new(),
        }
    }

    /// WINDOW frame granting `increment` more stream items on `call_id`.
    pub fn window(call_id: u32, increment: u32) -> Self {
        Self {
            header: Header::new(kind::WINDOW, 0, call_id, 4).encode(),
            payload: Bytes::copy_from_slice(&flow::encode_increment(increment)),
        }
    }

    /// Bytes on the wire, header included.
    #[inline]
    pub fn size(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// Writer task settings, shared by channels and the server.
#[derive(Debug, Clone)]
pub struct WriterConfig {
    /// Frames that may be queued or in flight before senders wait.
    pub max_pending_frames: usize,
    /// Capacity of the queue feeding the writer task.
    pub channel_capacity: usize,
    /// How long a sender waits for a credit before failing.
    pub backpressure_timeout: Duration,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            max_pending_frames: DEFAULT_MAX_PENDING_FRAMES,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            backpressure_timeout: DEFAULT_BACKPRESSURE_TIMEOUT,
        }
    }
}

/// A queued frame and the credit it holds until written.
struct Queued {
    frame: OutboundFrame,
    _credit: OwnedSemaphorePermit,
}

/// Cloneable sender side of a connection's writer task.
#[derive(Clone)]
pub struct WriterHandle {
    tx: mpsc::Sender<Queued>,
    credits: Arc<Semaphore>,
    max_pending: usize,
    timeout: Duration,
}

impl WriterHandle {
    /// Queue a frame, waiting up to the backpressure timeout for room.
    pub async fn send(&self, frame: OutboundFrame) -> WriteResult<()> {
        let credit = tokio::time::timeout(self.timeout, self.credits.clone().acquire_owned())
            .await
            .map_err(|_| TransportError::BackpressureTimeout)?
            .map_err(|_| TransportError::ConnectionClosed)?;

        self.tx
            .send(Queued {
                frame,
                _credit: credit,
            })
            .await
            .map_err(|_| TransportError::ConnectionClosed)
    }

    /// Queue a frame without waiting.
    ///
    /// Used from `Drop` paths (CANCEL on an abandoned call) where awaiting is
    /// not possible.
    pub fn try_send(&self, frame: OutboundFrame) -> WriteResult<()> {
        let credit = self
            .credits
            .clone()
            .try_acquire_owned()
            .map_err(|_| TransportError::BackpressureTimeout)?;

        self.tx
            .try_send(Queued {
                frame,
                _credit: credit,
            })
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => TransportError::BackpressureTimeout,
                mpsc::error::TrySendError::Closed(_) => TransportError::ConnectionClosed,
            })
    }

    /// Whether a sender would have to wait right now.
    #[inline]
    pub fn is_backpressure_active(&self) -> bool {
        self.credits.available_permits() == 0
    }

    /// Frames queued or being written.
    #[inline]
    pub fn pending_count(&self) -> usize {
        self.max_pending
            .saturating_sub(self.credits.available_permits())
    }

    /// Whether the writer task has stopped.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Start a writer task that owns `writer`.
///
/// The task ends cleanly when every handle is dropped, or with an error when
/// the underlying write fails.
pub fn spawn_writer_task<W>(
    writer: W,
    config: WriterConfig,
) -> (WriterHandle, JoinHandle<WriteResult<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
    let handle = WriterHandle {
        tx,
        credits: Arc::new(Semaphore::new(config.max_pending_frames)),
        max_pending: config.max_pending_frames,
        timeout: config.backpressure_timeout,
    };

    let task = tokio::spawn(async move {
        let result = writer_loop(rx, writer).await;
        if let Err(e) = &result {
            tracing::debug!(error = %e, "writer task stopped");
        }
        result
    });

    (handle, task)
}

async fn writer_loop<W>(mut rx: mpsc::Receiver<Queued>, mut writer: W) -> WriteResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);

    while rx.recv_many(&mut batch, MAX_BATCH_SIZE).await > 0 {
        let frames: Vec<&OutboundFrame> = batch.iter().map(|q| &q.frame).collect();
        write_batch(&mut writer, &frames).await?;
        // Credits return here.
        batch.clear();
    }

    let _ = writer.shutdown().await;
    Ok(())
}

/// Write every frame of `batch`, resuming after partial vectored writes.
async fn write_batch<W>(writer: &mut W, batch: &[&OutboundFrame]) -> WriteResult<()>
where
    W: AsyncWrite + Unpin,
{
    let mut parts: Vec<&[u8]> = batch
        .iter()
        .flat_map(|frame| [&frame.header[..], &frame.payload[..]])
        .filter(|part| !part.is_empty())
        .collect();
    let mut next = 0;

    while next < parts.len() {
        let mut written = {
            let slices: Vec<IoSlice<'_>> = parts[next..].iter().map(|p| IoSlice::new(p)).collect();
            writer.write_vectored(&slices).await?
        };
        if written == 0 {
            return Err(TransportError::Io(std::io::ErrorKind::WriteZero.into()));
        }

        while written > 0 {
            let part = parts[next];
            if written >= part.len() {
                written -= part.len();
                next += 1;
            } else {
                parts[next] = &part[written..];
                written = 0;
            }
        }
    }

    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{flags, kind, FrameBuffer};
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{duplex, AsyncReadExt};

    fn data_frame(call_id: u32, payload: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(kind::DATA, 0, call_id, Bytes::from_static(payload)).unwrap()
    }

    /// Accepts at most three bytes per write.
    #[derive(Default)]
    struct Trickle(Vec<u8>);

    impl AsyncWrite for Trickle {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<std::io::Result<usize>> {
            let n = buf.len().min(3);
            self.0.extend_from_slice(&buf[..n]);
            Poll::Ready(Ok(n))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[test]
    fn test_outbound_frame_header_length() {
        let frame = data_frame(42, b"hello");
        let header = Header::decode(&frame.header).unwrap();

        assert_eq!(header.payload_length, 5);
        assert_eq!(header.call_id, 42);
        assert_eq!(frame.size(), HEADER_SIZE + 5);
    }

    #[tokio::test]
    async fn test_partial_writes_resume() {
        let frames = [
            data_frame(1, b"hello"),
            OutboundFrame::empty(kind::CANCEL, 0, 2),
            data_frame(3, b"abc"),
        ];
        let batch: Vec<&OutboundFrame> = frames.iter().collect();

        let mut out = Trickle::default();
        write_batch(&mut out, &batch).await.unwrap();

        let mut expected = Vec::new();
        for frame in &frames {
            expected.extend_from_slice(&frame.header);
            expected.extend_from_slice(&frame.payload);
        }
        assert_eq!(out.0, expected);

        let parsed = FrameBuffer::new().push(&out.0).unwrap();
        assert_eq!(parsed.len(), 3);
        assert_eq!(parsed[2].payload(), b"abc");
    }

    #[tokio::test]
    async fn test_frames_arrive_in_order() {
        let (client, mut server) = duplex(64 * 1024);
        let (handle, _task) = spawn_writer_task(client, WriterConfig::default());

        for i in 1..=10u32 {
            let payload = Bytes::copy_from_slice(&i.to_be_bytes());
            handle
                .send(OutboundFrame::new(kind::DATA, 0, i, payload).unwrap())
                .await
                .unwrap();
        }
        handle
            .send(OutboundFrame::empty(kind::DATA, flags::END_STREAM, 11))
            .await
            .unwrap();

        let mut parser = FrameBuffer::new();
        let mut frames = Vec::new();
        let mut buf = vec![0u8; 1024];
        while frames.len() < 11 {
            let n = server.read(&mut buf).await.unwrap();
            frames.extend(parser.push(&buf[..n]).unwrap());
        }

        let ids: Vec<u32> = frames.iter().map(|f| f.call_id()).collect();
        assert_eq!(ids, (1..=11).collect::<Vec<_>>());
        assert!(frames[10].is_eos_marker());
    }

    #[tokio::test]
    async fn test_credits_return_after_write() {
        let (client, mut server) = duplex(64 * 1024);
        let config = WriterConfig {
            max_pending_frames: 2,
            ..WriterConfig::default()
        };
        let (handle, _task) = spawn_writer_task(client, config);

        for i in 1..=6 {
            handle.send(data_frame(i, b"x")).await.unwrap();
        }

        let mut buf = vec![0u8; 1024];
        let mut parser = FrameBuffer::new();
        let mut received = 0;
        while received < 6 {
            let n = server.read(&mut buf).await.unwrap();
            received += parser.push(&buf[..n]).unwrap().len();
        }
        assert_eq!(handle.pending_count(), 0);
        assert!(!handle.is_backpressure_active());
    }

    #[tokio::test]
    async fn test_try_send_without_credit() {
        let (client, _server) = duplex(16);
        let config = WriterConfig {
            max_pending_frames: 0,
            ..WriterConfig::default()
        };
        let (handle, _task) = spawn_writer_task(client, config);

        assert!(handle.is_backpressure_active());
        let result = handle.try_send(OutboundFrame::empty(kind::CANCEL, 0, 1));
        assert!(matches!(result, Err(TransportError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_send_times_out_under_backpressure() {
        let (client, _server) = duplex(16);
        let config = WriterConfig {
            max_pending_frames: 0,
            channel_capacity: 4,
            backpressure_timeout: Duration::from_millis(20),
        };
        let (handle, _task) = spawn_writer_task(client, config);

        let result = handle.send(OutboundFrame::empty(kind::CANCEL, 0, 1)).await;
        assert!(matches!(result, Err(TransportError::BackpressureTimeout)));
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_handle_drop() {
        let (client, _server) = duplex(4096);
        let (handle, task) = spawn_writer_task(client, WriterConfig::default());

        drop(handle);

        assert!(task.await.unwrap().is_ok());
    }
}
