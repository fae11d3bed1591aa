//! Stream endpoints handed to streaming handlers.
//!
//! - [`StreamSink`] - where a server-streaming handler pushes items
//! - [`ChunkStream`] - the caller's items, as seen by a client-streaming handler
//!
//! Both work the same whether the caller is in-process or remote.

use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use serde::Serialize;
use std::sync::Arc;

use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::codec::Codec;
use crate::error::{DispatchError, Result};
use crate::protocol::{flags, kind};
use crate::writer::{OutboundFrame, WriterHandle};

/// Remote end of a server stream: items become DATA frames on a call.
///
/// Each item spends one credit of the caller's window; `send` waits while
/// the caller's consumer is behind.
pub(crate) struct FrameSink {
    pub(crate) writer: WriterHandle,
    pub(crate) call_id: u32,
    pub(crate) codec: Codec,
    pub(crate) cancel: CancellationToken,
    pub(crate) credit: Arc<Semaphore>,
}

enum SinkInner<T> {
    Local(mpsc::Sender<Result<T>>),
    Remote(FrameSink),
}

/// Output side of a server-streaming call.
///
/// Items reach the caller in the order they are sent. `send` fails with
/// [`DispatchError::Cancelled`] once the caller has stopped listening;
/// handlers should return at that point.
pub struct StreamSink<T> {
    inner: SinkInner<T>,
    sent: u64,
    _item: PhantomData<fn(T)>,
}

impl<T: Serialize + Send + 'static> StreamSink<T> {
    pub(crate) fn local(tx: mpsc::Sender<Result<T>>) -> Self {
        Self {
            inner: SinkInner::Local(tx),
            sent: 0,
            _item: PhantomData,
        }
    }

    pub(crate) fn remote(sink: FrameSink) -> Self {
        Self {
            inner: SinkInner::Remote(sink),
            sent: 0,
            _item: PhantomData,
        }
    }

    /// Send one item to the caller.
    pub async fn send(&mut self, item: T) -> Result<()> {
        match &self.inner {
            SinkInner::Local(tx) => tx
                .send(Ok(item))
                .await
                .map_err(|_| DispatchError::Cancelled)?,
            SinkInner::Remote(sink) => {
                if sink.cancel.is_cancelled() {
                    return Err(DispatchError::Cancelled);
                }
                let encoded = sink.codec.encode(&item)?;
                let permit = tokio::select! {
                    biased;
                    _ = sink.cancel.cancelled() => return Err(DispatchError::Cancelled),
                    permit = sink.credit.acquire() => permit.map_err(|_| DispatchError::Cancelled)?,
                };
                permit.forget();
                let frame_flags = if encoded.compressed {
                    flags::COMPRESSED
                } else {
                    0
                };
                sink.writer
                    .send(OutboundFrame::new(
                        kind::DATA,
                        frame_flags,
                        sink.call_id,
                        encoded.bytes,
                    )?)
                    .await?;
            }
        }
        self.sent += 1;
        Ok(())
    }

    /// Number of items sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// Whether the caller has gone away.
    pub fn is_closed(&self) -> bool {
        match &self.inner {
            SinkInner::Local(tx) => tx.is_closed(),
            SinkInner::Remote(sink) => sink.cancel.is_cancelled() || sink.writer.is_closed(),
        }
    }
}

/// Input side of a client-streaming call.
///
/// Yields the caller's items in order and ends after the caller's
/// end-of-stream. An item the server could not decode arrives as an `Err`.
pub struct ChunkStream<T> {
    rx: mpsc::Receiver<Result<T>>,
}

impl<T> ChunkStream<T> {
    pub(crate) fn new(rx: mpsc::Receiver<Result<T>>) -> Self {
        Self { rx }
    }

    /// Next item, or `None` after end-of-stream.
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.rx.recv().await
    }
}

impl<T> Stream for ChunkStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
