//! Caller-side handles for streaming calls.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::BoxStream;
use futures::{Stream, StreamExt};

use super::local::LocalClientStream;
use super::remote::RemoteClientStream;
use crate::error::Result;

/// Items produced by a server-streaming call.
///
/// Lazy: nothing is resolved or sent until the first poll. Items arrive in
/// the order the handler produced them. A failure is yielded as the last
/// item. Dropping the stream early cancels the call.
pub struct ResultStream<T> {
    inner: BoxStream<'static, Result<T>>,
}

impl<T> ResultStream<T> {
    pub(crate) fn new(inner: BoxStream<'static, Result<T>>) -> Self {
        Self { inner }
    }

    /// Next item, or `None` once the call has completed.
    pub async fn next(&mut self) -> Option<Result<T>> {
        self.inner.next().await
    }

    /// Drain the stream, stopping at the first error.
    pub async fn collect_all(mut self) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.inner.next().await {
            items.push(item?);
        }
        Ok(items)
    }
}

impl<T> Stream for ResultStream<T> {
    type Item = Result<T>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.poll_next_unpin(cx)
    }
}

impl<T> std::fmt::Debug for ResultStream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultStream").finish_non_exhaustive()
    }
}

pub(crate) enum ClientStreamInner<I, O> {
    Local(LocalClientStream<I, O>),
    Remote(RemoteClientStream<I, O>),
}

/// An open client-streaming call.
///
/// Send items with [`send`](Self::send), then call [`finish`](Self::finish)
/// to end the input and receive the single result. The handler's result is
/// never observed before the end of input has been sent. Dropping the call
/// without finishing cancels it.
pub struct ClientStreamCall<I, O> {
    inner: ClientStreamInner<I, O>,
    sent: u64,
}

impl<I, O> ClientStreamCall<I, O>
where
    I: serde::Serialize + Send + 'static,
    O: serde::de::DeserializeOwned + Send + 'static,
{
    pub(crate) fn new(inner: ClientStreamInner<I, O>) -> Self {
        Self { inner, sent: 0 }
    }

    /// Send one input item.
    pub async fn send(&mut self, item: I) -> Result<()> {
        match &mut self.inner {
            ClientStreamInner::Local(local) => local.send(item).await?,
            ClientStreamInner::Remote(remote) => remote.send(item).await?,
        }
        self.sent += 1;
        Ok(())
    }

    /// Number of items sent so far.
    pub fn sent(&self) -> u64 {
        self.sent
    }

    /// End the input and wait for the result.
    pub async fn finish(self) -> Result<O> {
        match self.inner {
            ClientStreamInner::Local(local) => local.finish().await,
            ClientStreamInner::Remote(remote) => remote.finish().await,
        }
    }
}

impl<I, O> std::fmt::Debug for ClientStreamCall<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let target = match &self.inner {
            ClientStreamInner::Local(_) => "local",
            ClientStreamInner::Remote(_) => "remote",
        };
        f.debug_struct("ClientStreamCall")
            .field("target", &target)
            .field("sent", &self.sent)
            .finish()
    }
}
