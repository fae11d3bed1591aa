//! Channel - one logical connection to a remote handler server.
//!
//! A [`Channel`] is cheap to clone and shared by every remote binding that
//! targets its address. It connects lazily on first use, reconnects after a
//! connection is lost, and multiplexes any number of concurrent calls over
//! one connection. Only connecting is serialized.
//!
//! Retry scope per call shape:
//! - unary: the whole call, as long as no response frame has arrived
//! - server-streaming: connect, send and the wait for the first frame
//! - client-streaming: connect, open and the command frame; input items are
//!   not replayable

mod connection;
mod options;
mod retry;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{Codec, Encoded};
use crate::command::{path_for, CallShape};
use crate::context::CallOptions;
use crate::error::{DispatchError, Result};
use crate::protocol::{Frame, Trailer};
use crate::transport::{Connector, DefaultConnector};

pub(crate) use connection::Call;
use connection::Connection;
pub use options::{ChannelOptions, TlsOptions, DEFAULT_CONNECT_TIMEOUT};
pub use retry::{BackoffPolicy, DEFAULT_MAX_RETRY_ATTEMPTS};

/// Whole milliseconds in `d`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

/// Reply to a unary or client-streaming call.
#[derive(Debug)]
pub(crate) struct UnaryReply {
    /// The result frame, present for successful calls.
    pub data: Option<Frame>,
    pub trailer: Trailer,
}

struct ChannelInner {
    address: String,
    options: ChannelOptions,
    codec: Codec,
    connection: tokio::sync::Mutex<Option<Arc<Connection>>>,
    bound: RwLock<BTreeSet<&'static str>>,
}

/// Handle to a remote handler server.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel for `address`. No connection is made until first use.
    pub fn open(address: impl Into<String>, options: ChannelOptions) -> Self {
        let codec = Codec::new(options.compression);
        Self {
            inner: Arc::new(ChannelInner {
                address: address.into(),
                options,
                codec,
                connection: tokio::sync::Mutex::new(None),
                bound: RwLock::new(BTreeSet::new()),
            }),
        }
    }

    /// Target address.
    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Channel options.
    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }

    pub(crate) fn codec(&self) -> &Codec {
        &self.inner.codec
    }

    /// Connect now instead of on first call, retrying transient failures.
    pub async fn connect(&self) -> Result<()> {
        let options = &self.inner.options;
        retry::with_retry(
            &options.backoff,
            options.max_retry_attempts,
            &CancellationToken::new(),
            "connect",
            |_| self.connection(),
        )
        .await
        .map(drop)
    }

    /// Whether a live connection exists.
    pub async fn is_connected(&self) -> bool {
        match &*self.inner.connection.lock().await {
            Some(conn) => !conn.is_closed(),
            None => false,
        }
    }

    /// Drop the current connection. In-flight calls fail; the next call reconnects.
    pub async fn close(&self) {
        if let Some(conn) = self.inner.connection.lock().await.take() {
            debug!(address = %self.inner.address, "closing channel");
            conn.close();
        }
    }

    /// Command identities currently bound to this channel.
    pub fn bound_commands(&self) -> Vec<&'static str> {
        self.inner.bound.read().iter().copied().collect()
    }

    pub(crate) fn bind(&self, command: &'static str) {
        self.inner.bound.write().insert(command);
    }

    pub(crate) fn unbind(&self, command: &'static str) {
        self.inner.bound.write().remove(command);
    }

    /// Whether two handles refer to the same channel.
    pub fn same_channel(&self, other: &Channel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    async fn connection(&self) -> Result<Arc<Connection>> {
        let mut slot = self.inner.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            debug!(address = %self.inner.address, "connection lost, reconnecting");
        }

        let options = &self.inner.options;
        let stream = match &options.connector {
            Some(connector) => connector.connect(&self.inner.address, options).await?,
            None => DefaultConnector.connect(&self.inner.address, options).await?,
        };
        let conn = Connection::establish(
            stream,
            options.writer.clone(),
            options.connect_timeout_duration(),
        )
        .await?;

        debug!(address = %self.inner.address, "channel connected");
        *slot = Some(conn.clone());
        Ok(conn)
    }

    /// Open a call for `payload`, the command value sent next.
    ///
    /// A payload over the server's frame limit fails here, before anything
    /// is queued on the shared connection.
    async fn start_call(
        &self,
        command: &'static str,
        shape: CallShape,
        payload: &Encoded,
        call_options: &CallOptions,
    ) -> Result<Call> {
        let conn = self.connection().await?;
        conn.check_payload(payload)?;

        if let Some(advertised) = conn.shape_of(command) {
            if advertised != shape {
                return Err(DispatchError::shape_mismatch(command, shape, advertised));
            }
        }

        let mut metadata = self.inner.options.metadata.clone();
        metadata.extend(call_options.metadata.clone());

        let call = conn.open_call()?;
        call.send_open(&crate::protocol::CallHead {
            path: path_for(command),
            shape: Some(shape),
            metadata,
            timeout_ms: call_options.timeout.map(saturating_millis),
        })
        .await?;
        Ok(call)
    }

    async fn retrying<T, F, Fut>(
        &self,
        command: &'static str,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let options = &self.inner.options;
        retry::with_retry(&options.backoff, options.max_retry_attempts, cancel, command, op).await
    }

    /// Unary call: one value out, one result frame plus trailer back.
    pub(crate) async fn unary(
        &self,
        command: &'static str,
        payload: &Encoded,
        call_options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<UnaryReply> {
        self.retrying(command, cancel, move |attempt| async move {
            debug!(attempt, command, "sending unary call");
            let mut call = self
                .start_call(command, CallShape::Unary, payload, call_options)
                .await?;
            call.send_data(payload, true).await?;
            await_reply(&mut call).await
        })
        .await
    }

    /// Server-streaming call. Returns the call and its first inbound frame.
    pub(crate) async fn server_streaming(
        &self,
        command: &'static str,
        payload: &Encoded,
        call_options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<(Call, Frame)> {
        self.retrying(command, cancel, move |attempt| async move {
            debug!(attempt, command, "opening server stream");
            let mut call = self
                .start_call(command, CallShape::ServerStreaming, payload, call_options)
                .await?;
            call.send_data(payload, true).await?;
            let first = call.recv().await?;
            Ok((call, first))
        })
        .await
    }

    /// Client-streaming call, opened with the command frame sent.
    pub(crate) async fn client_streaming(
        &self,
        command: &'static str,
        payload: &Encoded,
        call_options: &CallOptions,
        cancel: &CancellationToken,
    ) -> Result<Call> {
        self.retrying(command, cancel, move |attempt| async move {
            debug!(attempt, command, "opening client stream");
            let call = self
                .start_call(command, CallShape::ClientStreaming, payload, call_options)
                .await?;
            call.send_data(payload, false).await?;
            Ok(call)
        })
        .await
    }
}

/// Collect the single result frame and trailer of a call.
pub(crate) async fn await_reply(call: &mut Call) -> Result<UnaryReply> {
    let mut data = None;
    loop {
        let frame = call.recv().await?;
        if frame.is_trailer() {
            let trailer = crate::codec::MsgPackCodec::decode(frame.payload())?;
            return Ok(UnaryReply { data, trailer });
        }
        if data.is_some() {
            return Err(DispatchError::Protocol(
                "more than one result frame for a single-result call".to_string(),
            ));
        }
        data = Some(frame);
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("address", &self.inner.address)
            .field("bound", &*self.inner.bound.read())
            .finish()
    }
}

/// One channel per address.
///
/// The first `get_or_open` for an address decides its options; later calls
/// reuse that channel.
#[derive(Debug, Default)]
pub struct ChannelPool {
    channels: RwLock<HashMap<String, Channel>>,
}

impl ChannelPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel for `address`, created with `options` if absent.
    pub fn get_or_open(&self, address: &str, options: ChannelOptions) -> Channel {
        if let Some(channel) = self.channels.read().get(address) {
            return channel.clone();
        }
        self.channels
            .write()
            .entry(address.to_string())
            .or_insert_with(|| Channel::open(address, options))
            .clone()
    }

    /// Existing channel for `address`.
    pub fn get(&self, address: &str) -> Option<Channel> {
        self.channels.read().get(address).cloned()
    }

    /// Close and forget every channel.
    pub async fn close_all(&self) {
        let channels: Vec<Channel> = self.channels.write().drain().map(|(_, c)| c).collect();
        for channel in channels {
            channel.close().await;
        }
    }
}
