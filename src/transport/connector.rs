//! Outbound connection establishment.
//!
//! A [`Connector`] turns an address into a connected byte stream. The channel
//! layer runs the handshake and framing on top of whatever the connector
//! returns, so custom connectors can add TLS, proxies or in-memory pipes.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::address::Address;
use crate::channel::ChannelOptions;
use crate::error::TransportError;

/// Any bidirectional async byte stream.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Type-erased connected stream.
pub type BoxedStream = Pin<Box<dyn AsyncStream>>;

/// Dials an address.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establish a new connection to `address`.
    async fn connect(
        &self,
        address: &str,
        options: &ChannelOptions,
    ) -> Result<BoxedStream, TransportError>;
}

/// TCP and unix socket dialer.
///
/// Refuses TLS: a channel configured with TLS options needs a custom
/// connector that provides it.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConnector;

#[async_trait]
impl Connector for DefaultConnector {
    async fn connect(
        &self,
        address: &str,
        options: &ChannelOptions,
    ) -> Result<BoxedStream, TransportError> {
        if options.tls.is_some() {
            return Err(TransportError::TlsUnsupported);
        }

        let timeout = options.connect_timeout_duration();
        match Address::parse(address)? {
            Address::Tcp(host_port) => {
                let stream = with_timeout(timeout, TcpStream::connect(host_port)).await?;
                stream.set_nodelay(true)?;
                Ok(Box::pin(stream))
            }
            #[cfg(unix)]
            Address::Unix(path) => {
                let stream = with_timeout(timeout, tokio::net::UnixStream::connect(path)).await?;
                Ok(Box::pin(stream))
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(TransportError::InvalidAddress(address.to_string())),
        }
    }
}

async fn with_timeout<T>(
    timeout: Duration,
    connect: impl std::future::Future<Output = std::io::Result<T>>,
) -> Result<T, TransportError> {
    match tokio::time::timeout(timeout, connect).await {
        Ok(result) => Ok(result?),
        Err(_) => Err(TransportError::ConnectTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::TlsOptions;

    #[tokio::test]
    async fn test_refused_connection_is_transient() {
        // Bind and drop to get a port that nobody listens on.
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let err = DefaultConnector
            .connect(&format!("127.0.0.1:{port}"), &ChannelOptions::default())
            .await
            .err()
            .unwrap();
        assert!(err.is_transient(), "unexpected: {err:?}");
    }

    #[tokio::test]
    async fn test_tls_is_refused() {
        let options = ChannelOptions::default().tls(TlsOptions::default());
        let err = DefaultConnector
            .connect("127.0.0.1:1", &options)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::TlsUnsupported));
    }

    #[tokio::test]
    async fn test_invalid_address() {
        let err = DefaultConnector
            .connect("nowhere", &ChannelOptions::default())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::InvalidAddress(_)));
        assert!(!err.is_transient());
    }
}
