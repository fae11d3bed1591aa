//! Inbound connection acceptance for the handler server.
//!
//! - TCP on every platform
//! - Unix Domain Sockets on unix; the socket file is removed on drop
//!
//! # Example
//!
//! ```no_run
//! # async fn run() -> Result<(), procwire_dispatch::TransportError> {
//! use procwire_dispatch::transport::Listener;
//!
//! let listener = Listener::bind("127.0.0.1:0").await?;
//! println!("listening on {}", listener.local_address());
//! let stream = listener.accept().await?;
//! # drop(stream);
//! # Ok(())
//! # }
//! ```

use std::path::PathBuf;

use tokio::net::TcpListener;

use super::address::Address;
use super::connector::BoxedStream;
use crate::error::TransportError;

enum Inner {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(tokio::net::UnixListener),
}

/// A bound listener.
pub struct Listener {
    inner: Inner,
    /// Socket file to clean up, for unix listeners.
    socket_path: Option<PathBuf>,
}

impl Listener {
    /// Bind to an address (`host:port`, `tcp://host:port`, `unix:///path`).
    ///
    /// For unix sockets an existing file at the path is removed first.
    pub async fn bind(address: &str) -> Result<Self, TransportError> {
        match Address::parse(address)? {
            Address::Tcp(host_port) => Ok(Self {
                inner: Inner::Tcp(TcpListener::bind(host_port).await?),
                socket_path: None,
            }),
            #[cfg(unix)]
            Address::Unix(path) => {
                if path.exists() {
                    std::fs::remove_file(&path)?;
                }
                let listener = tokio::net::UnixListener::bind(&path)?;
                Ok(Self {
                    inner: Inner::Unix(listener),
                    socket_path: Some(path),
                })
            }
            #[cfg(not(unix))]
            Address::Unix(_) => Err(TransportError::InvalidAddress(address.to_string())),
        }
    }

    /// Accept a single connection.
    pub async fn accept(&self) -> Result<BoxedStream, TransportError> {
        match &self.inner {
            Inner::Tcp(listener) => {
                let (stream, _peer) = listener.accept().await?;
                stream.set_nodelay(true)?;
                Ok(Box::pin(stream))
            }
            #[cfg(unix)]
            Inner::Unix(listener) => {
                let (stream, _peer) = listener.accept().await?;
                Ok(Box::pin(stream))
            }
        }
    }

    /// Address a client can dial, with the actual port for `:0` binds.
    pub fn local_address(&self) -> String {
        match &self.inner {
            Inner::Tcp(listener) => match listener.local_addr() {
                Ok(addr) => addr.to_string(),
                Err(_) => String::new(),
            },
            #[cfg(unix)]
            Inner::Unix(_) => match &self.socket_path {
                Some(path) => format!("unix://{}", path.display()),
                None => String::new(),
            },
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Some(path) = &self.socket_path {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl std::fmt::Debug for Listener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listener")
            .field("address", &self.local_address())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{Connector, DefaultConnector};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn test_tcp_accept() {
        let listener = Listener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_address();
        assert!(address.starts_with("127.0.0.1:"));

        let options = crate::channel::ChannelOptions::default();
        let (client, server) = tokio::join!(
            DefaultConnector.connect(&address, &options),
            listener.accept()
        );
        let mut client = client.unwrap();
        let mut server = server.unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_socket_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dispatch.sock");
        let address = format!("unix://{}", path.display());

        let listener = Listener::bind(&address).await.unwrap();
        assert!(path.exists());
        assert_eq!(listener.local_address(), address);

        drop(listener);
        assert!(!path.exists());
    }
}
