//! Endpoint address parsing.
//!
//! Accepted forms:
//! - `host:port` and `tcp://host:port`
//! - `unix:///path/to.sock` (unix only)

use std::fmt;
use std::path::PathBuf;

use crate::error::TransportError;

/// A parsed endpoint address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// TCP `host:port`.
    Tcp(String),
    /// Unix domain socket path.
    Unix(PathBuf),
}

impl Address {
    /// Parse an address string.
    pub fn parse(address: &str) -> Result<Self, TransportError> {
        let address = address.trim();

        if let Some(path) = address.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(TransportError::InvalidAddress(address.to_string()));
            }
            return Ok(Address::Unix(PathBuf::from(path)));
        }

        let host_port = address.strip_prefix("tcp://").unwrap_or(address);
        match host_port.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Address::Tcp(host_port.to_string()))
            }
            _ => Err(TransportError::InvalidAddress(address.to_string())),
        }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Tcp(host_port) => write!(f, "tcp://{host_port}"),
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
        }
    }
}

/// Generate a unique unix socket path for this process.
///
/// Format: `{tmp}/procwire-{pid}-{random}.sock`
pub fn generate_socket_path() -> PathBuf {
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::{SystemTime, UNIX_EPOCH};

    static SEQ: AtomicU64 = AtomicU64::new(0);

    let pid = std::process::id();
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0);
    let rand = nanos.wrapping_mul(0x517cc1b727220a95) ^ SEQ.fetch_add(1, Ordering::Relaxed);

    std::env::temp_dir().join(format!("procwire-{pid}-{rand:x}.sock"))
}
