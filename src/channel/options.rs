//! Channel configuration.
//!
//! `ChannelOptions` is built in code with the builder methods or loaded from
//! any serde source (every field has a default). The connector hook and the
//! writer settings are code-only.
//!
//! ```
//! use procwire_dispatch::channel::{BackoffPolicy, ChannelOptions};
//! use std::time::Duration;
//!
//! let options: ChannelOptions = serde_json::from_str(
//!     r#"{ "max_retry_attempts": 2, "metadata": { "tenant": "acme" } }"#,
//! ).unwrap();
//! assert_eq!(options.max_retry_attempts, 2);
//!
//! let options = options.backoff(BackoffPolicy::fixed(Duration::from_millis(50)));
//! assert_eq!(options.backoff.initial_ms, 50);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::retry::{BackoffPolicy, DEFAULT_MAX_RETRY_ATTEMPTS};
use super::saturating_millis;
use crate::codec::Compression;
use crate::transport::Connector;
use crate::writer::WriterConfig;

/// Default connect and handshake timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Opaque TLS settings handed to a connector.
///
/// The built-in connector does not implement TLS and refuses channels that
/// carry these options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsOptions {
    /// Server name for certificate verification.
    pub server_name: Option<String>,
    /// Connector-specific settings.
    pub settings: Option<serde_json::Value>,
}

/// Options for one [`Channel`](super::Channel).
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct ChannelOptions {
    /// Retries after the first attempt for transient failures.
    pub max_retry_attempts: u32,
    /// Delay between attempts.
    pub backoff: BackoffPolicy,
    /// Compression for outbound payloads.
    pub compression: Compression,
    /// Connect and handshake timeout in milliseconds.
    pub connect_timeout_ms: u64,
    /// Metadata sent with every call on the channel.
    pub metadata: HashMap<String, String>,
    /// Opaque service configuration, available to custom connectors.
    pub service_config: Option<serde_json::Value>,
    /// TLS marker.
    pub tls: Option<TlsOptions>,
    /// Outbound writer settings.
    #[serde(skip)]
    pub writer: WriterConfig,
    /// Custom dialer replacing the default TCP/unix connector.
    #[serde(skip)]
    pub connector: Option<Arc<dyn Connector>>,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            compression: Compression::default(),
            connect_timeout_ms: saturating_millis(DEFAULT_CONNECT_TIMEOUT),
            metadata: HashMap::new(),
            service_config: None,
            tls: None,
            writer: WriterConfig::default(),
            connector: None,
        }
    }
}

impl ChannelOptions {
    /// Create options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of retries after the first attempt.
    pub fn max_retry_attempts(mut self, retries: u32) -> Self {
        self.max_retry_attempts = retries;
        self
    }

    /// Set the backoff policy.
    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Set payload compression.
    pub fn compression(mut self, compression: Compression) -> Self {
        self.compression = compression;
        self
    }

    /// Set the connect and handshake timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = saturating_millis(timeout);
        self
    }

    /// Add a metadata entry sent with every call.
    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Attach opaque service configuration.
    pub fn service_config(mut self, config: serde_json::Value) -> Self {
        self.service_config = Some(config);
        self
    }

    /// Request TLS from the connector.
    pub fn tls(mut self, tls: TlsOptions) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Set writer settings.
    pub fn writer(mut self, writer: WriterConfig) -> Self {
        self.writer = writer;
        self
    }

    /// Dial through a custom connector.
    pub fn connector(mut self, connector: impl Connector) -> Self {
        self.connector = Some(Arc::new(connector));
        self
    }

    /// The connect timeout as a `Duration`.
    #[inline]
    pub fn connect_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl fmt::Debug for ChannelOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelOptions")
            .field("max_retry_attempts", &self.max_retry_attempts)
            .field("backoff", &self.backoff)
            .field("compression", &self.compression)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("metadata", &self.metadata)
            .field("service_config", &self.service_config)
            .field("tls", &self.tls)
            .field("writer", &self.writer)
            .field("custom_connector", &self.connector.is_some())
            .finish()
    }
}
