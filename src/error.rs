//! Error types for procwire-dispatch.
//!
//! [`DispatchError`] is the single failure a caller of the dispatcher sees.
//! Transport failures are nested in [`TransportError`] so the retry layer can
//! tell transient connection trouble apart from everything else.

use std::time::Duration;

use thiserror::Error;

use crate::command::CallShape;
use crate::context::ErrorPayload;

/// Codec failures. Always fatal to the call, never retried.
#[derive(Debug, Error)]
pub enum SerializationError {
    /// MsgPack serialization error.
    #[error("MsgPack encode error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MsgPack deserialization error.
    #[error("MsgPack decode error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    /// Deflate stage failed.
    #[error("Compression error: {0}")]
    Compression(#[source] std::io::Error),

    /// Decompressed payload is larger than the configured limit.
    #[error("Decompressed payload exceeds {limit} bytes")]
    TooLarge {
        /// Configured limit in bytes.
        limit: usize,
    },

    /// Encoded payload does not fit in one frame the peer will accept.
    #[error("Encoded payload of {size} bytes exceeds the {limit}-byte frame limit")]
    PayloadTooLarge {
        /// Encoded size in bytes.
        size: usize,
        /// Largest payload the peer accepts.
        limit: usize,
    },

    /// The remote side failed to decode or encode a value.
    #[error("Remote codec error: {0}")]
    Remote(String),
}

/// Connection-level failures.
#[derive(Debug, Error)]
pub enum TransportError {
    /// I/O error on the underlying stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Connection closed while the call was waiting for its first response.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Connection closed after part of the response had already arrived.
    #[error("Connection lost mid-response")]
    ResponseInterrupted,

    /// Connect or handshake did not finish in time.
    #[error("Connect timeout after {0:?}")]
    ConnectTimeout(Duration),

    /// Backpressure timeout - write buffer full.
    #[error("Backpressure timeout")]
    BackpressureTimeout,

    /// Address could not be parsed by the connector.
    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    /// TLS was requested but the connector in use cannot provide it.
    #[error("TLS requested but the connector does not support it")]
    TlsUnsupported,

    /// Every attempt failed with a transient error.
    #[error("Giving up after {attempts} attempts: {last}")]
    RetriesExhausted {
        /// Total attempts made (first try plus retries).
        attempts: u32,
        /// Error from the final attempt.
        last: Box<TransportError>,
    },
}

impl TransportError {
    /// Whether a fresh attempt could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        use std::io::ErrorKind;

        match self {
            TransportError::Io(e) => matches!(
                e.kind(),
                ErrorKind::ConnectionRefused
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::BrokenPipe
                    | ErrorKind::TimedOut
                    | ErrorKind::UnexpectedEof
                    | ErrorKind::AddrNotAvailable
                    | ErrorKind::Interrupted
            ),
            TransportError::ConnectionClosed | TransportError::ConnectTimeout(_) => true,
            TransportError::ResponseInterrupted
            | TransportError::BackpressureTimeout
            | TransportError::InvalidAddress(_)
            | TransportError::TlsUnsupported
            | TransportError::RetriesExhausted { .. } => false,
        }
    }
}

/// Main error type for all dispatch operations.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// No binding exists for the command identity.
    #[error("No handler registered for command `{0}`")]
    UnregisteredCommand(String),

    /// Registration refused because the registry rejects duplicates.
    #[error("Command `{0}` is already registered")]
    DuplicateRegistration(String),

    /// The binding exists but was registered for another call shape or type.
    #[error("Command `{command}` is bound as {found}, but was invoked as {expected}")]
    BindingMismatch {
        /// Command identity.
        command: String,
        /// What the caller asked for.
        expected: String,
        /// What the registry holds.
        found: String,
    },

    /// Codec failure (contract mismatch between the two sides).
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Connection/transport failure.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// The handler populated the error accumulator.
    #[error("Validation failed: {0}")]
    ValidationFailed(ErrorPayload),

    /// The handler failed outside the validation channel.
    #[error("Handler failed: {0}")]
    HandlerThrown(String),

    /// The caller cancelled the call.
    #[error("Call cancelled")]
    Cancelled,

    /// The call-scoped timeout elapsed.
    #[error("Deadline exceeded")]
    DeadlineExceeded,

    /// Protocol error (invalid frame, wrong flags, unexpected message, etc.).
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl DispatchError {
    /// Whether the channel retry loop may try again.
    ///
    /// Only transient transport failures qualify. Anything carrying an
    /// application payload already ran on the handler side.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Transport(e) if e.is_transient())
    }

    pub(crate) fn shape_mismatch(command: &str, expected: CallShape, found: CallShape) -> Self {
        DispatchError::BindingMismatch {
            command: command.to_string(),
            expected: expected.to_string(),
            found: found.to_string(),
        }
    }

    /// Map a handler failure into the dispatch taxonomy.
    ///
    /// A `DispatchError` anywhere in the chain keeps its meaning for
    /// cancellation, deadlines and validation; everything else becomes
    /// [`DispatchError::HandlerThrown`].
    pub(crate) fn from_handler(err: anyhow::Error) -> Self {
        match err.downcast::<DispatchError>() {
            Ok(DispatchError::Cancelled) => DispatchError::Cancelled,
            Ok(DispatchError::DeadlineExceeded) => DispatchError::DeadlineExceeded,
            Ok(DispatchError::ValidationFailed(payload)) => DispatchError::ValidationFailed(payload),
            Ok(other) => DispatchError::HandlerThrown(other.to_string()),
            Err(err) => DispatchError::HandlerThrown(format!("{err:#}")),
        }
    }
}

impl From<std::io::Error> for DispatchError {
    fn from(err: std::io::Error) -> Self {
        DispatchError::Transport(TransportError::Io(err))
    }
}

impl From<rmp_serde::encode::Error> for DispatchError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        DispatchError::Serialization(SerializationError::Encode(err))
    }
}

impl From<rmp_serde::decode::Error> for DispatchError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        DispatchError::Serialization(SerializationError::Decode(err))
    }
}

/// Result type alias using DispatchError.
pub type Result<T> = std::result::Result<T, DispatchError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_transient_io_kinds() {
        assert!(TransportError::Io(IoError::from(ErrorKind::ConnectionRefused)).is_transient());
        assert!(TransportError::Io(IoError::from(ErrorKind::ConnectionReset)).is_transient());
        assert!(!TransportError::Io(IoError::from(ErrorKind::PermissionDenied)).is_transient());
        assert!(TransportError::ConnectionClosed.is_transient());
        assert!(!TransportError::ResponseInterrupted.is_transient());
        assert!(!TransportError::TlsUnsupported.is_transient());
    }

    #[test]
    fn test_only_transient_transport_is_retryable() {
        assert!(DispatchError::Transport(TransportError::ConnectionClosed).is_retryable());
        assert!(!DispatchError::ValidationFailed(ErrorPayload::new()).is_retryable());
        assert!(!DispatchError::HandlerThrown("boom".into()).is_retryable());
        assert!(!DispatchError::Cancelled.is_retryable());
        assert!(!DispatchError::UnregisteredCommand("x".into()).is_retryable());

        let exhausted = TransportError::RetriesExhausted {
            attempts: 3,
            last: Box::new(TransportError::ConnectionClosed),
        };
        assert!(!DispatchError::Transport(exhausted).is_retryable());
    }

    #[test]
    fn test_from_handler_keeps_cancellation() {
        let err = anyhow::Error::new(DispatchError::Cancelled);
        assert!(matches!(DispatchError::from_handler(err), DispatchError::Cancelled));
    }

    #[test]
    fn test_from_handler_wraps_other_errors() {
        let err = anyhow::anyhow!("disk full").context("saving order");
        match DispatchError::from_handler(err) {
            DispatchError::HandlerThrown(msg) => {
                assert!(msg.contains("saving order"));
                assert!(msg.contains("disk full"));
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_from_handler_nested_dispatch_error_is_thrown() {
        let err = anyhow::Error::new(DispatchError::UnregisteredCommand("inner".into()));
        assert!(matches!(
            DispatchError::from_handler(err),
            DispatchError::HandlerThrown(msg) if msg.contains("inner")
        ));
    }
}
