//! Control payloads: HELLO, OPEN head and TRAILER.
//!
//! These are always MsgPack-encoded and never compressed. Only command
//! values, stream items and results pass through the compression stage.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::codec::MsgPackCodec;
use crate::command::CallShape;
use crate::context::ErrorPayload;
use crate::error::{DispatchError, Result, SerializationError};
use crate::protocol::DEFAULT_MAX_PAYLOAD_SIZE;

/// Protocol version sent in HELLO. Peers must agree on the major component.
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// One command a server can handle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDescriptor {
    /// Command identity.
    pub name: String,
    /// Call shape the handler was registered with.
    pub shape: CallShape,
}

/// Handshake payload.
///
/// The client sends its version with an empty command list. The server
/// answers with its version and every locally registered command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    /// Semver string.
    pub version: String,
    /// Advertised commands.
    #[serde(default)]
    pub commands: Vec<CommandDescriptor>,
    /// Largest frame payload the sender accepts; absent means the default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_payload_size: Option<u32>,
}

impl Hello {
    /// Client-side greeting.
    pub fn client() -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            commands: Vec::new(),
            max_payload_size: None,
        }
    }

    /// Server-side greeting advertising `commands`.
    pub fn server(commands: Vec<CommandDescriptor>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            commands,
            max_payload_size: None,
        }
    }

    /// Advertise the largest frame payload this side will read.
    pub fn with_max_payload_size(mut self, limit: u32) -> Self {
        self.max_payload_size = Some(limit);
        self
    }

    /// Payload limit the peer will enforce on frames sent to it.
    pub fn payload_limit(&self) -> u32 {
        self.max_payload_size.unwrap_or(DEFAULT_MAX_PAYLOAD_SIZE)
    }

    /// Fail unless the peer speaks the same major version.
    pub fn check_compatible(&self) -> Result<()> {
        if major(&self.version) != major(PROTOCOL_VERSION) {
            return Err(DispatchError::Protocol(format!(
                "Incompatible protocol version: peer {}, local {}",
                self.version, PROTOCOL_VERSION
            )));
        }
        Ok(())
    }
}

fn major(version: &str) -> Option<u64> {
    version.split('.').next().and_then(|m| m.parse().ok())
}

/// OPEN payload: which command and how the call is shaped.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallHead {
    /// Wire path, `"/" + command identity`.
    pub path: String,
    /// Expected call shape.
    pub shape: Option<CallShape>,
    /// Caller metadata.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    /// Remaining deadline in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

/// Final status of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Completed; for unary and client-streaming a DATA frame preceded the trailer.
    Ok,
    /// The handler populated the error accumulator.
    ValidationFailed,
    /// The handler failed outside the validation channel.
    HandlerThrown,
    /// No handler for the path.
    Unregistered,
    /// Handler registered with another shape.
    BindingMismatch,
    /// Server could not decode the command or encode the result.
    Serialization,
    /// The call was cancelled on the server side.
    Cancelled,
    /// The call-scoped deadline elapsed on the server side.
    DeadlineExceeded,
    /// The peer violated the call protocol.
    Protocol,
}

/// TRAILER payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trailer {
    /// Outcome.
    pub status: Status,
    /// Human-readable detail for non-OK outcomes.
    #[serde(default)]
    pub message: Option<String>,
    /// The handler's error accumulator, possibly empty.
    #[serde(default)]
    pub errors: ErrorPayload,
}

impl Trailer {
    /// Successful completion.
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            message: None,
            errors: ErrorPayload::new(),
        }
    }

    /// Describe a server-side failure. `errors` is the handler's accumulator.
    pub fn from_error(err: &DispatchError, errors: ErrorPayload) -> Self {
        let status = match err {
            DispatchError::ValidationFailed(_) => Status::ValidationFailed,
            DispatchError::HandlerThrown(_) => Status::HandlerThrown,
            DispatchError::UnregisteredCommand(_) => Status::Unregistered,
            DispatchError::BindingMismatch { .. } => Status::BindingMismatch,
            DispatchError::Serialization(_) => Status::Serialization,
            DispatchError::Cancelled => Status::Cancelled,
            DispatchError::DeadlineExceeded => Status::DeadlineExceeded,
            // A handler that itself dispatched remotely and lost the
            // connection failed from this caller's point of view.
            DispatchError::Transport(_)
            | DispatchError::DuplicateRegistration(_) => Status::HandlerThrown,
            DispatchError::Protocol(_) => Status::Protocol,
        };
        let message = match err {
            DispatchError::ValidationFailed(_) => None,
            DispatchError::HandlerThrown(msg) => Some(msg.clone()),
            DispatchError::UnregisteredCommand(name) => Some(name.clone()),
            other => Some(other.to_string()),
        };
        Self {
            status,
            message,
            errors,
        }
    }

    /// Caller-side view of a non-OK trailer.
    ///
    /// `command` names the call for errors that carry the identity.
    /// Returns `Ok(())` for [`Status::Ok`].
    pub fn into_result(self, command: &str) -> Result<()> {
        let message = self.message.unwrap_or_default();
        Err(match self.status {
            Status::Ok => return Ok(()),
            Status::ValidationFailed => DispatchError::ValidationFailed(self.errors),
            Status::HandlerThrown => DispatchError::HandlerThrown(message),
            Status::Unregistered => DispatchError::UnregisteredCommand(command.to_string()),
            Status::BindingMismatch => DispatchError::BindingMismatch {
                command: command.to_string(),
                expected: "the caller's shape".to_string(),
                found: message,
            },
            Status::Serialization => {
                DispatchError::Serialization(SerializationError::Remote(message))
            }
            Status::Cancelled => DispatchError::Cancelled,
            Status::DeadlineExceeded => DispatchError::DeadlineExceeded,
            Status::Protocol => DispatchError::Protocol(message),
        })
    }

    /// Encode for a TRAILER frame.
    pub fn encode(&self) -> std::result::Result<Vec<u8>, SerializationError> {
        MsgPackCodec::encode(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_compatibility() {
        assert!(Hello::client().check_compatible().is_ok());

        let minor_bump = Hello {
            version: "1.4.2".into(),
            commands: vec![],
            max_payload_size: None,
        };
        assert!(minor_bump.check_compatible().is_ok());

        let next_major = Hello {
            version: "2.0.0".into(),
            commands: vec![],
            max_payload_size: None,
        };
        assert!(matches!(
            next_major.check_compatible(),
            Err(DispatchError::Protocol(msg)) if msg.contains("2.0.0")
        ));

        let garbage = Hello {
            version: "banana".into(),
            commands: vec![],
            max_payload_size: None,
        };
        assert!(garbage.check_compatible().is_err());
    }

    #[test]
    fn test_hello_wire_round_trip() {
        let hello = Hello::server(vec![CommandDescriptor {
            name: "orders.place".into(),
            shape: CallShape::Unary,
        }]);
        let bytes = MsgPackCodec::encode(&hello).unwrap();
        let decoded: Hello = MsgPackCodec::decode(&bytes).unwrap();
        assert_eq!(decoded, hello);
        assert_eq!(decoded.payload_limit(), DEFAULT_MAX_PAYLOAD_SIZE);

        let limited = hello.with_max_payload_size(1024);
        let decoded: Hello = MsgPackCodec::decode(&MsgPackCodec::encode(&limited).unwrap()).unwrap();
        assert_eq!(decoded.payload_limit(), 1024);
    }

    #[test]
    fn test_trailer_carries_validation_payload() {
        let mut errors = ErrorPayload::new();
        errors.add_field("sku", "unknown");

        let trailer = Trailer::from_error(&DispatchError::ValidationFailed(errors.clone()), errors);
        assert_eq!(trailer.status, Status::ValidationFailed);

        let bytes = trailer.encode().unwrap();
        let decoded: Trailer = MsgPackCodec::decode(&bytes).unwrap();

        match decoded.into_result("orders.place") {
            Err(DispatchError::ValidationFailed(p)) => {
                assert_eq!(p.field("sku").unwrap(), ["unknown"])
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_trailer_status_mapping() {
        let thrown = Trailer::from_error(
            &DispatchError::HandlerThrown("db down".into()),
            ErrorPayload::new(),
        );
        assert!(matches!(
            thrown.into_result("x"),
            Err(DispatchError::HandlerThrown(msg)) if msg == "db down"
        ));

        let unregistered = Trailer::from_error(
            &DispatchError::UnregisteredCommand("ghost".into()),
            ErrorPayload::new(),
        );
        assert!(matches!(
            unregistered.into_result("ghost"),
            Err(DispatchError::UnregisteredCommand(name)) if name == "ghost"
        ));

        let cancelled = Trailer::from_error(&DispatchError::Cancelled, ErrorPayload::new());
        assert!(matches!(cancelled.into_result("x"), Err(DispatchError::Cancelled)));

        assert!(Trailer::ok().into_result("x").is_ok());
    }
}
