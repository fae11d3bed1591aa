//! Command traits and call shapes.
//!
//! A command is a plain serde value with a stable identity. The identity is
//! the routing key in the [`Registry`](crate::handler::Registry) and, for
//! remote bindings, the wire path (`"/" + NAME`).
//!
//! # Example
//!
//! ```
//! use procwire_dispatch::Command;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct CreateUser {
//!     name: String,
//! }
//!
//! impl Command for CreateUser {
//!     const NAME: &'static str = "users.create";
//!     type Output = u64;
//! }
//! ```

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// A request that produces exactly one result.
///
/// Use `type Output = ()` for fire-and-forget commands.
pub trait Command: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identity, independent of the Rust type name.
    const NAME: &'static str;

    /// Result produced by the handler.
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// A request whose handler produces an ordered sequence of items.
pub trait ServerStreamCommand: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identity.
    const NAME: &'static str;

    /// Element type of the produced sequence.
    type Item: Serialize + DeserializeOwned + Send + 'static;
}

/// A request followed by a caller-produced sequence, answered once.
pub trait ClientStreamCommand: Serialize + DeserializeOwned + Send + 'static {
    /// Stable identity.
    const NAME: &'static str;

    /// Element type the caller streams to the handler.
    type Item: Serialize + DeserializeOwned + Send + 'static;

    /// Result produced after the caller ends the stream.
    type Output: Serialize + DeserializeOwned + Send + 'static;
}

/// How a command exchanges values with its handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallShape {
    /// One request, one result.
    Unary,
    /// One request, a sequence of results.
    ServerStreaming,
    /// A request plus a sequence of inputs, one result.
    ClientStreaming,
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CallShape::Unary => "unary",
            CallShape::ServerStreaming => "server-streaming",
            CallShape::ClientStreaming => "client-streaming",
        };
        f.write_str(name)
    }
}

/// Wire path for a command identity.
#[inline]
pub fn path_for(name: &str) -> String {
    format!("/{name}")
}

/// Command identity carried by a wire path.
///
/// Returns `None` for paths without the leading `/` or with an empty name.
#[inline]
pub fn identity_from_path(path: &str) -> Option<&str> {
    path.strip_prefix('/').filter(|name| !name.is_empty())
}
