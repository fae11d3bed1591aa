//! MessagePack encoding via `rmp-serde`.
//!
//! Always `to_vec_named`, never `to_vec`: structs are written as maps keyed
//! by field name. Field identity travels with the value, so both sides only
//! need compatible serde types and no separately compiled schema. Adding an
//! optional field on one side (with `#[serde(default)]`) stays compatible.
//!
//! # Example
//!
//! ```
//! use procwire_dispatch::codec::MsgPackCodec;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Rename {
//!     user: u64,
//!     to: String,
//! }
//!
//! let cmd = Rename { user: 7, to: "grace".into() };
//! let bytes = MsgPackCodec::encode(&cmd).unwrap();
//! assert_eq!(MsgPackCodec::decode::<Rename>(&bytes).unwrap(), cmd);
//! ```

use crate::error::SerializationError;

/// Stateless MessagePack serializer used for every payload.
pub struct MsgPackCodec;

impl MsgPackCodec {
    /// Serialize `value`, structs as maps.
    #[inline]
    pub fn encode<T: serde::Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, SerializationError> {
        Ok(rmp_serde::to_vec_named(value)?)
    }

    /// Deserialize a `T` from `bytes`.
    #[inline]
    pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, SerializationError> {
        Ok(rmp_serde::from_slice(bytes)?)
    }
}
