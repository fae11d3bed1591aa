//! Codec module - payload encoding for the wire.
//!
//! Two stages, applied in order:
//!
//! - [`MsgPackCodec`] - MessagePack using `rmp-serde` (`to_vec_named`, struct-as-map)
//! - [`Compression`] - optional deflate of the encoded bytes
//!
//! [`Codec`] bundles both with a size limit and is what channels and
//! servers hold. A round trip through the same `Codec` restores any value
//! whose serde implementation round-trips.
//!
//! # Example
//!
//! ```
//! use procwire_dispatch::codec::{Codec, Compression};
//!
//! let codec = Codec::new(Compression::deflate());
//! let text = "hello ".repeat(100);
//!
//! let encoded = codec.encode(&text).unwrap();
//! assert!(encoded.compressed);
//!
//! let decoded: String = codec.decode(&encoded.bytes, encoded.compressed).unwrap();
//! assert_eq!(decoded, text);
//! ```

mod compression;
mod msgpack;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::SerializationError;
use crate::protocol::{Frame, DEFAULT_MAX_PAYLOAD_SIZE};

pub use compression::{
    decompress, Compression, DEFAULT_COMPRESSION_LEVEL, DEFAULT_MIN_COMPRESS_SIZE,
};
pub use msgpack::MsgPackCodec;

/// Encoded payload ready to be framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Encoded {
    /// Payload bytes.
    pub bytes: Bytes,
    /// Whether `bytes` are deflated.
    pub compressed: bool,
}

impl Encoded {
    /// Fail unless the payload fits in a frame of at most `limit` bytes.
    pub fn check_size(&self, limit: usize) -> Result<(), SerializationError> {
        if self.bytes.len() > limit {
            return Err(SerializationError::PayloadTooLarge {
                size: self.bytes.len(),
                limit,
            });
        }
        Ok(())
    }
}

/// Serializer plus compression stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Codec {
    compression: Compression,
    max_decoded_size: usize,
    max_encoded_size: usize,
}

impl Default for Codec {
    fn default() -> Self {
        Self::new(Compression::default())
    }
}

impl Codec {
    /// Create a codec with the given compression.
    pub fn new(compression: Compression) -> Self {
        Self {
            compression,
            max_decoded_size: DEFAULT_MAX_PAYLOAD_SIZE as usize,
            max_encoded_size: DEFAULT_MAX_PAYLOAD_SIZE as usize,
        }
    }

    /// Cap the size of a decompressed payload.
    pub fn with_max_decoded_size(mut self, limit: usize) -> Self {
        self.max_decoded_size = limit;
        self
    }

    /// Cap the size of an encoded payload.
    pub fn with_max_encoded_size(mut self, limit: usize) -> Self {
        self.max_encoded_size = limit;
        self
    }

    /// Largest payload [`Codec::encode`] will produce.
    #[inline]
    pub fn max_encoded_size(&self) -> usize {
        self.max_encoded_size
    }

    /// Compression in use.
    #[inline]
    pub fn compression(&self) -> Compression {
        self.compression
    }

    /// Serialize `value` and compress it if worthwhile.
    ///
    /// Fails with [`SerializationError::PayloadTooLarge`] when the result
    /// would not fit in a frame.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Encoded, SerializationError> {
        let raw = MsgPackCodec::encode(value)?;
        let encoded = match self.compression.compress(&raw)? {
            Some(packed) => Encoded {
                bytes: Bytes::from(packed),
                compressed: true,
            },
            None => Encoded {
                bytes: Bytes::from(raw),
                compressed: false,
            },
        };
        encoded.check_size(self.max_encoded_size)?;
        Ok(encoded)
    }

    /// Decode a payload, inflating it first when `compressed` is set.
    ///
    /// Decoding does not depend on the local compression setting, so peers
    /// with different settings interoperate.
    pub fn decode<T: DeserializeOwned>(
        &self,
        bytes: &[u8],
        compressed: bool,
    ) -> Result<T, SerializationError> {
        if compressed {
            let raw = decompress(bytes, self.max_decoded_size)?;
            MsgPackCodec::decode(&raw)
        } else {
            MsgPackCodec::decode(bytes)
        }
    }

    /// Decode the payload of a DATA frame.
    #[inline]
    pub fn decode_frame<T: DeserializeOwned>(&self, frame: &Frame) -> Result<T, SerializationError> {
        self.decode(&frame.payload, frame.is_compressed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde::Deserialize;
    use std::collections::BTreeMap;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Shipment {
        id: u64,
        lines: Vec<String>,
        weights: BTreeMap<String, u32>,
        note: Option<String>,
    }

    fn shipment() -> impl Strategy<Value = Shipment> {
        (
            any::<u64>(),
            prop::collection::vec(".{0,64}", 0..32),
            prop::collection::btree_map("[a-z]{1,8}", any::<u32>(), 0..8),
            prop::option::of(".{0,128}"),
        )
            .prop_map(|(id, lines, weights, note)| Shipment {
                id,
                lines,
                weights,
                note,
            })
    }

    proptest! {
        #[test]
        fn round_trip_with_deflate(value in shipment()) {
            let codec = Codec::new(Compression::Deflate { level: 6, min_size: 16 });
            let encoded = codec.encode(&value).unwrap();
            let decoded: Shipment = codec.decode(&encoded.bytes, encoded.compressed).unwrap();
            prop_assert_eq!(decoded, value);
        }

        #[test]
        fn round_trip_without_compression(value in shipment()) {
            let codec = Codec::new(Compression::None);
            let encoded = codec.encode(&value).unwrap();
            prop_assert!(!encoded.compressed);
            let decoded: Shipment = codec.decode(&encoded.bytes, false).unwrap();
            prop_assert_eq!(decoded, value);
        }
    }

    #[test]
    fn test_small_values_stay_uncompressed() {
        let codec = Codec::default();
        let encoded = codec.encode(&42u32).unwrap();
        assert!(!encoded.compressed);
    }

    #[test]
    fn test_decoder_ignores_local_setting() {
        let sender = Codec::new(Compression::deflate());
        let receiver = Codec::new(Compression::None);

        let text = "abc".repeat(500);
        let encoded = sender.encode(&text).unwrap();
        assert!(encoded.compressed);

        let decoded: String = receiver.decode(&encoded.bytes, true).unwrap();
        assert_eq!(decoded, text);
    }

    #[test]
    fn test_decode_limit_applies() {
        let sender = Codec::new(Compression::deflate());
        let receiver = Codec::default().with_max_decoded_size(64);

        let encoded = sender.encode(&vec![0u8; 4096]).unwrap();
        let result: Result<Vec<u8>, _> = receiver.decode(&encoded.bytes, encoded.compressed);
        assert!(matches!(result, Err(SerializationError::TooLarge { .. })));
    }

    #[test]
    fn test_encode_limit_applies() {
        let codec = Codec::new(Compression::None).with_max_encoded_size(1024);
        assert!(codec.encode(&vec![7u8; 512]).is_ok());

        match codec.encode(&vec![7u8; 4096]) {
            Err(SerializationError::PayloadTooLarge { size, limit }) => {
                assert!(size > 4096);
                assert_eq!(limit, 1024);
            }
            other => panic!("unexpected: {other:?}"),
        }

        // The limit applies to the bytes on the wire, after compression.
        let packed = Codec::new(Compression::deflate()).with_max_encoded_size(1024);
        assert!(packed.encode(&vec![0u8; 4096]).unwrap().compressed);
    }
}
