//! Block compression stage (deflate via `flate2`).
//!
//! Compression is applied per frame payload. Payloads below `min_size` are
//! sent as-is, and so is any payload deflate would not shrink. Whether a
//! payload is compressed travels in the frame flags.

use std::io::{Read, Write};

use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use serde::{Deserialize, Serialize};

use crate::error::SerializationError;

/// Payloads smaller than this are never compressed by default.
pub const DEFAULT_MIN_COMPRESS_SIZE: usize = 256;

/// Default deflate level.
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Compression applied to encoded payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Compression {
    /// Payloads are sent as encoded.
    None,
    /// Deflate payloads of at least `min_size` bytes.
    Deflate {
        /// Deflate level, 0-9.
        level: u32,
        /// Smallest payload worth compressing.
        min_size: usize,
    },
}

impl Default for Compression {
    fn default() -> Self {
        Compression::deflate()
    }
}

impl Compression {
    /// Deflate with default level and threshold.
    pub const fn deflate() -> Self {
        Compression::Deflate {
            level: DEFAULT_COMPRESSION_LEVEL,
            min_size: DEFAULT_MIN_COMPRESS_SIZE,
        }
    }

    /// Whether a payload of `len` bytes is a compression candidate.
    #[inline]
    pub fn applies_to(&self, len: usize) -> bool {
        match self {
            Compression::None => false,
            Compression::Deflate { min_size, .. } => len > 0 && len >= *min_size,
        }
    }

    /// Compress `data` if worthwhile.
    ///
    /// Returns `None` when the payload should be sent uncompressed.
    pub fn compress(&self, data: &[u8]) -> Result<Option<Vec<u8>>, SerializationError> {
        let level = match self {
            Compression::Deflate { level, .. } if self.applies_to(data.len()) => *level,
            _ => return Ok(None),
        };

        let mut encoder = DeflateEncoder::new(
            Vec::with_capacity(data.len() / 2),
            flate2::Compression::new(level.min(9)),
        );
        encoder
            .write_all(data)
            .map_err(SerializationError::Compression)?;
        let compressed = encoder.finish().map_err(SerializationError::Compression)?;

        if compressed.len() >= data.len() {
            return Ok(None);
        }
        Ok(Some(compressed))
    }
}

/// Inflate a compressed payload, refusing output larger than `limit`.
pub fn decompress(data: &[u8], limit: usize) -> Result<Vec<u8>, SerializationError> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(2).min(limit));
    DeflateDecoder::new(data)
        .take(limit as u64 + 1)
        .read_to_end(&mut out)
        .map_err(SerializationError::Compression)?;

    if out.len() > limit {
        return Err(SerializationError::TooLarge { limit });
    }
    Ok(out)
}
