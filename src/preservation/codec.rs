//! Payload encoding for snapshots: canonical JSON text, gzip, MD5 digest.

use crate::{RelearnError, Result};
use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde_json::Value;
use std::io::{Read, Write};

/// Canonical text form of a state. `serde_json::Map` keeps keys sorted, so
/// equal states always encode to identical bytes.
pub fn encode_state(state: &Value) -> Result<String> {
    Ok(serde_json::to_string(state)?)
}

/// Hex MD5 digest of an encoded state
pub fn digest(encoded: &str) -> String {
    format!("{:x}", md5::compute(encoded.as_bytes()))
}

/// Compressor settings for one engine
#[derive(Debug, Clone, Copy)]
pub struct Codec {
    enabled: bool,
    level: u32,
}

impl Codec {
    pub fn new(enabled: bool, level: u32) -> Self {
        Self {
            enabled,
            level: level.min(9),
        }
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.enabled {
            return Ok(data.to_vec());
        }

        let mut encoder = GzEncoder::new(Vec::new(), Compression::new(self.level));
        encoder.write_all(data)?;
        Ok(encoder.finish()?)
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        if !self.enabled {
            return Ok(data.to_vec());
        }

        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| RelearnError::Codec(format!("gzip decode failed: {}", e)))?;
        Ok(decompressed)
    }

    /// Decompress and parse a JSON payload
    pub fn decode<T: serde::de::DeserializeOwned>(&self, data: &[u8]) -> Result<T> {
        let raw = self.decompress(data)?;
        serde_json::from_slice(&raw)
            .map_err(|e| RelearnError::Codec(format!("payload is not valid JSON: {}", e)))
    }
}

/// `1 - compressed/original`; 0 for an empty original
pub fn compression_ratio(original: usize, compressed: usize) -> f64 {
    if original == 0 {
        return 0.0;
    }
    1.0 - compressed as f64 / original as f64
}
