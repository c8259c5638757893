//! Payload encoding: serialization and optional compression.
//!
//! Values are serialized with bincode, raw byte values are stored as they
//! are, and either kind is compressed once it grows past the configured
//! threshold. The resulting [`RecordFlags`] travel in the block headers so a
//! reader knows how to undo each step.

use crate::config::{CompressionType, Options};
use crate::error::{Error, Result};
use crate::record::RecordFlags;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A payload ready to be written as a record chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedPayload {
    /// Flags describing how `bytes` were produced.
    pub flags: RecordFlags,
    /// The bytes stored on disk.
    pub bytes: Vec<u8>,
}

/// Serialize `value` and compress it if it is large.
pub fn encode_value<T: Serialize + ?Sized>(value: &T, options: &Options) -> Result<EncodedPayload> {
    let serialized = bincode::serialize(value)?;
    finish(serialized, RecordFlags::default().with(RecordFlags::SERIALIZED), options)
}

/// Wrap raw bytes, compressing them if they are large.
pub fn encode_bytes(value: &[u8], options: &Options) -> Result<EncodedPayload> {
    finish(value.to_vec(), RecordFlags::default(), options)
}

fn finish(bytes: Vec<u8>, flags: RecordFlags, options: &Options) -> Result<EncodedPayload> {
    match options.compression_threshold() {
        Some(threshold) if bytes.len() > threshold => {
            let compressed = compress(options.compression, &bytes)?;
            log::debug!("Compressed payload from {} to {} bytes", bytes.len(), compressed.len());
            Ok(EncodedPayload { flags: flags.with(RecordFlags::COMPRESSED), bytes: compressed })
        }
        _ => Ok(EncodedPayload { flags, bytes }),
    }
}

fn compress(compression: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        CompressionType::None => Ok(data.to_vec()),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::Compression(format!("Compression failed: {}", e))),
    }
}

/// Undo compression according to `flags`, returning the stored value bytes.
pub fn decode_payload(flags: RecordFlags, bytes: Vec<u8>) -> Result<Vec<u8>> {
    if !flags.is_compressed() {
        return Ok(bytes);
    }
    decompress(&bytes)
}

#[cfg(feature = "snappy")]
fn decompress(data: &[u8]) -> Result<Vec<u8>> {
    snap::raw::Decoder::new()
        .decompress_vec(data)
        .map_err(|e| Error::Compression(format!("Decompression failed: {}", e)))
}

#[cfg(not(feature = "snappy"))]
fn decompress(_data: &[u8]) -> Result<Vec<u8>> {
    Err(Error::NotSupported("record is compressed but snappy is not enabled".to_string()))
}

/// Decode a stored payload into a typed value.
///
/// A record that was stored as raw bytes is rejected.
pub fn decode_value<T: DeserializeOwned>(flags: RecordFlags, bytes: Vec<u8>) -> Result<T> {
    if !flags.is_serialized() {
        return Err(Error::Serialization("record holds raw bytes, not a serialized value".to_string()));
    }
    let data = decode_payload(flags, bytes)?;
    Ok(bincode::deserialize(&data)?)
}
