//! Purge properties payloads.
//!
//! Astarte exchanges the list of known properties as a zlib stream prefixed
//! by the uncompressed length as a big-endian `u32`. The uncompressed content
//! is `interface/path` entries joined by `;`. A zero length means an empty
//! list, in which case no stream follows.

use alloc::string::String;
use alloc::vec::Vec;

use miniz_oxide::deflate::compress_to_vec_zlib;
use miniz_oxide::inflate::decompress_to_vec_zlib_with_limit;

const COMPRESSION_LEVEL: u8 = 6;

/// Default bound on the announced uncompressed length of a purge payload.
pub const DEFAULT_MAX_PURGE_SIZE: usize = 64 * 1024;

/// Errors decoding a purge payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PurgeError {
    /// Shorter than the length prefix.
    Truncated,
    /// The zlib stream is corrupted.
    Inflate,
    /// The inflated size differs from the announced one.
    LengthMismatch,
    /// The inflated content is not UTF-8.
    InvalidUtf8,
    /// The announced length exceeds the allowed maximum.
    TooLarge,
}

/// Encodes `content` as a purge payload.
pub fn compress(content: &str) -> Vec<u8> {
    let mut payload = Vec::with_capacity(4 + content.len() / 2);
    payload.extend_from_slice(&(content.len() as u32).to_be_bytes());
    if !content.is_empty() {
        payload.extend_from_slice(&compress_to_vec_zlib(content.as_bytes(), COMPRESSION_LEVEL));
    }
    payload
}

/// Decodes a purge payload into its uncompressed content, bounded by
/// [`DEFAULT_MAX_PURGE_SIZE`].
pub fn decompress(payload: &[u8]) -> Result<String, PurgeError> {
    decompress_with_limit(payload, DEFAULT_MAX_PURGE_SIZE)
}

/// Decodes a purge payload whose announced length is at most `max_len`.
///
/// The prefix comes from the network, so it is checked before any buffer is
/// sized from it.
pub fn decompress_with_limit(payload: &[u8], max_len: usize) -> Result<String, PurgeError> {
    let (prefix, stream) = payload.split_first_chunk::<4>().ok_or(PurgeError::Truncated)?;
    let len = usize::try_from(u32::from_be_bytes(*prefix)).map_err(|_| PurgeError::TooLarge)?;
    if len == 0 {
        return Ok(String::new());
    }
    if len > max_len {
        return Err(PurgeError::TooLarge);
    }

    let content = decompress_to_vec_zlib_with_limit(stream, len).map_err(|_| PurgeError::Inflate)?;
    if content.len() != len {
        return Err(PurgeError::LengthMismatch);
    }
    String::from_utf8(content).map_err(|_| PurgeError::InvalidUtf8)
}

/// Splits decoded purge content into its entries, skipping empty ones.
pub fn entries(content: &str) -> impl Iterator<Item = &str> {
    content.split(';').filter(|entry| !entry.is_empty())
}
