//! # Compression
//!
//! Pluggable payload compressors used by the packet codec.
//!
//! The codec only knows the [`PacketCompressor`] trait. Two implementations ship with
//! the crate: LZ4 (fast, default) and Zstd (denser). Both enforce a maximum
//! decompressed size to protect against decompression bombs.

use crate::error::{NetworkError, Result};

/// Maximum output size for decompression (16 MB)
pub const MAX_DECOMPRESSION_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Copy, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum CompressionKind {
    Lz4,
    Zstd,
}

/// Compresses outbound payloads and restores inbound ones.
pub trait PacketCompressor: Send + Sync {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    fn uncompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Compressor backed by one of the built-in algorithms.
#[derive(Debug, Clone, Copy)]
pub struct DefaultCompressor {
    kind: CompressionKind,
}

impl DefaultCompressor {
    pub fn new(kind: CompressionKind) -> Self {
        Self { kind }
    }

    pub fn kind(&self) -> CompressionKind {
        self.kind
    }
}

impl Default for DefaultCompressor {
    fn default() -> Self {
        Self::new(CompressionKind::Lz4)
    }
}

impl PacketCompressor for DefaultCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        compress(data, &self.kind)
    }

    fn uncompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        decompress(data, &self.kind)
    }
}

/// Compresses data using the specified compression algorithm
///
/// # Errors
/// Returns `NetworkError::CompressionFailure` if compression fails
pub fn compress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    match kind {
        CompressionKind::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionKind::Zstd => {
            let mut out = Vec::new();
            zstd::stream::copy_encode(data, &mut out, 1)
                .map_err(|_| NetworkError::CompressionFailure)?;
            Ok(out)
        }
    }
}

/// Decompresses data that was compressed with the specified algorithm
///
/// # Errors
/// Returns `NetworkError::DecompressionFailure` if the input is malformed or the
/// output would exceed [`MAX_DECOMPRESSION_SIZE`].
pub fn decompress(data: &[u8], kind: &CompressionKind) -> Result<Vec<u8>> {
    match *kind {
        CompressionKind::Lz4 => {
            if data.len() < 4 {
                return Err(NetworkError::DecompressionFailure);
            }

            // lz4_flex prepends the uncompressed size as a little-endian u32
            let claimed_size = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
            if claimed_size > MAX_DECOMPRESSION_SIZE {
                return Err(NetworkError::DecompressionFailure);
            }

            lz4_flex::decompress_size_prepended(data)
                .map_err(|_| NetworkError::DecompressionFailure)
        }
        CompressionKind::Zstd => {
            use std::io::Read;

            let mut out = Vec::new();
            let mut reader = zstd::stream::Decoder::new(data)
                .map_err(|_| NetworkError::DecompressionFailure)?;

            let mut buffer = [0u8; 8192];
            loop {
                match reader.read(&mut buffer) {
                    Ok(0) => break,
                    Ok(n) => {
                        out.extend_from_slice(&buffer[..n]);
                        if out.len() > MAX_DECOMPRESSION_SIZE {
                            return Err(NetworkError::DecompressionFailure);
                        }
                    }
                    Err(_) => return Err(NetworkError::DecompressionFailure),
                }
            }
            Ok(out)
        }
    }
}
