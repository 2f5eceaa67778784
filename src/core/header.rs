//! # Packet Header
//!
//! The first byte of every wire packet carries four flags:
//!
//! ```text
//! bit 7 (0x80) binary
//! bit 6 (0x40) encrypted
//! bit 5 (0x20) compressed
//! bit 3 (0x08) big sized (length field is 4 bytes instead of 2)
//! ```
//!
//! Remaining bits are reserved and must be zero.

use crate::error::{NetworkError, Result};

pub const FLAG_BINARY: u8 = 0x80;
pub const FLAG_ENCRYPTED: u8 = 0x40;
pub const FLAG_COMPRESSED: u8 = 0x20;
pub const FLAG_BIG_SIZED: u8 = 0x08;

const KNOWN_FLAGS: u8 = FLAG_BINARY | FLAG_ENCRYPTED | FLAG_COMPRESSED | FLAG_BIG_SIZED;

/// Largest payload that still fits the short (2 byte) length field.
pub const SHORT_LENGTH_LIMIT: usize = u16::MAX as usize;

/// Immutable set of packet flags packed into one byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PacketHeader {
    pub binary: bool,
    pub compressed: bool,
    pub big_sized: bool,
    pub encrypted: bool,
}

impl PacketHeader {
    pub fn new(binary: bool, compressed: bool, big_sized: bool, encrypted: bool) -> Self {
        Self {
            binary,
            compressed,
            big_sized,
            encrypted,
        }
    }

    /// Build the header for a binary payload of `payload_len` bytes.
    pub fn for_payload(payload_len: usize, compressed: bool, encrypted: bool) -> Self {
        Self::new(true, compressed, payload_len > SHORT_LENGTH_LIMIT, encrypted)
    }

    pub fn to_byte(self) -> u8 {
        let mut byte = 0u8;
        if self.binary {
            byte |= FLAG_BINARY;
        }
        if self.encrypted {
            byte |= FLAG_ENCRYPTED;
        }
        if self.compressed {
            byte |= FLAG_COMPRESSED;
        }
        if self.big_sized {
            byte |= FLAG_BIG_SIZED;
        }
        byte
    }

    /// Unpack a header byte. Reserved bits or a missing binary flag are rejected.
    pub fn from_byte(byte: u8) -> Result<Self> {
        if byte & !KNOWN_FLAGS != 0 || byte & FLAG_BINARY == 0 {
            return Err(NetworkError::InvalidHeader);
        }
        Ok(Self {
            binary: true,
            compressed: byte & FLAG_COMPRESSED != 0,
            big_sized: byte & FLAG_BIG_SIZED != 0,
            encrypted: byte & FLAG_ENCRYPTED != 0,
        })
    }

    /// Width of the length field that follows this header.
    #[inline]
    pub fn length_field_size(&self) -> usize {
        if self.big_sized {
            4
        } else {
            2
        }
    }
}
