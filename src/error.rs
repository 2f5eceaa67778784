//! # Error Types
//!
//! Error handling for the network core.
//!
//! Every fallible operation in the crate returns [`Result`]. The variants group into
//! the failure classes the server has to treat differently:
//!
//! ## Error Categories
//! - **Configuration errors**: a packet header asks for a compressor or decryptor that
//!   was never installed. Fatal for that decode attempt, never retried.
//! - **Backpressure errors**: packet queue full, request queue full, queue policy
//!   violation. Expected under load; the item is dropped and the caller decides how
//!   to throttle.
//! - **Admission errors**: banned address or per-address connection limit reached.
//!   Raised before any session exists.
//! - **Codec errors**: malformed headers, oversized packets, undecodable payloads.
//! - **I/O errors**: socket failures from the transports.
//!
//! ## Example Usage
//! ```rust
//! use netcore::error::{NetworkError, PacketQueueError, Result};
//!
//! fn enqueue(result: Result<()>) {
//!     match result {
//!         Err(NetworkError::PacketQueue(PacketQueueError::Full { max_size })) => {
//!             tracing::warn!(max_size, "outbound queue is full");
//!         }
//!         Err(e) => tracing::error!(error = %e, "enqueue failed"),
//!         Ok(()) => {}
//!     }
//! }
//! ```

use crate::core::packet::PacketPriority;
use std::io;
use std::net::IpAddr;
use thiserror::Error;

/// Static error strings reused on hot paths.
pub mod constants {
    /// Dispatcher-related error messages
    pub const ERR_DISPATCHER_WRITE_LOCK: &str = "Failed to acquire write lock on dispatcher";
    pub const ERR_DISPATCHER_READ_LOCK: &str = "Failed to acquire read lock on dispatcher";

    /// Codec errors
    pub const ERR_INVALID_HEADER: &str = "Invalid packet header";
    pub const ERR_TRUNCATED_DATAGRAM: &str = "Datagram shorter than its declared length";
    pub const ERR_MISSING_COMPRESSOR: &str =
        "Packet is compressed but no compressor is configured";
    pub const ERR_MISSING_DECRYPTOR: &str = "Packet is encrypted but no decryptor is configured";

    /// Zero format errors
    pub const ERR_ZERO_TOO_SHORT: &str = "Binary data is too short to hold a zero collection";
    pub const ERR_ZERO_NEGATIVE_SIZE: &str = "Negative size in zero collection";
    pub const ERR_ZERO_UNEXPECTED_EOF: &str = "Unexpected end of zero collection data";
    pub const ERR_ZERO_TOO_DEEP: &str = "Zero collection nesting exceeds the depth limit";

    /// Session errors
    pub const ERR_SESSION_NOT_TCP: &str =
        "A datagram or KCP channel can only be attached to a TCP session";
    pub const ERR_SESSION_INACTIVE: &str = "Session is no longer active";

    /// Synchronisation
    pub const ERR_LOCK_POISONED: &str = "Synchronization primitive poisoned";
}

/// Why the connection filter turned an address away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefusalReason {
    Banned,
    LimitReached { max: usize },
}

impl std::fmt::Display for RefusalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RefusalReason::Banned => write!(f, "address is banned"),
            RefusalReason::LimitReached { max } => {
                write!(f, "reached the limit of {max} connections")
            }
        }
    }
}

/// Rejections raised by a session's outbound packet queue.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PacketQueueError {
    #[error("Packet queue is full (max size {max_size})")]
    Full { max_size: usize },

    #[error("Packet with priority {priority:?} rejected at {percentage_used:.1}% queue usage")]
    PolicyViolation {
        priority: PacketPriority,
        percentage_used: f32,
    },
}

/// Primary error type for all network core operations.
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Invalid packet header")]
    InvalidHeader,

    #[error("Packet too large: {0} bytes")]
    OversizedPacket(usize),

    #[error("Truncated packet: expected {expected} bytes, got {actual}")]
    TruncatedPacket { expected: usize, actual: usize },

    #[error("Packet is compressed but no compressor is configured")]
    MissingCompressor,

    #[error("Packet is encrypted but no decryptor is configured")]
    MissingDecryptor,

    #[error("Encryption failed")]
    EncryptionFailure,

    #[error("Decryption failed")]
    DecryptionFailure,

    #[error("Compression failed")]
    CompressionFailure,

    #[error("Decompression failed")]
    DecompressionFailure,

    #[error("Serialize error: {0}")]
    SerializeError(String),

    #[error("Deserialize error: {0}")]
    DeserializeError(String),

    #[error(transparent)]
    PacketQueue(#[from] PacketQueueError),

    #[error("Request queue is full (size {size})")]
    RequestQueueFull { size: usize },

    #[error("Refused connection from {address}: {reason}")]
    RefusedAddress {
        address: IpAddr,
        reason: RefusalReason,
    },

    #[error("Session {0} not found")]
    SessionNotFound(u64),

    #[error("Session error: {0}")]
    SessionError(String),

    #[error("No handler registered for event {0}")]
    UnhandledEvent(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Synchronization primitive poisoned")]
    LockPoisoned,

    #[error("Custom error: {0}")]
    Custom(String),
}

impl NetworkError {
    /// Backpressure conditions are expected under load and should be throttled, not escalated.
    pub fn is_backpressure(&self) -> bool {
        matches!(
            self,
            NetworkError::PacketQueue(_) | NetworkError::RequestQueueFull { .. }
        )
    }

    /// Configuration errors are fatal for the operation and must not be retried.
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            NetworkError::MissingCompressor
                | NetworkError::MissingDecryptor
                | NetworkError::ConfigError(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for NetworkError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        NetworkError::TransportError(format!("websocket: {err}"))
    }
}

impl From<kcp::Error> for NetworkError {
    fn from(err: kcp::Error) -> Self {
        NetworkError::TransportError(format!("kcp: {err:?}"))
    }
}

/// Type alias for Results using NetworkError
pub type Result<T> = std::result::Result<T, NetworkError>;
