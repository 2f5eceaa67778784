//! # Utility Modules
//!
//! Supporting utilities shared by the codec, sessions and transports.
//!
//! ## Components
//! - **Compression**: LZ4 and Zstd behind the `PacketCompressor` trait, with size limits
//! - **Crypto**: XChaCha20-Poly1305 behind the `PacketEncryptor` trait
//! - **Buffer Pool**: engine-owned socket read buffers
//! - **Logging**: `tracing-subscriber` setup
//! - **Metrics**: per-engine reader and writer statistics
//! - **Time**: millisecond clocks for sessions and KCP

pub mod buffer_pool;
pub mod compression;
pub mod crypto;
pub mod logging;
pub mod metrics;
pub mod time;

pub use compression::{CompressionKind, DefaultCompressor, PacketCompressor};
pub use crypto::{Crypto, PacketEncryptor};
pub use metrics::{NetworkStatistics, StatisticsSnapshot};
