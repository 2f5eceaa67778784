//! # Core Protocol Components
//!
//! Packet framing, encoding/decoding and payload formats.
//!
//! ## Components
//! - **Header**: the one-byte flag set leading every packet
//! - **Packet**: outbound carrier with its encode stage, and the inbound decode state
//! - **Codec**: encoder, incremental decoder and a `tokio_util` framing adapter
//! - **Zero**: compact type-tagged map/array format
//! - **Serialization**: payload format selection (Zero or MessagePack)
//!
//! ## Wire Format
//! ```text
//! [Header(1)] [Length(2 or 4)] [Payload(N)]
//! ```
//!
//! ## Security
//! - Maximum packet size: 16MB (prevents memory exhaustion)
//! - Length validation before allocation

pub mod codec;
pub mod header;
pub mod packet;
pub mod serialization;
pub mod zero;
