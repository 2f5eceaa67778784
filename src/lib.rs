//! # netcore
//!
//! Network core for real-time game servers.
//!
//! Clients connect over TCP or WebSocket and may negotiate a UDP or KCP side
//! channel. Every transport carries the same binary packets:
//!
//! ```text
//! [header (1)] [length (2 or 4)] [payload]
//! ```
//!
//! Payloads are Zero collections or MessagePack maps, optionally encrypted and
//! compressed. Inbound messages become prioritized requests run by a worker pool;
//! outbound responses land in bounded per-session queues that shed low-priority
//! traffic under load.
//!
//! ## Layout
//! - [`core`]: header, packet, codec and payload formats
//! - [`session`]: sessions, packet queues, the session registry, queue partitioning
//! - [`security`]: per-address connection filter
//! - [`protocol`]: requests, responses, dispatcher and controller
//! - [`transport`]: TCP, WebSocket, UDP, KCP and the writer tasks
//! - [`engine`]: wires everything together
//! - [`config`], [`error`], [`utils`]: ambient pieces

pub mod config;
pub mod core;
pub mod engine;
pub mod error;
pub mod protocol;
pub mod security;
pub mod session;
pub mod transport;
pub mod utils;

pub use config::NetworkConfig;
pub use engine::{BoundAddresses, NetworkEngine};
pub use error::{NetworkError, Result};
