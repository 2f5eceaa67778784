//! # Admission Control
//!
//! Decides which peers may open a session before any session state is allocated.

pub mod filter;

pub use filter::{ConnectionFilter, DefaultConnectionFilter, DEFAULT_MAX_CONNECTIONS_PER_IP};
