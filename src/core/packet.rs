//! # Packet
//!
//! Outbound packet carrier and the read-side decode state.
//!
//! A [`Packet`] is created per outbound message. The encoder moves it through a fixed
//! sequence of stages:
//!
//! ```text
//! Raw -> Encrypted -> Compressed -> Framed
//! ```
//!
//! Encryption and compression are each optional, but they never run out of order and
//! a framed packet is never transformed again.

use crate::core::header::PacketHeader;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Session identifier, unique for the lifetime of an engine.
pub type SessionId = u64;

/// Delivery priority of an outbound packet. Drives the queue shedding policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PacketPriority {
    /// Non urgent traffic, shed first.
    Low,
    Normal,
    Urgent,
    /// Survives every shedding threshold; only a full queue rejects it.
    Guaranteed,
}

impl Default for PacketPriority {
    fn default() -> Self {
        PacketPriority::Normal
    }
}

/// Transport a packet (or session) travels over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransportType {
    Tcp,
    Udp,
    WebSocket,
    Kcp,
    Unknown,
}

/// Encoding stage of a packet's data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PacketState {
    Raw,
    Encrypted,
    Compressed,
    Framed,
}

#[derive(Debug, Clone)]
pub struct Packet {
    data: Vec<u8>,
    state: PacketState,
    priority: PacketPriority,
    encrypted: bool,
    transport: TransportType,
    sender: Option<SessionId>,
    recipients: Vec<SessionId>,
    created_at: Instant,
}

impl Packet {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            state: PacketState::Raw,
            priority: PacketPriority::Normal,
            encrypted: false,
            transport: TransportType::Tcp,
            sender: None,
            recipients: Vec::new(),
            created_at: Instant::now(),
        }
    }

    pub fn with_priority(mut self, priority: PacketPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_encryption(mut self, encrypted: bool) -> Self {
        self.encrypted = encrypted;
        self
    }

    pub fn with_transport(mut self, transport: TransportType) -> Self {
        self.transport = transport;
        self
    }

    pub fn with_sender(mut self, sender: SessionId) -> Self {
        self.sender = Some(sender);
        self
    }

    pub fn with_recipients(mut self, recipients: Vec<SessionId>) -> Self {
        self.recipients = recipients;
        self
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn into_data(self) -> Vec<u8> {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn state(&self) -> PacketState {
        self.state
    }

    pub fn is_framed(&self) -> bool {
        self.state == PacketState::Framed
    }

    pub fn priority(&self) -> PacketPriority {
        self.priority
    }

    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub fn sender(&self) -> Option<SessionId> {
        self.sender
    }

    pub fn recipients(&self) -> &[SessionId] {
        &self.recipients
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub(crate) fn take_data(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.data)
    }

    /// Advance the stage. Stages only move forward.
    pub(crate) fn mark(&mut self, state: PacketState) {
        debug_assert!(state > self.state, "packet stages only move forward");
        self.state = state;
    }

    pub(crate) fn advance(&mut self, state: PacketState, data: Vec<u8>) {
        self.mark(state);
        self.data = data;
    }

    pub(crate) fn clear_encryption(&mut self) {
        self.encrypted = false;
    }

    /// Copy carrying the same payload and metadata, addressed to one recipient.
    pub fn clone_for(&self, recipient: SessionId) -> Self {
        let mut packet = self.clone();
        packet.recipients = vec![recipient];
        packet
    }
}

/// Progress of the incremental reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketReadState {
    WaitNewPacket,
    WaitDataSize,
    WaitDataSizeFragment,
    WaitData,
}

/// Per-session inbound decode state. Never shared between sessions.
#[derive(Debug)]
pub struct PendingPacket {
    pub(crate) state: PacketReadState,
    pub(crate) header: Option<PacketHeader>,
    pub(crate) size_fragment: Vec<u8>,
    pub(crate) expected_length: usize,
    pub(crate) buffer: Vec<u8>,
}

impl PendingPacket {
    pub fn new() -> Self {
        Self {
            state: PacketReadState::WaitNewPacket,
            header: None,
            size_fragment: Vec::with_capacity(4),
            expected_length: 0,
            buffer: Vec::new(),
        }
    }

    pub fn state(&self) -> PacketReadState {
        self.state
    }

    pub fn header(&self) -> Option<PacketHeader> {
        self.header
    }

    pub fn expected_length(&self) -> usize {
        self.expected_length
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn reset(&mut self) {
        self.state = PacketReadState::WaitNewPacket;
        self.header = None;
        self.size_fragment.clear();
        self.expected_length = 0;
        self.buffer = Vec::new();
    }
}

impl Default for PendingPacket {
    fn default() -> Self {
        Self::new()
    }
}

/// One completed inbound packet, still in wire form (compressed and/or encrypted).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessedPacket {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}
