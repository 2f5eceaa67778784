//! # Session
//!
//! Server-side identity of one connected client, possibly spanning several transports.
//!
//! A session is composed from a small set of channel capabilities rather than a type
//! per transport:
//!
//! - a **stream channel** (TCP or WebSocket) with its own outbound [`PacketQueue`]
//! - an optional **datagram channel** (plain UDP, routed by conveying id)
//! - an optional **KCP channel** (reliable UDP, routed by `conv`)
//!
//! The secondary channels can only be attached to a TCP session: clients authenticate
//! over TCP, then negotiate the faster path. Each secondary channel brings its own
//! outbound queue, so a full UDP queue never blocks the TCP stream and vice versa.
//!
//! ## Lifecycle
//! Sessions start active. [`Session::close`] runs once: it releases the connection
//! filter slot, empties every queue, detaches secondary channels and signals the
//! reader task to shut the transport down.

use crate::core::codec::BinaryPacketDecoder;
use crate::core::packet::{Packet, PendingPacket, ProcessedPacket, SessionId, TransportType};
use crate::error::{constants, NetworkError, Result};
use crate::security::filter::ConnectionFilter;
use crate::session::channel::StreamChannel;
use crate::session::queue::PacketQueue;
use crate::transport::kcp::KcpChannel;
use crate::transport::udp::{DatagramChannel, EMPTY_DATAGRAM_CONVEY_ID};
use crate::utils::time::{current_time_millis, elapsed_millis};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Time a new session may stay unassociated before it counts as an orphan.
pub const ORPHAN_ALLOWANCE: Duration = Duration::from_millis(3000);

pub struct Session {
    id: SessionId,
    name: RwLock<Option<String>>,
    transport: TransportType,
    client_address: SocketAddr,
    server_address: Option<SocketAddr>,

    stream: Option<StreamChannel>,
    packet_queue: PacketQueue,
    datagram: RwLock<Option<Arc<DatagramChannel>>>,
    kcp: RwLock<Option<Arc<KcpChannel>>>,
    pending: Mutex<PendingPacket>,
    filter: Option<Arc<dyn ConnectionFilter>>,

    created_time: u64,
    last_read_time: AtomicU64,
    last_write_time: AtomicU64,
    last_activity_time: AtomicU64,
    inactivated_time: AtomicU64,

    read_bytes: AtomicU64,
    read_messages: AtomicU64,
    written_bytes: AtomicU64,
    dropped_packets: AtomicU64,

    max_idle_millis: AtomicU64,
    activated: AtomicBool,
    associated: AtomicBool,
    scheduled: AtomicBool,
    closed: CancellationToken,
}

impl Session {
    pub fn new(
        id: SessionId,
        transport: TransportType,
        client_address: SocketAddr,
        packet_queue: PacketQueue,
    ) -> Self {
        let now = current_time_millis();
        Self {
            id,
            name: RwLock::new(None),
            transport,
            client_address,
            server_address: None,
            stream: None,
            packet_queue,
            datagram: RwLock::new(None),
            kcp: RwLock::new(None),
            pending: Mutex::new(PendingPacket::new()),
            filter: None,
            created_time: now,
            last_read_time: AtomicU64::new(now),
            last_write_time: AtomicU64::new(now),
            last_activity_time: AtomicU64::new(now),
            inactivated_time: AtomicU64::new(0),
            read_bytes: AtomicU64::new(0),
            read_messages: AtomicU64::new(0),
            written_bytes: AtomicU64::new(0),
            dropped_packets: AtomicU64::new(0),
            max_idle_millis: AtomicU64::new(0),
            activated: AtomicBool::new(true),
            associated: AtomicBool::new(false),
            scheduled: AtomicBool::new(false),
            closed: CancellationToken::new(),
        }
    }

    pub fn with_stream(mut self, stream: StreamChannel) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn with_server_address(mut self, address: SocketAddr) -> Self {
        self.server_address = Some(address);
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn ConnectionFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_max_idle_time(self, max_idle: Duration) -> Self {
        self.set_max_idle_time(max_idle);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn name(&self) -> Option<String> {
        self.name.read().ok().and_then(|n| n.clone())
    }

    pub fn set_name(&self, name: impl Into<String>) {
        if let Ok(mut guard) = self.name.write() {
            *guard = Some(name.into());
        }
    }

    pub fn transport(&self) -> TransportType {
        self.transport
    }

    pub fn is_tcp(&self) -> bool {
        self.transport == TransportType::Tcp
    }

    pub fn is_websocket(&self) -> bool {
        self.transport == TransportType::WebSocket
    }

    pub fn client_address(&self) -> SocketAddr {
        self.client_address
    }

    pub fn server_address(&self) -> Option<SocketAddr> {
        self.server_address
    }

    pub fn stream(&self) -> Option<&StreamChannel> {
        self.stream.as_ref()
    }

    pub fn packet_queue(&self) -> &PacketQueue {
        &self.packet_queue
    }

    // ---- secondary channels ----

    pub fn datagram(&self) -> Option<Arc<DatagramChannel>> {
        self.datagram.read().ok().and_then(|d| d.clone())
    }

    pub fn contains_udp(&self) -> bool {
        self.datagram().is_some()
    }

    /// Conveying id of the attached datagram channel, or the empty sentinel.
    pub fn udp_convey_id(&self) -> i32 {
        self.datagram()
            .map(|d| d.convey_id())
            .unwrap_or(EMPTY_DATAGRAM_CONVEY_ID)
    }

    pub fn attach_datagram(&self, channel: Arc<DatagramChannel>) -> Result<()> {
        self.ensure_attachable()?;
        let mut guard = self.datagram.write().map_err(|_| NetworkError::LockPoisoned)?;
        *guard = Some(channel);
        Ok(())
    }

    pub fn detach_datagram(&self) -> Option<Arc<DatagramChannel>> {
        let detached = self.datagram.write().ok().and_then(|mut d| d.take());
        if let Some(channel) = &detached {
            channel.queue().clear();
        }
        detached
    }

    pub fn kcp(&self) -> Option<Arc<KcpChannel>> {
        self.kcp.read().ok().and_then(|k| k.clone())
    }

    pub fn contains_kcp(&self) -> bool {
        self.kcp().is_some()
    }

    pub fn attach_kcp(&self, channel: Arc<KcpChannel>) -> Result<()> {
        self.ensure_attachable()?;
        let mut guard = self.kcp.write().map_err(|_| NetworkError::LockPoisoned)?;
        *guard = Some(channel);
        Ok(())
    }

    pub fn detach_kcp(&self) -> Option<Arc<KcpChannel>> {
        let detached = self.kcp.write().ok().and_then(|mut k| k.take());
        if let Some(channel) = &detached {
            channel.queue().clear();
        }
        detached
    }

    fn ensure_attachable(&self) -> Result<()> {
        if !self.is_tcp() {
            return Err(NetworkError::SessionError(
                constants::ERR_SESSION_NOT_TCP.to_string(),
            ));
        }
        if !self.is_activated() {
            return Err(NetworkError::SessionError(
                constants::ERR_SESSION_INACTIVE.to_string(),
            ));
        }
        Ok(())
    }

    // ---- outbound ----

    /// Route a framed packet to the queue of the channel it asks for.
    ///
    /// Rejections count as dropped packets and are returned to the caller.
    pub fn enqueue(&self, packet: Packet) -> Result<()> {
        let result = match packet.transport() {
            TransportType::Udp => match self.datagram() {
                Some(channel) => channel.queue().put(packet).map_err(NetworkError::from),
                None => Err(NetworkError::SessionError(format!(
                    "session {} has no datagram channel",
                    self.id
                ))),
            },
            TransportType::Kcp => match self.kcp() {
                Some(channel) => channel.queue().put(packet).map_err(NetworkError::from),
                None => Err(NetworkError::SessionError(format!(
                    "session {} has no KCP channel",
                    self.id
                ))),
            },
            _ => {
                if !self.is_activated() {
                    Err(NetworkError::SessionError(
                        constants::ERR_SESSION_INACTIVE.to_string(),
                    ))
                } else {
                    self.packet_queue.put(packet).map_err(NetworkError::from)
                }
            }
        };

        if result.is_err() {
            self.add_dropped_packets(1);
        }
        result
    }

    /// True when any of the session's queues holds packets.
    pub fn has_pending_output(&self) -> bool {
        !self.packet_queue.is_empty()
            || self.datagram().is_some_and(|d| !d.queue().is_empty())
            || self.kcp().is_some_and(|k| !k.queue().is_empty())
    }

    /// Claim the session for a writer pass. Returns false if one is already scheduled.
    pub fn try_schedule(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub fn clear_scheduled(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    // ---- inbound ----

    /// Feed stream bytes through this session's decode state.
    pub fn read_stream(
        &self,
        decoder: &BinaryPacketDecoder,
        bytes: &[u8],
    ) -> Result<Vec<ProcessedPacket>> {
        self.add_read_bytes(bytes.len() as u64);
        let mut pending = self.pending.lock().map_err(|_| NetworkError::LockPoisoned)?;
        decoder.read(&mut pending, bytes)
    }

    pub fn add_read_bytes(&self, bytes: u64) {
        let now = current_time_millis();
        self.read_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.last_read_time.store(now, Ordering::Relaxed);
        self.last_activity_time.store(now, Ordering::Relaxed);
    }

    pub fn increase_read_messages(&self) {
        self.read_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_written_bytes(&self, bytes: u64) {
        let now = current_time_millis();
        self.written_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.last_write_time.store(now, Ordering::Relaxed);
        self.last_activity_time.store(now, Ordering::Relaxed);
    }

    pub fn add_dropped_packets(&self, packets: u64) {
        self.dropped_packets.fetch_add(packets, Ordering::Relaxed);
    }

    pub fn read_bytes(&self) -> u64 {
        self.read_bytes.load(Ordering::Relaxed)
    }

    pub fn read_messages(&self) -> u64 {
        self.read_messages.load(Ordering::Relaxed)
    }

    pub fn written_bytes(&self) -> u64 {
        self.written_bytes.load(Ordering::Relaxed)
    }

    pub fn dropped_packets(&self) -> u64 {
        self.dropped_packets.load(Ordering::Relaxed)
    }

    pub fn created_time(&self) -> u64 {
        self.created_time
    }

    pub fn last_read_time(&self) -> u64 {
        self.last_read_time.load(Ordering::Relaxed)
    }

    pub fn last_write_time(&self) -> u64 {
        self.last_write_time.load(Ordering::Relaxed)
    }

    pub fn last_activity_time(&self) -> u64 {
        self.last_activity_time.load(Ordering::Relaxed)
    }

    /// Mark activity without traffic (heartbeats handled by the application).
    pub fn touch(&self) {
        self.last_activity_time
            .store(current_time_millis(), Ordering::Relaxed);
    }

    // ---- liveness ----

    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_millis.load(Ordering::Relaxed))
    }

    /// Zero disables idle detection.
    pub fn set_max_idle_time(&self, max_idle: Duration) {
        self.max_idle_millis
            .store(max_idle.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn is_idle(&self) -> bool {
        let max = self.max_idle_millis.load(Ordering::Relaxed);
        max > 0 && elapsed_millis(self.last_activity_time()) > max
    }

    /// The application has bound this session to one of its own entities.
    pub fn set_associated(&self, associated: bool) {
        self.associated.store(associated, Ordering::Release);
    }

    pub fn is_associated(&self) -> bool {
        self.associated.load(Ordering::Acquire)
    }

    pub fn is_orphan(&self) -> bool {
        !self.is_associated()
            && elapsed_millis(self.created_time) >= ORPHAN_ALLOWANCE.as_millis() as u64
    }

    pub fn is_activated(&self) -> bool {
        self.activated.load(Ordering::Acquire)
    }

    pub fn activate(&self) {
        self.activated.store(true, Ordering::Release);
    }

    pub fn deactivate(&self) {
        self.activated.store(false, Ordering::Release);
        self.inactivated_time
            .store(current_time_millis(), Ordering::Relaxed);
    }

    pub fn inactivated_time(&self) -> u64 {
        self.inactivated_time.load(Ordering::Relaxed)
    }

    /// Cancelled once the session closes. Reader tasks select on it.
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    /// Release every resource the session holds. Only the first call does anything.
    ///
    /// Returns true when this call performed the close.
    pub fn close(&self) -> bool {
        if self
            .activated
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.inactivated_time
            .store(current_time_millis(), Ordering::Relaxed);

        if let Some(filter) = &self.filter {
            filter.remove_address(self.client_address.ip());
        }

        self.packet_queue.clear();
        if self.detach_datagram().is_some() {
            debug!(session = self.id, "Detached datagram channel");
        }
        if self.detach_kcp().is_some() {
            debug!(session = self.id, "Detached KCP channel");
        }
        if let Ok(mut pending) = self.pending.lock() {
            pending.reset();
        }

        self.closed.cancel();
        info!(
            session = self.id,
            client = %self.client_address,
            transport = ?self.transport,
            read_bytes = self.read_bytes(),
            written_bytes = self.written_bytes(),
            dropped_packets = self.dropped_packets(),
            "Session closed"
        );
        true
    }
}

impl PartialEq for Session {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Session {}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name())
            .field("transport", &self.transport)
            .field("client_address", &self.client_address)
            .field("activated", &self.is_activated())
            .field("has_udp", &self.contains_udp())
            .field("has_kcp", &self.contains_kcp())
            .finish()
    }
}
