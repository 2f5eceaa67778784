//! Session registry.
//!
//! Indexes live sessions by id and by the routing keys of their secondary channels,
//! so the UDP and KCP readers can resolve an inbound datagram without scanning.

use crate::config::NetworkConfig;
use crate::core::packet::{SessionId, TransportType};
use crate::error::{constants, NetworkError, Result};
use crate::security::filter::ConnectionFilter;
use crate::session::channel::StreamChannel;
use crate::session::queue::{DefaultPacketQueuePolicy, NoSheddingPolicy, PacketQueue, PacketQueuePolicy};
use crate::session::session::Session;
use crate::transport::kcp::KcpChannel;
use crate::transport::udp::DatagramChannel;
use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct SessionManager {
    sessions: DashMap<SessionId, Arc<Session>>,
    udp_convs: DashMap<i32, SessionId>,
    kcp_convs: DashMap<u32, SessionId>,
    next_session_id: AtomicU64,
    next_udp_conv: AtomicI32,
    next_kcp_conv: AtomicU32,
    filter: Arc<dyn ConnectionFilter>,
    queue_policy: Arc<dyn PacketQueuePolicy>,
    packet_queue_size: usize,
    max_idle_time: Duration,
    orphan_check: bool,
}

impl SessionManager {
    pub fn new(config: &NetworkConfig, filter: Arc<dyn ConnectionFilter>) -> Self {
        let queue_policy: Arc<dyn PacketQueuePolicy> = if config.queues.shedding_enabled {
            Arc::new(DefaultPacketQueuePolicy::new())
        } else {
            Arc::new(NoSheddingPolicy)
        };

        Self {
            sessions: DashMap::new(),
            udp_convs: DashMap::new(),
            kcp_convs: DashMap::new(),
            next_session_id: AtomicU64::new(1),
            next_udp_conv: AtomicI32::new(1),
            next_kcp_conv: AtomicU32::new(1),
            filter,
            queue_policy,
            packet_queue_size: config.queues.packet_queue_size,
            max_idle_time: config.session.max_idle_time,
            orphan_check: config.session.orphan_check,
        }
    }

    /// A fresh outbound queue with the configured size and overload policy.
    pub fn create_packet_queue(&self) -> PacketQueue {
        PacketQueue::new(self.packet_queue_size, self.queue_policy.clone())
    }

    /// Register a session for an admitted stream connection.
    ///
    /// The caller must already hold a filter slot for `client_address`; the session
    /// releases it when it closes.
    pub fn create_session(
        &self,
        transport: TransportType,
        client_address: SocketAddr,
        server_address: Option<SocketAddr>,
        stream: StreamChannel,
    ) -> Arc<Session> {
        let id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let mut session = Session::new(id, transport, client_address, self.create_packet_queue())
            .with_stream(stream)
            .with_filter(self.filter.clone())
            .with_max_idle_time(self.max_idle_time);
        if let Some(address) = server_address {
            session = session.with_server_address(address);
        }

        let session = Arc::new(session);
        self.sessions.insert(id, session.clone());
        debug!(session = id, client = %client_address, ?transport, "Session created");
        session
    }

    pub fn get(&self, id: SessionId) -> Option<Arc<Session>> {
        self.sessions.get(&id).map(|s| s.clone())
    }

    pub fn contains(&self, id: SessionId) -> bool {
        self.sessions.contains_key(&id)
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn sessions(&self) -> Vec<Arc<Session>> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    /// Unregister and close a session. Returns it if it was registered.
    pub fn remove_session(&self, id: SessionId) -> Option<Arc<Session>> {
        let (_, session) = self.sessions.remove(&id)?;
        self.unindex(&session);
        session.close();
        Some(session)
    }

    fn unindex(&self, session: &Session) {
        if let Some(channel) = session.datagram() {
            self.udp_convs.remove(&channel.convey_id());
        }
        if let Some(channel) = session.kcp() {
            self.kcp_convs.remove(&channel.conv());
        }
    }

    fn ensure_tcp(session: &Session) -> Result<()> {
        if session.is_tcp() {
            Ok(())
        } else {
            Err(NetworkError::SessionError(
                constants::ERR_SESSION_NOT_TCP.to_string(),
            ))
        }
    }

    /// Allocate a conveying id and attach a datagram channel to a TCP session.
    ///
    /// Re-attaching replaces the previous channel and its conveying id.
    pub fn attach_datagram(
        &self,
        session: &Arc<Session>,
        socket: Arc<tokio::net::UdpSocket>,
    ) -> Result<Arc<DatagramChannel>> {
        Self::ensure_tcp(session)?;
        let conv = self.next_udp_conv.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(DatagramChannel::new(conv, socket, self.create_packet_queue()));

        self.detach_datagram(session);
        session.attach_datagram(channel.clone())?;
        self.udp_convs.insert(conv, session.id());
        info!(session = session.id(), conv, "Datagram channel attached");
        Ok(channel)
    }

    pub fn detach_datagram(&self, session: &Session) -> bool {
        match session.detach_datagram() {
            Some(channel) => {
                self.udp_convs.remove(&channel.convey_id());
                true
            }
            None => false,
        }
    }

    /// Allocate a KCP conv and attach a KCP channel built by `build` to a TCP session.
    pub fn attach_kcp<F>(&self, session: &Arc<Session>, build: F) -> Result<Arc<KcpChannel>>
    where
        F: FnOnce(u32, PacketQueue) -> KcpChannel,
    {
        Self::ensure_tcp(session)?;
        let conv = self.next_kcp_conv.fetch_add(1, Ordering::Relaxed);
        let channel = Arc::new(build(conv, self.create_packet_queue()));

        self.detach_kcp(session);
        session.attach_kcp(channel.clone())?;
        self.kcp_convs.insert(conv, session.id());
        info!(session = session.id(), conv, "KCP channel attached");
        Ok(channel)
    }

    pub fn detach_kcp(&self, session: &Session) -> bool {
        match session.detach_kcp() {
            Some(channel) => {
                self.kcp_convs.remove(&channel.conv());
                true
            }
            None => false,
        }
    }

    pub fn session_by_udp_conv(&self, conv: i32) -> Option<Arc<Session>> {
        let id = *self.udp_convs.get(&conv)?;
        self.get(id)
    }

    pub fn session_by_kcp_conv(&self, conv: u32) -> Option<Arc<Session>> {
        let id = *self.kcp_convs.get(&conv)?;
        self.get(id)
    }

    /// Sessions currently holding a KCP channel.
    pub fn kcp_sessions(&self) -> Vec<Arc<Session>> {
        self.kcp_convs
            .iter()
            .filter_map(|entry| self.get(*entry.value()))
            .collect()
    }

    /// Unregister and close every idle session, and every orphan when orphan checking
    /// is enabled. Returns the closed sessions.
    pub fn idle_scan(&self) -> Vec<Arc<Session>> {
        let expired: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|s| s.is_idle() || (self.orphan_check && s.is_orphan()))
            .map(|s| s.id())
            .collect();

        expired
            .into_iter()
            .filter_map(|id| {
                let session = self.remove_session(id)?;
                info!(session = id, idle = session.is_idle(), "Closing expired session");
                Some(session)
            })
            .collect()
    }

    /// Close and unregister everything.
    pub fn close_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|s| *s.key()).collect();
        ids.into_iter()
            .filter(|id| self.remove_session(*id).is_some())
            .count()
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("sessions", &self.sessions.len())
            .field("udp_channels", &self.udp_convs.len())
            .field("kcp_channels", &self.kcp_convs.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::security::filter::DefaultConnectionFilter;
    use crate::utils::metrics::NetworkStatistics;
    use tokio::net::{TcpListener, TcpStream, UdpSocket};

    async fn tcp_stream() -> StreamChannel {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (client, _) = tokio::join!(TcpStream::connect(address), listener.accept());
        let (_read, write) = client.unwrap().into_split();
        StreamChannel::tcp(write)
    }

    fn manager(config: NetworkConfig) -> (SessionManager, Arc<DefaultConnectionFilter>) {
        let filter = Arc::new(DefaultConnectionFilter::default());
        (SessionManager::new(&config, filter.clone()), filter)
    }

    fn client() -> SocketAddr {
        "127.0.0.1:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn ids_are_monotonic_and_indexed() {
        let (manager, _) = manager(NetworkConfig::default());
        let a = manager.create_session(TransportType::Tcp, client(), None, tcp_stream().await);
        let b = manager.create_session(TransportType::Tcp, client(), None, tcp_stream().await);
        assert!(b.id() > a.id());
        assert_eq!(manager.count(), 2);
        assert!(manager.get(a.id()).is_some());
    }

    #[tokio::test]
    async fn datagram_routing_follows_attach_and_detach() {
        let (manager, _) = manager(NetworkConfig::default());
        let session = manager.create_session(TransportType::Tcp, client(), None, tcp_stream().await);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        let channel = manager.attach_datagram(&session, socket).unwrap();
        let conv = channel.convey_id();
        assert_eq!(manager.session_by_udp_conv(conv).unwrap().id(), session.id());
        assert_eq!(session.udp_convey_id(), conv);

        assert!(manager.detach_datagram(&session));
        assert!(manager.session_by_udp_conv(conv).is_none());
    }

    #[tokio::test]
    async fn websocket_session_rejects_secondary_channels() {
        let (manager, _) = manager(NetworkConfig::default());
        let session =
            manager.create_session(TransportType::WebSocket, client(), None, tcp_stream().await);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());

        assert!(manager.attach_datagram(&session, socket.clone()).is_err());
        let stats = Arc::new(NetworkStatistics::new());
        let result = manager.attach_kcp(&session, |conv, queue| {
            KcpChannel::new(conv, socket, queue, &Default::default(), stats, Arc::downgrade(&session))
        });
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn kcp_channel_is_indexed_by_conv() {
        let (manager, _) = manager(NetworkConfig::default());
        let session = manager.create_session(TransportType::Tcp, client(), None, tcp_stream().await);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let stats = Arc::new(NetworkStatistics::new());
        let weak = Arc::downgrade(&session);

        let channel = manager
            .attach_kcp(&session, |conv, queue| {
                KcpChannel::new(conv, socket, queue, &Default::default(), stats, weak)
            })
            .unwrap();
        assert_eq!(manager.session_by_kcp_conv(channel.conv()).unwrap().id(), session.id());
        assert_eq!(manager.kcp_sessions().len(), 1);
    }

    #[tokio::test]
    async fn remove_session_releases_everything() {
        let (manager, filter) = manager(NetworkConfig::default());
        filter.validate_and_add_address(client().ip()).unwrap();
        let session = manager.create_session(TransportType::Tcp, client(), None, tcp_stream().await);
        let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let conv = manager.attach_datagram(&session, socket).unwrap().convey_id();

        assert!(manager.remove_session(session.id()).is_some());
        assert!(manager.remove_session(session.id()).is_none());
        assert!(manager.session_by_udp_conv(conv).is_none());
        assert_eq!(filter.connection_count(&client().ip()), 0);
        assert!(!session.is_activated());
    }

    #[tokio::test]
    async fn idle_scan_closes_only_expired_sessions() {
        let config = NetworkConfig::default_with_overrides(|c| {
            c.session.max_idle_time = Duration::from_millis(1);
        });
        let (manager, _) = manager(config);
        let idle = manager.create_session(TransportType::Tcp, client(), None, tcp_stream().await);
        let busy = manager.create_session(TransportType::Tcp, client(), None, tcp_stream().await);
        busy.set_max_idle_time(Duration::from_secs(60));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let closed = manager.idle_scan();
        assert_eq!(closed.len(), 1);
        assert_eq!(closed[0].id(), idle.id());
        assert!(manager.contains(busy.id()));
    }
}
