//! # Network Engine
//!
//! Wires the connection filter, session registry, codec, request controller and
//! writer shards together and runs the transport tasks.
//!
//! ## Tasks
//! - one acceptor per configured stream listener (TCP, WebSocket), each spawning a
//!   reader task per connection
//! - one reader for the shared UDP socket and one for the shared KCP socket
//! - a KCP tick task
//! - `writer_shards` writer tasks
//! - the idle scan
//! - `worker_threads` request workers inside the controller
//!
//! Every task watches one [`CancellationToken`]; [`NetworkEngine::shutdown`] cancels
//! it, closes all sessions and waits for the tasks to finish within the configured
//! shutdown timeout.
//!
//! ## Example
//! ```rust,no_run
//! use netcore::config::NetworkConfig;
//! use netcore::engine::NetworkEngine;
//! use netcore::protocol::{RequestEvent, Response};
//!
//! # async fn run() -> netcore::error::Result<()> {
//! let engine = NetworkEngine::new(NetworkConfig::from_env()?)?;
//! engine.register_handler(RequestEvent::SessionReadMessage, |request| {
//!     let (Some(sender), Some(message)) = (request.sender(), request.message()) else {
//!         return Ok(None);
//!     };
//!     Ok(Some(Response::new(message.clone()).to(sender.id())))
//! })?;
//! engine.start().await?;
//! # Ok(())
//! # }
//! ```

use crate::config::NetworkConfig;
use crate::core::codec::{BinaryPacketDecoder, BinaryPacketEncoder, PacketCodec};
use crate::core::packet::SessionId;
use crate::error::{NetworkError, Result};
use crate::protocol::controller::{closing_request, DeliveryReport, Outbound, RequestController, RequestQueue};
use crate::protocol::dispatcher::Dispatcher;
use crate::protocol::request::{Request, RequestEvent, Response};
use crate::security::filter::{ConnectionFilter, DefaultConnectionFilter};
use crate::session::partition::{QueuePartitionManager, TicketQueue};
use crate::session::{Session, SessionManager};
use crate::transport::kcp::KcpChannel;
use crate::transport::udp::{DatagramPacketPolicy, DefaultDatagramPacketPolicy};
use crate::transport::{kcp, tcp, udp, websocket, writer};
use crate::utils::buffer_pool::BufferPool;
use crate::utils::compression::{DefaultCompressor, PacketCompressor};
use crate::utils::crypto::PacketEncryptor;
use crate::utils::metrics::{NetworkStatistics, StatisticsSnapshot};
use std::net::SocketAddr;
use std::sync::{Arc, OnceLock};
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument, warn};

/// State shared by every task of one engine.
pub(crate) struct EngineCore {
    pub(crate) config: NetworkConfig,
    pub(crate) filter: Arc<dyn ConnectionFilter>,
    pub(crate) sessions: Arc<SessionManager>,
    pub(crate) controller: RequestController,
    pub(crate) encoder: BinaryPacketEncoder,
    pub(crate) decoder: BinaryPacketDecoder,
    pub(crate) datagram_policy: Arc<dyn DatagramPacketPolicy>,
    pub(crate) writers: Arc<QueuePartitionManager<TicketQueue>>,
    pub(crate) statistics: Arc<NetworkStatistics>,
    pub(crate) buffers: BufferPool,
    pub(crate) udp_socket: OnceLock<Arc<UdpSocket>>,
    pub(crate) kcp_socket: OnceLock<Arc<UdpSocket>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tracker: TaskTracker,
}

impl EngineCore {
    /// Unregister and close a session, then tell the application.
    ///
    /// Returns false if the session was already gone.
    pub(crate) fn close_session(&self, session: &Arc<Session>) -> bool {
        if self.sessions.remove_session(session.id()).is_none() {
            return false;
        }
        self.after_close(session.clone());
        true
    }

    fn after_close(&self, session: Arc<Session>) {
        self.statistics.session_closed();
        if self.shutdown.is_cancelled() {
            return;
        }
        if let Err(e) = self.controller.enqueue_request(closing_request(session)) {
            debug!(error = %e, "Close notification dropped");
        }
    }
}

/// Local addresses the engine actually bound. Useful when configured with port 0.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BoundAddresses {
    pub tcp: Option<SocketAddr>,
    pub udp: Option<SocketAddr>,
    pub websocket: Option<SocketAddr>,
    pub kcp: Option<SocketAddr>,
}

pub struct NetworkEngineBuilder {
    config: NetworkConfig,
    compressor: Option<Arc<dyn PacketCompressor>>,
    encryptor: Option<Arc<dyn PacketEncryptor>>,
    filter: Option<Arc<dyn ConnectionFilter>>,
    datagram_policy: Option<Arc<dyn DatagramPacketPolicy>>,
}

impl NetworkEngineBuilder {
    /// Replace the compressor built from `transport.compression_kind`.
    pub fn with_compressor(mut self, compressor: Arc<dyn PacketCompressor>) -> Self {
        self.compressor = Some(compressor);
        self
    }

    /// Encrypt responses marked as encrypted and decrypt encrypted inbound packets.
    pub fn with_encryptor(mut self, encryptor: Arc<dyn PacketEncryptor>) -> Self {
        self.encryptor = Some(encryptor);
        self
    }

    pub fn with_filter(mut self, filter: Arc<dyn ConnectionFilter>) -> Self {
        self.filter = Some(filter);
        self
    }

    pub fn with_datagram_policy(mut self, policy: Arc<dyn DatagramPacketPolicy>) -> Self {
        self.datagram_policy = Some(policy);
        self
    }

    pub fn build(self) -> Result<NetworkEngine> {
        let config = self.config;
        config.validate_strict()?;

        let compressor = match self.compressor {
            Some(compressor) => Some(compressor),
            None if config.transport.compression_enabled => Some(Arc::new(DefaultCompressor::new(
                config.transport.compression_kind,
            )) as Arc<dyn PacketCompressor>),
            None => None,
        };

        let mut encoder = BinaryPacketEncoder::new()
            .with_compression_threshold(config.transport.compression_threshold_bytes)
            .with_max_packet_size(config.transport.max_packet_size);
        let mut decoder = BinaryPacketDecoder::new(config.transport.data_type)
            .with_max_packet_size(config.transport.max_packet_size);
        if let Some(compressor) = compressor {
            encoder = encoder.with_compressor(compressor.clone());
            decoder = decoder.with_compressor(compressor);
        }
        if let Some(encryptor) = self.encryptor {
            encoder = encoder.with_encryptor(encryptor.clone());
            decoder = decoder.with_decryptor(encryptor);
        }

        let filter = self.filter.unwrap_or_else(|| {
            Arc::new(DefaultConnectionFilter::new(
                config.server.max_connections_per_ip,
            ))
        });
        let sessions = Arc::new(SessionManager::new(&config, filter.clone()));
        let writers = Arc::new(QueuePartitionManager::new(
            config.queues.writer_shards,
            TicketQueue::new,
        )?);
        let statistics = Arc::new(NetworkStatistics::new());

        let controller = RequestController::new(
            config.logging.app_name.clone(),
            RequestQueue::new(config.queues.request_queue_size, config.queues.priority_ordering),
            config.queues.worker_threads,
            Dispatcher::new(),
            Outbound {
                sessions: sessions.clone(),
                encoder: encoder.clone(),
                writers: writers.clone(),
                statistics: statistics.clone(),
            },
        );

        let buffers = BufferPool::new(
            config.transport.read_buffer_pool_size,
            config.transport.read_buffer_size,
        );

        let core = EngineCore {
            filter,
            sessions,
            controller,
            encoder,
            decoder,
            datagram_policy: self
                .datagram_policy
                .unwrap_or_else(|| Arc::new(DefaultDatagramPacketPolicy)),
            writers,
            statistics,
            buffers,
            udp_socket: OnceLock::new(),
            kcp_socket: OnceLock::new(),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            config,
        };

        Ok(NetworkEngine {
            core: Arc::new(core),
        })
    }
}

/// Handle to a running (or not yet started) network engine. Cheap to clone.
#[derive(Clone)]
pub struct NetworkEngine {
    core: Arc<EngineCore>,
}

impl NetworkEngine {
    pub fn builder(config: NetworkConfig) -> NetworkEngineBuilder {
        NetworkEngineBuilder {
            config,
            compressor: None,
            encryptor: None,
            filter: None,
            datagram_policy: None,
        }
    }

    pub fn new(config: NetworkConfig) -> Result<Self> {
        Self::builder(config).build()
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.core.config
    }

    pub fn filter(&self) -> &Arc<dyn ConnectionFilter> {
        &self.core.filter
    }

    pub fn sessions(&self) -> &SessionManager {
        &self.core.sessions
    }

    pub fn controller(&self) -> &RequestController {
        &self.core.controller
    }

    /// Codec matching this engine's settings, for clients talking to it.
    pub fn client_codec(&self) -> PacketCodec {
        PacketCodec::new(self.core.encoder.clone(), self.core.decoder.clone())
    }

    pub fn datagram_policy(&self) -> &Arc<dyn DatagramPacketPolicy> {
        &self.core.datagram_policy
    }

    pub fn register_handler<F>(&self, event: RequestEvent, handler: F) -> Result<()>
    where
        F: Fn(&Request) -> Result<Option<crate::protocol::Response>> + Send + Sync + 'static,
    {
        self.core.controller.dispatcher().register(event, handler)
    }

    /// Bind every configured listener and spawn the engine's tasks.
    #[instrument(skip(self), fields(app = %self.core.config.logging.app_name))]
    pub async fn start(&self) -> Result<BoundAddresses> {
        let core = &self.core;
        let server = &core.config.server;
        let mut bound = BoundAddresses::default();

        if let Some(address) = &server.tcp_address {
            let listener = TcpListener::bind(address).await?;
            bound.tcp = Some(listener.local_addr()?);
            core.tracker.spawn(tcp::run_acceptor(core.clone(), listener));
        }

        if let Some(address) = &server.websocket_address {
            let listener = TcpListener::bind(address).await?;
            bound.websocket = Some(listener.local_addr()?);
            core.tracker.spawn(websocket::run_acceptor(core.clone(), listener));
        }

        if let Some(address) = &server.udp_address {
            let socket = Arc::new(UdpSocket::bind(address).await?);
            bound.udp = Some(socket.local_addr()?);
            if core.udp_socket.set(socket.clone()).is_err() {
                return Err(NetworkError::ConfigError("engine already started".to_string()));
            }
            core.tracker.spawn(udp::run_reader(core.clone(), socket));
        }

        if let Some(address) = &server.kcp_address {
            let socket = Arc::new(UdpSocket::bind(address).await?);
            bound.kcp = Some(socket.local_addr()?);
            if core.kcp_socket.set(socket.clone()).is_err() {
                return Err(NetworkError::ConfigError("engine already started".to_string()));
            }
            core.tracker.spawn(kcp::run_reader(core.clone(), socket));
            core.tracker.spawn(kcp::run_ticker(core.clone()));
        }

        for shard in 0..core.writers.size() {
            core.tracker.spawn(writer::run_writer(core.clone(), shard));
        }
        core.tracker.spawn(run_idle_scan(core.clone()));
        core.controller.start();

        info!(?bound, "Network engine started");
        Ok(bound)
    }

    /// Queue a response for its recipients.
    pub fn send(&self, response: Response) -> Result<DeliveryReport> {
        self.core.controller.deliver(response)
    }

    pub fn session(&self, id: SessionId) -> Option<Arc<Session>> {
        self.core.sessions.get(id)
    }

    pub fn session_count(&self) -> usize {
        self.core.sessions.count()
    }

    /// Give a TCP session a datagram channel on the engine's UDP socket.
    ///
    /// Returns the conveying id the client must put in its datagram envelopes.
    pub fn attach_datagram(&self, id: SessionId) -> Result<i32> {
        let socket = self
            .core
            .udp_socket
            .get()
            .cloned()
            .ok_or_else(|| NetworkError::ConfigError("UDP transport is not running".to_string()))?;
        let session = self.core.sessions.get(id).ok_or(NetworkError::SessionNotFound(id))?;
        let channel = self.core.sessions.attach_datagram(&session, socket)?;
        Ok(channel.convey_id())
    }

    /// Give a TCP session a KCP channel on the engine's KCP socket. Returns its conv.
    pub fn attach_kcp(&self, id: SessionId) -> Result<u32> {
        let socket = self
            .core
            .kcp_socket
            .get()
            .cloned()
            .ok_or_else(|| NetworkError::ConfigError("KCP transport is not running".to_string()))?;
        let session = self.core.sessions.get(id).ok_or(NetworkError::SessionNotFound(id))?;
        let weak = Arc::downgrade(&session);
        let statistics = self.core.statistics.clone();
        let config = &self.core.config.kcp;
        let channel = self.core.sessions.attach_kcp(&session, |conv, queue| {
            KcpChannel::new(conv, socket, queue, config, statistics, weak)
        })?;
        Ok(channel.conv())
    }

    pub fn close_session(&self, id: SessionId) -> bool {
        match self.core.sessions.get(id) {
            Some(session) => self.core.close_session(&session),
            None => false,
        }
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.core.statistics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.core.controller.is_running()
    }

    /// Stop accepting, close every session and wait for the tasks to finish.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let core = &self.core;
        core.shutdown.cancel();

        let closed = core.sessions.close_all();
        for _ in 0..closed {
            core.statistics.session_closed();
        }

        core.tracker.close();
        let timeout = core.config.server.shutdown_timeout;
        if tokio::time::timeout(timeout, core.tracker.wait()).await.is_err() {
            warn!(?timeout, "Shutdown timeout reached, abandoning remaining tasks");
        }

        core.controller.shutdown().await;
        core.writers.clear();
        core.statistics.log_metrics();
        info!(closed, "Network engine stopped");
    }
}

impl std::fmt::Debug for NetworkEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetworkEngine")
            .field("sessions", &self.core.sessions)
            .field("controller", &self.core.controller)
            .finish()
    }
}

async fn run_idle_scan(core: Arc<EngineCore>) {
    let period = core
        .config
        .session
        .scan_interval
        .max(std::time::Duration::from_millis(10));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        for session in core.sessions.idle_scan() {
            core.after_close(session);
        }
    }
}
