//! # KCP Transport
//!
//! Reliable, ordered delivery over UDP using the `kcp` crate.
//!
//! All KCP channels share one server socket. The first four bytes of every KCP
//! segment carry the `conv` id, which routes the segment to its channel. Each
//! channel owns a [`Kcp`] control block whose output writes straight back through
//! the shared socket and counts what it sends.
//!
//! A tick task drives every channel's clock at `update_interval` milliseconds and
//! retires channels that have stopped receiving input for `idle_timeout`.
//!
//! Each KCP message carries exactly one framed packet, decoded with the same codec
//! as every other transport.

use crate::config::KcpConfig;
use crate::engine::EngineCore;
use crate::error::{NetworkError, Result};
use crate::protocol::request::{Request, RequestEvent};
use crate::session::queue::PacketQueue;
use crate::session::session::Session;
use crate::utils::metrics::NetworkStatistics;
use crate::utils::time::{current_time_millis, elapsed_millis, kcp_clock};
use kcp::Kcp;
use std::io::{self, Write};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

/// Bytes of KCP segment header. Anything shorter cannot be a segment.
pub const KCP_OVERHEAD: usize = 24;

type SharedRemote = Arc<RwLock<Option<SocketAddr>>>;

/// Raw writer behind a KCP control block.
pub struct KcpOutput {
    socket: Arc<UdpSocket>,
    remote: SharedRemote,
    statistics: Arc<NetworkStatistics>,
    session: Weak<Session>,
}

impl Write for KcpOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let remote = self.remote.read().ok().and_then(|r| *r);
        let Some(remote) = remote else {
            // Peer not heard from yet. The segment stays in KCP's send buffer and is
            // retransmitted once it is, so nothing is lost.
            trace!(bytes = buf.len(), "KCP output held until the peer is known");
            return Ok(buf.len());
        };

        match self.socket.try_send_to(buf, remote) {
            Ok(written) => {
                self.statistics.update_written_bytes(written as u64);
                self.statistics.update_written_packets(1);
                if let Some(session) = self.session.upgrade() {
                    session.add_written_bytes(written as u64);
                }
                Ok(written)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                self.statistics.update_written_dropped_packets(1);
                Ok(buf.len())
            }
            Err(e) => Err(e),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// KCP capability of a TCP session.
pub struct KcpChannel {
    conv: u32,
    kcp: Mutex<Kcp<KcpOutput>>,
    remote: SharedRemote,
    queue: PacketQueue,
    last_input_time: AtomicU64,
    idle_timeout: Duration,
}

impl KcpChannel {
    pub fn new(
        conv: u32,
        socket: Arc<UdpSocket>,
        queue: PacketQueue,
        config: &KcpConfig,
        statistics: Arc<NetworkStatistics>,
        session: Weak<Session>,
    ) -> Self {
        let remote: SharedRemote = Arc::new(RwLock::new(None));
        let output = KcpOutput {
            socket,
            remote: remote.clone(),
            statistics,
            session,
        };

        let mut kcp = Kcp::new(conv, output);
        kcp.set_nodelay(
            config.no_delay,
            config.update_interval as i32,
            config.fast_resend as i32,
            !config.congestion_control,
        );
        kcp.set_wndsize(config.send_window, config.receive_window);
        // Start the clock so the first send can flush without waiting for a tick.
        if let Err(e) = kcp.update(kcp_clock()) {
            debug!(conv, error = %e, "Initial KCP update failed");
        }

        Self {
            conv,
            kcp: Mutex::new(kcp),
            remote,
            queue,
            last_input_time: AtomicU64::new(current_time_millis()),
            idle_timeout: config.idle_timeout,
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote.read().ok().and_then(|r| *r)
    }

    pub fn set_remote_address(&self, address: SocketAddr) {
        if let Ok(mut remote) = self.remote.write() {
            *remote = Some(address);
        }
    }

    /// Feed one raw UDP datagram into the control block.
    pub fn input(&self, datagram: &[u8]) -> Result<()> {
        let mut kcp = self.kcp.lock().map_err(|_| NetworkError::LockPoisoned)?;
        kcp.input(datagram)?;
        self.last_input_time
            .store(current_time_millis(), Ordering::Relaxed);
        Ok(())
    }

    /// Drain every message KCP has fully reassembled.
    pub fn receive(&self) -> Result<Vec<Vec<u8>>> {
        let mut kcp = self.kcp.lock().map_err(|_| NetworkError::LockPoisoned)?;
        let mut messages = Vec::new();
        while let Ok(size) = kcp.peeksize() {
            let mut message = vec![0u8; size];
            let read = kcp.recv(&mut message)?;
            message.truncate(read);
            messages.push(message);
        }
        Ok(messages)
    }

    /// Queue one framed packet for reliable delivery and push it out immediately.
    pub fn send(&self, bytes: &[u8]) -> Result<usize> {
        let mut kcp = self.kcp.lock().map_err(|_| NetworkError::LockPoisoned)?;
        let sent = kcp.send(bytes)?;
        match kcp.flush() {
            // Still queued; the next tick flushes it.
            Ok(()) | Err(kcp::Error::NeedUpdate) => Ok(sent),
            Err(e) => Err(e.into()),
        }
    }

    /// Advance the KCP clock, retransmitting as needed.
    pub fn update(&self, now: u32) -> Result<()> {
        let mut kcp = self.kcp.lock().map_err(|_| NetworkError::LockPoisoned)?;
        kcp.update(now)?;
        Ok(())
    }

    /// Segments still waiting for acknowledgement.
    pub fn pending_segments(&self) -> usize {
        self.kcp.lock().map(|k| k.wait_snd()).unwrap_or(0)
    }

    pub fn last_input_time(&self) -> u64 {
        self.last_input_time.load(Ordering::Relaxed)
    }

    pub fn is_expired(&self) -> bool {
        !self.idle_timeout.is_zero()
            && elapsed_millis(self.last_input_time()) > self.idle_timeout.as_millis() as u64
    }
}

impl std::fmt::Debug for KcpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KcpChannel")
            .field("conv", &self.conv)
            .field("remote", &self.remote_address())
            .field("queued", &self.queue.size())
            .finish()
    }
}

/// Receive loop for the shared KCP socket.
pub(crate) async fn run_reader(core: Arc<EngineCore>, socket: Arc<UdpSocket>) {
    let shutdown = core.shutdown.clone();
    let mut buffer = core.buffers.acquire();

    loop {
        let (length, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    debug!(error = %e, "KCP receive failed");
                    continue;
                }
            },
        };

        core.statistics.update_read_bytes(length as u64);
        if length < KCP_OVERHEAD {
            core.statistics.update_read_dropped_packets(1);
            continue;
        }
        handle_segment(&core, &buffer[..length], from);
    }

    debug!("KCP reader stopped");
}

fn handle_segment(core: &EngineCore, datagram: &[u8], from: SocketAddr) {
    let conv = kcp::get_conv(datagram);
    let Some(session) = core.sessions.session_by_kcp_conv(conv) else {
        trace!(conv, %from, "Segment for unknown KCP conv");
        core.statistics.update_read_dropped_packets(1);
        return;
    };
    let Some(channel) = session.kcp() else {
        core.statistics.update_read_dropped_packets(1);
        return;
    };

    channel.set_remote_address(from);
    session.add_read_bytes(datagram.len() as u64);

    let messages = match channel.input(datagram).and_then(|_| channel.receive()) {
        Ok(messages) => messages,
        Err(e) => {
            debug!(session = session.id(), conv, error = %e, "KCP input rejected");
            core.statistics.update_read_dropped_packets(1);
            return;
        }
    };

    for message in messages {
        let decoded = core
            .decoder
            .read_frame(&message)
            .and_then(|frame| match frame {
                Some(frame) => core.decoder.decode(frame),
                None => Ok(None),
            });
        match decoded {
            Ok(Some(collection)) => {
                session.increase_read_messages();
                core.statistics.update_read_packets(1);
                let request = Request::new(RequestEvent::SessionReadMessage)
                    .with_sender(session.clone())
                    .with_message(Some(collection))
                    .with_remote_address(from);
                if let Err(e) = core.controller.enqueue_request(request) {
                    warn!(session = session.id(), error = %e, "KCP request rejected");
                    core.statistics.update_read_dropped_packets(1);
                }
            }
            Ok(None) => {}
            Err(e) => {
                debug!(session = session.id(), error = %e, "Dropping undecodable KCP message");
                core.statistics.update_read_dropped_packets(1);
            }
        }
    }
}

/// Drive every KCP channel's clock and retire the ones that went silent.
pub(crate) async fn run_ticker(core: Arc<EngineCore>) {
    let period = Duration::from_millis(u64::from(core.config.kcp.update_interval.max(1)));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }

        let now = kcp_clock();
        for session in core.sessions.kcp_sessions() {
            let Some(channel) = session.kcp() else { continue };
            if channel.is_expired() {
                info!(session = session.id(), conv = channel.conv(), "KCP channel expired");
                core.sessions.detach_kcp(&session);
                continue;
            }
            if let Err(e) = channel.update(now) {
                warn!(session = session.id(), error = %e, "KCP update failed");
            }
        }
    }

    debug!("KCP ticker stopped");
}
