//! Plain UDP transport.
//!
//! One server socket carries every datagram channel. Each datagram holds exactly one
//! framed packet whose message is wrapped in an envelope naming the conveying id of
//! the session it belongs to. Decoding is stateless: a datagram is either a complete
//! packet or garbage.

use crate::core::packet::SessionId;
use crate::core::serialization::DataCollection;
use crate::core::zero::{ZeroElement, ZeroMap};
use crate::engine::EngineCore;
use crate::protocol::request::{Request, RequestEvent};
use crate::session::queue::PacketQueue;
use crate::utils::time::current_time_millis;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tokio::net::UdpSocket;
use tracing::{debug, trace, warn};

/// Reserved conveying id meaning "not established".
pub const EMPTY_DATAGRAM_CONVEY_ID: i32 = -1;

/// Envelope key holding the conveying id.
pub const CONVEY_ID_KEY: &str = "u";
/// Envelope key holding the wrapped message.
pub const MESSAGE_KEY: &str = "d";

/// Extracts the conveying id from an inbound datagram message.
pub trait DatagramPacketPolicy: Send + Sync {
    /// Split a decoded datagram into its conveying id and inner message.
    ///
    /// Returns [`EMPTY_DATAGRAM_CONVEY_ID`] when the envelope carries no usable id.
    fn apply(&self, message: DataCollection) -> (i32, Option<DataCollection>);

    /// Build the envelope a client sends for `conv`.
    fn wrap(&self, conv: i32, message: DataCollection) -> DataCollection;
}

/// Map envelopes use `"u"` and `"d"`; array envelopes carry the id as the last element.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDatagramPacketPolicy;

impl DatagramPacketPolicy for DefaultDatagramPacketPolicy {
    fn apply(&self, message: DataCollection) -> (i32, Option<DataCollection>) {
        match message {
            DataCollection::ZeroMap(map) => {
                let conv = map
                    .get_i64(CONVEY_ID_KEY)
                    .and_then(|v| i32::try_from(v).ok())
                    .unwrap_or(EMPTY_DATAGRAM_CONVEY_ID);
                let inner = match map.get(MESSAGE_KEY) {
                    Some(ZeroElement::Map(m)) => Some(DataCollection::ZeroMap(m.clone())),
                    Some(ZeroElement::Array(a)) => Some(DataCollection::ZeroArray(a.clone())),
                    _ => None,
                };
                (conv, inner)
            }
            DataCollection::ZeroArray(mut array) => {
                let conv = array
                    .pop()
                    .and_then(|e| e.as_i64())
                    .and_then(|v| i32::try_from(v).ok())
                    .unwrap_or(EMPTY_DATAGRAM_CONVEY_ID);
                (conv, Some(DataCollection::ZeroArray(array)))
            }
            DataCollection::MsgPack(value) => {
                let mut conv = EMPTY_DATAGRAM_CONVEY_ID;
                let mut inner = None;
                if let rmpv::Value::Map(entries) = value {
                    for (key, val) in entries {
                        match key.as_str() {
                            Some(CONVEY_ID_KEY) => {
                                conv = val
                                    .as_i64()
                                    .and_then(|v| i32::try_from(v).ok())
                                    .unwrap_or(EMPTY_DATAGRAM_CONVEY_ID);
                            }
                            Some(MESSAGE_KEY) if val.is_map() => {
                                inner = Some(DataCollection::MsgPack(val));
                            }
                            _ => {}
                        }
                    }
                }
                (conv, inner)
            }
        }
    }

    fn wrap(&self, conv: i32, message: DataCollection) -> DataCollection {
        match message {
            DataCollection::ZeroMap(inner) => {
                let mut envelope = ZeroMap::new();
                envelope.insert(CONVEY_ID_KEY, conv).insert(MESSAGE_KEY, inner);
                DataCollection::ZeroMap(envelope)
            }
            DataCollection::ZeroArray(mut inner) => {
                inner.push(conv);
                DataCollection::ZeroArray(inner)
            }
            DataCollection::MsgPack(inner) => DataCollection::MsgPack(rmpv::Value::Map(vec![
                (rmpv::Value::from(CONVEY_ID_KEY), rmpv::Value::from(conv)),
                (rmpv::Value::from(MESSAGE_KEY), inner),
            ])),
        }
    }
}

/// Datagram capability of a TCP session.
///
/// The remote address is learned from the first datagram carrying the channel's
/// conveying id; outbound packets queued before that are dropped by the writer.
pub struct DatagramChannel {
    conv: i32,
    socket: Arc<UdpSocket>,
    remote: RwLock<Option<SocketAddr>>,
    queue: PacketQueue,
    last_read_time: AtomicU64,
}

impl DatagramChannel {
    pub fn new(conv: i32, socket: Arc<UdpSocket>, queue: PacketQueue) -> Self {
        Self {
            conv,
            socket,
            remote: RwLock::new(None),
            queue,
            last_read_time: AtomicU64::new(current_time_millis()),
        }
    }

    pub fn convey_id(&self) -> i32 {
        self.conv
    }

    pub fn queue(&self) -> &PacketQueue {
        &self.queue
    }

    pub fn remote_address(&self) -> Option<SocketAddr> {
        self.remote.read().ok().and_then(|r| *r)
    }

    /// Record where the peer's datagrams come from. Clients behind NAT may rebind.
    pub fn set_remote_address(&self, address: SocketAddr) {
        if let Ok(mut remote) = self.remote.write() {
            if *remote != Some(address) {
                debug!(conv = self.conv, %address, "Datagram remote address updated");
                *remote = Some(address);
            }
        }
        self.last_read_time
            .store(current_time_millis(), Ordering::Relaxed);
    }

    pub fn last_read_time(&self) -> u64 {
        self.last_read_time.load(Ordering::Relaxed)
    }

    /// Send one framed packet. Returns `None` while the remote is still unknown.
    pub async fn send(&self, bytes: &[u8]) -> crate::error::Result<Option<usize>> {
        match self.remote_address() {
            Some(remote) => Ok(Some(self.socket.send_to(bytes, remote).await?)),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for DatagramChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatagramChannel")
            .field("conv", &self.conv)
            .field("remote", &self.remote_address())
            .field("queued", &self.queue.size())
            .finish()
    }
}

/// Receive loop for the shared UDP socket.
pub(crate) async fn run_reader(core: Arc<EngineCore>, socket: Arc<UdpSocket>) {
    let shutdown = core.shutdown.clone();
    let mut buffer = core.buffers.acquire();

    loop {
        let (length, from) = tokio::select! {
            _ = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buffer) => match received {
                Ok(received) => received,
                Err(e) => {
                    // ICMP port unreachable surfaces here on some platforms.
                    debug!(error = %e, "UDP receive failed");
                    continue;
                }
            },
        };

        core.statistics.update_read_bytes(length as u64);
        if let Some(session) = handle_datagram(&core, &buffer[..length], from) {
            trace!(session, bytes = length, "Datagram routed");
        }
    }

    debug!("UDP reader stopped");
}

/// Decode, route and enqueue one datagram. Returns the session it was routed to.
fn handle_datagram(core: &EngineCore, datagram: &[u8], from: SocketAddr) -> Option<SessionId> {
    let decoded = core
        .decoder
        .read_frame(datagram)
        .and_then(|frame| match frame {
            Some(frame) => core.decoder.decode(frame),
            None => Ok(None),
        });

    let message = match decoded {
        Ok(Some(message)) => message,
        Ok(None) => return None,
        Err(e) => {
            debug!(%from, error = %e, "Dropping undecodable datagram");
            core.statistics.update_read_dropped_packets(1);
            return None;
        }
    };

    let (conv, inner) = core.datagram_policy.apply(message);
    if conv == EMPTY_DATAGRAM_CONVEY_ID {
        core.statistics.update_read_dropped_packets(1);
        return None;
    }

    let Some(session) = core.sessions.session_by_udp_conv(conv) else {
        debug!(conv, %from, "Datagram for unknown conveying id");
        core.statistics.update_read_dropped_packets(1);
        return None;
    };
    let Some(channel) = session.datagram() else {
        core.statistics.update_read_dropped_packets(1);
        return None;
    };

    channel.set_remote_address(from);
    session.add_read_bytes(datagram.len() as u64);
    session.increase_read_messages();
    core.statistics.update_read_packets(1);

    let request = Request::new(RequestEvent::DatagramReadMessage)
        .with_sender(session.clone())
        .with_message(inner)
        .with_remote_address(from);
    if let Err(e) = core.controller.enqueue_request(request) {
        warn!(session = session.id(), error = %e, "Datagram request rejected");
        core.statistics.update_read_dropped_packets(1);
    }
    Some(session.id())
}
