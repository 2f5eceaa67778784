//! # Transports
//!
//! Tokio tasks moving bytes between sockets and sessions.
//!
//! - **tcp**: acceptor and per-connection readers, plus a framed client
//! - **websocket**: the same over `tokio-tungstenite`, one packet per binary frame
//! - **udp**: datagram channels routed by conveying id
//! - **kcp**: reliable UDP channels routed by conv, with a clock tick task
//! - **writer**: sharded tasks draining session queues onto the wire
//!
//! Every reader converges on the same contract: bytes go through the session's
//! decoder, each completed message becomes a request in the controller's queue.

pub mod kcp;
pub mod tcp;
pub mod udp;
pub mod websocket;
pub mod writer;

use crate::core::packet::ProcessedPacket;
use crate::engine::EngineCore;
use crate::protocol::request::{Request, RequestEvent};
use crate::session::Session;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Run the connection filter for a new peer. Refusals are counted and logged.
pub(crate) fn admit(core: &EngineCore, peer: SocketAddr) -> bool {
    match core.filter.validate_and_add_address(peer.ip()) {
        Ok(()) => {
            core.statistics.connection_accepted();
            true
        }
        Err(e) => {
            core.statistics.connection_refused();
            debug!(%peer, error = %e, "Connection refused");
            false
        }
    }
}

/// Tell the application about a new stream session.
pub(crate) fn announce(core: &EngineCore, session: &Arc<Session>) {
    let request = Request::new(RequestEvent::SessionRequestConnection).with_sender(session.clone());
    if let Err(e) = core.controller.enqueue_request(request) {
        warn!(session = session.id(), error = %e, "Connection request rejected");
    }
}

/// Decode completed stream packets and queue them as read-message requests.
pub(crate) fn submit_packets(core: &EngineCore, session: &Arc<Session>, packets: Vec<ProcessedPacket>) {
    for packet in packets {
        match core.decoder.decode(packet) {
            Ok(Some(message)) => {
                session.increase_read_messages();
                core.statistics.update_read_packets(1);
                let request = Request::new(RequestEvent::SessionReadMessage)
                    .with_sender(session.clone())
                    .with_message(Some(message));
                if let Err(e) = core.controller.enqueue_request(request) {
                    debug!(session = session.id(), error = %e, "Read request rejected");
                    core.statistics.update_read_dropped_packets(1);
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(session = session.id(), error = %e, "Dropping undecodable packet");
                core.statistics.update_read_dropped_packets(1);
            }
        }
    }
}
