//! WebSocket transport.
//!
//! Browsers cannot open raw sockets, so the same packets travel inside binary
//! WebSocket frames, one framed packet per frame. Text frames are ignored.

use crate::core::packet::TransportType;
use crate::engine::EngineCore;
use crate::session::channel::StreamChannel;
use crate::session::Session;
use crate::transport::{admit, announce, submit_packets};
use futures::stream::SplitStream;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, error, info, instrument, warn};

type WebSocketSource = SplitStream<WebSocketStream<TcpStream>>;

#[instrument(skip_all, fields(address = ?listener.local_addr().ok()))]
pub(crate) async fn run_acceptor(core: Arc<EngineCore>, listener: TcpListener) {
    info!("Accepting WebSocket connections");
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        if !admit(&core, peer) {
                            continue;
                        }
                        let core = core.clone();
                        core.tracker.clone().spawn(async move {
                            handshake(core, stream, peer).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
    info!("WebSocket acceptor stopped");
}

async fn handshake(core: Arc<EngineCore>, stream: TcpStream, peer: SocketAddr) {
    let local = stream.local_addr().ok();
    let websocket = match tokio_tungstenite::accept_async(stream).await {
        Ok(websocket) => websocket,
        Err(e) => {
            debug!(%peer, error = %e, "WebSocket handshake failed");
            // No session owns the filter slot yet.
            core.filter.remove_address(peer.ip());
            return;
        }
    };

    let (sink, source) = websocket.split();
    let session = core.sessions.create_session(
        TransportType::WebSocket,
        peer,
        local,
        StreamChannel::websocket(sink),
    );
    announce(&core, &session);
    run_reader(core, session, source).await;
}

async fn run_reader(core: Arc<EngineCore>, session: Arc<Session>, mut source: WebSocketSource) {
    let closed = session.closed();

    loop {
        let message = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = closed.cancelled() => break,
            message = source.next() => message,
        };

        let frame = match message {
            Some(Ok(Message::Binary(frame))) => frame,
            Some(Ok(Message::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(session = session.id(), error = %e, "WebSocket read failed");
                break;
            }
        };

        core.statistics.update_read_bytes(frame.len() as u64);
        session.add_read_bytes(frame.len() as u64);
        match core.decoder.read_frame(&frame) {
            Ok(Some(packet)) => submit_packets(&core, &session, vec![packet]),
            Ok(None) => {}
            Err(e) => {
                warn!(session = session.id(), error = %e, "Dropping malformed WebSocket frame");
                core.statistics.update_read_dropped_packets(1);
            }
        }
    }

    core.close_session(&session);
    if let Some(stream) = session.stream() {
        stream.shutdown().await;
    }
}
