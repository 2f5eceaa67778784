use crate::core::codec::PacketCodec;
use crate::core::packet::{Packet, TransportType};
use crate::core::serialization::{DataCollection, DataType};
use crate::engine::EngineCore;
use crate::error::{NetworkError, Result};
use crate::session::channel::StreamChannel;
use crate::session::Session;
use crate::transport::{admit, announce, submit_packets};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tokio_util::codec::Framed;
use tracing::{debug, error, info, instrument, warn};

/// Accept loop. Each admitted connection gets a session and a reader task.
#[instrument(skip_all, fields(address = ?listener.local_addr().ok()))]
pub(crate) async fn run_acceptor(core: Arc<EngineCore>, listener: TcpListener) {
    info!("Accepting TCP connections");
    loop {
        tokio::select! {
            _ = core.shutdown.cancelled() => break,
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((stream, peer)) => {
                        if !admit(&core, peer) {
                            continue;
                        }
                        if let Err(e) = stream.set_nodelay(true) {
                            debug!(%peer, error = %e, "Failed to set TCP_NODELAY");
                        }
                        let local = stream.local_addr().ok();
                        let (read_half, write_half) = stream.into_split();
                        let session = core.sessions.create_session(
                            TransportType::Tcp,
                            peer,
                            local,
                            StreamChannel::tcp(write_half),
                        );
                        announce(&core, &session);

                        let core = core.clone();
                        core.tracker.clone().spawn(async move {
                            run_reader(core, session, read_half).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "Error accepting connection");
                    }
                }
            }
        }
    }
    info!("TCP acceptor stopped");
}

async fn run_reader(core: Arc<EngineCore>, session: Arc<Session>, mut reader: OwnedReadHalf) {
    let closed = session.closed();
    let mut buffer = core.buffers.acquire();

    loop {
        let read = tokio::select! {
            _ = core.shutdown.cancelled() => break,
            _ = closed.cancelled() => break,
            read = reader.read(&mut buffer) => read,
        };

        let n = match read {
            Ok(0) => {
                debug!(session = session.id(), "Peer closed the connection");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                debug!(session = session.id(), error = %e, "TCP read failed");
                break;
            }
        };

        core.statistics.update_read_bytes(n as u64);
        match session.read_stream(&core.decoder, &buffer[..n]) {
            Ok(packets) => submit_packets(&core, &session, packets),
            Err(e) => {
                // The stream is out of sync once framing fails.
                warn!(session = session.id(), error = %e, "Closing session after framing error");
                core.statistics.update_read_dropped_packets(1);
                break;
            }
        }
    }

    drop(buffer);
    core.close_session(&session);
    if let Some(stream) = session.stream() {
        stream.shutdown().await;
    }
}

/// Client side of a TCP connection, framed with the packet codec.
///
/// Mostly useful for tests and tooling that talk to a running engine.
pub struct TcpClient {
    framed: Framed<TcpStream, PacketCodec>,
    data_type: DataType,
}

impl TcpClient {
    pub async fn connect<A: ToSocketAddrs>(address: A, codec: PacketCodec, data_type: DataType) -> Result<Self> {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        Ok(Self {
            framed: Framed::new(stream, codec),
            data_type,
        })
    }

    pub async fn send(&mut self, packet: Packet) -> Result<()> {
        self.framed.send(packet).await
    }

    pub async fn send_collection(&mut self, message: &DataCollection) -> Result<()> {
        self.send(Packet::new(message.to_bytes()?)).await
    }

    /// Next unwrapped payload, or `None` once the server hangs up.
    pub async fn recv(&mut self) -> Option<Result<Vec<u8>>> {
        self.framed.next().await
    }

    pub async fn recv_collection(&mut self) -> Result<DataCollection> {
        match self.recv().await {
            Some(payload) => DataCollection::from_bytes(self.data_type, &payload?),
            None => Err(NetworkError::ConnectionClosed),
        }
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.framed.get_ref().local_addr()?)
    }
}
