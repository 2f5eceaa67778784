#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]
//! End-to-end tests: a real engine on loopback sockets, driven by real clients.

use futures::{SinkExt, StreamExt};
use netcore::config::NetworkConfig;
use netcore::core::codec::{BinaryPacketDecoder, BinaryPacketEncoder};
use netcore::core::packet::{Packet, PacketPriority, SessionId};
use netcore::core::serialization::{DataCollection, DataType};
use netcore::core::zero::ZeroMap;
use netcore::engine::NetworkEngine;
use netcore::protocol::{RequestEvent, Response};
use netcore::security::DefaultConnectionFilter;
use netcore::session::PacketQueue;
use netcore::transport::kcp::KcpChannel;
use netcore::transport::tcp::TcpClient;
use netcore::utils::metrics::NetworkStatistics;
use netcore::utils::time::kcp_clock;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;

const WAIT: Duration = Duration::from_secs(5);

fn loopback_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.server.tcp_address = Some("127.0.0.1:0".to_string());
        c.server.udp_address = Some("127.0.0.1:0".to_string());
        c.server.websocket_address = Some("127.0.0.1:0".to_string());
        c.server.kcp_address = Some("127.0.0.1:0".to_string());
        c.server.shutdown_timeout = Duration::from_secs(2);
        c.queues.worker_threads = 2;
        c.queues.writer_shards = 2;
        c.transport.read_buffer_pool_size = 4;
    })
}

fn greeting(text: &str) -> DataCollection {
    let mut map = ZeroMap::new();
    map.insert("say", text).insert("n", 7);
    map.into()
}

/// Echo every message back over the channel it arrived on.
fn install_echo(engine: &NetworkEngine) {
    engine
        .register_handler(RequestEvent::SessionReadMessage, |request| {
            let (Some(sender), Some(message)) = (request.sender(), request.message()) else {
                return Ok(None);
            };
            let response = Response::new(message.clone()).to(sender.id());
            Ok(Some(if sender.contains_kcp() { response.over_kcp() } else { response }))
        })
        .unwrap();
    engine
        .register_handler(RequestEvent::DatagramReadMessage, |request| {
            let (Some(sender), Some(message)) = (request.sender(), request.message()) else {
                return Ok(None);
            };
            Ok(Some(Response::new(message.clone()).to(sender.id()).over_udp()))
        })
        .unwrap();
}

/// Report every connected session id.
fn track_connections(engine: &NetworkEngine) -> mpsc::UnboundedReceiver<SessionId> {
    let (tx, rx) = mpsc::unbounded_channel();
    engine
        .register_handler(RequestEvent::SessionRequestConnection, move |request| {
            if let Some(sender) = request.sender() {
                let _ = tx.send(sender.id());
            }
            Ok(None)
        })
        .unwrap();
    rx
}

async fn next_id(rx: &mut mpsc::UnboundedReceiver<SessionId>) -> SessionId {
    timeout(WAIT, rx.recv()).await.unwrap().unwrap()
}

fn frame(message: &DataCollection) -> Vec<u8> {
    BinaryPacketEncoder::new()
        .encode(Packet::new(message.to_bytes().unwrap()))
        .unwrap()
        .into_data()
}

fn unframe(bytes: &[u8]) -> DataCollection {
    let decoder = BinaryPacketDecoder::new(DataType::Zero);
    let packet = decoder.read_frame(bytes).unwrap().unwrap();
    decoder.decode(packet).unwrap().unwrap()
}

// ============================================================================
// TCP
// ============================================================================

#[tokio::test]
async fn tcp_message_round_trip() {
    let engine = NetworkEngine::new(loopback_config()).unwrap();
    install_echo(&engine);
    let mut connections = track_connections(&engine);
    let bound = engine.start().await.unwrap();

    let mut client = TcpClient::connect(bound.tcp.unwrap(), engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let id = next_id(&mut connections).await;
    assert!(engine.session(id).is_some());

    let message = greeting("hello");
    client.send_collection(&message).await.unwrap();
    let echoed = timeout(WAIT, client.recv_collection()).await.unwrap().unwrap();
    assert_eq!(echoed, message);

    let stats = engine.statistics();
    assert_eq!(stats.connections_accepted, 1);
    assert!(stats.read_packets >= 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn large_messages_are_compressed_and_restored() {
    let engine = NetworkEngine::new(loopback_config()).unwrap();
    install_echo(&engine);
    let bound = engine.start().await.unwrap();

    let mut client = TcpClient::connect(bound.tcp.unwrap(), engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let mut map = ZeroMap::new();
    map.insert("blob", vec![b'x'; 100_000]);
    let message = DataCollection::from(map);

    client.send_collection(&message).await.unwrap();
    let echoed = timeout(WAIT, client.recv_collection()).await.unwrap().unwrap();
    assert_eq!(echoed, message);

    engine.shutdown().await;
}

#[tokio::test]
async fn slow_handler_does_not_stall_other_sessions() {
    let engine = NetworkEngine::new(loopback_config()).unwrap();
    engine
        .register_handler(RequestEvent::SessionReadMessage, |request| {
            let (Some(sender), Some(message)) = (request.sender(), request.message()) else {
                return Ok(None);
            };
            if let DataCollection::ZeroMap(map) = message {
                if map.get_str("say") == Some("slow") {
                    std::thread::sleep(Duration::from_millis(1500));
                }
            }
            Ok(Some(Response::new(message.clone()).to(sender.id())))
        })
        .unwrap();
    let bound = engine.start().await.unwrap();
    let address = bound.tcp.unwrap();

    let mut slow = TcpClient::connect(address, engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let mut fast = TcpClient::connect(address, engine.client_codec(), DataType::Zero)
        .await
        .unwrap();

    slow.send_collection(&greeting("slow")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = std::time::Instant::now();
    let message = greeting("fast");
    fast.send_collection(&message).await.unwrap();
    let echoed = timeout(WAIT, fast.recv_collection()).await.unwrap().unwrap();
    assert_eq!(echoed, message);
    assert!(
        started.elapsed() < Duration::from_millis(1000),
        "fast echo took {:?}",
        started.elapsed()
    );

    let echoed = timeout(WAIT, slow.recv_collection()).await.unwrap().unwrap();
    assert_eq!(echoed, greeting("slow"));

    engine.shutdown().await;
}

#[tokio::test]
async fn stalled_reader_does_not_hold_up_its_writer_shard() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.tcp_address = Some("127.0.0.1:0".to_string());
        c.server.shutdown_timeout = Duration::from_secs(2);
        c.queues.writer_shards = 1;
        c.queues.packet_queue_size = 256;
        c.transport.compression_enabled = false;
        c.transport.write_timeout = Duration::from_millis(500);
    });
    let engine = NetworkEngine::new(config).unwrap();
    let mut connections = track_connections(&engine);
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    engine
        .register_handler(RequestEvent::SessionWillBeClosed, move |request| {
            if let Some(sender) = request.sender() {
                let _ = closed_tx.send(sender.id());
            }
            Ok(None)
        })
        .unwrap();
    let bound = engine.start().await.unwrap();
    let address = bound.tcp.unwrap();

    // Connects and never reads a byte.
    let stalled = tokio::net::TcpStream::connect(address).await.unwrap();
    let stalled_id = next_id(&mut connections).await;
    let mut healthy = TcpClient::connect(address, engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let healthy_id = next_id(&mut connections).await;

    let mut blob = ZeroMap::new();
    blob.insert("blob", vec![0xA5u8; 256 * 1024]);
    for _ in 0..200 {
        engine
            .send(
                Response::new(blob.clone())
                    .to(stalled_id)
                    .with_priority(PacketPriority::Guaranteed),
            )
            .unwrap();
    }

    let message = greeting("still here");
    engine.send(Response::new(message.clone()).to(healthy_id)).unwrap();
    let received = timeout(Duration::from_secs(3), healthy.recv_collection())
        .await
        .expect("healthy session starved behind a stalled peer")
        .unwrap();
    assert_eq!(received, message);

    // The stalled peer is dropped once the write timeout passes.
    let closed = timeout(WAIT, closed_rx.recv()).await.unwrap().unwrap();
    assert_eq!(closed, stalled_id);
    assert!(engine.session(stalled_id).is_none());
    assert!(engine.session(healthy_id).is_some());

    drop(stalled);
    engine.shutdown().await;
}

#[tokio::test]
async fn connections_over_the_per_address_limit_are_refused() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.tcp_address = Some("127.0.0.1:0".to_string());
        c.server.max_connections_per_ip = 1;
    });
    let filter = Arc::new(DefaultConnectionFilter::new(1));
    let engine = NetworkEngine::builder(config)
        .with_filter(filter.clone())
        .build()
        .unwrap();
    let mut connections = track_connections(&engine);
    let bound = engine.start().await.unwrap();
    let address = bound.tcp.unwrap();

    let _first = TcpClient::connect(address, engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    next_id(&mut connections).await;

    let mut second = TcpClient::connect(address, engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let outcome = timeout(WAIT, second.recv()).await.unwrap();
    assert!(outcome.map_or(true, |r| r.is_err()), "refused connection must be closed");

    assert_eq!(engine.statistics().connections_refused, 1);
    assert_eq!(engine.session_count(), 1);
    assert_eq!(filter.connection_count(&address.ip()), 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn idle_sessions_are_closed_and_release_their_slot() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.tcp_address = Some("127.0.0.1:0".to_string());
        c.session.max_idle_time = Duration::from_millis(200);
        c.session.scan_interval = Duration::from_millis(50);
    });
    let filter = Arc::new(DefaultConnectionFilter::default());
    let engine = NetworkEngine::builder(config)
        .with_filter(filter.clone())
        .build()
        .unwrap();
    let mut connections = track_connections(&engine);
    let (closed_tx, mut closed_rx) = mpsc::unbounded_channel();
    engine
        .register_handler(RequestEvent::SessionWillBeClosed, move |request| {
            if let Some(sender) = request.sender() {
                let _ = closed_tx.send(sender.id());
            }
            Ok(None)
        })
        .unwrap();
    let bound = engine.start().await.unwrap();

    let mut client = TcpClient::connect(bound.tcp.unwrap(), engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let id = next_id(&mut connections).await;

    let closed = timeout(WAIT, closed_rx.recv()).await.unwrap().unwrap();
    assert_eq!(closed, id);
    assert!(timeout(WAIT, client.recv()).await.unwrap().map_or(true, |r| r.is_err()));
    assert_eq!(filter.tracked_addresses(), 0);
    assert_eq!(engine.statistics().sessions_closed, 1);

    engine.shutdown().await;
}

#[tokio::test]
async fn broadcast_skips_a_full_recipient() {
    let engine = NetworkEngine::new(loopback_config()).unwrap();
    let mut connections = track_connections(&engine);
    let bound = engine.start().await.unwrap();
    let address = bound.tcp.unwrap();

    let mut a = TcpClient::connect(address, engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let id_a = next_id(&mut connections).await;
    let _b = TcpClient::connect(address, engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let id_b = next_id(&mut connections).await;

    // Saturate b's queue without waking its writer.
    let session_b = engine.session(id_b).unwrap();
    session_b.packet_queue().set_max_size(2);
    for _ in 0..2 {
        session_b
            .packet_queue()
            .put(Packet::new(vec![0]).with_priority(PacketPriority::Guaranteed))
            .unwrap();
    }

    let message = greeting("room");
    let report = engine
        .send(Response::new(message.clone()).to_all([id_a, id_b]))
        .unwrap();
    assert_eq!(report.delivered, vec![id_a]);
    assert_eq!(report.rejected.len(), 1);
    assert_eq!(report.rejected[0].0, id_b);
    assert!(report.rejected[0].1.is_backpressure());

    let received = timeout(WAIT, a.recv_collection()).await.unwrap().unwrap();
    assert_eq!(received, message);
    assert_eq!(session_b.dropped_packets(), 1);

    engine.shutdown().await;
}

// ============================================================================
// UDP
// ============================================================================

#[tokio::test]
async fn datagrams_route_by_conveying_id() {
    let engine = NetworkEngine::new(loopback_config()).unwrap();
    install_echo(&engine);
    let mut connections = track_connections(&engine);
    let bound = engine.start().await.unwrap();

    let _tcp = TcpClient::connect(bound.tcp.unwrap(), engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let id = next_id(&mut connections).await;
    let conv = engine.attach_datagram(id).unwrap();
    assert_eq!(engine.session(id).unwrap().udp_convey_id(), conv);

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let message = greeting("udp");
    let envelope = engine.datagram_policy().wrap(conv, message.clone());
    socket
        .send_to(&frame(&envelope), bound.udp.unwrap())
        .await
        .unwrap();

    let mut buf = vec![0u8; 2048];
    let (n, _) = timeout(WAIT, socket.recv_from(&mut buf)).await.unwrap().unwrap();
    assert_eq!(unframe(&buf[..n]), message);

    engine.shutdown().await;
}

#[tokio::test]
async fn datagram_with_unknown_conveying_id_is_dropped() {
    let engine = NetworkEngine::new(loopback_config()).unwrap();
    install_echo(&engine);
    let bound = engine.start().await.unwrap();

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let envelope = engine.datagram_policy().wrap(9_999, greeting("nobody"));
    socket
        .send_to(&frame(&envelope), bound.udp.unwrap())
        .await
        .unwrap();

    timeout(WAIT, async {
        while engine.statistics().read_dropped_packets == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();

    engine.shutdown().await;
}

// ============================================================================
// WEBSOCKET
// ============================================================================

#[tokio::test]
async fn websocket_binary_frames_carry_packets() {
    let engine = NetworkEngine::new(loopback_config()).unwrap();
    install_echo(&engine);
    let mut connections = track_connections(&engine);
    let bound = engine.start().await.unwrap();

    let url = format!("ws://{}", bound.websocket.unwrap());
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.unwrap();
    let id = next_id(&mut connections).await;
    assert!(engine.session(id).unwrap().is_websocket());
    assert!(engine.attach_datagram(id).is_err());

    let message = greeting("browser");
    ws.send(Message::Binary(frame(&message))).await.unwrap();

    let reply = loop {
        match timeout(WAIT, ws.next()).await.unwrap().unwrap().unwrap() {
            Message::Binary(bytes) => break bytes,
            _ => continue,
        }
    };
    assert_eq!(unframe(&reply), message);

    engine.shutdown().await;
}

// ============================================================================
// KCP
// ============================================================================

#[tokio::test]
async fn kcp_channel_delivers_reliably() {
    let engine = NetworkEngine::new(loopback_config()).unwrap();
    install_echo(&engine);
    let mut connections = track_connections(&engine);
    let bound = engine.start().await.unwrap();

    let _tcp = TcpClient::connect(bound.tcp.unwrap(), engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let id = next_id(&mut connections).await;
    let conv = engine.attach_kcp(id).unwrap();

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let client = KcpChannel::new(
        conv,
        socket.clone(),
        PacketQueue::with_default_policy(8),
        &engine.config().kcp,
        Arc::new(NetworkStatistics::new()),
        Weak::new(),
    );
    client.set_remote_address(bound.kcp.unwrap());

    let message = greeting("reliable");
    client.send(&frame(&message)).unwrap();

    let reply = timeout(WAIT, async {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (n, _) = received.unwrap();
                    client.input(&buf[..n]).unwrap();
                    if let Some(reply) = client.receive().unwrap().into_iter().next() {
                        break reply;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    client.update(kcp_clock()).unwrap();
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(unframe(&reply), message);

    engine.shutdown().await;
}

#[tokio::test]
async fn kcp_output_queued_before_the_peer_is_known_still_arrives() {
    let engine = NetworkEngine::new(loopback_config()).unwrap();
    install_echo(&engine);
    let mut connections = track_connections(&engine);
    let bound = engine.start().await.unwrap();

    let _tcp = TcpClient::connect(bound.tcp.unwrap(), engine.client_codec(), DataType::Zero)
        .await
        .unwrap();
    let id = next_id(&mut connections).await;
    let conv = engine.attach_kcp(id).unwrap();

    let early = greeting("early");
    let report = engine
        .send(Response::new(early.clone()).to(id).over_kcp())
        .unwrap();
    assert!(report.is_complete());
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(engine.statistics().written_dropped_packets, 0);

    let socket = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
    let client = KcpChannel::new(
        conv,
        socket.clone(),
        PacketQueue::with_default_policy(8),
        &engine.config().kcp,
        Arc::new(NetworkStatistics::new()),
        Weak::new(),
    );
    client.set_remote_address(bound.kcp.unwrap());
    client.send(&frame(&greeting("hello"))).unwrap();

    let first = timeout(WAIT, async {
        let mut buf = vec![0u8; 2048];
        loop {
            tokio::select! {
                received = socket.recv_from(&mut buf) => {
                    let (n, _) = received.unwrap();
                    client.input(&buf[..n]).unwrap();
                    if let Some(message) = client.receive().unwrap().into_iter().next() {
                        break message;
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(10)) => {
                    client.update(kcp_clock()).unwrap();
                }
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(unframe(&first), early);
    assert_eq!(engine.statistics().written_dropped_packets, 0);

    engine.shutdown().await;
}
