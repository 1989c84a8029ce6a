// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use rstest::{fixture, rstest};
use stonewire::{
    flags, setup_local_tracing, AppError, CloseReason, ConnectionHandle, ConnectionId,
    ConnectionState, DataConsumer, Engine, EngineConfig, Frame, MessageType, Role,
};
use tokio::io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::time;

const WAIT: Duration = Duration::from_secs(10);

#[fixture]
fn config() -> EngineConfig {
    setup_local_tracing().unwrap();
    let mut config = EngineConfig::default();
    config.worker_pool.max_workers = 2;
    config.connection.timer_tick_ms = 10;
    config.connection.time_wait_ms = 50;
    config.connection.io_timeout_ms = 5_000;
    config.connection.handshake_timeout_ms = 5_000;
    config.connection.shutdown_grace_ms = 1_000;
    config
}

fn peer(port: u16) -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], port))
}

async fn eventually<F: Fn() -> bool>(condition: F) {
    time::timeout(WAIT, async {
        while !condition() {
            time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
}

/// Two engines joined by an in-memory pipe, handshake completed.
async fn connected(
    config: &EngineConfig,
) -> (Engine, ConnectionHandle, Engine, ConnectionHandle) {
    let server = Engine::start(config.clone()).unwrap();
    let client = Engine::start(config.clone()).unwrap();
    let (server_side, client_side) = duplex(256 * 1024);

    let passive = server
        .attach(server_side, peer(4000), Role::Passive)
        .await
        .unwrap();
    let active = client
        .attach(client_side, peer(5000), Role::Active)
        .await
        .unwrap();
    client.wait_established(&active).await.unwrap();
    server.wait_established(&passive).await.unwrap();
    (server, passive, client, active)
}

/// Reads raw frames written by an engine.
async fn read_frame(peer: &mut DuplexStream, buffer: &mut BytesMut) -> Frame {
    loop {
        if let Some(raw) = Frame::parse(buffer, 1400).unwrap() {
            return Frame::decode(raw).unwrap();
        }
        let n = time::timeout(WAIT, peer.read_buf(buffer))
            .await
            .unwrap()
            .unwrap();
        assert!(n > 0, "engine closed the transport");
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_handshake_establishes_both_sides(config: EngineConfig) {
    let (server, passive, client, active) = connected(&config).await;
    assert_eq!(server.state(&passive), ConnectionState::Established);
    assert_eq!(client.state(&active), ConnectionState::Established);
    assert_eq!(server.connection_count(), 1);
    assert_eq!(client.engine_stats().connections_accepted, 1);

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[rstest]
#[case(1, 1)]
#[case(1400, 1)]
#[case(1401, 2)]
#[case(10_000, 8)]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_transfer_counts_packets(
    config: EngineConfig,
    #[case] size: usize,
    #[case] packets: u64,
) {
    let (server, passive, client, active) = connected(&config).await;
    let data: Vec<u8> = (0..size).map(|i| (i % 251) as u8).collect();

    assert_eq!(client.send(&active, &data).await.unwrap(), size);
    let received = server.receive_exact(&passive, size).await.unwrap();
    assert_eq!(received.as_ref(), data.as_slice());

    let stats = server.stats(&passive);
    assert_eq!(stats.packets_received, packets);
    assert_eq!(stats.bytes_received, size as u64);
    assert_eq!(stats.out_of_order_packets, 0);

    eventually(|| client.stats(&active).in_flight == 0).await;
    let stats = client.stats(&active);
    assert_eq!(stats.packets_sent, packets);
    assert_eq!(stats.bytes_sent, size as u64);
    assert_eq!(stats.retransmissions, 0);
    assert!(stats.smoothed_rtt_ms.is_some());

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_bidirectional_echo(config: EngineConfig) {
    let (server, passive, client, active) = connected(&config).await;

    client.send(&active, b"hello").await.unwrap();
    let request = server.receive_exact(&passive, 5).await.unwrap();
    server.send(&passive, &request).await.unwrap();
    let reply = client.receive_exact(&active, 5).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"hello"));

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_table_full_rejects_fifth(mut config: EngineConfig) {
    config.network.max_connection = 4;
    let engine = Engine::start(config).unwrap();

    let mut peers = Vec::new();
    let mut handles = Vec::new();
    for port in 0..4 {
        let (local, remote) = duplex(64 * 1024);
        peers.push(remote);
        handles.push(
            engine
                .attach(local, peer(6000 + port), Role::Passive)
                .await
                .unwrap(),
        );
    }

    let (local, _remote) = duplex(64 * 1024);
    let rejected = engine.attach(local, peer(6100), Role::Passive).await;
    assert!(matches!(rejected, Err(AppError::ResourceExhausted(_))));

    assert_eq!(engine.connection_count(), 4);
    for handle in &handles {
        assert!(engine.is_registered(handle));
        assert_eq!(engine.state(handle), ConnectionState::Listen);
    }
    let stats = engine.engine_stats();
    assert_eq!(stats.connections_accepted, 4);
    assert_eq!(stats.connections_rejected, 1);
    assert_eq!(stats.active_connections, 4);

    engine.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_idle_connection_times_out(mut config: EngineConfig) {
    config.connection.keepalive_interval_ms = 0;
    config.connection.idle_timeout_ms = 300;
    let engine = Engine::start(config).unwrap();
    let (local, mut remote) = duplex(64 * 1024);
    let handle = engine
        .attach(local, peer(6200), Role::Active)
        .await
        .unwrap();

    // play the passive side by hand, then go silent
    let mut buffer = BytesMut::new();
    assert!(read_frame(&mut remote, &mut buffer).await.has_flag(flags::SYN));
    let syn_ack = Frame::encode(
        MessageType::Control,
        flags::SYN | flags::ACK,
        1000,
        0,
        &32u16.to_be_bytes(),
    )
    .unwrap();
    remote.write_all(&syn_ack).await.unwrap();
    engine.wait_established(&handle).await.unwrap();
    assert_eq!(read_frame(&mut remote, &mut buffer).await.message_type(), MessageType::Ack);

    eventually(|| engine.connection_count() == 0).await;
    assert!(!engine.is_registered(&handle));
    assert_eq!(engine.state(&handle), ConnectionState::Closed);
    assert_eq!(engine.close_reason(&handle), Some(CloseReason::Timeout));
    let stats = engine.engine_stats();
    assert_eq!(stats.connection_timeouts, 1);
    assert_eq!(stats.connections_closed, 1);

    engine.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_keepalive_holds_idle_connection(mut config: EngineConfig) {
    config.connection.keepalive_interval_ms = 50;
    config.connection.idle_timeout_ms = 400;
    let (server, passive, client, active) = connected(&config).await;

    time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(server.state(&passive), ConnectionState::Established);
    assert_eq!(client.state(&active), ConnectionState::Established);
    assert!(client.stats(&active).control_frames_sent > 1);

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_graceful_close_empties_both_tables(config: EngineConfig) {
    let (server, passive, client, active) = connected(&config).await;
    client.send(&active, b"last words").await.unwrap();
    assert_eq!(
        server.receive_exact(&passive, 10).await.unwrap(),
        Bytes::from_static(b"last words")
    );

    client.close(&active).await.unwrap();
    assert!(client.state(&active).is_fin_acknowledged());

    eventually(|| server.connection_count() == 0 && client.connection_count() == 0).await;
    assert_eq!(server.state(&passive), ConnectionState::Closed);
    assert_eq!(client.state(&active), ConnectionState::Closed);
    assert_eq!(server.close_reason(&passive), Some(CloseReason::Graceful));
    assert_eq!(client.close_reason(&active), Some(CloseReason::Graceful));
    assert!(matches!(
        server.receive(&passive).await,
        Err(AppError::PeerClosed)
    ));

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_closes_immediately(config: EngineConfig) {
    let engine = Engine::start(config).unwrap();
    let (local, mut remote) = duplex(64 * 1024);
    let handle = engine
        .attach(local, peer(7000), Role::Active)
        .await
        .unwrap();

    let mut buffer = BytesMut::new();
    let syn = read_frame(&mut remote, &mut buffer).await;
    assert_eq!(syn.message_type(), MessageType::Control);
    assert!(syn.has_flag(flags::SYN));

    let reset = Frame::encode(MessageType::Control, flags::RST, 0, 0, &[]).unwrap();
    remote.write_all(&reset).await.unwrap();

    eventually(|| !engine.is_registered(&handle)).await;
    assert_eq!(engine.state(&handle), ConnectionState::Closed);
    assert_eq!(engine.close_reason(&handle), Some(CloseReason::PeerClosed));
    assert!(matches!(
        engine.wait_established(&handle).await,
        Err(AppError::PeerClosed)
    ));

    engine.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_close_before_handshake_sends_reset(config: EngineConfig) {
    let engine = Engine::start(config).unwrap();
    let (local, mut remote) = duplex(64 * 1024);
    let handle = engine
        .attach(local, peer(7100), Role::Active)
        .await
        .unwrap();

    let mut buffer = BytesMut::new();
    assert!(read_frame(&mut remote, &mut buffer).await.has_flag(flags::SYN));

    engine.close(&handle).await.unwrap();
    let reset = read_frame(&mut remote, &mut buffer).await;
    assert!(reset.has_flag(flags::RST));
    assert!(!engine.is_registered(&handle));
    assert_eq!(engine.close_reason(&handle), Some(CloseReason::Aborted));

    engine.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_malformed_frame_is_dropped(config: EngineConfig) {
    let engine = Engine::start(config).unwrap();
    let (local, mut remote) = duplex(64 * 1024);
    let handle = engine
        .attach(local, peer(7200), Role::Passive)
        .await
        .unwrap();

    let syn = Frame::encode(MessageType::Control, flags::SYN, 100, 0, &32u16.to_be_bytes())
        .unwrap();
    let mut corrupted = syn.to_vec();
    corrupted[5] ^= 0x10;
    remote.write_all(&corrupted).await.unwrap();

    eventually(|| engine.engine_stats().malformed_frames == 1).await;
    assert_eq!(engine.state(&handle), ConnectionState::Listen);
    assert_eq!(engine.stats(&handle).malformed_frames, 1);

    remote.write_all(&syn).await.unwrap();
    let mut buffer = BytesMut::new();
    let syn_ack = read_frame(&mut remote, &mut buffer).await;
    assert!(syn_ack.has_flag(flags::SYN | flags::ACK));
    assert_eq!(engine.state(&handle), ConnectionState::SynReceived);

    engine.shutdown().await.unwrap();
}

#[derive(Default)]
struct Collector {
    received: Mutex<Vec<(ConnectionId, Bytes)>>,
}

impl DataConsumer for Collector {
    fn on_data(&self, connection: ConnectionId, payload: Bytes) {
        self.received.lock().push((connection, payload));
    }
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_consumer_receives_payloads(config: EngineConfig) {
    let collector = Arc::new(Collector::default());
    let server = Engine::with_consumer(config.clone(), collector.clone()).unwrap();
    let client = Engine::start(config).unwrap();
    let (server_side, client_side) = duplex(64 * 1024);
    let passive = server
        .attach(server_side, peer(8000), Role::Passive)
        .await
        .unwrap();
    let active = client
        .attach(client_side, peer(8001), Role::Active)
        .await
        .unwrap();
    client.wait_established(&active).await.unwrap();

    client.send(&active, b"one").await.unwrap();
    client.send(&active, b"two").await.unwrap();
    eventually(|| collector.received.lock().len() == 2).await;

    let received = collector.received.lock().clone();
    assert_eq!(received[0], (passive.id(), Bytes::from_static(b"one")));
    assert_eq!(received[1], (passive.id(), Bytes::from_static(b"two")));

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_tcp_loopback_echo(config: EngineConfig) {
    let server = Engine::start(config.clone()).unwrap();
    let client = Engine::start(config).unwrap();
    let addr = server.listen("127.0.0.1:0").await.unwrap();

    let active = client.open(&addr.to_string()).await.unwrap();
    let passive = time::timeout(WAIT, server.accept()).await.unwrap().unwrap();
    assert_eq!(server.state(&passive), ConnectionState::Established);

    client.send(&active, b"ping").await.unwrap();
    let request = server.receive_exact(&passive, 4).await.unwrap();
    server.send(&passive, &request).await.unwrap();
    assert_eq!(
        client.receive_exact(&active, 4).await.unwrap(),
        Bytes::from_static(b"ping")
    );

    client.close(&active).await.unwrap();
    eventually(|| server.connection_count() == 0).await;

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_closes_connections(config: EngineConfig) {
    let (server, passive, client, active) = connected(&config).await;

    time::timeout(WAIT, server.shutdown()).await.unwrap().unwrap();
    eventually(|| client.connection_count() == 0).await;
    assert_eq!(client.state(&active), ConnectionState::Closed);
    assert_eq!(passive.role(), Role::Passive);

    client.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test]
async fn test_invalid_config_is_rejected(mut config: EngineConfig) {
    config.network.max_payload_size = 0;
    assert!(matches!(
        Engine::start(config),
        Err(AppError::InvalidValue(_))
    ));
}

#[rstest]
#[tokio::test]
async fn test_start_then_immediate_shutdown(config: EngineConfig) {
    let engine = Engine::start(config).unwrap();
    time::timeout(Duration::from_secs(5), engine.shutdown())
        .await
        .unwrap()
        .unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_zero_window_recovers_after_drain(mut config: EngineConfig) {
    config.connection.keepalive_interval_ms = 0;
    config.connection.recv_buffer_size = 2 * config.network.max_payload_size + 1;
    let (server, passive, client, active) = connected(&config).await;
    let data = vec![3u8; 2 * config.network.max_payload_size];

    client.send(&active, &data).await.unwrap();
    eventually(|| {
        let stats = client.stats(&active);
        stats.in_flight == 0 && stats.peer_window == 0
    })
    .await;
    assert!(client.stats(&active).congestion_window >= 1);

    assert_eq!(server.receive_exact(&passive, data.len()).await.unwrap().len(), data.len());
    eventually(|| client.stats(&active).peer_window == 2).await;

    client.send(&active, b"more").await.unwrap();
    assert_eq!(
        server.receive_exact(&passive, 4).await.unwrap(),
        Bytes::from_static(b"more")
    );

    client.shutdown().await.unwrap();
    server.shutdown().await.unwrap();
}

#[rstest]
#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stalled_peer_does_not_block_worker(mut config: EngineConfig) {
    config.worker_pool.max_workers = 1;
    config.connection.keepalive_interval_ms = 0;
    config.connection.idle_timeout_ms = 2_000;
    config.connection.io_timeout_ms = 500;
    let engine = Engine::start(config.clone()).unwrap();

    // a peer that completes the handshake and then never reads
    let (local, mut remote) = duplex(64);
    let stalled = engine
        .attach(local, peer(9000), Role::Active)
        .await
        .unwrap();
    let mut buffer = BytesMut::new();
    assert!(read_frame(&mut remote, &mut buffer).await.has_flag(flags::SYN));
    let syn_ack = Frame::encode(
        MessageType::Control,
        flags::SYN | flags::ACK,
        1000,
        0,
        &32u16.to_be_bytes(),
    )
    .unwrap();
    remote.write_all(&syn_ack).await.unwrap();
    engine.wait_established(&stalled).await.unwrap();
    for _ in 0..20 {
        let heartbeat = Frame::encode(MessageType::Heartbeat, 0, 1001, 0, &[]).unwrap();
        remote.write_all(&heartbeat).await.unwrap();
    }

    // a healthy connection on the same worker keeps moving
    let other = Engine::start(config).unwrap();
    let (server_side, client_side) = duplex(64 * 1024);
    let passive = engine
        .attach(server_side, peer(9001), Role::Passive)
        .await
        .unwrap();
    let active = other
        .attach(client_side, peer(9002), Role::Active)
        .await
        .unwrap();
    other.wait_established(&active).await.unwrap();
    other.send(&active, b"still alive").await.unwrap();
    assert_eq!(
        engine.receive_exact(&passive, 11).await.unwrap(),
        Bytes::from_static(b"still alive")
    );

    eventually(|| !engine.is_registered(&stalled)).await;
    assert_eq!(engine.close_reason(&stalled), Some(CloseReason::Timeout));

    other.shutdown().await.unwrap();
    time::timeout(WAIT, engine.shutdown()).await.unwrap().unwrap();
}
