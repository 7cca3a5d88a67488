// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// End-to-end Core A scenarios: a real bootstrap handshake over a Unix
// domain socket, real shared-memory rings, a real out-of-band
// notification channel. Each test spawns a thread for one side and drives
// the other from the test body.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{mpsc, Arc};
use std::time::Duration;

use safeipc::connection::ConnectionId;
use safeipc::shm::PosixShmProvider;
use safeipc::{Connection, SafeIpcConfig};

static NEXT_PORT: AtomicU32 = AtomicU32::new(55000);

fn test_id() -> ConnectionId {
    ConnectionId {
        domain: 777,
        port: NEXT_PORT.fetch_add(1, Ordering::Relaxed),
    }
}

fn test_config() -> SafeIpcConfig {
    let mut config = SafeIpcConfig::default();
    config.bootstrap_socket_dir = std::env::temp_dir().to_string_lossy().into_owned();
    config.platform_min_buffer_size = 8192;
    config
}

fn connect_pair(id: ConnectionId, config: &SafeIpcConfig) -> (Connection, Connection) {
    let shm: Arc<dyn safeipc::shm::ShmProvider> = Arc::new(PosixShmProvider::new());
    let server_shm = Arc::clone(&shm);
    let server_config = config.clone();
    let server = std::thread::spawn(move || {
        let bootstrap = safeipc::handshake::BootstrapListener::bind(
            &server_config.bootstrap_socket_dir,
            id.domain,
            id.port,
        )
        .unwrap();
        let stream = bootstrap.accept().unwrap();
        Connection::accept_blocking(stream, id, &server_config, server_shm).unwrap()
    });

    std::thread::sleep(Duration::from_millis(50));
    let client = Connection::connect_blocking(id, config, shm).unwrap();
    let server = server.join().unwrap();
    (client, server)
}

#[test]
fn handshake_establishes_bidirectional_connection() {
    let id = test_id();
    let config = test_config();
    let (client, server) = connect_pair(id, &config);

    assert_eq!(client.id(), id);
    assert_eq!(server.id(), id);
    assert!(client.get_send_buffer_size() >= config.platform_min_buffer_size);
    assert!(server.get_receive_buffer_size() >= config.platform_min_buffer_size);

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn send_sync_then_receive_sync_round_trips_payload() {
    let id = test_id();
    let config = test_config();
    let (client, server) = connect_pair(id, &config);

    let payload = b"hello from the client side";
    client.send_sync(payload, Some(2_000)).unwrap();

    let mut buf = [0u8; 64];
    let received = server.receive_sync(&mut buf, Some(2_000)).unwrap();
    assert!(!received.truncated);
    assert_eq!(&buf[..received.len], payload);

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn notifications_are_delivered_independently_of_data_path() {
    let id = test_id();
    let config = test_config();
    let (client, server) = connect_pair(id, &config);

    let (tx, rx) = mpsc::channel();
    server.register_notification_callback(Arc::new(move |value| {
        tx.send(value).unwrap();
    }));

    client.send_notification(42).unwrap();
    let value = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(value, 42);

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn send_async_completion_fires_for_many_messages() {
    let id = test_id();
    let config = test_config();
    let (client, server) = connect_pair(id, &config);

    let (tx, rx) = mpsc::channel();
    for i in 0..16u32 {
        let tx = tx.clone();
        client
            .send_async(&i.to_le_bytes(), move |result| {
                tx.send(result).unwrap();
            })
            .unwrap();
    }
    for _ in 0..16 {
        rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
    }

    let mut seen = Vec::new();
    for _ in 0..16u32 {
        let mut buf = [0u8; 4];
        let received = server.receive_sync(&mut buf, Some(2_000)).unwrap();
        assert!(!received.truncated);
        seen.push(u32::from_le_bytes(buf));
    }
    seen.sort();
    assert_eq!(seen, (0..16).collect::<Vec<_>>());

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn closing_one_side_makes_the_other_unusable() {
    let id = test_id();
    let config = test_config();
    let (client, server) = connect_pair(id, &config);

    client.close().unwrap();
    assert!(client.send_sync(b"x", Some(100)).is_err());

    server.close().unwrap();
}
