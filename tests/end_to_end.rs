//! Drives a real client against a real server over loopback UDP sockets,
//! exercising the scenarios in `SPEC_FULL.md` §8 at a scale a unit test
//! inside `src/rudp/` can't reach.

use std::io::Read;
use std::thread;
use std::time::Duration;

use rudp::{Client, ClientOptions};

fn start_server(drop_rate: f64) -> (rudp::Server, std::net::SocketAddr) {
    let server = rudp::server("127.0.0.1", 0, drop_rate).expect("bind");
    let addr = server.local_addr().expect("local_addr");
    (server, addr)
}

#[test]
fn loss_free_small_message_round_trips_exactly() {
    let (server, addr) = start_server(0.0);
    let payload = "Olá RUDP!".as_bytes().to_vec();
    let expected = payload.clone();

    let server_thread = thread::spawn(move || {
        let mut stream = server.accept().expect("accept");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).expect("read_to_end");
        (received, stream.metrics())
    });

    let client = Client::connect(addr, ClientOptions::default()).expect("connect");
    client.send_bytes(&payload).expect("send_bytes");
    client.close().expect("close");

    let (received, server_metrics) = server_thread.join().expect("server thread");
    assert_eq!(received, expected);
    assert_eq!(server_metrics.bytes_delivered, expected.len() as u64);
    assert_eq!(client.metrics().retransmissions, 0);
}

#[test]
fn larger_deterministic_payload_is_delivered_byte_exact_and_in_order() {
    let (server, addr) = start_server(0.0);
    let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();

    let server_thread = thread::spawn(move || {
        let mut stream = server.accept().expect("accept");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).expect("read_to_end");
        received
    });

    let client = Client::connect(addr, ClientOptions::default()).expect("connect");
    client.send_bytes(&payload).expect("send_bytes");
    client.close().expect("close");

    let received = server_thread.join().expect("server thread");
    assert_eq!(received, expected);
}

#[test]
fn simulated_loss_still_delivers_every_byte_and_forces_retransmission() {
    let (server, addr) = start_server(0.12);
    let payload: Vec<u8> = (0..80_000u32).map(|i| (i % 256) as u8).collect();
    let expected = payload.clone();

    let server_thread = thread::spawn(move || {
        let mut stream = server.accept().expect("accept");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).expect("read_to_end");
        received
    });

    let options = ClientOptions {
        op_timeout: Some(Duration::from_secs(30)),
        ..ClientOptions::default()
    };
    let client = Client::connect(addr, options).expect("connect");
    client.send_bytes(&payload).expect("send_bytes");
    client.close().expect("close");

    let received = server_thread.join().expect("server thread");
    assert_eq!(received, expected);
    assert!(client.metrics().retransmissions > 0);
}

#[test]
fn close_without_crypto_or_congestion_control_still_closes_cleanly() {
    let (server, addr) = start_server(0.0);
    let payload = b"plaintext, flow-control-only transfer".to_vec();
    let expected = payload.clone();

    let server_thread = thread::spawn(move || {
        let mut stream = server.accept().expect("accept");
        let mut received = Vec::new();
        stream.read_to_end(&mut received).expect("read_to_end");
        received
    });

    let options = ClientOptions {
        use_crypto: false,
        cc_enabled: false,
        op_timeout: None,
    };
    let client = Client::connect(addr, options).expect("connect");
    client.send_bytes(&payload).expect("send_bytes");
    client.close().expect("close");

    let received = server_thread.join().expect("server thread");
    assert_eq!(received, expected);
}

#[test]
fn connect_to_unreachable_peer_fails_instead_of_hanging() {
    // Nothing is listening on this port: every SYN goes unanswered. A short
    // `op_timeout` must surface a `LocalCancelled` well before full SYN
    // retry exhaustion (which backs off geometrically and can take over a
    // minute) — the call must never block forever either way.
    let addr: std::net::SocketAddr = "127.0.0.1:1".parse().unwrap();
    let options = ClientOptions {
        op_timeout: Some(Duration::from_secs(2)),
        ..ClientOptions::default()
    };
    let result = Client::connect(addr, options);
    assert!(matches!(
        result,
        Err(rudp::Error::LocalCancelled { .. }) | Err(rudp::Error::HandshakeFailure { .. })
    ));
}
