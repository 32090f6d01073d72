//! End-to-end tests over real localhost sockets, covering the cooperative
//! listen mode and its interaction with the synchronous pump.

use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::time::{timeout, Instant};

use wirebox::{
    DynamicPacket, ListenOptions, Mailbox, MailboxConfig, Packet, StopPolicy, WireboxError,
};

const DEADLINE: Duration = Duration::from_secs(5);

/// Route library tracing into the test output. Safe to call repeatedly;
/// only the first call installs the subscriber.
fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Connected localhost socket pair.
fn tcp_pair() -> (TcpStream, TcpStream) {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    let client = TcpStream::connect(addr).unwrap();
    let (server, _) = listener.accept().unwrap();
    (client, server)
}

fn mailbox_pair() -> (Arc<Mailbox>, Arc<Mailbox>) {
    let (a, b) = tcp_pair();
    (
        Arc::new(Mailbox::new(a).unwrap()),
        Arc::new(Mailbox::new(b).unwrap()),
    )
}

/// Tick `mailbox` until `done` reports true or the deadline passes.
async fn drive(mailbox: &Mailbox, mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !done() {
        assert!(Instant::now() < deadline, "test deadline exceeded");
        assert!(mailbox.tick(), "mailbox failed while driving");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

/// Wait until `done` reports true or the deadline passes, without ticking.
async fn wait_for(mut done: impl FnMut() -> bool) {
    let deadline = Instant::now() + DEADLINE;
    while !done() {
        assert!(Instant::now() < deadline, "test deadline exceeded");
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
}

#[tokio::test]
async fn test_listen_mode_echo() {
    let (alice, bob) = mailbox_pair();
    alice.start_listen(ListenOptions::default()).unwrap();
    bob.start_listen(ListenOptions::default()).unwrap();

    alice.send(Packet::new(Bytes::from_static(b"ping")));
    let request = timeout(DEADLINE, bob.recv()).await.unwrap();
    assert_eq!(request.payload(), b"ping");

    bob.send(Packet::new(Bytes::from_static(b"pong")));
    let reply = timeout(DEADLINE, alice.recv()).await.unwrap();
    assert_eq!(reply.payload(), b"pong");

    alice.stop_listen_wait(StopPolicy::Immediate).await;
    bob.stop_listen_wait(StopPolicy::Immediate).await;
    assert!(alice.is_usable());
    assert!(bob.is_usable());
}

#[tokio::test]
async fn test_listen_mode_delivers_zero_length_packets() {
    let (alice, bob) = mailbox_pair();
    alice.start_listen(ListenOptions::default()).unwrap();
    bob.start_listen(ListenOptions::default()).unwrap();

    alice.send(Packet::empty());
    let packet = timeout(DEADLINE, bob.recv()).await.unwrap();
    assert!(packet.is_empty());

    alice.stop_listen_wait(StopPolicy::Immediate).await;
    bob.stop_listen_wait(StopPolicy::Immediate).await;
}

#[tokio::test]
async fn test_listen_then_resume_ticking() {
    let (alice, bob) = mailbox_pair();

    // First exchange through the cooperative pump.
    alice.start_listen(ListenOptions::default()).unwrap();
    bob.start_listen(ListenOptions::default()).unwrap();
    alice.send(Packet::new(Bytes::from_static(b"async")));
    timeout(DEADLINE, bob.recv()).await.unwrap();

    alice.stop_listen_wait(StopPolicy::Immediate).await;
    bob.stop_listen_wait(StopPolicy::Immediate).await;

    // Second exchange through the synchronous pump on the same sockets.
    alice.send(Packet::new(Bytes::from_static(b"sync")));
    drive(&alice, || alice.pending_send() == 0).await;
    drive(&bob, || bob.pending_received() == 1).await;
    assert_eq!(bob.next().unwrap().payload(), b"sync");
}

#[tokio::test]
async fn test_stop_drain_on_empty_flushes_queued_packets() {
    let (alice, bob) = mailbox_pair();
    alice.start_listen(ListenOptions::default()).unwrap();

    for i in 0..50u8 {
        alice.send(Packet::new(Bytes::copy_from_slice(&[i])));
    }
    alice.stop_listen_wait(StopPolicy::DrainOnEmpty).await;
    assert_eq!(alice.pending_send(), 0);
    assert!(alice.is_usable());

    drive(&bob, || bob.pending_received() == 50).await;
    for i in 0..50u8 {
        assert_eq!(bob.next().unwrap().payload(), &[i]);
    }
}

#[tokio::test]
async fn test_start_listen_twice_is_rejected() {
    let (alice, _bob) = mailbox_pair();
    alice.start_listen(ListenOptions::default()).unwrap();

    let err = alice.start_listen(ListenOptions::default()).unwrap_err();
    assert!(matches!(err, WireboxError::AlreadyListening(_)));

    alice.stop_listen_wait(StopPolicy::Immediate).await;
    // Once stopped, listening may start again.
    alice.start_listen(ListenOptions::default()).unwrap();
    alice.stop_listen_wait(StopPolicy::Immediate).await;
}

#[tokio::test]
async fn test_protocol_violation_terminates_listen_loops() {
    let (raw, b) = tcp_pair();
    let bob = Arc::new(Mailbox::new(b).unwrap());
    bob.start_listen(ListenOptions::default()).unwrap();

    // Declare a negative length straight onto the raw socket.
    use std::io::Write;
    let mut raw = raw;
    raw.set_nonblocking(false).unwrap();
    raw.write_all(&(-7i32).to_le_bytes()).unwrap();
    raw.flush().unwrap();

    wait_for(|| !bob.is_usable()).await;
    bob.stop_listen_wait(StopPolicy::Immediate).await;
    assert!(!bob.is_usable());
    assert_eq!(bob.pending_received(), 0);
}

#[tokio::test]
async fn test_peer_close_terminates_listen_loops() {
    let (a, b) = tcp_pair();
    let bob = Arc::new(Mailbox::new(b).unwrap());
    bob.start_listen(ListenOptions::default()).unwrap();

    drop(a);
    wait_for(|| !bob.is_usable()).await;
    bob.stop_listen_wait(StopPolicy::Immediate).await;
}

#[tokio::test]
async fn test_oversize_packet_terminates_listen_loops() {
    let (raw, b) = tcp_pair();
    let bob = Arc::new(
        Mailbox::with_config(
            b,
            MailboxConfig {
                max_payload_size: 16,
                ..MailboxConfig::default()
            },
        )
        .unwrap(),
    );
    bob.start_listen(ListenOptions::default()).unwrap();

    use std::io::Write;
    let mut raw = raw;
    raw.set_nonblocking(false).unwrap();
    raw.write_all(&1024i32.to_le_bytes()).unwrap();
    raw.flush().unwrap();

    wait_for(|| !bob.is_usable()).await;
    bob.stop_listen_wait(StopPolicy::Immediate).await;
}

#[tokio::test]
async fn test_receive_rate_cap_throttles_per_window() {
    let (alice, bob) = mailbox_pair();
    bob.start_listen(ListenOptions {
        max_packets_per_second: 5,
    })
    .unwrap();

    for i in 0..15u8 {
        alice.send(Packet::new(Bytes::copy_from_slice(&[i])));
    }
    drive(&alice, || alice.pending_send() == 0).await;

    // Within the first window no more than one cap's worth arrives.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(
        bob.pending_received() <= 5,
        "rate cap exceeded: {} in first window",
        bob.pending_received()
    );

    // All of them arrive once enough windows have elapsed.
    wait_for(|| bob.pending_received() == 15).await;
    bob.stop_listen_wait(StopPolicy::Immediate).await;
}

#[tokio::test]
async fn test_dynamic_packet_sends_latest_payload() {
    let (alice, bob) = mailbox_pair();

    // Queue before the send loop exists, then update the payload.
    let dynamic = DynamicPacket::with_payload(Bytes::from_static(b"stale"));
    alice.send_dynamic(&dynamic);
    assert!(dynamic.replace_payload(Bytes::from_static(b"fresh")));

    alice.start_listen(ListenOptions::default()).unwrap();
    bob.start_listen(ListenOptions::default()).unwrap();

    let packet = timeout(DEADLINE, bob.recv()).await.unwrap();
    assert_eq!(packet.payload(), b"fresh");

    // The payload is locked once transmission has picked it up.
    assert!(!dynamic.replace_payload(Bytes::from_static(b"too late")));

    alice.stop_listen_wait(StopPolicy::Immediate).await;
    bob.stop_listen_wait(StopPolicy::Immediate).await;
}

#[tokio::test]
async fn test_close_during_listen_cancels_loops() {
    let (alice, _bob) = mailbox_pair();
    alice.start_listen(ListenOptions::default()).unwrap();

    alice.close();
    assert!(!alice.is_usable());
    alice.stop_listen_wait(StopPolicy::Immediate).await;
    assert!(!alice.tick());
}

#[tokio::test]
async fn test_large_payload_roundtrip_through_listen() {
    let (alice, bob) = mailbox_pair();
    alice.start_listen(ListenOptions::default()).unwrap();
    bob.start_listen(ListenOptions::default()).unwrap();

    let payload: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();
    alice.send(Packet::from(payload.clone()));

    let packet = timeout(DEADLINE, bob.recv()).await.unwrap();
    assert_eq!(packet.len(), payload.len());
    assert_eq!(packet.payload(), &payload[..]);

    alice.stop_listen_wait(StopPolicy::Immediate).await;
    bob.stop_listen_wait(StopPolicy::Immediate).await;
}
