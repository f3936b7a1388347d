//! End-to-end tests over in-process datagram links.
//!
//! Each test wires a publisher and a subscriber driver back-to-back with
//! unbounded channels standing in for the lower layer — optionally through
//! a fault-injecting relay — and exercises whole-message transfer through
//! the full stack: handshake, fragmentation, windowing, acks, reassembly.

use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;

use paftp::driver::{self, PaftpSession};
use paftp::packet::flags;
use paftp::state::Role;
use paftp::timer::TimerConfig;
use paftp::transport::Session;

fn session() -> Session {
    Session {
        id: 1,
        peer_id: 2,
        peer_addr: [0x02, 0, 0, 0, 0, 0x01],
    }
}

/// Timeouts shrunk so loss tests retransmit in milliseconds, not seconds.
fn fast_config() -> TimerConfig {
    TimerConfig {
        connect_timeout: Duration::from_secs(2),
        ack_received_timeout: Duration::from_millis(100),
        retransmit_timeout: Duration::from_millis(100),
        send_ack_timeout: Duration::from_millis(50),
        wait_resource_timeout: Duration::from_millis(50),
        max_resource_blocks: 15,
    }
}

/// Two drivers joined by direct channels.
fn direct_pair() -> (PaftpSession, PaftpSession) {
    let (sub_out_tx, sub_out_rx) = mpsc::unbounded_channel();
    let (pub_out_tx, pub_out_rx) = mpsc::unbounded_channel();

    let publisher = driver::spawn(
        Role::Publisher,
        session(),
        pub_out_tx,
        sub_out_rx,
        fast_config(),
    );
    let subscriber = driver::spawn(
        Role::Subscriber,
        session(),
        sub_out_tx,
        pub_out_rx,
        fast_config(),
    );
    (publisher, subscriber)
}

// ---------------------------------------------------------------------------
// Test 1: handshake completes through the event loop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn handshake_completes() {
    let (_publisher, mut subscriber) = direct_pair();

    tokio::time::timeout(Duration::from_secs(5), subscriber.connected())
        .await
        .expect("handshake timed out")
        .expect("handshake failed");
}

// ---------------------------------------------------------------------------
// Test 2: basic ping-pong
// ---------------------------------------------------------------------------

#[tokio::test]
async fn round_trip_small_message() {
    let (mut publisher, mut subscriber) = direct_pair();
    subscriber.connected().await.expect("connect");

    subscriber
        .send(Bytes::from_static(b"Ping!"))
        .await
        .expect("subscriber send");
    let received = publisher.recv().await.expect("publisher recv");
    assert_eq!(received, "Ping!");

    publisher
        .send(Bytes::from_static(b"Pong!"))
        .await
        .expect("publisher send");
    let reply = subscriber.recv().await.expect("subscriber recv");
    assert_eq!(reply, "Pong!");

    subscriber.close().await;
    publisher.close().await;
}

// ---------------------------------------------------------------------------
// Test 3: a message spanning many fragments arrives intact
// ---------------------------------------------------------------------------

#[tokio::test]
async fn large_message_reassembles() {
    let (mut publisher, mut subscriber) = direct_pair();
    subscriber.connected().await.expect("connect");

    // ~21 fragments at the 244-byte fragment size.
    let payload: Vec<u8> = (0..5000u32).map(|i| (i * 31) as u8).collect();
    let message = Bytes::from(payload);

    subscriber.send(message.clone()).await.expect("send");
    let received = tokio::time::timeout(Duration::from_secs(10), publisher.recv())
        .await
        .expect("transfer timed out")
        .expect("connection closed");
    assert_eq!(received, message);

    subscriber.close().await;
    publisher.close().await;
}

// ---------------------------------------------------------------------------
// Test 4: message boundaries and order survive a burst
// ---------------------------------------------------------------------------

#[tokio::test]
async fn burst_preserves_order_and_boundaries() {
    const COUNT: usize = 10;

    let (mut publisher, mut subscriber) = direct_pair();
    subscriber.connected().await.expect("connect");

    for i in 0..COUNT {
        let msg = format!("message-{i:02}-{}", "x".repeat(i * 40));
        subscriber.send(msg.into_bytes().into()).await.expect("send");
    }

    for i in 0..COUNT {
        let received = tokio::time::timeout(Duration::from_secs(10), publisher.recv())
            .await
            .expect("burst timed out")
            .expect("connection closed");
        let expected = format!("message-{i:02}-{}", "x".repeat(i * 40));
        assert_eq!(received, expected.as_bytes(), "message {i} corrupted");
    }

    subscriber.close().await;
    publisher.close().await;
}

// ---------------------------------------------------------------------------
// Test 5: a dropped data datagram is recovered by retransmission
// ---------------------------------------------------------------------------

/// Forward datagrams, dropping the first message-starting one exactly once.
fn drop_first_start_relay(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<Bytes>,
) {
    tokio::spawn(async move {
        let mut dropped = false;
        while let Some(datagram) = rx.recv().await {
            let hdr = datagram.first().copied().unwrap_or(0);
            let is_start = hdr & flags::HANDSHAKE == 0 && hdr & flags::START_MESSAGE != 0;
            if is_start && !dropped {
                dropped = true;
                continue;
            }
            if tx.send(datagram).is_err() {
                break;
            }
        }
    });
}

#[tokio::test]
async fn lost_datagram_recovered_by_retransmission() {
    let (sub_out_tx, sub_out_rx) = mpsc::unbounded_channel();
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let (pub_out_tx, pub_out_rx) = mpsc::unbounded_channel();

    // Subscriber → relay → publisher; the return path is direct.
    drop_first_start_relay(sub_out_rx, relay_tx);

    let mut publisher = driver::spawn(
        Role::Publisher,
        session(),
        pub_out_tx,
        relay_rx,
        fast_config(),
    );
    let mut subscriber = driver::spawn(
        Role::Subscriber,
        session(),
        sub_out_tx,
        pub_out_rx,
        fast_config(),
    );

    subscriber.connected().await.expect("connect");

    subscriber
        .send(Bytes::from_static(b"hello through loss"))
        .await
        .expect("send");

    // The first copy is dropped; the ack timeout resends it.
    let received = tokio::time::timeout(Duration::from_secs(5), publisher.recv())
        .await
        .expect("retransmission never recovered the message")
        .expect("connection closed");
    assert_eq!(received, "hello through loss");

    subscriber.close().await;
    publisher.close().await;
}

// ---------------------------------------------------------------------------
// Test 6: a duplicated ack-bearing datagram does not kill the connection
// ---------------------------------------------------------------------------

/// Forward datagrams, delivering the first ack-carrying one twice.
fn duplicate_first_ack_relay(
    mut rx: mpsc::UnboundedReceiver<Bytes>,
    tx: mpsc::UnboundedSender<Bytes>,
) {
    tokio::spawn(async move {
        let mut duplicated = false;
        while let Some(datagram) = rx.recv().await {
            let hdr = datagram.first().copied().unwrap_or(0);
            let carries_ack = hdr & flags::HANDSHAKE == 0 && hdr & flags::FRAGMENT_ACK != 0;
            if carries_ack && !duplicated {
                duplicated = true;
                if tx.send(datagram.clone()).is_err() {
                    break;
                }
            }
            if tx.send(datagram).is_err() {
                break;
            }
        }
    });
}

#[tokio::test]
async fn duplicated_ack_datagram_is_ignored() {
    let (sub_out_tx, sub_out_rx) = mpsc::unbounded_channel();
    let (relay_tx, relay_rx) = mpsc::unbounded_channel();
    let (pub_out_tx, pub_out_rx) = mpsc::unbounded_channel();

    // Subscriber → relay → publisher; the return path is direct.  The
    // second copy arrives behind the receive window with a stale ack and
    // must be swallowed, not escalated into a close.
    duplicate_first_ack_relay(sub_out_rx, relay_tx);

    let mut publisher = driver::spawn(
        Role::Publisher,
        session(),
        pub_out_tx,
        relay_rx,
        fast_config(),
    );
    let mut subscriber = driver::spawn(
        Role::Subscriber,
        session(),
        sub_out_tx,
        pub_out_rx,
        fast_config(),
    );

    subscriber.connected().await.expect("connect");

    subscriber
        .send(Bytes::from_static(b"first despite duplicate"))
        .await
        .expect("send");
    let received = tokio::time::timeout(Duration::from_secs(5), publisher.recv())
        .await
        .expect("first transfer timed out")
        .expect("connection closed on duplicate");
    assert_eq!(received, "first despite duplicate");

    // The connection is still healthy: a second message goes through.
    subscriber
        .send(Bytes::from_static(b"still connected"))
        .await
        .expect("send after duplicate");
    let received = tokio::time::timeout(Duration::from_secs(5), publisher.recv())
        .await
        .expect("second transfer timed out")
        .expect("connection closed after duplicate");
    assert_eq!(received, "still connected");

    subscriber.close().await;
    publisher.close().await;
}

// ---------------------------------------------------------------------------
// Test 7: graceful close drains and reports a clean reason
// ---------------------------------------------------------------------------

#[tokio::test]
async fn graceful_close_reports_clean_reason() {
    let (mut publisher, mut subscriber) = direct_pair();
    subscriber.connected().await.expect("connect");

    subscriber
        .send(Bytes::from_static(b"last words"))
        .await
        .expect("send");
    let received = publisher.recv().await.expect("recv");
    assert_eq!(received, "last words");

    // Dropping the handle inside close() drains the queue, waits for the
    // final ack, and resolves with the close reason.
    let reason = tokio::time::timeout(Duration::from_secs(5), subscriber.close())
        .await
        .expect("close timed out");
    assert_eq!(reason, None, "graceful close must be clean");

    // The peer side winds down too, either from its own graceful close or
    // from observing the link go away.
    tokio::time::timeout(Duration::from_secs(5), publisher.close())
        .await
        .expect("peer close timed out");
}
