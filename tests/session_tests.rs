// tests/session_tests.rs

use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};

use mcast_relay::transport::{Packet, Session, TransportError, CHANNEL_CAPACITY, PACKET_MTU};

const WAIT: Duration = Duration::from_secs(2);

/// A session on a unicast loopback socket plus a sender connected to it.
async fn loopback() -> (Session, UdpSocket) {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    let session = Session::from_socket(socket);
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.connect(addr).await.unwrap();
    (session, sender)
}

fn ts_packet(fill: u8, len: usize) -> Vec<u8> {
    let mut data = vec![fill; len];
    data[0] = 0x47;
    data
}

fn rtp_packet(flags: u8, seq: u16, payload: &[u8]) -> Vec<u8> {
    let mut data = vec![0x80 | flags, 0x21];
    data.extend_from_slice(&seq.to_be_bytes());
    data.extend_from_slice(&[0, 0, 0, 0, 0x11, 0x22, 0x33, 0x44]);
    data.extend_from_slice(payload);
    data
}

async fn next(rx: &mut mpsc::Receiver<Packet>) -> Option<Packet> {
    timeout(WAIT, rx.recv()).await.expect("timed out waiting for packet")
}

#[tokio::test]
async fn test_raw_stream_is_relayed_in_arrival_order() {
    let (session, sender) = loopback().await;
    for fill in 1..=3u8 {
        sender.send(&ts_packet(fill, 188)).await.unwrap();
    }

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    for fill in 1..=3u8 {
        let pkt = next(&mut rx).await.unwrap();
        assert_eq!(pkt.offset(), 0);
        assert_eq!(pkt.payload().len(), 188);
        assert_eq!(pkt.payload()[0], 0x47);
        assert_eq!(pkt.payload()[1], fill);
        pkt.release();
    }
    session.close();
}

#[tokio::test]
async fn test_rtp_stream_is_stripped_and_reordered() {
    let (session, sender) = loopback().await;
    for seq in [10u16, 11, 13, 12, 14] {
        sender
            .send(&rtp_packet(0, seq, format!("seq{}", seq).as_bytes()))
            .await
            .unwrap();
    }

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    for seq in 10u16..=14 {
        let pkt = next(&mut rx).await.unwrap();
        assert_eq!(pkt.sequence(), seq);
        assert_eq!(pkt.offset(), 12);
        assert_eq!(pkt.payload(), format!("seq{}", seq).as_bytes());
    }
}

#[tokio::test]
async fn test_empty_rtp_payload_is_skipped_without_stalling() {
    let (session, sender) = loopback().await;
    sender.send(&rtp_packet(0, 1, b"one")).await.unwrap();
    // Padding covers the whole payload.
    sender.send(&rtp_packet(0x20, 2, &[0, 0, 3])).await.unwrap();
    sender.send(&rtp_packet(0, 3, b"three")).await.unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    assert_eq!(next(&mut rx).await.unwrap().payload(), b"one");
    let pkt = next(&mut rx).await.unwrap();
    assert_eq!(pkt.sequence(), 3);
    assert_eq!(pkt.payload(), b"three");
}

#[tokio::test]
async fn test_oversized_datagram_is_truncated() {
    let (session, sender) = loopback().await;
    sender.send(&ts_packet(9, PACKET_MTU + 500)).await.unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    let pkt = next(&mut rx).await.unwrap();
    assert_eq!(pkt.length(), PACKET_MTU);
    assert_eq!(pkt.payload().len(), PACKET_MTU);
}

#[tokio::test]
async fn test_unsupported_version_fails_start() {
    let (session, sender) = loopback().await;
    let mut data = rtp_packet(0, 1, b"x");
    data[0] = 0x40;
    sender.send(&data).await.unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let err = session.start(cancel_rx).await.unwrap_err();
    assert!(matches!(err, TransportError::UnsupportedVersion(1)));
}

#[tokio::test]
async fn test_unsupported_profile_fails_start() {
    let (session, sender) = loopback().await;
    let mut data = rtp_packet(0, 1, b"x");
    data[1] = 0x60;
    sender.send(&data).await.unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let err = session.start(cancel_rx).await.unwrap_err();
    assert!(matches!(err, TransportError::UnsupportedProfile(0x60)));
}

#[tokio::test]
async fn test_short_first_packet_fails_start() {
    let (session, sender) = loopback().await;
    sender.send(&[0x80, 0x21, 0, 1, 0]).await.unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let err = session.start(cancel_rx).await.unwrap_err();
    assert!(matches!(err, TransportError::MalformedPacket(5)));
}

#[tokio::test]
async fn test_cancel_while_blocked_on_send_closes_channel() {
    let (session, sender) = loopback().await;
    for fill in 0..40u8 {
        sender.send(&ts_packet(fill, 188)).await.unwrap();
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    // Let the producer fill the channel and block on the next send.
    sleep(Duration::from_millis(200)).await;
    cancel_tx.send(true).unwrap();

    let mut received = Vec::new();
    while let Some(pkt) = next(&mut rx).await {
        received.push(pkt.payload()[1]);
    }
    assert_eq!(received.len(), CHANNEL_CAPACITY);
    assert_eq!(received, (0..CHANNEL_CAPACITY as u8).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_dropping_cancel_sender_ends_stream() {
    let (session, sender) = loopback().await;
    sender.send(&ts_packet(1, 188)).await.unwrap();

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    drop(cancel_tx);
    assert!(next(&mut rx).await.is_some());
    assert!(next(&mut rx).await.is_none());
}

#[tokio::test]
async fn test_close_unblocks_idle_reader_and_is_idempotent() {
    let (session, sender) = loopback().await;
    sender.send(&ts_packet(1, 188)).await.unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    assert!(next(&mut rx).await.is_some());

    session.close();
    session.close();
    assert!(next(&mut rx).await.is_none());
    session.close();
}

#[tokio::test]
async fn test_released_packets_are_reused() {
    let (session, sender) = loopback().await;
    for fill in 1..=4u8 {
        sender.send(&ts_packet(fill, 188)).await.unwrap();
    }

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    for _ in 0..4 {
        next(&mut rx).await.unwrap().release();
    }
    assert!(session.pool().idle() >= 1);
}

#[tokio::test]
async fn test_cancel_stops_socket_reads() {
    let std_socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    std_socket.set_nonblocking(true).unwrap();
    let addr = std_socket.local_addr().unwrap();
    // A second handle on the same socket sees whatever the session left unread.
    let spare = std_socket.try_clone().unwrap();
    let session = Session::from_socket(UdpSocket::from_std(std_socket).unwrap());
    let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    sender.connect(addr).await.unwrap();
    for fill in 0..40u8 {
        sender.send(&ts_packet(fill, 188)).await.unwrap();
    }

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    cancel_tx.send(true).unwrap();
    while next(&mut rx).await.is_some() {}
    sender.send(&ts_packet(0xEE, 188)).await.unwrap();

    // The channel filled up with 0..15 and 16 was waiting to be queued; nothing
    // past that was read.
    let spare = UdpSocket::from_std(spare).unwrap();
    let mut buf = [0u8; PACKET_MTU];
    let mut rest = Vec::new();
    for _ in 17..=40 {
        let n = timeout(WAIT, spare.recv(&mut buf)).await.unwrap().unwrap();
        assert_eq!(n, 188);
        rest.push(buf[1]);
    }
    let mut expected: Vec<u8> = (17..40).collect();
    expected.push(0xEE);
    assert_eq!(rest, expected);
    assert_eq!(session.pool().idle(), CHANNEL_CAPACITY + 1);
}

#[tokio::test]
async fn test_close_releases_socket() {
    let (session, sender) = loopback().await;
    let addr = session.local_addr().unwrap();
    sender.send(&ts_packet(1, 188)).await.unwrap();

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    assert!(next(&mut rx).await.is_some());
    assert!(std::net::UdpSocket::bind(addr).is_err());

    session.close();
    assert!(next(&mut rx).await.is_none());
    assert!(std::net::UdpSocket::bind(addr).is_ok());
    assert!(session.local_addr().is_err());

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    assert!(session.start(cancel_rx).await.is_err());
}

#[tokio::test]
async fn test_close_unblocks_producer_waiting_on_full_channel() {
    let (session, sender) = loopback().await;
    for fill in 0..20u8 {
        sender.send(&ts_packet(fill, 188)).await.unwrap();
    }

    let (_cancel_tx, cancel_rx) = watch::channel(false);
    let mut rx = session.start(cancel_rx).await.unwrap();
    sleep(Duration::from_millis(200)).await;
    session.close();

    let mut received = 0;
    while next(&mut rx).await.is_some() {
        received += 1;
    }
    assert_eq!(received, CHANNEL_CAPACITY);
}
