//! End-to-end tests over 127.0.0.1 with fault injection.
//!
//! Each test binds two endpoints on ephemeral ports, runs both sides
//! concurrently with `tokio::join!`, and uses seeded RNGs plus short
//! timeouts so runs finish quickly.

use std::time::Duration;

use bytes::BytesMut;
use taut::{Config, Endpoint, State, TautError};

fn fast(seed: u64) -> Config {
    Config {
        timeout: Duration::from_millis(40),
        handshake_timeout: Duration::from_millis(60),
        max_retries: 25,
        rng_seed: Some(seed),
        ..Config::default()
    }
}

async fn pair(client_cfg: Config, server_cfg: Config) -> (Endpoint, Endpoint) {
    let mut server = Endpoint::bind("127.0.0.1:0", server_cfg).await.unwrap();
    let server_addr = server.local_addr().unwrap();
    let mut client = Endpoint::bind("127.0.0.1:0", client_cfg).await.unwrap();

    let (c, s) = tokio::join!(client.connect(server_addr), server.accept());
    c.unwrap();
    s.unwrap();
    (client, server)
}

/// Collect exactly `want` bytes from successive `recv` calls.
async fn collect(endpoint: &mut Endpoint, want: usize) -> BytesMut {
    let mut out = BytesMut::new();
    while out.len() < want {
        let chunk = endpoint
            .recv()
            .await
            .unwrap()
            .expect("stream ended before the full payload arrived");
        out.extend_from_slice(&chunk);
    }
    out
}

#[tokio::test]
async fn handshake_establishes_both_sides() {
    let (client, server) = pair(fast(1), fast(2)).await;
    assert_eq!(client.state(), State::Established);
    assert_eq!(server.state(), State::Established);
    assert_eq!(client.peer_addr(), Some(server.local_addr().unwrap()));
    assert_eq!(server.peer_addr(), Some(client.local_addr().unwrap()));

    // SYN + completing ACK on one side, SYN|ACK on the other; no data.
    assert_eq!(client.channel_stats().sent, 2);
    assert_eq!(server.channel_stats().sent, 1);
}

#[tokio::test]
async fn small_message_is_one_data_frame_and_one_ack() {
    let (mut client, mut server) = pair(fast(3), fast(4)).await;

    let (sent, received) = tokio::join!(client.send(b"Hello, Server!"), server.recv());
    sent.unwrap();
    assert_eq!(&received.unwrap().unwrap()[..], b"Hello, Server!");

    // Handshake (2) + one DATA frame; handshake (1) + one ACK frame.
    assert_eq!(client.channel_stats().sent, 3);
    assert_eq!(server.channel_stats().sent, 2);
}

#[tokio::test]
async fn large_message_segments_and_reassembles() {
    let (mut client, mut server) = pair(fast(5), fast(6)).await;

    let payload = vec![0x58u8; 10240]; // 11 segments of <= 1009 bytes
    let (sent, received) = tokio::join!(client.send(&payload), collect(&mut server, 10240));
    sent.unwrap();
    assert_eq!(received.len(), 10240);
    assert!(received.iter().all(|&b| b == 0x58));

    // Handshake (2) plus at least ceil(10240 / 1009) = 11 DATA frames.
    assert!(client.channel_stats().sent >= 13);
}

#[tokio::test]
async fn bidirectional_transfer() {
    let (mut client, mut server) = pair(fast(7), fast(8)).await;

    let (sent, received) = tokio::join!(client.send(b"ping"), server.recv());
    sent.unwrap();
    assert_eq!(&received.unwrap().unwrap()[..], b"ping");

    let (sent, received) = tokio::join!(server.send(b"pong"), client.recv());
    sent.unwrap();
    assert_eq!(&received.unwrap().unwrap()[..], b"pong");
}

#[tokio::test]
async fn reversed_datagram_order_is_reassembled() {
    let (mut client, mut server) = pair(fast(9), fast(10)).await;

    let mut message = Vec::new();
    message.extend_from_slice(b"Start");
    message.extend_from_slice(&[b'X'; 2000]);
    message.extend_from_slice(b"End");

    // Two segments; the shim stashes both and flushes them in reverse.
    client.set_reorder_depth(2);
    let (sent, received) = tokio::join!(client.send(&message), collect(&mut server, message.len()));
    sent.unwrap();
    assert_eq!(&received[..], &message[..]);

    client.set_reorder_depth(0);
    client.close().await.unwrap();
}

#[tokio::test]
async fn lossy_channel_both_directions() {
    let mut cfg_client = fast(11);
    let mut cfg_server = fast(12);
    cfg_client.max_retries = 60;
    cfg_server.max_retries = 60;
    let (mut client, mut server) = pair(cfg_client, cfg_server).await;

    // Handshake ran clean; the data exchange is what suffers.
    client.set_loss_rate(0.5);
    server.set_loss_rate(0.5);

    let message = vec![0x58u8; 10240]; // 11 segments

    let (sent, received) = tokio::join!(client.send(&message), collect(&mut server, message.len()));
    sent.unwrap();
    assert_eq!(&received[..], &message[..]);

    // Loss forces retransmission: the client emitted (or had dropped) more
    // frames than the 2 handshake frames plus 11 segments.
    let stats = client.channel_stats();
    assert!(stats.sent + stats.dropped > 13);
}

#[tokio::test]
async fn corrupted_frames_never_reach_the_application() {
    let mut cfg_client = fast(13);
    cfg_client.timeout = Duration::from_millis(30);
    cfg_client.max_retries = 60;
    let (mut client, mut server) = pair(cfg_client, fast(14)).await;

    // Four out of five of the client's frames go out with a bad checksum.
    client.set_corrupt_rate(0.8);

    let request = b"GET /index.html HTTP/1.0\r\n\r\n";
    let (sent, server_side) = tokio::join!(client.send_final(request), async {
        let payload = server.recv().await.unwrap().unwrap();
        // DATA|FIN: the payload arrives intact, then end-of-stream.
        let eof = server.recv().await.unwrap();
        server.close().await.unwrap();
        (payload, eof)
    });
    sent.unwrap();
    let (payload, eof) = server_side;
    assert_eq!(&payload[..], request);
    assert_eq!(eof, None);
    assert!(client.channel_stats().corrupted > 0);

    assert_eq!(server.state(), State::Closed);
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test]
async fn total_loss_exhausts_retries_and_closes() {
    let mut cfg = fast(15);
    cfg.timeout = Duration::from_millis(30);
    cfg.max_retries = 4;
    let (mut client, server) = pair(cfg, fast(16)).await;

    client.set_loss_rate(1.0);
    let err = client.send(b"into the void").await.unwrap_err();
    assert!(matches!(err, TautError::DeliveryFailed { retries: 4, .. }));
    assert_eq!(client.state(), State::Closed);

    // The connection is gone for good.
    let err = client.send(b"again").await.unwrap_err();
    assert!(matches!(err, TautError::ConnectionClosed));
    drop(server);
}

#[tokio::test]
async fn graceful_close_converges_and_is_idempotent() {
    let (mut client, mut server) = pair(fast(17), fast(18)).await;

    tokio::join!(
        async {
            client.close().await.unwrap();
            // Repeated close() calls converge without error.
            client.close().await.unwrap();
        },
        async {
            // Peer FIN surfaces as end-of-stream.
            assert_eq!(server.recv().await.unwrap(), None);
            server.close().await.unwrap();
        }
    );

    assert_eq!(client.state(), State::Closed);
    assert_eq!(server.state(), State::Closed);

    let err = client.send(b"late").await.unwrap_err();
    assert!(matches!(err, TautError::ConnectionClosed));
}

#[tokio::test]
async fn duplicated_frames_deliver_exactly_once() {
    let (mut client, mut server) = pair(fast(24), fast(25)).await;
    client.set_dup_rate(1.0);
    server.set_dup_rate(1.0);

    let (sent, received) = tokio::join!(client.send(b"once and only once"), server.recv());
    sent.unwrap();
    assert_eq!(&received.unwrap().unwrap()[..], b"once and only once");
    assert!(client.channel_stats().duplicated > 0);

    // A second exchange proves the duplicates were suppressed, not queued:
    // the next in-order unit is the new payload.
    let (sent, received) = tokio::join!(client.send(b"second"), server.recv());
    sent.unwrap();
    assert_eq!(&received.unwrap().unwrap()[..], b"second");
}

#[tokio::test]
async fn simultaneous_close_converges() {
    let (mut client, mut server) = pair(fast(26), fast(27)).await;

    let (c, s) = tokio::join!(client.close(), server.close());
    c.unwrap();
    s.unwrap();
    assert_eq!(client.state(), State::Closed);
    assert_eq!(server.state(), State::Closed);
}

#[tokio::test]
async fn connect_without_listener_fails_after_retries() {
    let mut cfg = fast(19);
    cfg.max_retries = 3;
    // A bound socket that never answers.
    let black_hole = Endpoint::bind("127.0.0.1:0", fast(20)).await.unwrap();
    let target = black_hole.local_addr().unwrap();

    let mut client = Endpoint::bind("127.0.0.1:0", cfg).await.unwrap();
    let err = client.connect(target).await.unwrap_err();
    assert!(matches!(err, TautError::HandshakeFailed { attempts: 3 }));
    assert_eq!(client.state(), State::Closed);
}

#[tokio::test]
async fn small_sequence_space_wraps_in_flight() {
    let mut cfg_client = fast(21);
    let mut cfg_server = fast(22);
    cfg_client.seq_space = 256;
    cfg_server.seq_space = 256;
    let (mut client, mut server) = pair(cfg_client, cfg_server).await;

    let payload = vec![0x2Au8; 20480]; // 21 segments in a 256-wide space
    let (sent, received) = tokio::join!(client.send(&payload), collect(&mut server, 20480));
    sent.unwrap();
    assert_eq!(&received[..], &payload[..]);
}

#[tokio::test]
async fn payload_larger_than_the_sequence_space() {
    let mut cfg_client = fast(28);
    let mut cfg_server = fast(29);
    cfg_client.seq_space = 16;
    cfg_server.seq_space = 16;

    // 33 segments lap a 16-value sequence space twice over; the varied
    // byte pattern would expose any lost or reordered chunk.
    let payload: Vec<u8> = (0..33 * 1009).map(|i| (i % 251) as u8).collect();
    let (mut client, mut server) = pair(cfg_client, cfg_server).await;

    let (sent, received) = tokio::join!(client.send(&payload), collect(&mut server, payload.len()));
    sent.unwrap();
    assert_eq!(&received[..], &payload[..]);
}

#[tokio::test]
async fn recv_times_out_on_a_silent_peer() {
    let mut cfg = fast(23);
    cfg.timeout = Duration::from_millis(20);
    cfg.max_retries = 3;
    let (_client, mut server) = pair(cfg.clone(), cfg).await;

    let err = server.recv().await.unwrap_err();
    assert!(matches!(err, TautError::TimedOut));
    // A timeout is not a teardown.
    assert_eq!(server.state(), State::Established);
}
