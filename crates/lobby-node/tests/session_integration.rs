//! Integration tests for the host → join → session lifecycle.
//!
//! # Purpose
//!
//! These tests drive two [`LobbyService`] instances in one process over
//! loopback, the way a game would drive one on each machine.  They verify:
//!
//! - The full scenario: host advertises, the other node lists the lobby,
//!   joins it, the host's next `update()` promotes the connection, the
//!   advertisement flips to `in_game` and broadcasting stops.
//! - Latest-value semantics: several records sent before a `receive()`
//!   collapse to the newest one.
//! - Termination: a peer closing its side flips `is_connected` and makes
//!   `send` return `false`.
//! - Robustness: a malformed frame in the middle of the stream is dropped
//!   without ending the session.
//! - Backpressure: against a peer that stops reading, `send` drops frames
//!   instead of blocking, the session stays up, and the byte stream the
//!   peer eventually reads holds exactly the records `send` accepted.
//!
//! # Loopback wiring
//!
//! ```text
//! guest registry  bound on 127.0.0.1:<ephemeral D>
//! host config     broadcast_address = 127.0.0.1, discovery_port = D
//! host listener   bound on 127.0.0.1:<ephemeral S>, advertised as port S
//! ```

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Duration;

use lobby_core::{decode_stream, encode, LobbyFilter, LobbyStatus, SessionRole};
use lobby_node::application::LobbyService;
use lobby_node::infrastructure::network::session::{SessionChannel, SessionListener};
use lobby_node::infrastructure::storage::config::NodeConfig;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Snapshot {
    x: i64,
}

fn loopback_config(discovery_port: u16) -> NodeConfig {
    let mut cfg = NodeConfig::default();
    cfg.network.bind_address = "127.0.0.1".to_string();
    cfg.network.broadcast_address = "127.0.0.1".to_string();
    cfg.network.discovery_port = discovery_port;
    cfg.timing.beacon_interval_ms = 30;
    cfg.timing.connect_timeout_ms = 2000;
    cfg
}

/// Retries `f` every 10 ms for about 2 s.
async fn eventually<F: FnMut() -> bool>(mut f: F) -> bool {
    for _ in 0..200 {
        if f() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Host and guest services with a connected session between them.
async fn connected_pair() -> (LobbyService, LobbyService) {
    let mut host = LobbyService::new(loopback_config(9));
    let addr = host.try_host(0, Vec::<(String, Value)>::new()).expect("host");
    let mut guest = LobbyService::new(loopback_config(9));
    assert!(guest.join(addr.ip(), addr.port()).await, "join");
    assert!(
        eventually(|| {
            host.update();
            host.is_connected()
        })
        .await,
        "host must accept"
    );
    (host, guest)
}

// ── Full scenario ─────────────────────────────────────────────────────────────

/// Host → discover → join → promote, end to end.
#[tokio::test]
async fn test_host_discover_join_promote() {
    // Arrange: guest starts discovery first so we know its port
    let mut guest = LobbyService::new(loopback_config(0));
    guest.start_discovery().expect("guest discovery");
    let discovery_port = guest.discovery_addr().unwrap().port();

    let mut host = LobbyService::new(loopback_config(discovery_port));
    assert!(host.host(0, [("name", json!("den")), ("players", json!(1))]));
    assert!(host.is_host());
    assert!(!host.is_connected());

    // Act 1: guest sees exactly one open lobby
    let found = eventually(|| {
        guest.update();
        guest.get_lobbies(&LobbyFilter::new()).len() == 1
    })
    .await;
    assert!(found, "lobby must be discovered");
    let (addr, ad) = guest
        .get_lobbies(&LobbyFilter::new().with("status", "open"))
        .pop()
        .expect("open lobby");
    assert_eq!(ad.get_field("name"), Some(json!("den")));
    assert_eq!(ad.players, 1);

    // Act 2: join and let the host promote on its next update
    assert!(guest.join(addr.ip(), ad.port).await);
    let promoted = eventually(|| {
        host.update();
        host.is_connected()
    })
    .await;

    // Assert
    assert!(promoted);
    assert!(guest.is_connected());
    assert!(host.is_host());
    assert!(!guest.is_host());

    let hosted = host.hosted_advertisement().expect("hosted ad");
    assert_eq!(hosted.status, LobbyStatus::InGame);
    assert_eq!(hosted.players, 2);
    assert!(!host.is_advertising(), "beacon stops once a peer joins");

    // A second joiner is never accepted.
    let mut late = LobbyService::new(loopback_config(9));
    assert!(!late.join(addr.ip(), ad.port).await);
}

/// Once the host stops advertising, the lobby ages out of the guest's list.
#[tokio::test]
async fn test_joined_lobby_leaves_listing() {
    // Arrange
    let mut guest_cfg = loopback_config(0);
    guest_cfg.timing.lobby_timeout_ms = 200;
    let mut guest = LobbyService::new(guest_cfg);
    guest.start_discovery().unwrap();
    let port = guest.discovery_addr().unwrap().port();

    let mut host = LobbyService::new(loopback_config(port));
    let session_addr = host.try_host(0, Vec::<(String, Value)>::new()).unwrap();
    assert!(
        eventually(|| {
            guest.update();
            !guest.get_lobbies(&LobbyFilter::new()).is_empty()
        })
        .await
    );

    // Act
    assert!(guest.join(session_addr.ip(), session_addr.port()).await);
    assert!(
        eventually(|| {
            host.update();
            host.is_connected()
        })
        .await
    );

    // Assert
    let gone = eventually(|| {
        guest.update();
        guest.get_lobbies(&LobbyFilter::new()).is_empty()
    })
    .await;
    assert!(gone, "silent lobby must be evicted");
}

// ── Record exchange ───────────────────────────────────────────────────────────

/// Records flow both ways and decode into typed values.
#[tokio::test]
async fn test_records_flow_both_ways() {
    // Arrange
    let (host, guest) = connected_pair().await;

    // Act
    assert!(host.send(&Snapshot { x: 1 }));
    assert!(guest.send(&json!({"x": 7})));

    // Assert
    let mut at_guest = None;
    assert!(eventually(|| {
        at_guest = guest.receive_as::<Snapshot>();
        at_guest.is_some()
    })
    .await);
    assert_eq!(at_guest, Some(Snapshot { x: 1 }));

    let mut at_host = None;
    assert!(eventually(|| {
        at_host = host.receive();
        at_host.is_some()
    })
    .await);
    assert_eq!(at_host, Some(json!({"x": 7})));
}

/// Two sends before one receive: only the newer record is delivered.
#[tokio::test]
async fn test_receive_returns_only_latest_record() {
    // Arrange
    let (host, guest) = connected_pair().await;

    // Act
    assert!(host.send(&json!({"x": 1})));
    assert!(host.send(&json!({"x": 2})));
    // Both frames are on loopback well before this sleep ends.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Assert
    assert_eq!(guest.receive(), Some(json!({"x": 2})));
    assert_eq!(guest.receive(), None, "at most one pending record");
}

// ── Termination ───────────────────────────────────────────────────────────────

/// The guest stops; the host observes EOF and its sends start failing.
#[tokio::test]
async fn test_peer_close_disconnects_and_send_returns_false() {
    // Arrange
    let (mut host, mut guest) = connected_pair().await;

    // Act
    guest.stop();

    // Assert
    assert!(!guest.is_connected());
    assert!(!guest.send(&json!({"x": 1})));
    let dropped = eventually(|| {
        host.update();
        !host.is_connected()
    })
    .await;
    assert!(dropped, "host must see the peer leave");
    assert!(!host.send(&json!({"x": 1})));
    assert!(host.receive().is_none());

    // A lost session is terminal but the node may host again.
    assert!(host.host(0, Vec::<(String, Value)>::new()));
}

// ── Raw-socket peers ──────────────────────────────────────────────────────────

/// A malformed segment between two valid frames is dropped; the session
/// survives and still delivers the valid record that follows.
#[tokio::test]
async fn test_malformed_frame_does_not_end_session() {
    // Arrange: the host side is a SessionChannel, the peer a raw TCP stream
    let listener = SessionListener::bind("127.0.0.1:0".parse().unwrap()).unwrap();
    let mut raw = TcpStream::connect(listener.local_addr()).unwrap();
    let mut channel = None;
    assert!(eventually(|| {
        channel = listener.try_accept().unwrap();
        channel.is_some()
    })
    .await);
    let channel = channel.unwrap();
    assert_eq!(channel.role(), SessionRole::Host);

    // Act
    raw.write_all(b"{\"x\":1}\n{oops\n{\"x\":3}\n").unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Assert
    assert_eq!(channel.receive(), Some(json!({"x": 3})));
    assert!(channel.is_connected());
}

/// A record split across two TCP writes is reassembled.
#[tokio::test]
async fn test_split_frame_is_reassembled() {
    // Arrange
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let client = SessionChannel::connect(addr, Duration::from_secs(2)).await.unwrap();
    let (mut raw, _) = listener.accept().unwrap();
    raw.set_nodelay(true).unwrap();

    // Act
    raw.write_all(b"{\"x\":").unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    let early = client.receive();
    raw.write_all(b"42}\n").unwrap();

    // Assert
    assert_eq!(early, None, "half a frame is not a record");
    let mut got = None;
    assert!(eventually(|| {
        got = client.receive();
        got.is_some()
    })
    .await);
    assert_eq!(got, Some(json!({"x": 42})));
    assert_eq!(client.role(), SessionRole::Client);
}

/// Dropping the raw peer's socket is seen as EOF by the channel.
#[tokio::test]
async fn test_raw_peer_drop_clears_connected_flag() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = SessionChannel::connect(listener.local_addr().unwrap(), Duration::from_secs(2))
        .await
        .unwrap();
    let (raw, _) = listener.accept().unwrap();
    assert!(client.is_connected());

    drop(raw);

    assert!(eventually(|| !client.is_connected()).await);
    assert!(!client.send(&json!({"x": 1})));
}

/// A peer that does not read fills both socket buffers.  `send` then
/// returns `false` without blocking and without ending the session.  Once
/// the peer drains, the stream holds every accepted record in order, at most
/// one discarded fragment, and the record sent after the stall.
#[tokio::test]
async fn test_full_send_buffer_drops_frames_and_stream_resyncs() {
    // Arrange: a raw peer that accepts and then does not read
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let client = SessionChannel::connect(listener.local_addr().unwrap(), Duration::from_secs(2))
        .await
        .unwrap();
    let (mut raw, _) = listener.accept().unwrap();
    let pad = "x".repeat(3000);

    // Act 1: send ~3 KB records until the first one is refused
    let mut accepted = Vec::new();
    let mut refused = false;
    for seq in 0..20_000u64 {
        if client.send(&json!({ "seq": seq, "pad": pad })) {
            accepted.push(seq);
        } else {
            refused = true;
            break;
        }
    }

    // Assert 1
    assert!(refused, "a stalled peer must eventually fill the send buffer");
    assert!(!accepted.is_empty());
    assert!(client.is_connected(), "a full buffer is not a disconnect");

    // Act 2: drain the peer, then send one more record
    let last = json!({"final": true});
    let last_frame = encode(&last).unwrap();
    let drain = tokio::task::spawn_blocking(move || {
        raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let mut wire = Vec::new();
        let mut chunk = vec![0u8; 64 * 1024];
        while !wire.ends_with(&last_frame) {
            match raw.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => wire.extend_from_slice(&chunk[..n]),
            }
        }
        wire
    });
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(eventually(|| client.send(&last)).await, "send must recover once drained");
    let wire = drain.await.unwrap();

    // Assert 2
    let stream = decode_stream::<Value>(&wire);
    let dropped = stream.records.iter().filter(|r| r.is_err()).count();
    let records: Vec<Value> = stream.records.into_iter().filter_map(Result::ok).collect();
    let seqs: Vec<u64> = records
        .iter()
        .filter_map(|r| r.get("seq").and_then(Value::as_u64))
        .collect();

    assert!(dropped <= 1, "only the torn frame may be discarded, got {dropped}");
    assert_eq!(seqs, accepted, "every accepted record arrives once, in order");
    assert_eq!(records.len(), accepted.len() + 1);
    assert_eq!(records.last(), Some(&last));
    assert!(stream.remainder.is_empty());
    assert!(client.is_connected());
}
