//! Datagram ingest and fan-out, exercised against the real pipeline with
//! loopback UDP sockets standing in for clients.

use std::net::SocketAddr;
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};

use slipstream_server::events::{NullEventSink, SecurityEventKind};
use slipstream_server::protocol::{RoomId, ServerReply, SessionId};
use slipstream_server::security::DatagramCipher;
use slipstream_server::server::{RaceServer, ServerConfig};

fn test_server() -> Arc<RaceServer> {
    RaceServer::new(ServerConfig::default(), Arc::new(NullEventSink))
}

async fn connect(server: &RaceServer) -> SessionId {
    let (sender, _inbox) = mpsc::channel(64);
    let addr: SocketAddr = "127.0.0.1:50000".parse().unwrap();
    server.register_session(sender, addr).await
}

async fn authenticate(server: &RaceServer, id: &SessionId, name: &str) {
    let line = json!({"command": "NAME", "name": name, "password": "pw"}).to_string();
    let outcome = server.handle_line(id, &line).await;
    assert!(
        matches!(
            outcome.reply,
            Some(ServerReply::NameOk { authenticated: true, .. })
        ),
        "authentication failed for {name}"
    );
}

/// Two authenticated sessions sharing a room.
async fn room_with_two_players(server: &RaceServer) -> (SessionId, SessionId, RoomId) {
    let alice = connect(server).await;
    let bob = connect(server).await;
    authenticate(server, &alice, "alice").await;
    authenticate(server, &bob, "bob").await;

    let create = json!({"command": "CREATE_ROOM", "name": "r1"}).to_string();
    let room_id = match server.handle_line(&alice, &create).await.reply {
        Some(ServerReply::RoomCreated { room_id, .. }) => room_id,
        other => panic!("room creation failed: {other:?}"),
    };
    let join = json!({"command": "JOIN_ROOM", "roomId": room_id}).to_string();
    assert!(matches!(
        server.handle_line(&bob, &join).await.reply,
        Some(ServerReply::JoinOk { .. })
    ));
    (alice, bob, room_id)
}

fn update_payload(session: &SessionId, x: f32, y: f32, z: f32) -> Value {
    json!({
        "command": "UPDATE",
        "sessionId": session.as_str(),
        "position": {"x": x, "y": y, "z": z},
        "rotation": {"x": 0.0, "y": 0.0, "z": 0.0, "w": 1.0},
    })
}

#[tokio::test]
async fn encrypted_update_is_re_encrypted_per_recipient() {
    let server = test_server();
    let (alice, bob, _room) = room_with_two_players(&server).await;

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let alice_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let alice_cipher = DatagramCipher::for_session(&alice);
    let bob_cipher = DatagramCipher::for_session(&bob);

    // Bob's endpoint is learned from his first datagram.
    let hello = bob_cipher.encrypt_value(&update_payload(&bob, 0.0, 0.0, 0.0));
    server
        .handle_datagram(&relay, &hello, bob_sock.local_addr().unwrap())
        .await;

    // Alice reports a new position; bob must receive it under his own key.
    let payload = update_payload(&alice, 10.0, 0.0, 5.0);
    let packet = alice_cipher.encrypt_value(&payload);
    server
        .handle_datagram(&relay, &packet, alice_sock.local_addr().unwrap())
        .await;

    let mut buf = [0u8; 2048];
    let (len, from) = timeout(Duration::from_secs(1), bob_sock.recv_from(&mut buf))
        .await
        .expect("no fan-out within 1s")
        .unwrap();
    assert_eq!(from, relay.local_addr().unwrap());

    let received = bob_cipher
        .decrypt_value(&buf[..len])
        .expect("fan-out must decrypt under the recipient cipher");
    assert_eq!(received, payload);

    // The sender must not hear its own update back.
    let echo = timeout(Duration::from_millis(200), alice_sock.recv_from(&mut buf)).await;
    assert!(echo.is_err(), "sender received its own update");
}

#[tokio::test]
async fn legacy_plaintext_update_still_fans_out() {
    let server = test_server();
    let (alice, bob, _room) = room_with_two_players(&server).await;

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let alice_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let bob_cipher = DatagramCipher::for_session(&bob);
    let hello = bob_cipher.encrypt_value(&update_payload(&bob, 0.0, 0.0, 0.0));
    server
        .handle_datagram(&relay, &hello, bob_sock.local_addr().unwrap())
        .await;

    // Plaintext path: raw JSON with a trailing LF.
    let payload = update_payload(&alice, 3.0, 0.0, 1.0);
    let mut wire = payload.to_string().into_bytes();
    wire.push(b'\n');
    server
        .handle_datagram(&relay, &wire, alice_sock.local_addr().unwrap())
        .await;

    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(1), bob_sock.recv_from(&mut buf))
        .await
        .expect("no fan-out within 1s")
        .unwrap();
    // Bob is authenticated, so even a plaintext ingest is re-encrypted.
    assert_eq!(bob_cipher.decrypt_value(&buf[..len]).unwrap(), payload);
}

#[tokio::test]
async fn input_packets_fan_out_to_room() {
    let server = test_server();
    let (alice, bob, room_id) = room_with_two_players(&server).await;

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let alice_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let bob_sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();

    let alice_cipher = DatagramCipher::for_session(&alice);
    let bob_cipher = DatagramCipher::for_session(&bob);

    let hello = bob_cipher.encrypt_value(&update_payload(&bob, 0.0, 0.0, 0.0));
    server
        .handle_datagram(&relay, &hello, bob_sock.local_addr().unwrap())
        .await;

    let payload = json!({
        "command": "INPUT",
        "sessionId": alice.as_str(),
        "roomId": room_id,
        "input": {"steering": -0.25, "throttle": 1.0, "brake": 0.0},
        "client_id": 7,
    });
    let packet = alice_cipher.encrypt_value(&payload);
    server
        .handle_datagram(&relay, &packet, alice_sock.local_addr().unwrap())
        .await;

    let mut buf = [0u8; 2048];
    let (len, _) = timeout(Duration::from_secs(1), bob_sock.recv_from(&mut buf))
        .await
        .expect("no fan-out within 1s")
        .unwrap();
    assert_eq!(bob_cipher.decrypt_value(&buf[..len]).unwrap(), payload);
}

#[tokio::test(start_paused = true)]
async fn teleport_is_rejected_and_recorded() {
    let server = test_server();
    let (alice, _bob, _room) = room_with_two_players(&server).await;

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer: SocketAddr = "127.0.0.1:40001".parse().unwrap();
    let cipher = DatagramCipher::for_session(&alice);

    let first = cipher.encrypt_value(&update_payload(&alice, 0.0, 0.0, 0.0));
    server.handle_datagram(&relay, &first, peer).await;

    tokio::time::advance(Duration::from_millis(100)).await;

    // 100 units in 100 ms exceeds max(200 * 0.1, 50) = 50.
    let second = cipher.encrypt_value(&update_payload(&alice, 100.0, 0.0, 0.0));
    server.handle_datagram(&relay, &second, peer).await;

    let events = server.security().recent_events();
    assert!(
        events
            .iter()
            .any(|e| e.kind == SecurityEventKind::PhysicsViolation && e.client_id == alice),
        "physics violation not recorded: {events:?}"
    );
    assert_eq!(server.security().threat_level(&alice), 1);
    // One violation is not enough to kick.
    assert!(server.is_connected(&alice));
}

#[tokio::test]
async fn spoofed_session_id_is_rejected() {
    let server = test_server();
    let (alice, bob, _room) = room_with_two_players(&server).await;

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer: SocketAddr = "127.0.0.1:40002".parse().unwrap();

    // Encrypted under alice's key but claiming to be bob.
    let cipher = DatagramCipher::for_session(&alice);
    let packet = cipher.encrypt_value(&update_payload(&bob, 0.0, 0.0, 0.0));
    server.handle_datagram(&relay, &packet, peer).await;

    let events = server.security().recent_events();
    assert!(
        events
            .iter()
            .any(|e| e.kind == SecurityEventKind::SessionSpoof && e.client_id == alice),
        "spoof not recorded: {events:?}"
    );
}

#[tokio::test]
async fn repeated_violations_kick_the_session() {
    let server = test_server();
    let (alice, _bob, _room) = room_with_two_players(&server).await;

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer: SocketAddr = "127.0.0.1:40003".parse().unwrap();
    let cipher = DatagramCipher::for_session(&alice);

    // Unknown datagram command fails structural validation each time.
    let bogus = json!({"command": "WARP", "sessionId": alice.as_str()});
    for _ in 0..3 {
        let packet = cipher.encrypt_value(&bogus);
        server.handle_datagram(&relay, &packet, peer).await;
    }

    assert!(!server.is_connected(&alice), "third violation must kick");
    assert!(server
        .security()
        .recent_events()
        .iter()
        .any(|e| e.kind == SecurityEventKind::PlayerKicked));
}

#[tokio::test]
async fn garbage_datagrams_are_dropped_silently() {
    let server = test_server();
    let (_alice, _bob, _room) = room_with_two_players(&server).await;

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer: SocketAddr = "127.0.0.1:40004".parse().unwrap();

    server.handle_datagram(&relay, b"\x01\x02\x03", peer).await;
    server.handle_datagram(&relay, b"not json", peer).await;
    // Unknown sender id on the plaintext path.
    server
        .handle_datagram(
            &relay,
            br#"{"command":"UPDATE","sessionId":"stranger"}"#,
            peer,
        )
        .await;

    // Nothing attributable happened: no events, nobody kicked.
    assert!(server.security().recent_events().is_empty());
}

#[tokio::test]
async fn recipients_without_endpoints_are_skipped() {
    let server = test_server();
    let (alice, _bob, _room) = room_with_two_players(&server).await;

    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let peer: SocketAddr = "127.0.0.1:40005".parse().unwrap();
    let cipher = DatagramCipher::for_session(&alice);

    // Bob never sent a datagram, so he has no endpoint; this must not error.
    let packet = cipher.encrypt_value(&update_payload(&alice, 1.0, 0.0, 0.0));
    server.handle_datagram(&relay, &packet, peer).await;
    assert!(server.is_connected(&alice));
}
