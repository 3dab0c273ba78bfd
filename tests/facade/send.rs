//! Sending through the client facade to a server.

use std::time::Duration;

use dtls_bridge::Error;

use crate::common::*;

#[test]
fn hex_payload_arrives_once() {
    let _ = env_logger::try_init();

    let server = server();
    let client = client(&server);

    client.send("cafebabe").unwrap();
    let d = recv(&server);
    assert_eq!(d.payload(), &[0xCA, 0xFE, 0xBA, 0xBE]);
    assert!(client.is_handshake_complete());
    assert!(server.is_handshake_complete());

    // Exactly once.
    assert!(server.recv_timeout(Duration::from_millis(500)).is_none());

    client.close();
    server.close();
}

#[test]
fn queued_sends_arrive_in_order() {
    let _ = env_logger::try_init();

    let server = server();
    let client = client(&server);

    // All of these go out before any handshake can have finished.
    for data in ["01", "02", "03", "hello"] {
        client.send(data).unwrap();
    }

    let received: Vec<Vec<u8>> = (0..4).map(|_| recv(&server).payload().to_vec()).collect();
    assert_eq!(
        received,
        vec![vec![0x01], vec![0x02], vec![0x03], b"hello".to_vec()]
    );
    assert!(wait_until(Duration::from_secs(1), || client.queued() == 0));

    client.close();
    server.close();
}

#[test]
fn server_replies_to_the_client() {
    let _ = env_logger::try_init();

    let server = server();
    let client = client(&server);
    assert!(matches!(server.send(b"early"), Err(Error::NotConnected)));

    client.send("ping").unwrap();
    let d = recv(&server);
    assert_eq!(d.payload(), b"ping");
    assert_eq!(server.peer_addr().map(|a| a.port()), Some(d.sender().port()));

    server.send(b"pong").unwrap();
    let reply = client.recv_timeout(WAIT).expect("reply in time");
    assert_eq!(reply.payload(), b"pong");
    assert_eq!(reply.sender(), server.local_addr());
    assert!(client.recv_timeout(Duration::from_millis(300)).is_none());

    client.close();
    server.close();
}

#[test]
fn release_after_exchange() {
    let _ = env_logger::try_init();

    let server = server();
    let client = client(&server);

    client.send("01").unwrap();
    recv(&server);
    assert!(client.is_handshake_complete());

    client.release().unwrap();
    assert!(!client.is_handshake_complete());
    // Torn down channels are not kept for reuse.
    assert_eq!(client.idle_channels(), 0);
    // Nothing held any more.
    client.release().unwrap();

    client.close();
    server.close();
}

#[test]
fn send_after_release_acquires_again() {
    let _ = env_logger::try_init();

    let first = server();
    let addr = first.local_addr();
    let client = client(&first);

    client.send("01").unwrap();
    assert_eq!(recv(&first).payload(), &[0x01]);
    let old_port = first.peer_addr().map(|a| a.port());
    client.release().unwrap();

    // The server serves one peer, so the new channel needs a fresh one.
    first.close();
    let second = server_at(addr);

    client.send("02").unwrap();
    let d = recv(&second);
    assert_eq!(d.payload(), &[0x02]);
    assert_ne!(Some(d.sender().port()), old_port);
    assert!(client.is_handshake_complete());
    assert_eq!(client.queued(), 0);

    client.close();
    second.close();
}

#[test]
fn closed_client_refuses_sends() {
    let _ = env_logger::try_init();

    let server = server();
    let client = client(&server);

    client.close();
    client.close();
    assert!(client.is_closed());
    assert!(matches!(client.send("01"), Err(Error::Closed)));

    server.close();
    assert!(matches!(server.send(b"x"), Err(Error::Closed)));
    assert!(server.recv_timeout(Duration::from_millis(10)).is_none());
}
