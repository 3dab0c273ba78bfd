//! Client and server handlers on real channels, without the facade.

use std::sync::Arc;
use std::time::Duration;

use dtls_bridge::channel::{Bootstrap, Channel};
use dtls_bridge::handler::{ClientHandler, ServerHandler};
use dtls_bridge::role::{ClientRole, HandshakeRole, ServerRole};
use dtls_bridge::testing::LoopbackEngine;
use dtls_bridge::{CredentialResolver, Datagram, Error, Packet, ProtocolEngine};

use crate::common::*;

struct Pair {
    client: Channel,
    client_handler: Arc<ClientHandler>,
    server_handler: Arc<ServerHandler>,
    server_inbound: tokio::sync::mpsc::UnboundedReceiver<Datagram>,
}

fn pair(bootstrap: &Bootstrap, client_credentials: CredentialResolver) -> Pair {
    let config = config();
    let engine: Arc<dyn ProtocolEngine> = Arc::new(LoopbackEngine::default());

    let server = bootstrap.bind(loopback()).unwrap();
    let server_role = Arc::new(ServerRole::new(
        Arc::new(CredentialResolver::server()),
        heartbeat(),
    ));
    let server_handler = Arc::new(ServerHandler::new(server_role, engine.clone(), &config));
    server.install(server_handler.clone()).unwrap();
    let server_inbound = server.take_inbound().unwrap();
    server.activate().unwrap();

    let client = bootstrap.connect(server.local_addr()).unwrap();
    let client_role = Arc::new(ClientRole::new(
        server.local_addr(),
        Arc::new(client_credentials),
        heartbeat(),
    ));
    let client_handler = Arc::new(ClientHandler::new(client_role, engine, &config));
    client.install(client_handler.clone()).unwrap();

    Pair {
        client,
        client_handler,
        server_handler,
        server_inbound,
    }
}

#[test]
fn writes_before_handshake_arrive_in_order() {
    let _ = env_logger::try_init();

    let rt = runtime();
    let bootstrap = Bootstrap::new(config(), rt.handle().clone());
    let mut p = pair(&bootstrap, CredentialResolver::client());

    // Registered but not active yet, writes are refused.
    let early = rt.block_on(p.client.write(Packet::application(vec![0], loopback())));
    assert!(early.is_err());

    p.client.activate().unwrap();
    let remote = p.client.remote_addr().unwrap();
    let writes: Vec<_> = (1..=20u8)
        .map(|i| p.client.write(Packet::application(vec![i; i as usize], remote)))
        .collect();

    for w in writes {
        within(&rt, WAIT, w)
            .expect("write completes once the handshake is done")
            .expect("write succeeds");
    }
    assert!(p.client_handler.role().is_handshake_complete());
    assert!(p.client_handler.handshake().is_initialized());

    for i in 1..=20u8 {
        let d = within(&rt, WAIT, p.server_inbound.recv())
            .expect("datagram in time")
            .expect("channel open");
        assert_eq!(d.payload(), &vec![i; i as usize][..]);
        assert_eq!(d.sender().port(), p.client.local_addr().port());
    }
    assert!(p.server_handler.role().is_handshake_complete());
    assert!(p.server_handler.handshake().is_initialized());
}

#[test]
fn untrusted_client_chain_never_initializes_the_server() {
    let _ = env_logger::try_init();

    let foreign = std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("src/credentials/defaults/server_cert.pem");
    let credentials = CredentialResolver::client();
    credentials.set_root_path(Some(foreign.clone()));
    credentials.set_peer_path(Some(foreign));

    let rt = runtime();
    let bootstrap = Bootstrap::new(config(), rt.handle().clone());
    let mut p = pair(&bootstrap, credentials);
    p.client.activate().unwrap();

    let remote = p.client.remote_addr().unwrap();
    let write = p.client.write(Packet::application(vec![1, 2, 3], remote));

    // The handshake fails well within this; nothing is ever published.
    std::thread::sleep(Duration::from_secs(3));
    assert!(!p.server_handler.handshake().is_initialized());
    assert!(!p.server_handler.role().is_handshake_complete());
    assert!(!p.client_handler.handshake().is_initialized());

    let nothing = within(&rt, Duration::from_millis(200), p.server_inbound.recv());
    assert!(nothing.is_err());

    // Tearing down fails the parked write.
    rt.block_on(p.client.close()).unwrap();
    let result = within(&rt, Duration::from_secs(5), write);
    assert!(matches!(result, Ok(Err(Error::Closed))));
}
