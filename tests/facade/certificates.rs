//! Certificate failures seen through the facades.

use std::path::Path;
use std::time::Duration;

use crate::common::*;

#[test]
fn client_chain_outside_the_trusted_root_is_refused() {
    let _ = env_logger::try_init();

    let server = server();
    let client = client(&server);

    // Self-contained chain that shares nothing with the server's root.
    let foreign = Path::new(env!("CARGO_MANIFEST_DIR")).join("src/credentials/defaults/server_cert.pem");
    client.credentials().set_root_path(Some(foreign.clone()));
    client.credentials().set_peer_path(Some(foreign));

    client.send("cafebabe").unwrap();

    assert!(server.recv_timeout(Duration::from_secs(3)).is_none());
    assert!(!server.is_initialized());
    assert!(!server.is_handshake_complete());
    assert!(!client.is_handshake_complete());
    assert!(client.queued() > 0);

    client.close();
    server.close();
}
