//! Shared helpers for client/server facade tests.

#![allow(unused)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dtls_bridge::testing::LoopbackEngine;
use dtls_bridge::{Config, Datagram, DtlsClient, DtlsServer, ProtocolEngine};

/// Generous bound for anything involving a handshake.
pub const WAIT: Duration = Duration::from_secs(30);

pub fn engine() -> Arc<dyn ProtocolEngine> {
    Arc::new(LoopbackEngine::default())
}

pub fn server() -> DtlsServer {
    server_at("127.0.0.1:0".parse().unwrap())
}

pub fn server_at(local: SocketAddr) -> DtlsServer {
    let config = Config::builder()
        .local_addr(local)
        .build()
        .expect("server config");
    DtlsServer::bind(config, engine()).expect("bind server")
}

pub fn client_config(server: &DtlsServer) -> Config {
    Config::builder()
        .remote_addr(server.local_addr())
        .local_addr("127.0.0.1:0".parse().unwrap())
        .idle_flush_interval(Duration::from_millis(200))
        .build()
        .expect("client config")
}

pub fn client(server: &DtlsServer) -> DtlsClient {
    DtlsClient::open(client_config(server), engine()).expect("open client")
}

pub fn recv(server: &DtlsServer) -> Datagram {
    server.recv_timeout(WAIT).expect("datagram in time")
}

pub fn wait_until(timeout: Duration, mut f: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if f() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    f()
}
