//! Shared helpers for adapter integration tests.

#![allow(unused)]

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dtls_bridge::channel::{Bootstrap, Channel};
use dtls_bridge::types::Heartbeat;
use dtls_bridge::Config;

/// Generous bound for anything involving a handshake.
pub const WAIT: Duration = Duration::from_secs(30);

pub fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .enable_all()
        .build()
        .expect("runtime")
}

pub fn config() -> Arc<Config> {
    Arc::new(Config::default())
}

pub fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

pub fn heartbeat() -> Heartbeat {
    Heartbeat::symmetric(Duration::from_secs(10))
}

/// A bound, active channel without a handler, and its inbound receiver.
pub fn plain_peer(
    bootstrap: &Bootstrap,
) -> (Channel, tokio::sync::mpsc::UnboundedReceiver<dtls_bridge::Datagram>) {
    let peer = bootstrap.bind(loopback()).expect("bind peer");
    let inbound = peer.take_inbound().expect("inbound");
    peer.activate().expect("activate peer");
    (peer, inbound)
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

/// Drive `fut` on `rt` for at most `limit`.
///
/// The timer is created inside the runtime.
pub fn within<F: Future>(
    rt: &tokio::runtime::Runtime,
    limit: Duration,
    fut: F,
) -> Result<F::Output, tokio::time::error::Elapsed> {
    rt.block_on(async move { tokio::time::timeout(limit, fut).await })
}
