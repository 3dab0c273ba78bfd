// Server flow:
//
// 1. Bind a channel at the configured local address and install the server
//    handler. The handshake starts right away and waits in accept.
// 2. The first client hello arrives; the bridge follows the sender of every
//    datagram, so replies go to whoever spoke last.
// 3. Client certificates must share a certificate with the trusted root.
// 4. Once the handle is published, inbound records are decrypted on the
//    blocking pool and delivered through recv_timeout.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::runtime::{Handle, Runtime};
use tokio::sync::mpsc::UnboundedReceiver;

use crate::channel::{event_loop, Bootstrap, Channel};
use crate::credentials::CredentialResolver;
use crate::engine::ProtocolEngine;
use crate::handler::ServerHandler;
use crate::packet::{Datagram, Packet};
use crate::role::{HandshakeRole, ServerRole};
use crate::{Config, Error};

/// DTLS server for a single peer.
///
/// Blocking methods must not be called from within an async context.
pub struct DtlsServer {
    runtime: Mutex<Option<Runtime>>,
    handle: Handle,
    channel: Channel,
    handler: Arc<ServerHandler>,
    credentials: Arc<CredentialResolver>,
    inbound: Mutex<UnboundedReceiver<Datagram>>,
    closed: AtomicBool,
}

impl DtlsServer {
    /// Bind with the built-in server credentials.
    pub fn bind(config: Config, engine: Arc<dyn ProtocolEngine>) -> Result<Self, Error> {
        Self::bind_with_credentials(config, engine, Arc::new(CredentialResolver::server()))
    }

    pub fn bind_with_credentials(
        config: Config,
        engine: Arc<dyn ProtocolEngine>,
        credentials: Arc<CredentialResolver>,
    ) -> Result<Self, Error> {
        let config = Arc::new(config);
        let runtime = event_loop(&config)?;
        let handle = runtime.handle().clone();

        let bootstrap = Bootstrap::new(config.clone(), handle.clone());
        let channel = bootstrap.bind(config.local_addr())?;

        let role = Arc::new(ServerRole::new(credentials.clone(), config.heartbeat()));
        let handler = Arc::new(ServerHandler::new(role, engine, &config));
        channel.install(handler.clone())?;
        let inbound = channel.take_inbound().ok_or(Error::Closed)?;
        channel.activate()?;

        info!("Server listening on {}", channel.local_addr());
        Ok(DtlsServer {
            runtime: Mutex::new(Some(runtime)),
            handle,
            channel,
            handler,
            credentials,
            inbound: Mutex::new(inbound),
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.channel.local_addr()
    }

    /// Where credential overrides for the handshake are set.
    pub fn credentials(&self) -> &Arc<CredentialResolver> {
        &self.credentials
    }

    /// The peer replies go to, once someone has spoken.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.handler.bridge().remote_address()
    }

    /// Wait up to `timeout` for the next decrypted datagram.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Datagram> {
        if self.is_closed() {
            return None;
        }
        let mut inbound = self.inbound.lock();
        let datagram = self
            .handle
            .block_on(async { tokio::time::timeout(timeout, inbound.recv()).await })
            .ok()
            .flatten()?;
        debug!(
            "Server received datagram of {} bytes from {}",
            datagram.payload().len(),
            datagram.sender()
        );
        Some(datagram)
    }

    /// Send `payload` to the current peer and wait until it left the socket.
    ///
    /// Before the handshake completes this waits for it.
    pub fn send(&self, payload: &[u8]) -> Result<(), Error> {
        if self.is_closed() {
            return Err(Error::Closed);
        }
        let remote = self.peer_addr().ok_or(Error::NotConnected)?;
        let packet = Packet::application(payload.to_vec(), remote);
        self.handle.block_on(self.channel.write(packet))
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handler.role().is_handshake_complete()
    }

    /// Whether the handshake published its handle.
    pub fn is_initialized(&self) -> bool {
        self.handler.handshake().is_initialized()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the channel and stop the event loop. Only the first call has an effect.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.handle.block_on(self.channel.close()) {
            warn!("Closing {} failed: {}", self.channel.id(), e);
        }
        if let Some(runtime) = self.runtime.lock().take() {
            runtime.shutdown_background();
        }
        info!("Server on {} closed", self.channel.local_addr());
    }
}

impl fmt::Debug for DtlsServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DtlsServer")
            .field("local", &self.local_addr())
            .field("peer", &self.peer_addr())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for DtlsServer {
    fn drop(&mut self) {
        self.close();
    }
}
