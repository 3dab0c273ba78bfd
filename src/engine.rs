//! Contract between this crate and a synchronous DTLS protocol engine.
//!
//! # Overview
//!
//! The record layer itself (handshake messages, record protection, replay
//! windows) is provided by an external engine with a blocking API. The engine
//! drives a handshake by calling [`ProtocolEngine::connect`] or
//! [`ProtocolEngine::accept`] with a [`DatagramTransport`] it can block on,
//! and returns another [`DatagramTransport`], the encrypted handle, once the
//! handshake is done.
//!
//! # Architecture
//!
//! - **Transport** ([`DatagramTransport`]): blocking send/receive with fixed size limits.
//!   Implemented by the raw datagram bridge, and by the handle the engine returns.
//! - **Engine** ([`ProtocolEngine`]): runs one handshake per call.
//! - **Peer roles** ([`PeerRole`], [`ClientPeer`], [`ServerPeer`]): the callbacks the
//!   engine invokes during a handshake to negotiate versions, obtain credentials and
//!   validate the peer's certificates.
//!
//! Errors returned from peer role callbacks are fatal to the handshake. An engine
//! raises [`Error::alert`] to the peer before giving up.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use crate::credentials::CertificateChain;
use crate::error::AlertDescription;
use crate::sign::Signer;
use crate::types::{ClientCertificateType, Heartbeat, HeartbeatMode};
use crate::types::{ProtocolVersion, RenegotiationPolicy, SignatureAndHashAlgorithm};
use crate::Error;

/// Blocking datagram transport with fixed size limits.
pub trait DatagramTransport: Send + Sync + Debug {
    /// Send one record. Fails with [`Error::OversizedRecord`] above [`send_limit`].
    ///
    /// [`send_limit`]: DatagramTransport::send_limit
    fn send(&self, buf: &[u8]) -> Result<(), Error>;

    /// Wait at most `wait` for one datagram, copying it into `buf`.
    ///
    /// Returns `Ok(None)` when nothing arrived in time.
    fn receive(&self, buf: &mut [u8], wait: Duration) -> Result<Option<usize>, Error>;

    /// Largest record `send` accepts.
    fn send_limit(&self) -> usize;

    /// Largest datagram `receive` can deliver.
    fn receive_limit(&self) -> usize;

    /// Release the transport. Blocked receivers return.
    fn close(&self);
}

/// A synchronous DTLS implementation.
pub trait ProtocolEngine: Send + Sync + Debug {
    /// Run a client handshake over `transport`, blocking until it completes.
    fn connect(
        &self,
        client: &dyn ClientPeer,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Arc<dyn DatagramTransport>, Error>;

    /// Run a server handshake over `transport`, blocking until it completes.
    fn accept(
        &self,
        server: &dyn ServerPeer,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Arc<dyn DatagramTransport>, Error>;
}

/// Callbacks common to both ends of a handshake.
pub trait PeerRole: Send + Sync + Debug {
    /// Versions offered, newest first.
    fn supported_versions(&self) -> &[ProtocolVersion];

    fn heartbeat_mode(&self) -> HeartbeatMode;

    fn heartbeat(&self) -> Option<Heartbeat>;

    fn renegotiation_policy(&self) -> RenegotiationPolicy;

    fn notify_handshake_beginning(&self) {}

    fn notify_handshake_complete(&self) {}

    /// This side is about to send a fatal alert.
    fn notify_alert_raised(&self, alert: AlertDescription, cause: &Error) {
        warn!("Raising alert {}: {}", alert, cause);
    }

    /// The peer sent an alert.
    fn notify_alert_received(&self, alert: AlertDescription) {
        warn!("Received alert {}", alert);
    }
}

/// Client side callbacks.
pub trait ClientPeer: PeerRole {
    /// Validate the server's certificate chain.
    fn notify_server_certificate(&self, chain: &CertificateChain) -> Result<(), Error>;

    /// Credentials to answer a certificate request with.
    ///
    /// `Ok(None)` means the client has nothing acceptable and continues without.
    fn client_credentials(&self, request: &CertificateRequest)
        -> Result<Option<Credentials>, Error>;
}

/// Server side callbacks.
pub trait ServerPeer: PeerRole {
    /// Validate the client's certificate chain.
    fn notify_client_certificate(&self, chain: &CertificateChain) -> Result<(), Error>;

    /// The certificate request to send to the client.
    fn certificate_request(&self) -> Result<CertificateRequest, Error>;

    /// The server's own credentials.
    ///
    /// `client_algorithms` is what the client advertised, if anything.
    fn credentials(
        &self,
        client_algorithms: Option<&[SignatureAndHashAlgorithm]>,
    ) -> Result<Credentials, Error>;
}

/// What a server asks of the client's certificate (RFC 5246 7.4.4).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRequest {
    pub certificate_types: Vec<ClientCertificateType>,
    /// `None` for DTLS 1.0 which does not carry the list.
    pub signature_algorithms: Option<Vec<SignatureAndHashAlgorithm>>,
    /// DER encoded distinguished names.
    pub certificate_authorities: Vec<Vec<u8>>,
}

/// A certificate chain and a signer for the matching private key.
#[derive(Debug, Clone)]
pub struct Credentials {
    pub chain: CertificateChain,
    pub signer: Signer,
}
