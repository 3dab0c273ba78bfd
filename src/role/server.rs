use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{choose_algorithm, HandshakeRole, RebindPolicy};
use crate::credentials::{check_signature_algorithms, share_common_certificate};
use crate::credentials::{CertificateChain, CredentialResolver};
use crate::engine::{CertificateRequest, Credentials, DatagramTransport, PeerRole};
use crate::engine::{ProtocolEngine, ServerPeer};
use crate::sign::Signer;
use crate::types::{ClientCertificateType, HandshakeState, Heartbeat, HeartbeatMode};
use crate::types::{ProtocolVersion, RenegotiationPolicy, SignatureAlgorithm};
use crate::types::SignatureAndHashAlgorithm;
use crate::Error;

/// The server end of a connection.
#[derive(Debug)]
pub struct ServerRole {
    credentials: Arc<CredentialResolver>,
    heartbeat: Heartbeat,
    state: Mutex<HandshakeState>,
}

impl ServerRole {
    pub fn new(credentials: Arc<CredentialResolver>, heartbeat: Heartbeat) -> Self {
        ServerRole {
            credentials,
            heartbeat,
            state: Mutex::new(HandshakeState::NotStarted),
        }
    }
}

impl PeerRole for ServerRole {
    fn supported_versions(&self) -> &[ProtocolVersion] {
        ProtocolVersion::supported()
    }

    fn heartbeat_mode(&self) -> HeartbeatMode {
        HeartbeatMode::PeerAllowedToSend
    }

    fn heartbeat(&self) -> Option<Heartbeat> {
        Some(self.heartbeat)
    }

    fn renegotiation_policy(&self) -> RenegotiationPolicy {
        RenegotiationPolicy::Accept
    }

    fn notify_handshake_beginning(&self) {
        *self.state.lock() = HandshakeState::InProgress;
        debug!("Server handshake beginning");
    }

    fn notify_handshake_complete(&self) {
        *self.state.lock() = HandshakeState::Complete;
        info!("Server handshake complete");
    }
}

impl ServerPeer for ServerRole {
    fn notify_client_certificate(&self, chain: &CertificateChain) -> Result<(), Error> {
        if chain.is_empty() {
            return Err(Error::BadCertificate("client sent no certificate".into()));
        }
        trace!("Client certificates: {:?}", chain.fingerprints());

        let trusted = self.credentials.resolve_root()?;
        if !share_common_certificate(chain, &trusted) {
            return Err(Error::BadCertificate(
                "no certificate in common with the trusted root".into(),
            ));
        }
        check_signature_algorithms(chain, SignatureAndHashAlgorithm::rsa_descending())
    }

    fn certificate_request(&self) -> Result<CertificateRequest, Error> {
        let root = self.credentials.resolve_root()?;
        if root.is_empty() {
            return Err(Error::NoCertificateAvailable);
        }

        Ok(CertificateRequest {
            certificate_types: vec![ClientCertificateType::RSA_SIGN],
            signature_algorithms: Some(SignatureAndHashAlgorithm::rsa_descending().to_vec()),
            certificate_authorities: vec![root.subject(0)?],
        })
    }

    fn credentials(
        &self,
        client_algorithms: Option<&[SignatureAndHashAlgorithm]>,
    ) -> Result<Credentials, Error> {
        let defaults = SignatureAndHashAlgorithm::defaults_for(SignatureAlgorithm::RSA);
        let candidates = client_algorithms.unwrap_or(&defaults[..]);
        let algorithm = choose_algorithm(candidates, SignatureAlgorithm::RSA)
            .ok_or(Error::UnsupportedSignatureAlgorithm(defaults[0]))?;

        let root = self.credentials.resolve_root()?;
        let peer = self.credentials.resolve_peer()?;
        if root.is_empty() || peer.is_empty() {
            return Err(Error::NoCertificateAvailable);
        }
        let key = self.credentials.resolve_key()?;
        let signer = Signer::new(Arc::new(key), algorithm)?;

        debug!("Server credentials signing with {:?}", algorithm);
        Ok(Credentials {
            chain: peer.concat(&root),
            signer,
        })
    }
}

impl HandshakeRole for ServerRole {
    fn rebind_policy(&self) -> RebindPolicy {
        RebindPolicy::EveryPacket
    }

    fn default_remote(&self) -> Option<SocketAddr> {
        None
    }

    fn handshake(
        &self,
        engine: &dyn ProtocolEngine,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Arc<dyn DatagramTransport>, Error> {
        engine.accept(self, transport)
    }

    fn handshake_state(&self) -> HandshakeState {
        *self.state.lock()
    }
}
