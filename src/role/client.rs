use std::net::SocketAddr;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{choose_algorithm, HandshakeRole, RebindPolicy};
use crate::credentials::{check_signature_algorithms, CredentialResolver};
use crate::engine::{CertificateRequest, ClientPeer, Credentials, DatagramTransport};
use crate::engine::{PeerRole, ProtocolEngine};
use crate::sign::Signer;
use crate::types::{ClientCertificateType, HandshakeState, Heartbeat, HeartbeatMode};
use crate::types::{ProtocolVersion, RenegotiationPolicy, SignatureAlgorithm};
use crate::types::SignatureAndHashAlgorithm;
use crate::Error;

/// The client end of a connection.
#[derive(Debug)]
pub struct ClientRole {
    remote: SocketAddr,
    credentials: Arc<CredentialResolver>,
    heartbeat: Heartbeat,
    state: Mutex<HandshakeState>,
}

impl ClientRole {
    pub fn new(remote: SocketAddr, credentials: Arc<CredentialResolver>, heartbeat: Heartbeat) -> Self {
        ClientRole {
            remote,
            credentials,
            heartbeat,
            state: Mutex::new(HandshakeState::NotStarted),
        }
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    // What we accept on the server's certificates.
    fn accepted_algorithms() -> Vec<SignatureAndHashAlgorithm> {
        let mut accepted = SignatureAndHashAlgorithm::defaults_for(SignatureAlgorithm::RSA);
        accepted.extend(SignatureAndHashAlgorithm::defaults_for(SignatureAlgorithm::ECDSA));
        accepted
    }
}

impl PeerRole for ClientRole {
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
        let previous = std::mem::replace(&mut *self.state.lock(), HandshakeState::InProgress);
        if previous == HandshakeState::Complete {
            debug!("Client renegotiating with {}", self.remote);
        } else {
            debug!("Client handshake with {} beginning", self.remote);
        }
    }

    fn notify_handshake_complete(&self) {
        *self.state.lock() = HandshakeState::Complete;
        info!("Client handshake with {} complete", self.remote);
    }
}

impl ClientPeer for ClientRole {
    fn notify_server_certificate(&self, chain: &crate::CertificateChain) -> Result<(), Error> {
        if chain.is_empty() {
            return Err(Error::BadCertificate("server sent no certificate".into()));
        }
        trace!("Server certificates: {:?}", chain.fingerprints());
        check_signature_algorithms(chain, &Self::accepted_algorithms())
    }

    fn client_credentials(
        &self,
        request: &CertificateRequest,
    ) -> Result<Option<Credentials>, Error> {
        if !request
            .certificate_types
            .contains(&ClientCertificateType::RSA_SIGN)
        {
            debug!("Server does not accept RSA certificates");
            return Ok(None);
        }

        let offered = request
            .signature_algorithms
            .clone()
            .unwrap_or_else(|| SignatureAndHashAlgorithm::defaults_for(SignatureAlgorithm::RSA));
        let Some(algorithm) = choose_algorithm(&offered, SignatureAlgorithm::RSA) else {
            debug!("No usable RSA signature algorithm in certificate request");
            return Ok(None);
        };

        let root = self.credentials.resolve_root()?;
        let peer = self.credentials.resolve_peer()?;
        if root.is_empty() || peer.is_empty() {
            return Err(Error::NoCertificateAvailable);
        }
        let chain = peer.concat(&root);
        check_signature_algorithms(&chain, &offered)?;

        let key = self.credentials.resolve_key()?;
        let signer = Signer::new(Arc::new(key), algorithm)?;

        debug!("Client credentials signing with {:?}", algorithm);
        Ok(Some(Credentials { chain, signer }))
    }
}

impl HandshakeRole for ClientRole {
    fn rebind_policy(&self) -> RebindPolicy {
        RebindPolicy::FirstPacket
    }

    fn default_remote(&self) -> Option<SocketAddr> {
        Some(self.remote)
    }

    fn handshake(
        &self,
        engine: &dyn ProtocolEngine,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Arc<dyn DatagramTransport>, Error> {
        engine.connect(self, transport)
    }

    fn handshake_state(&self) -> HandshakeState {
        *self.state.lock()
    }
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use super::*;
    use crate::types::HashAlgorithm;

    fn role() -> ClientRole {
        ClientRole::new(
            "127.0.0.1:4740".parse().unwrap(),
            Arc::new(CredentialResolver::client()),
            Heartbeat::symmetric(std::time::Duration::from_secs(10)),
        )
    }

    fn request() -> CertificateRequest {
        CertificateRequest {
            certificate_types: vec![ClientCertificateType::RSA_SIGN],
            signature_algorithms: Some(SignatureAndHashAlgorithm::rsa_descending().to_vec()),
            certificate_authorities: vec![],
        }
    }

    #[test]
    fn state_follows_notifications() {
        let role = role();
        assert_eq!(role.handshake_state(), HandshakeState::NotStarted);
        role.notify_handshake_beginning();
        assert_eq!(role.handshake_state(), HandshakeState::InProgress);
        assert!(!role.is_handshake_complete());
        role.notify_handshake_complete();
        assert!(role.is_handshake_complete());
        // Renegotiation.
        role.notify_handshake_beginning();
        assert_eq!(role.handshake_state(), HandshakeState::InProgress);
    }

    #[test]
    fn policies() {
        let role = role();
        assert_eq!(
            role.supported_versions(),
            &[ProtocolVersion::Dtls1_2, ProtocolVersion::Dtls1_0]
        );
        assert_eq!(role.heartbeat_mode(), HeartbeatMode::PeerAllowedToSend);
        assert_eq!(role.renegotiation_policy(), RenegotiationPolicy::Accept);
        assert_eq!(role.rebind_policy(), RebindPolicy::FirstPacket);
    }

    #[test]
    fn credentials_are_peer_then_root() {
        let role = role();
        let creds = role.client_credentials(&request()).unwrap().unwrap();
        let resolver = CredentialResolver::client();
        let expected = resolver
            .resolve_peer()
            .unwrap()
            .concat(&resolver.resolve_root().unwrap());
        assert_eq!(creds.chain, expected);
        assert_eq!(
            creds.signer.algorithm(),
            SignatureAndHashAlgorithm::new(HashAlgorithm::SHA512, SignatureAlgorithm::RSA)
        );
    }

    #[test]
    fn no_rsa_sign_means_no_credentials() {
        let mut request = request();
        request.certificate_types = vec![ClientCertificateType::ECDSA_SIGN];
        assert!(role().client_credentials(&request).unwrap().is_none());
    }

    #[test]
    fn missing_algorithms_fall_back_to_defaults() {
        let mut request = request();
        request.signature_algorithms = None;
        let creds = role().client_credentials(&request).unwrap().unwrap();
        assert_eq!(creds.signer.algorithm().hash, HashAlgorithm::SHA256);
    }

    #[test]
    fn chain_must_use_offered_algorithms() {
        // The built-in chain is signed with sha256WithRSAEncryption.
        let mut request = request();
        request.signature_algorithms = Some(vec![SignatureAndHashAlgorithm::new(
            HashAlgorithm::SHA384,
            SignatureAlgorithm::RSA,
        )]);
        assert!(matches!(
            role().client_credentials(&request),
            Err(Error::BadCertificate(_))
        ));
    }

    #[test]
    fn empty_peer_certificate_is_no_certificate_available() {
        // A PEM file without certificates resolves to an empty chain.
        let path: PathBuf = std::env::temp_dir().join(format!(
            "dtls-bridge-{}-empty-peer.pem",
            std::process::id()
        ));
        fs::write(&path, "no certificates here\n").unwrap();

        let role = role();
        role.credentials.set_peer_path(Some(path.clone()));
        assert!(matches!(
            role.client_credentials(&request()),
            Err(Error::NoCertificateAvailable)
        ));
        let _ = fs::remove_file(path);
    }

    #[test]
    fn server_chain_checked() {
        let role = role();
        assert!(matches!(
            role.notify_server_certificate(&crate::CertificateChain::default()),
            Err(Error::BadCertificate(_))
        ));
        let server_chain = CredentialResolver::server().resolve_peer().unwrap();
        role.notify_server_certificate(&server_chain).unwrap();
    }
}
