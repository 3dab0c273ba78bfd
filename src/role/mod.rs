//! The two ends of a handshake.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::engine::{DatagramTransport, PeerRole, ProtocolEngine};
use crate::types::{HandshakeState, SignatureAlgorithm, SignatureAndHashAlgorithm};
use crate::Error;

mod client;
mod server;

pub use client::ClientRole;
pub use server::ServerRole;

/// When inbound datagrams move the bridge's remote address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebindPolicy {
    /// Only the first datagram's sender is adopted.
    FirstPacket,
    /// Every datagram's sender is adopted.
    EveryPacket,
}

/// What the protocol handler needs from a peer role.
pub trait HandshakeRole: PeerRole + 'static {
    fn rebind_policy(&self) -> RebindPolicy;

    /// The remote address to start out with, before any datagram arrived.
    fn default_remote(&self) -> Option<SocketAddr>;

    /// Run the blocking handshake for this end.
    fn handshake(
        &self,
        engine: &dyn ProtocolEngine,
        transport: Arc<dyn DatagramTransport>,
    ) -> Result<Arc<dyn DatagramTransport>, Error>;

    fn handshake_state(&self) -> HandshakeState;

    fn is_handshake_complete(&self) -> bool {
        self.handshake_state() == HandshakeState::Complete
    }
}

/// The first pair in `candidates` using `signature` that we can sign with.
fn choose_algorithm(
    candidates: &[SignatureAndHashAlgorithm],
    signature: SignatureAlgorithm,
) -> Option<SignatureAndHashAlgorithm> {
    candidates
        .iter()
        .copied()
        .find(|a| a.signature == signature && crate::sign::Signer::supports(*a))
}
