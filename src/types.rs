//! Protocol vocabulary shared between the peer roles and the protocol engine.
//!
//! These are the values that cross the engine boundary during a handshake:
//! versions, signature/hash pairs, certificate types and heartbeat and
//! renegotiation policies.

use std::fmt;
use std::time::Duration;

/// A one-byte registry value. Values outside the registry are kept in
/// `Unknown` so they survive a round trip through the engine.
macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident = $value:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
        pub enum $name {
            $($(#[$vmeta])* $variant,)+
            Unknown(u8),
        }

        impl From<u8> for $name {
            fn from(value: u8) -> Self {
                match value {
                    $($value => $name::$variant,)+
                    other => $name::Unknown(other),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                match value {
                    $($name::$variant => $value,)+
                    $name::Unknown(other) => other,
                }
            }
        }
    };
}

wire_enum! {
    /// Hash half of a signature/hash pair (RFC 5246 7.4.1.4.1).
    pub enum HashAlgorithm {
        None = 0,
        MD5 = 1,
        /// Advertised for compatibility, never used to sign here.
        SHA1 = 2,
        SHA224 = 3,
        SHA256 = 4,
        SHA384 = 5,
        SHA512 = 6,
    }
}

wire_enum! {
    /// Signature half of a signature/hash pair.
    pub enum SignatureAlgorithm {
        Anonymous = 0,
        RSA = 1,
        DSA = 2,
        ECDSA = 3,
    }
}

wire_enum! {
    /// Certificate types a server may ask the client for.
    pub enum ClientCertificateType {
        RSA_SIGN = 1,
        DSS_SIGN = 2,
        RSA_FIXED_DH = 3,
        DSS_FIXED_DH = 4,
        ECDSA_SIGN = 64,
    }
}

/// DTLS protocol versions this crate negotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ProtocolVersion {
    Dtls1_0,
    Dtls1_2,
}

// On the wire DTLS versions are the one's complement of {1, 0} and {1, 2}.
const VERSION_CODES: [(ProtocolVersion, u16); 2] = [
    (ProtocolVersion::Dtls1_0, 0xfeff),
    (ProtocolVersion::Dtls1_2, 0xfefd),
];

impl ProtocolVersion {
    /// The versions offered by both roles, newest first.
    pub const fn supported() -> &'static [ProtocolVersion; 2] {
        &[ProtocolVersion::Dtls1_2, ProtocolVersion::Dtls1_0]
    }

    pub fn from_u16(value: u16) -> Option<Self> {
        VERSION_CODES
            .iter()
            .find(|(_, code)| *code == value)
            .map(|(version, _)| *version)
    }

    pub fn as_u16(&self) -> u16 {
        VERSION_CODES
            .iter()
            .find(|(version, _)| version == self)
            .map(|(_, code)| *code)
            .unwrap_or_default()
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let minor = match self {
            ProtocolVersion::Dtls1_0 => 0,
            ProtocolVersion::Dtls1_2 => 2,
        };
        write!(f, "DTLS 1.{minor}")
    }
}

/// A signature primitive together with the hash it signs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SignatureAndHashAlgorithm {
    pub hash: HashAlgorithm,
    pub signature: SignatureAlgorithm,
}

/// Hash preference when the other side advertised nothing.
const DEFAULT_HASHES: [HashAlgorithm; 5] = [
    HashAlgorithm::SHA256,
    HashAlgorithm::SHA384,
    HashAlgorithm::SHA512,
    HashAlgorithm::SHA224,
    HashAlgorithm::SHA1,
];

const RSA_DESCENDING: [SignatureAndHashAlgorithm; 5] = [
    SignatureAndHashAlgorithm::new(HashAlgorithm::SHA512, SignatureAlgorithm::RSA),
    SignatureAndHashAlgorithm::new(HashAlgorithm::SHA384, SignatureAlgorithm::RSA),
    SignatureAndHashAlgorithm::new(HashAlgorithm::SHA256, SignatureAlgorithm::RSA),
    SignatureAndHashAlgorithm::new(HashAlgorithm::SHA224, SignatureAlgorithm::RSA),
    SignatureAndHashAlgorithm::new(HashAlgorithm::SHA1, SignatureAlgorithm::RSA),
];

impl SignatureAndHashAlgorithm {
    pub const fn new(hash: HashAlgorithm, signature: SignatureAlgorithm) -> Self {
        SignatureAndHashAlgorithm { hash, signature }
    }

    /// Hash in the high byte, signature in the low byte.
    pub fn from_u16(value: u16) -> Self {
        let [hash, signature] = value.to_be_bytes();
        SignatureAndHashAlgorithm::new(hash.into(), signature.into())
    }

    pub fn as_u16(&self) -> u16 {
        u16::from_be_bytes([self.hash.into(), self.signature.into()])
    }

    /// The pairs a peer assumes for `signature` when the other side
    /// advertised none: sha256, sha384, sha512, sha224, sha1.
    pub fn defaults_for(signature: SignatureAlgorithm) -> Vec<SignatureAndHashAlgorithm> {
        DEFAULT_HASHES
            .iter()
            .map(|hash| SignatureAndHashAlgorithm::new(*hash, signature))
            .collect()
    }

    /// The RSA pairs a server advertises in its certificate request,
    /// strongest hash first.
    pub const fn rsa_descending() -> &'static [SignatureAndHashAlgorithm; 5] {
        &RSA_DESCENDING
    }
}

impl fmt::Display for SignatureAndHashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}with{:?}", self.hash, self.signature)
    }
}

/// Heartbeat extension mode (RFC 6520).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatMode {
    PeerAllowedToSend,
    PeerNotAllowedToSend,
}

/// Heartbeat timing a peer role asks the engine to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Heartbeat {
    /// Idle time before a heartbeat request is sent.
    pub idle: Duration,
    /// Time to wait for the heartbeat response.
    pub timeout: Duration,
}

impl Heartbeat {
    pub const fn symmetric(interval: Duration) -> Self {
        Heartbeat {
            idle: interval,
            timeout: interval,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenegotiationPolicy {
    Deny,
    Accept,
}

/// Progress of the handshake of one connection, as seen by its peer role.
///
/// Moves `NotStarted -> InProgress -> Complete`. `Complete -> InProgress`
/// only happens when the peer renegotiates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandshakeState {
    #[default]
    NotStarted,
    InProgress,
    Complete,
}
