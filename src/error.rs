use std::fmt;

use thiserror::Error;

use crate::types::SignatureAndHashAlgorithm;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Record of {len} bytes exceeds the send limit of {limit}")]
    OversizedRecord { len: usize, limit: usize },

    #[error("Bad certificate: {0}")]
    BadCertificate(String),

    #[error("No certificate available")]
    NoCertificateAvailable,

    #[error("Invalid key material: {0}")]
    InvalidKeyMaterial(String),

    #[error("Invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("Handshake failed: {0}")]
    HandshakeIo(String),

    #[error("Timed out acquiring a channel")]
    AcquisitionTimeout,

    #[error("Unsupported signature algorithm {0}")]
    UnsupportedSignatureAlgorithm(SignatureAndHashAlgorithm),

    #[error("Received fatal alert {0}")]
    AlertReceived(AlertDescription),

    #[error("Transport has no channel or remote address")]
    NotConnected,

    #[error("Transport interrupted")]
    Interrupted,

    #[error("Closed")]
    Closed,

    #[error("Channel is {actual:?}, expected {expected:?}")]
    ChannelState {
        expected: crate::channel::ChannelState,
        actual: crate::channel::ChannelState,
    },

    #[error("Channel does not belong to this pool")]
    ForeignChannel,

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The alert a protocol engine raises to the peer when a role callback
    /// fails with this error.
    pub fn alert(&self) -> AlertDescription {
        match self {
            Error::BadCertificate(_) | Error::InvalidCertificate(_) => {
                AlertDescription::BadCertificate
            }
            Error::NoCertificateAvailable => AlertDescription::NoCertificate,
            Error::UnsupportedSignatureAlgorithm(_) => AlertDescription::HandshakeFailure,
            Error::AlertReceived(a) => *a,
            _ => AlertDescription::InternalError,
        }
    }
}

/// TLS alert descriptions (RFC 5246 7.2) that this crate raises or reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertDescription {
    CloseNotify,
    HandshakeFailure,
    NoCertificate,
    BadCertificate,
    UnsupportedCertificate,
    DecodeError,
    InternalError,
    Unknown(u8),
}

impl AlertDescription {
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => AlertDescription::CloseNotify,
            40 => AlertDescription::HandshakeFailure,
            41 => AlertDescription::NoCertificate,
            42 => AlertDescription::BadCertificate,
            43 => AlertDescription::UnsupportedCertificate,
            50 => AlertDescription::DecodeError,
            80 => AlertDescription::InternalError,
            _ => AlertDescription::Unknown(value),
        }
    }

    pub fn as_u8(&self) -> u8 {
        match self {
            AlertDescription::CloseNotify => 0,
            AlertDescription::HandshakeFailure => 40,
            AlertDescription::NoCertificate => 41,
            AlertDescription::BadCertificate => 42,
            AlertDescription::UnsupportedCertificate => 43,
            AlertDescription::DecodeError => 50,
            AlertDescription::InternalError => 80,
            AlertDescription::Unknown(value) => *value,
        }
    }
}

impl fmt::Display for AlertDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlertDescription::CloseNotify => write!(f, "close_notify(0)"),
            AlertDescription::HandshakeFailure => write!(f, "handshake_failure(40)"),
            AlertDescription::NoCertificate => write!(f, "no_certificate(41)"),
            AlertDescription::BadCertificate => write!(f, "bad_certificate(42)"),
            AlertDescription::UnsupportedCertificate => write!(f, "unsupported_certificate(43)"),
            AlertDescription::DecodeError => write!(f, "decode_error(50)"),
            AlertDescription::InternalError => write!(f, "internal_error(80)"),
            AlertDescription::Unknown(v) => write!(f, "unknown({v})"),
        }
    }
}
