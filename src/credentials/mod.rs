//! Credential material: root CA, peer certificate and private key.
//!
//! Each piece resolves from an override path when one is set, and from the
//! compiled-in defaults otherwise. Overrides can be swapped at any time; the
//! next handshake picks them up.

use std::fs;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use parking_lot::RwLock;
use zeroize::Zeroizing;

use crate::Error;

mod chain;
mod key;

pub use chain::{check_signature_algorithms, fingerprint, share_common_certificate, CertificateChain};
pub use key::PrivateKey;

const DEFAULT_ROOT_CA: &str = include_str!("defaults/root_ca.pem");
const DEFAULT_CLIENT_CERT: &str = include_str!("defaults/client_cert.pem");
const DEFAULT_CLIENT_KEY: &str = include_str!("defaults/client_key.pem");
const DEFAULT_SERVER_CERT: &str = include_str!("defaults/server_cert.pem");
const DEFAULT_SERVER_KEY: &str = include_str!("defaults/server_key.pem");

// Parsed on first use, shared by every resolver.
type Parsed<T> = Lazy<Result<T, String>>;

static ROOT_CA: Parsed<CertificateChain> =
    Lazy::new(|| CertificateChain::from_pem(DEFAULT_ROOT_CA).map_err(|e| e.to_string()));
static CLIENT_CERT: Parsed<CertificateChain> =
    Lazy::new(|| CertificateChain::from_pem(DEFAULT_CLIENT_CERT).map_err(|e| e.to_string()));
static CLIENT_KEY: Parsed<PrivateKey> =
    Lazy::new(|| PrivateKey::from_pem(DEFAULT_CLIENT_KEY).map_err(|e| e.to_string()));
static SERVER_CERT: Parsed<CertificateChain> =
    Lazy::new(|| CertificateChain::from_pem(DEFAULT_SERVER_CERT).map_err(|e| e.to_string()));
static SERVER_KEY: Parsed<PrivateKey> =
    Lazy::new(|| PrivateKey::from_pem(DEFAULT_SERVER_KEY).map_err(|e| e.to_string()));

#[derive(Clone, Copy)]
struct Defaults {
    root: &'static Parsed<CertificateChain>,
    peer: &'static Parsed<CertificateChain>,
    key: &'static Parsed<PrivateKey>,
}

impl std::fmt::Debug for Defaults {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Defaults").finish_non_exhaustive()
    }
}

/// Resolves credential material from override paths or built-in defaults.
#[derive(Debug)]
pub struct CredentialResolver {
    root_path: RwLock<Option<PathBuf>>,
    peer_path: RwLock<Option<PathBuf>>,
    key_path: RwLock<Option<PathBuf>>,
    defaults: Defaults,
}

impl CredentialResolver {
    /// Resolver for the client role, defaulting to the built-in client identity.
    pub fn client() -> Self {
        Self::with_defaults(Defaults {
            root: &ROOT_CA,
            peer: &CLIENT_CERT,
            key: &CLIENT_KEY,
        })
    }

    /// Resolver for the server role, defaulting to the built-in server identity.
    pub fn server() -> Self {
        Self::with_defaults(Defaults {
            root: &ROOT_CA,
            peer: &SERVER_CERT,
            key: &SERVER_KEY,
        })
    }

    fn with_defaults(defaults: Defaults) -> Self {
        CredentialResolver {
            root_path: RwLock::new(None),
            peer_path: RwLock::new(None),
            key_path: RwLock::new(None),
            defaults,
        }
    }

    /// Override the root CA file. `None` restores the default.
    pub fn set_root_path(&self, path: Option<PathBuf>) {
        debug!("Root CA override: {:?}", path);
        *self.root_path.write() = path;
    }

    /// Override the peer certificate file. `None` restores the default.
    pub fn set_peer_path(&self, path: Option<PathBuf>) {
        debug!("Peer certificate override: {:?}", path);
        *self.peer_path.write() = path;
    }

    /// Override the private key file. `None` restores the default.
    pub fn set_key_path(&self, path: Option<PathBuf>) {
        debug!("Private key override: {:?}", path);
        *self.key_path.write() = path;
    }

    pub fn resolve_root(&self) -> Result<CertificateChain, Error> {
        let path = self.root_path.read().clone();
        match path {
            Some(path) => CertificateChain::from_pem(&read_pem(&path)?),
            None => self.default_root(),
        }
    }

    pub fn resolve_peer(&self) -> Result<CertificateChain, Error> {
        let path = self.peer_path.read().clone();
        match path {
            Some(path) => CertificateChain::from_pem(&read_pem(&path)?),
            None => self.default_peer(),
        }
    }

    pub fn resolve_key(&self) -> Result<PrivateKey, Error> {
        let path = self.key_path.read().clone();
        match path {
            Some(path) => PrivateKey::from_pem(&read_pem(&path)?),
            None => self.default_key(),
        }
    }

    fn default_root(&self) -> Result<CertificateChain, Error> {
        Lazy::force(self.defaults.root)
            .clone()
            .map_err(Error::InvalidCertificate)
    }

    fn default_peer(&self) -> Result<CertificateChain, Error> {
        Lazy::force(self.defaults.peer)
            .clone()
            .map_err(Error::InvalidCertificate)
    }

    fn default_key(&self) -> Result<PrivateKey, Error> {
        Lazy::force(self.defaults.key)
            .clone()
            .map_err(Error::InvalidKeyMaterial)
    }
}

fn read_pem(path: &Path) -> Result<Zeroizing<String>, Error> {
    trace!("Reading credential material from {}", path.display());
    Ok(Zeroizing::new(fs::read_to_string(path)?))
}

/// Split PEM text into `(label, der)` blocks, in order.
fn pem_blocks(pem: &str) -> Result<Vec<(String, Zeroizing<Vec<u8>>)>, String> {
    const BEGIN: &str = "-----BEGIN ";
    const END: &str = "-----END ";
    const DASHES: &str = "-----";

    let mut blocks = Vec::new();
    let mut rest = pem;

    while let Some(start) = rest.find(BEGIN) {
        let block = &rest[start..];
        let end = block
            .find(END)
            .ok_or_else(|| "unterminated PEM block".to_string())?;
        let after_end = &block[end + END.len()..];
        let close = after_end
            .find(DASHES)
            .ok_or_else(|| "malformed PEM footer".to_string())?;
        let len = end + END.len() + close + DASHES.len();

        let (label, der) =
            der::pem::decode_vec(block[..len].as_bytes()).map_err(|e| e.to_string())?;
        blocks.push((label.to_string(), Zeroizing::new(der)));

        rest = &block[len..];
    }

    Ok(blocks)
}
