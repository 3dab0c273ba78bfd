//! Signatures over handshake transcripts with the resolved private key.

use std::fmt;
use std::sync::Arc;

use rsa::Pkcs1v15Sign;
use sha2::{Digest, Sha224, Sha256, Sha384, Sha512};
use signature::hazmat::PrehashSigner;

use crate::credentials::PrivateKey;
use crate::types::{HashAlgorithm, SignatureAlgorithm, SignatureAndHashAlgorithm};
use crate::Error;

/// A private key bound to the negotiated signature and hash pair.
#[derive(Clone)]
pub struct Signer {
    key: Arc<PrivateKey>,
    algorithm: SignatureAndHashAlgorithm,
}

impl Signer {
    /// Bind `key` to `algorithm`.
    ///
    /// Fails if the key cannot produce signatures of that kind, or the hash
    /// is one we cannot compute.
    pub fn new(key: Arc<PrivateKey>, algorithm: SignatureAndHashAlgorithm) -> Result<Self, Error> {
        if key.signature_algorithm() != algorithm.signature {
            return Err(Error::InvalidKeyMaterial(format!(
                "{:?} key cannot produce {:?} signatures",
                key.signature_algorithm(),
                algorithm.signature
            )));
        }
        if !Self::supports(algorithm) {
            return Err(Error::UnsupportedSignatureAlgorithm(algorithm));
        }
        Ok(Signer { key, algorithm })
    }

    /// Whether signatures of this kind can be produced at all.
    pub fn supports(algorithm: SignatureAndHashAlgorithm) -> bool {
        matches!(
            algorithm.signature,
            SignatureAlgorithm::RSA | SignatureAlgorithm::ECDSA
        ) && matches!(
            algorithm.hash,
            HashAlgorithm::SHA224 | HashAlgorithm::SHA256 | HashAlgorithm::SHA384 | HashAlgorithm::SHA512
        )
    }

    pub fn algorithm(&self) -> SignatureAndHashAlgorithm {
        self.algorithm
    }

    /// Sign `data`. RSA signatures are PKCS#1 v1.5, ECDSA signatures are DER encoded.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        let digest = digest(self.algorithm.hash, data)?;

        match &*self.key {
            PrivateKey::Rsa(key) => {
                let scheme = match self.algorithm.hash {
                    HashAlgorithm::SHA224 => Pkcs1v15Sign::new::<Sha224>(),
                    HashAlgorithm::SHA256 => Pkcs1v15Sign::new::<Sha256>(),
                    HashAlgorithm::SHA384 => Pkcs1v15Sign::new::<Sha384>(),
                    HashAlgorithm::SHA512 => Pkcs1v15Sign::new::<Sha512>(),
                    _ => return Err(Error::UnsupportedSignatureAlgorithm(self.algorithm)),
                };
                key.sign(scheme, &digest)
                    .map_err(|e| Error::InvalidKeyMaterial(format!("RSA signing: {e}")))
            }
            PrivateKey::EcdsaP256(key) => {
                let signature: p256::ecdsa::Signature = key
                    .sign_prehash(&digest)
                    .map_err(|e| Error::InvalidKeyMaterial(format!("ECDSA signing: {e}")))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            PrivateKey::EcdsaP384(key) => {
                let signature: p384::ecdsa::Signature = key
                    .sign_prehash(&digest)
                    .map_err(|e| Error::InvalidKeyMaterial(format!("ECDSA signing: {e}")))?;
                Ok(signature.to_der().as_bytes().to_vec())
            }
            PrivateKey::Dsa(_) => Err(Error::UnsupportedSignatureAlgorithm(self.algorithm)),
        }
    }
}

impl fmt::Debug for Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signer")
            .field("key", &self.key)
            .field("algorithm", &self.algorithm)
            .finish()
    }
}

fn digest(hash: HashAlgorithm, data: &[u8]) -> Result<Vec<u8>, Error> {
    Ok(match hash {
        HashAlgorithm::SHA224 => Sha224::digest(data).to_vec(),
        HashAlgorithm::SHA256 => Sha256::digest(data).to_vec(),
        HashAlgorithm::SHA384 => Sha384::digest(data).to_vec(),
        HashAlgorithm::SHA512 => Sha512::digest(data).to_vec(),
        _ => {
            return Err(Error::UnsupportedSignatureAlgorithm(
                SignatureAndHashAlgorithm::new(hash, SignatureAlgorithm::Anonymous),
            ))
        }
    })
}
