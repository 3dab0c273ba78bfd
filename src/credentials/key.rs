//! Private keys in the formats OpenSSL and friends write.

use std::fmt;

use pkcs8::DecodePrivateKey;
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::RsaPrivateKey;
use spki::ObjectIdentifier;
use zeroize::Zeroizing;

use crate::types::SignatureAlgorithm;
use crate::Error;

const OID_RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const OID_EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const OID_DSA: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10040.4.1");
const OID_P256: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.3.1.7");
const OID_P384: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.132.0.34");

/// A private key of one of the recognized types.
///
/// DSA keys are recognized so that they resolve, but no signer can use them.
#[derive(Clone)]
pub enum PrivateKey {
    Rsa(Box<RsaPrivateKey>),
    EcdsaP256(p256::ecdsa::SigningKey),
    EcdsaP384(p384::ecdsa::SigningKey),
    Dsa(Zeroizing<Vec<u8>>),
}

impl PrivateKey {
    /// Parse the first private key PEM block.
    pub fn from_pem(pem: &str) -> Result<Self, Error> {
        let blocks = super::pem_blocks(pem).map_err(Error::InvalidKeyMaterial)?;
        for (label, der) in blocks {
            match label.as_str() {
                "PRIVATE KEY" => return Self::from_pkcs8_der(&der),
                "RSA PRIVATE KEY" => {
                    let key = RsaPrivateKey::from_pkcs1_der(&der)
                        .map_err(|e| Error::InvalidKeyMaterial(format!("PKCS#1: {e}")))?;
                    return Ok(PrivateKey::Rsa(Box::new(key)));
                }
                "EC PRIVATE KEY" => return Self::from_sec1_der(&der),
                "DSA PRIVATE KEY" => return Ok(PrivateKey::Dsa(der)),
                _ => trace!("Skipping PEM block {}", label),
            }
        }
        Err(Error::InvalidKeyMaterial("no private key found".into()))
    }

    /// Parse a PKCS#8 `PrivateKeyInfo`, choosing the key type by algorithm OID.
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, Error> {
        let info = pkcs8::PrivateKeyInfo::try_from(der)
            .map_err(|e| Error::InvalidKeyMaterial(format!("PKCS#8: {e}")))?;
        let oid = info.algorithm.oid;

        if oid == OID_RSA_ENCRYPTION {
            let key = RsaPrivateKey::from_pkcs8_der(der)
                .map_err(|e| Error::InvalidKeyMaterial(format!("RSA: {e}")))?;
            Ok(PrivateKey::Rsa(Box::new(key)))
        } else if oid == OID_EC_PUBLIC_KEY {
            let curve = info
                .algorithm
                .parameters_oid()
                .map_err(|e| Error::InvalidKeyMaterial(format!("EC parameters: {e}")))?;
            if curve == OID_P256 {
                let key = p256::ecdsa::SigningKey::from_pkcs8_der(der)
                    .map_err(|e| Error::InvalidKeyMaterial(format!("P-256: {e}")))?;
                Ok(PrivateKey::EcdsaP256(key))
            } else if curve == OID_P384 {
                let key = p384::ecdsa::SigningKey::from_pkcs8_der(der)
                    .map_err(|e| Error::InvalidKeyMaterial(format!("P-384: {e}")))?;
                Ok(PrivateKey::EcdsaP384(key))
            } else {
                Err(Error::InvalidKeyMaterial(format!("unsupported curve {curve}")))
            }
        } else if oid == OID_DSA {
            Ok(PrivateKey::Dsa(Zeroizing::new(der.to_vec())))
        } else {
            Err(Error::InvalidKeyMaterial(format!(
                "unsupported key algorithm {oid}"
            )))
        }
    }

    /// Parse a SEC1 `ECPrivateKey` (OpenSSL EC private key format).
    pub fn from_sec1_der(der: &[u8]) -> Result<Self, Error> {
        let ec_key = sec1::EcPrivateKey::try_from(der)
            .map_err(|e| Error::InvalidKeyMaterial(format!("SEC1: {e}")))?;

        // Without named curve parameters, guess from the scalar length.
        let curve = match &ec_key.parameters {
            Some(sec1::EcParameters::NamedCurve(oid)) => *oid,
            None if ec_key.private_key.len() == 32 => OID_P256,
            None if ec_key.private_key.len() == 48 => OID_P384,
            None => {
                return Err(Error::InvalidKeyMaterial(
                    "EC key without curve parameters".into(),
                ))
            }
        };

        if curve == OID_P256 {
            let secret = p256::SecretKey::from_slice(ec_key.private_key)
                .map_err(|e| Error::InvalidKeyMaterial(format!("P-256: {e}")))?;
            Ok(PrivateKey::EcdsaP256(secret.into()))
        } else if curve == OID_P384 {
            let secret = p384::SecretKey::from_slice(ec_key.private_key)
                .map_err(|e| Error::InvalidKeyMaterial(format!("P-384: {e}")))?;
            Ok(PrivateKey::EcdsaP384(secret.into()))
        } else {
            Err(Error::InvalidKeyMaterial(format!("unsupported curve {curve}")))
        }
    }

    /// The signature primitive this key produces.
    pub fn signature_algorithm(&self) -> SignatureAlgorithm {
        match self {
            PrivateKey::Rsa(_) => SignatureAlgorithm::RSA,
            PrivateKey::EcdsaP256(_) | PrivateKey::EcdsaP384(_) => SignatureAlgorithm::ECDSA,
            PrivateKey::Dsa(_) => SignatureAlgorithm::DSA,
        }
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivateKey::Rsa(_) => f.debug_tuple("PrivateKey::Rsa").finish(),
            PrivateKey::EcdsaP256(_) => f.debug_tuple("PrivateKey::EcdsaP256").finish(),
            PrivateKey::EcdsaP384(_) => f.debug_tuple("PrivateKey::EcdsaP384").finish(),
            PrivateKey::Dsa(_) => f.debug_tuple("PrivateKey::Dsa").finish(),
        }
    }
}
