//! Certificate chains as sequences of DER encodings.

use std::fmt;

use der::{Decode, Encode};
use sha2::{Digest, Sha256};
use spki::ObjectIdentifier;
use x509_cert::Certificate as X509Certificate;

use crate::types::{HashAlgorithm, SignatureAlgorithm, SignatureAndHashAlgorithm};
use crate::Error;

/// Ordered certificates, leaf first, each DER encoded.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CertificateChain(Vec<Vec<u8>>);

impl CertificateChain {
    pub fn new(certificates: Vec<Vec<u8>>) -> Self {
        CertificateChain(certificates)
    }

    /// Parse every PEM block labelled `...CERTIFICATE`, in file order.
    ///
    /// Other blocks are skipped. Input without certificates gives an empty chain.
    pub fn from_pem(pem: &str) -> Result<Self, Error> {
        let mut certificates = Vec::new();
        for (label, der) in super::pem_blocks(pem).map_err(Error::InvalidCertificate)? {
            if !label.ends_with("CERTIFICATE") {
                trace!("Skipping PEM block {}", label);
                continue;
            }
            X509Certificate::from_der(&der)
                .map_err(|e| Error::InvalidCertificate(format!("{label}: {e}")))?;
            certificates.push(der.to_vec());
        }
        Ok(CertificateChain(certificates))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn certificates(&self) -> &[Vec<u8>] {
        &self.0
    }

    /// This chain followed by `other`.
    pub fn concat(&self, other: &CertificateChain) -> CertificateChain {
        let mut certificates = self.0.clone();
        certificates.extend(other.0.iter().cloned());
        CertificateChain(certificates)
    }

    /// DER encoded subject name of the certificate at `index`.
    pub fn subject(&self, index: usize) -> Result<Vec<u8>, Error> {
        let der = self
            .0
            .get(index)
            .ok_or_else(|| Error::InvalidCertificate(format!("no certificate at {index}")))?;
        let cert = X509Certificate::from_der(der)
            .map_err(|e| Error::InvalidCertificate(e.to_string()))?;
        cert.tbs_certificate
            .subject
            .to_der()
            .map_err(|e| Error::InvalidCertificate(e.to_string()))
    }

    /// Colon separated SHA-256 fingerprints, one per certificate.
    pub fn fingerprints(&self) -> Vec<String> {
        self.0
            .iter()
            .map(|c| fingerprint(c))
            .collect()
    }
}

impl fmt::Debug for CertificateChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateChain")
            .field("certificates", &self.0.len())
            .field("total_bytes", &self.0.iter().map(|c| c.len()).sum::<usize>())
            .finish()
    }
}

/// Whether the chains have at least one byte-identical certificate in common.
pub fn share_common_certificate(a: &CertificateChain, b: &CertificateChain) -> bool {
    a.0.iter().any(|x| b.0.iter().any(|y| x == y))
}

/// Check that every certificate in `chain` is signed with one of `accepted`.
pub fn check_signature_algorithms(
    chain: &CertificateChain,
    accepted: &[SignatureAndHashAlgorithm],
) -> Result<(), Error> {
    for (i, der) in chain.0.iter().enumerate() {
        let cert = X509Certificate::from_der(der)
            .map_err(|e| Error::BadCertificate(format!("certificate {i}: {e}")))?;
        let oid = cert.signature_algorithm.oid;
        match signature_and_hash_for_oid(&oid) {
            Some(alg) if accepted.contains(&alg) => {}
            Some(alg) => {
                return Err(Error::BadCertificate(format!(
                    "certificate {i} signed with {alg:?}, not acceptable"
                )))
            }
            None => {
                return Err(Error::BadCertificate(format!(
                    "certificate {i} signed with unknown algorithm {oid}"
                )))
            }
        }
    }
    Ok(())
}

fn signature_and_hash_for_oid(oid: &ObjectIdentifier) -> Option<SignatureAndHashAlgorithm> {
    use HashAlgorithm as H;
    use SignatureAlgorithm as S;

    let (hash, signature) = match oid.to_string().as_str() {
        "1.2.840.113549.1.1.5" => (H::SHA1, S::RSA),
        "1.2.840.113549.1.1.14" => (H::SHA224, S::RSA),
        "1.2.840.113549.1.1.11" => (H::SHA256, S::RSA),
        "1.2.840.113549.1.1.12" => (H::SHA384, S::RSA),
        "1.2.840.113549.1.1.13" => (H::SHA512, S::RSA),
        "1.2.840.10045.4.1" => (H::SHA1, S::ECDSA),
        "1.2.840.10045.4.3.1" => (H::SHA224, S::ECDSA),
        "1.2.840.10045.4.3.2" => (H::SHA256, S::ECDSA),
        "1.2.840.10045.4.3.3" => (H::SHA384, S::ECDSA),
        "1.2.840.10045.4.3.4" => (H::SHA512, S::ECDSA),
        "1.2.840.10040.4.3" => (H::SHA1, S::DSA),
        "2.16.840.1.101.3.4.3.1" => (H::SHA224, S::DSA),
        "2.16.840.1.101.3.4.3.2" => (H::SHA256, S::DSA),
        _ => return None,
    };
    Some(SignatureAndHashAlgorithm::new(hash, signature))
}

/// Colon separated upper-case hex of the SHA-256 digest of `cert_der`.
pub fn fingerprint(cert_der: &[u8]) -> String {
    Sha256::digest(cert_der)
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(s: &str) -> ObjectIdentifier {
        ObjectIdentifier::new_unwrap(s)
    }

    #[test]
    fn signature_oids_map_to_pairs() {
        assert_eq!(
            signature_and_hash_for_oid(&oid("1.2.840.113549.1.1.11")),
            Some(SignatureAndHashAlgorithm::new(
                HashAlgorithm::SHA256,
                SignatureAlgorithm::RSA
            ))
        );
        assert_eq!(
            signature_and_hash_for_oid(&oid("1.2.840.10045.4.3.3")),
            Some(SignatureAndHashAlgorithm::new(
                HashAlgorithm::SHA384,
                SignatureAlgorithm::ECDSA
            ))
        );
        // Ed25519 has no pair.
        assert_eq!(signature_and_hash_for_oid(&oid("1.3.101.112")), None);
    }
}
