//! Self-signed X.509 identity certificates.
//!
//! Each peer's certificate carries its Ed25519 public key and names the peer
//! by decimal id in both subject and issuer common name. Certificates are
//! compared by SHA-1 fingerprint of the DER encoding; nothing else about them
//! is validated.

use crate::identity::PeerId;
use crate::{CERTIFICATE_VALIDITY_DAYS, CryptoError, ED25519_PUBLIC_KEY_SIZE, FINGERPRINT_SIZE};
use ed25519_dalek::{Signer, SigningKey};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, RemoteKeyPair, SignatureAlgorithm};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha1::{Digest, Sha1};
use std::fmt;
use std::str::FromStr;
use x509_parser::prelude::{FromDer, X509Certificate};

/// SHA-1 digest of a DER certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Fingerprint([u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Fingerprint of a DER-encoded certificate.
    #[must_use]
    pub fn of(cert_der: &[u8]) -> Self {
        let digest = Sha1::digest(cert_der);
        let mut bytes = [0u8; FINGERPRINT_SIZE];
        bytes.copy_from_slice(&digest);
        Self(bytes)
    }

    /// Wrap raw digest bytes.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; FINGERPRINT_SIZE]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

impl FromStr for Fingerprint {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        let bytes: [u8; FINGERPRINT_SIZE] = raw
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial("fingerprint must be 20 bytes".into()))?;
        Ok(Self(bytes))
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Fields extracted from a peer certificate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject common name
    pub subject_cn: String,
    /// Issuer common name
    pub issuer_cn: String,
    /// Ed25519 public key the certificate binds
    pub public_key: [u8; ED25519_PUBLIC_KEY_SIZE],
    /// SHA-1 of the DER encoding
    pub fingerprint: Fingerprint,
}

impl CertificateInfo {
    /// Parse a DER certificate.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::CertificateParse`] for malformed DER,
    /// [`CryptoError::MissingCommonName`] if subject or issuer lacks a common
    /// name, and [`CryptoError::InvalidPublicKey`] if the key is not Ed25519.
    pub fn parse(cert_der: &[u8]) -> Result<Self, CryptoError> {
        let (rest, cert) =
            X509Certificate::from_der(cert_der).map_err(|e| CryptoError::CertificateParse(e.to_string()))?;
        if !rest.is_empty() {
            return Err(CryptoError::CertificateParse("trailing bytes after certificate".into()));
        }

        let subject_cn = first_common_name(cert.subject())?;
        let issuer_cn = first_common_name(cert.issuer())?;

        let key_bytes: &[u8] = &cert.public_key().subject_public_key.data;
        let public_key: [u8; ED25519_PUBLIC_KEY_SIZE] =
            key_bytes.try_into().map_err(|_| CryptoError::InvalidPublicKey)?;
        ed25519_dalek::VerifyingKey::from_bytes(&public_key).map_err(|_| CryptoError::InvalidPublicKey)?;

        Ok(Self {
            subject_cn,
            issuer_cn,
            public_key,
            fingerprint: Fingerprint::of(cert_der),
        })
    }

    /// Check that both subject and issuer name `expected`.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::IdentityMismatch`] naming the offending field.
    pub fn check_names(&self, expected: PeerId) -> Result<(), CryptoError> {
        let want = expected.to_string();
        for cn in [&self.subject_cn, &self.issuer_cn] {
            if *cn != want {
                return Err(CryptoError::IdentityMismatch {
                    expected: expected.get(),
                    found: cn.clone(),
                });
            }
        }
        Ok(())
    }

    /// Peer id named by the subject, if it parses as one.
    #[must_use]
    pub fn claimed_id(&self) -> Option<PeerId> {
        self.subject_cn.parse::<u32>().ok().map(PeerId::new)
    }
}

fn first_common_name(name: &x509_parser::x509::X509Name<'_>) -> Result<String, CryptoError> {
    name.iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_owned)
        .ok_or(CryptoError::MissingCommonName)
}

/// Adapter letting rcgen sign with an ed25519-dalek key.
struct DalekSigner {
    key: SigningKey,
    public: [u8; ED25519_PUBLIC_KEY_SIZE],
}

impl RemoteKeyPair for DalekSigner {
    fn public_key(&self) -> &[u8] {
        &self.public
    }

    fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, rcgen::Error> {
        Ok(self.key.sign(msg).to_bytes().to_vec())
    }

    fn algorithm(&self) -> &'static SignatureAlgorithm {
        &rcgen::PKCS_ED25519
    }
}

/// Create a self-signed certificate for `id` over `key`, returning its DER.
///
/// # Errors
///
/// Returns [`CryptoError::KeyGeneration`] if rcgen fails to build or sign.
pub fn self_signed(id: PeerId, key: &SigningKey) -> Result<Vec<u8>, CryptoError> {
    let signer = DalekSigner {
        key: key.clone(),
        public: key.verifying_key().to_bytes(),
    };
    let key_pair = KeyPair::from_remote(Box::new(signer)).map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;

    let mut name = DistinguishedName::new();
    name.push(DnType::CommonName, id.to_string());

    let mut params = CertificateParams::default();
    params.distinguished_name = name;
    let now = time::OffsetDateTime::now_utc();
    params.not_before = now;
    params.not_after = now + time::Duration::days(CERTIFICATE_VALIDITY_DAYS);

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
    Ok(cert.der().to_vec())
}
