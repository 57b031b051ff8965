//! Local identity: numeric peer id, Ed25519 key and self-signed certificate.

use crate::certificate::{self, Fingerprint};
use crate::{CryptoError, ED25519_SIGNATURE_SIZE};
use ed25519_dalek::{Signer, SigningKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, info};
use zeroize::Zeroizing;

/// Numeric peer identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u32);

impl PeerId {
    /// Wrap a raw id.
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Raw id
    #[must_use]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PeerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// This node's own identity.
pub struct LocalIdentity {
    id: PeerId,
    signing_key: SigningKey,
    certificate: Vec<u8>,
    fingerprint: Fingerprint,
}

impl fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("id", &self.id)
            .field("fingerprint", &self.fingerprint)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
struct IdentityFile {
    id: PeerId,
    seed: String,
    certificate: String,
}

/// Generate a fresh keypair and certificate for `local_id`.
///
/// # Errors
///
/// Returns [`CryptoError::KeyGeneration`] if the certificate cannot be built.
pub fn generate_own_identity(local_id: PeerId) -> Result<LocalIdentity, CryptoError> {
    LocalIdentity::generate(local_id)
}

impl LocalIdentity {
    /// Generate a fresh keypair and certificate.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::KeyGeneration`] if the certificate cannot be built.
    pub fn generate(id: PeerId) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::generate(&mut OsRng);
        let certificate = certificate::self_signed(id, &signing_key)?;
        let fingerprint = Fingerprint::of(&certificate);
        info!("Generated identity for peer {} ({})", id, fingerprint);
        Ok(Self {
            id,
            signing_key,
            certificate,
            fingerprint,
        })
    }

    /// Rebuild an identity from a stored seed and certificate.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::InvalidKeyMaterial`] if the certificate does not
    /// carry the seed's public key, or an identity error if it names another peer.
    pub fn from_parts(id: PeerId, seed: [u8; 32], certificate: Vec<u8>) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_bytes(&seed);
        let info = certificate::CertificateInfo::parse(&certificate)?;
        info.check_names(id)?;
        if info.public_key != signing_key.verifying_key().to_bytes() {
            return Err(CryptoError::InvalidKeyMaterial(
                "certificate key does not match signing key".into(),
            ));
        }
        Ok(Self {
            id,
            signing_key,
            fingerprint: info.fingerprint,
            certificate,
        })
    }

    /// Our peer id
    #[must_use]
    pub fn id(&self) -> PeerId {
        self.id
    }

    /// DER certificate
    #[must_use]
    pub fn certificate_der(&self) -> &[u8] {
        &self.certificate
    }

    /// Certificate fingerprint
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }

    /// Sign `message` with the identity key.
    #[must_use]
    pub fn sign(&self, message: &[u8]) -> [u8; ED25519_SIGNATURE_SIZE] {
        self.signing_key.sign(message).to_bytes()
    }

    /// Write the identity as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Storage`] on I/O failure.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let seed = Zeroizing::new(self.signing_key.to_bytes());
        let file = IdentityFile {
            id: self.id,
            seed: hex::encode(*seed),
            certificate: hex::encode(&self.certificate),
        };
        let json = Zeroizing::new(serde_json::to_vec_pretty(&file)?);
        write_atomically(path, &json)?;
        debug!("Saved identity to {}", path.display());
        Ok(())
    }

    /// Load an identity written by [`LocalIdentity::save`].
    ///
    /// # Errors
    ///
    /// Returns an error if the file is missing, malformed or inconsistent.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let data = Zeroizing::new(fs::read(path)?);
        let file: IdentityFile = serde_json::from_slice(&data)?;
        let seed_bytes = Zeroizing::new(
            hex::decode(&file.seed).map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?,
        );
        let seed: [u8; 32] = seed_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidKeyMaterial("seed must be 32 bytes".into()))?;
        let certificate =
            hex::decode(&file.certificate).map_err(|e| CryptoError::InvalidKeyMaterial(e.to_string()))?;
        Self::from_parts(file.id, seed, certificate)
    }
}

/// Write `data` to a temporary sibling of `path`, then rename over it.
pub(crate) fn write_atomically(path: &Path, data: &[u8]) -> Result<(), CryptoError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = std::path::PathBuf::from(tmp);
    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}
