//! Trust store: the set of friend certificates this node will talk to.
//!
//! A peer is trusted when its certificate fingerprint is in the table. Each
//! fingerprint maps to at most one peer id. Peers known by id and name but
//! without a certificate are kept as *pending* and are never trusted.

use crate::certificate::{CertificateInfo, Fingerprint};
use crate::handshake::PeerVerifier;
use crate::identity::{PeerId, write_atomically};
use crate::CryptoError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

/// Result of [`TrustStore::add_or_update_peer`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrustUpdate {
    /// Peer was unknown or pending and is now trusted
    Added,
    /// Peer was trusted under a different certificate
    Updated,
    /// Peer already trusted with this exact certificate
    Unchanged,
    /// Certificate malformed, misnamed or owned by another peer
    Rejected,
}

impl TrustUpdate {
    /// True for `Added` and `Updated`
    #[must_use]
    pub fn changed(self) -> bool {
        matches!(self, TrustUpdate::Added | TrustUpdate::Updated)
    }
}

/// One entry of the trust table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TrustedPeer {
    /// Peer id
    pub id: PeerId,
    /// Display name
    pub name: String,
    /// DER certificate, `None` while pending
    pub certificate: Option<Vec<u8>>,
    /// Fingerprint of `certificate`
    pub fingerprint: Option<Fingerprint>,
    /// Ed25519 key bound by `certificate`
    pub public_key: Option<[u8; 32]>,
}

impl TrustedPeer {
    /// True when the peer has no certificate yet
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.certificate.is_none()
    }
}

#[derive(Default)]
struct TrustTable {
    peers: HashMap<PeerId, TrustedPeer>,
    by_fingerprint: HashMap<Fingerprint, PeerId>,
}

#[derive(Serialize, Deserialize)]
struct TrustRecord {
    id: PeerId,
    name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    certificate: Option<String>,
}

/// Mutex-guarded trust table, shareable across threads.
#[derive(Default)]
pub struct TrustStore {
    table: Mutex<TrustTable>,
}

impl TrustStore {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrustTable> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a peer known by id and name only.
    ///
    /// An already trusted peer keeps its certificate; only the name changes.
    pub fn add_pending(&self, id: PeerId, name: &str) {
        let mut table = self.lock();
        table
            .peers
            .entry(id)
            .and_modify(|p| p.name = name.to_owned())
            .or_insert_with(|| TrustedPeer {
                id,
                name: name.to_owned(),
                certificate: None,
                fingerprint: None,
                public_key: None,
            });
    }

    /// Trust `cert_der` as the certificate of `expected_id`.
    ///
    /// Subject and issuer common names must both equal the id, and the
    /// fingerprint must not already belong to a different peer.
    pub fn add_or_update_peer(&self, cert_der: &[u8], expected_id: PeerId, name: Option<&str>) -> TrustUpdate {
        let info = match CertificateInfo::parse(cert_der).and_then(|info| {
            info.check_names(expected_id)?;
            Ok(info)
        }) {
            Ok(info) => info,
            Err(e) => {
                warn!("Rejected certificate for peer {}: {}", expected_id, e);
                return TrustUpdate::Rejected;
            }
        };

        let mut table = self.lock();
        if let Some(owner) = table.by_fingerprint.get(&info.fingerprint) {
            if *owner != expected_id {
                warn!(
                    "Rejected certificate for peer {}: fingerprint {} already belongs to peer {}",
                    expected_id, info.fingerprint, owner
                );
                return TrustUpdate::Rejected;
            }
        }

        let previous = table.peers.get(&expected_id).and_then(|p| p.fingerprint);
        let outcome = match previous {
            Some(fp) if fp == info.fingerprint => {
                if let (Some(name), Some(peer)) = (name, table.peers.get_mut(&expected_id)) {
                    peer.name = name.to_owned();
                }
                return TrustUpdate::Unchanged;
            }
            Some(fp) => {
                table.by_fingerprint.remove(&fp);
                TrustUpdate::Updated
            }
            None => TrustUpdate::Added,
        };

        let name = name
            .map(str::to_owned)
            .or_else(|| table.peers.get(&expected_id).map(|p| p.name.clone()))
            .unwrap_or_default();
        table.by_fingerprint.insert(info.fingerprint, expected_id);
        table.peers.insert(
            expected_id,
            TrustedPeer {
                id: expected_id,
                name,
                certificate: Some(cert_der.to_vec()),
                fingerprint: Some(info.fingerprint),
                public_key: Some(info.public_key),
            },
        );
        info!("Trust {:?} for peer {} ({})", outcome, expected_id, info.fingerprint);
        outcome
    }

    /// True when the certificate's fingerprint is trusted.
    #[must_use]
    pub fn verify_incoming(&self, cert_der: &[u8]) -> bool {
        self.id_for(&Fingerprint::of(cert_der)).is_some()
    }

    /// Forget a peer entirely. Returns the removed entry.
    pub fn remove_peer(&self, id: PeerId) -> Option<TrustedPeer> {
        let mut table = self.lock();
        let removed = table.peers.remove(&id)?;
        if let Some(fp) = removed.fingerprint {
            table.by_fingerprint.remove(&fp);
        }
        debug!("Removed peer {} from trust store", id);
        Some(removed)
    }

    /// Fingerprint trusted for `id`
    #[must_use]
    pub fn fingerprint_for(&self, id: PeerId) -> Option<Fingerprint> {
        self.lock().peers.get(&id).and_then(|p| p.fingerprint)
    }

    /// Peer id owning `fingerprint`
    #[must_use]
    pub fn id_for(&self, fingerprint: &Fingerprint) -> Option<PeerId> {
        self.lock().by_fingerprint.get(fingerprint).copied()
    }

    /// Snapshot of one entry
    #[must_use]
    pub fn peer(&self, id: PeerId) -> Option<TrustedPeer> {
        self.lock().peers.get(&id).cloned()
    }

    /// Snapshot of every entry, ordered by id
    #[must_use]
    pub fn peers(&self) -> Vec<TrustedPeer> {
        let mut peers: Vec<_> = self.lock().peers.values().cloned().collect();
        peers.sort_by_key(|p| p.id);
        peers
    }

    /// Number of entries, pending included
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().peers.len()
    }

    /// True when no peers are known
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Persist the table as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::Storage`] on I/O failure.
    pub fn save(&self, path: &Path) -> Result<(), CryptoError> {
        let records: Vec<TrustRecord> = self
            .peers()
            .into_iter()
            .map(|p| TrustRecord {
                id: p.id,
                name: p.name,
                certificate: p.certificate.map(hex::encode),
            })
            .collect();
        write_atomically(path, &serde_json::to_vec_pretty(&records)?)
    }

    /// Load a table written by [`TrustStore::save`].
    ///
    /// Records whose certificate no longer validates are kept as pending.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: &Path) -> Result<Self, CryptoError> {
        let records: Vec<TrustRecord> = serde_json::from_slice(&fs::read(path)?)?;
        let store = Self::new();
        for record in records {
            store.add_pending(record.id, &record.name);
            if let Some(cert_hex) = record.certificate {
                match hex::decode(&cert_hex) {
                    Ok(der) => {
                        store.add_or_update_peer(&der, record.id, Some(&record.name));
                    }
                    Err(e) => warn!("Ignoring certificate of peer {}: {}", record.id, e),
                }
            }
        }
        Ok(store)
    }
}

impl PeerVerifier for TrustStore {
    fn verify_peer(&self, info: &CertificateInfo) -> Result<PeerId, CryptoError> {
        let id = self
            .id_for(&info.fingerprint)
            .ok_or_else(|| CryptoError::Untrusted(info.fingerprint.to_string()))?;
        info.check_names(id)?;
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::LocalIdentity;

    fn cert(id: u32) -> Vec<u8> {
        LocalIdentity::generate(PeerId::new(id))
            .unwrap()
            .certificate_der()
            .to_vec()
    }

    #[test]
    fn test_add_update_unchanged() {
        let store = TrustStore::new();
        let c1 = cert(5);
        let c2 = cert(5);

        assert_eq!(store.add_or_update_peer(&c1, PeerId::new(5), Some("bob")), TrustUpdate::Added);
        assert_eq!(store.add_or_update_peer(&c1, PeerId::new(5), None), TrustUpdate::Unchanged);
        assert_eq!(store.add_or_update_peer(&c2, PeerId::new(5), None), TrustUpdate::Updated);

        assert!(!store.verify_incoming(&c1));
        assert!(store.verify_incoming(&c2));
        assert_eq!(store.fingerprint_for(PeerId::new(5)), Some(Fingerprint::of(&c2)));
        assert_eq!(store.peer(PeerId::new(5)).unwrap().name, "bob");
    }

    #[test]
    fn test_rejects_misnamed_certificate() {
        let store = TrustStore::new();
        assert_eq!(store.add_or_update_peer(&cert(6), PeerId::new(7), None), TrustUpdate::Rejected);
        assert_eq!(store.add_or_update_peer(b"junk", PeerId::new(7), None), TrustUpdate::Rejected);
        assert!(store.is_empty());
    }

    #[test]
    fn test_pending_is_untrusted() {
        let store = TrustStore::new();
        store.add_pending(PeerId::new(9), "carol");
        assert!(store.peer(PeerId::new(9)).unwrap().is_pending());
        assert!(store.fingerprint_for(PeerId::new(9)).is_none());

        let c = cert(9);
        assert_eq!(store.add_or_update_peer(&c, PeerId::new(9), None), TrustUpdate::Added);
        assert_eq!(store.peer(PeerId::new(9)).unwrap().name, "carol");
    }

    #[test]
    fn test_remove_clears_fingerprint() {
        let store = TrustStore::new();
        let c = cert(3);
        store.add_or_update_peer(&c, PeerId::new(3), None);
        assert!(store.remove_peer(PeerId::new(3)).is_some());
        assert!(!store.verify_incoming(&c));
        assert!(store.id_for(&Fingerprint::of(&c)).is_none());
        assert!(store.remove_peer(PeerId::new(3)).is_none());
    }

    #[test]
    fn test_verifier_identifies_peer() {
        let store = TrustStore::new();
        let c = cert(11);
        store.add_or_update_peer(&c, PeerId::new(11), None);

        let info = CertificateInfo::parse(&c).unwrap();
        assert_eq!(store.verify_peer(&info).unwrap(), PeerId::new(11));

        let stranger = CertificateInfo::parse(&cert(12)).unwrap();
        assert!(matches!(store.verify_peer(&stranger), Err(CryptoError::Untrusted(_))));
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("trust.json");

        let store = TrustStore::new();
        let c = cert(20);
        store.add_or_update_peer(&c, PeerId::new(20), Some("dave"));
        store.add_pending(PeerId::new(21), "erin");
        store.save(&path).unwrap();

        let loaded = TrustStore::load(&path).unwrap();
        assert_eq!(loaded.len(), 2);
        assert!(loaded.verify_incoming(&c));
        assert!(loaded.peer(PeerId::new(21)).unwrap().is_pending());
        assert_eq!(loaded.peer(PeerId::new(20)).unwrap().name, "dave");
    }
}
