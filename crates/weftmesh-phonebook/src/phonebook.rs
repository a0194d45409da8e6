//! Signed Phonebook (C2): a last-writer-wins CRDT of member entries and
//! revocation tombstones under a shared group secret.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;
use weftmesh_core::crypto::{entry_sign_bytes, tombstone_sign_bytes, verify};
use weftmesh_core::types::{PeerId, PhonebookEntry, Tombstone};

/// Entries and tombstones expire 24 hours after their timestamp.
pub const ENTRY_TTL_SECS: u64 = 24 * 60 * 60;

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// An entry/tombstone is expired once its age reaches 24h (inclusive):
/// acceptance requires `now - timestamp < 24h` strictly (§8), so a record
/// exactly at the boundary is rejected, not kept for one more instant.
fn is_expired(timestamp: u64, at: u64) -> bool {
    at >= timestamp.saturating_add(ENTRY_TTL_SECS)
}

/// Ordering key used to decide whether a new entry supersedes a stored one:
/// `(sequence, timestamp, signature)` compared lexicographically. This
/// generalizes "sequence strictly greater" (the common case) to a total order
/// so that two entries racing with an identical sequence number still
/// converge to the same winner regardless of merge order.
fn entry_order_key(entry: &PhonebookEntry) -> (u64, u64, &[u8]) {
    (entry.sequence, entry.timestamp, &entry.signature)
}

fn tombstone_order_key(tomb: &Tombstone) -> (u64, &[u8]) {
    (tomb.timestamp, &tomb.signature)
}

/// Last-writer-wins CRDT of phonebook entries and tombstones for one group.
pub struct Phonebook {
    entries: RwLock<HashMap<PeerId, PhonebookEntry>>,
    tombstones: RwLock<HashMap<PeerId, Tombstone>>,
}

impl Default for Phonebook {
    fn default() -> Self {
        Self::new()
    }
}

impl Phonebook {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            tombstones: RwLock::new(HashMap::new()),
        }
    }

    fn live_tombstone(&self, peer_id: &PeerId, at: u64) -> bool {
        self.tombstones
            .read()
            .get(peer_id)
            .is_some_and(|t| !is_expired(t.timestamp, at))
    }

    /// Verify, validate and admit a phonebook entry (§4.2).
    ///
    /// Rejects (without panicking or surfacing a caller-visible fault beyond
    /// `Result`) a bad signature, an expired entry, a peer under a live
    /// tombstone, or an entry that does not supersede the one on record.
    pub fn add_entry(&self, entry: PhonebookEntry) -> Result<()> {
        let bytes = entry_sign_bytes(&entry)?;
        if !verify(&entry.public_key, &bytes, &entry.signature) {
            debug!(peer_id = %entry.peer_id, "phonebook: rejecting entry with bad signature");
            return Err(Error::InvalidSignature);
        }

        let at = now();
        if is_expired(entry.timestamp, at) {
            debug!(peer_id = %entry.peer_id, "phonebook: rejecting expired entry");
            return Err(Error::Expired);
        }

        if self.live_tombstone(&entry.peer_id, at) {
            debug!(peer_id = %entry.peer_id, "phonebook: rejecting entry, peer is revoked");
            return Err(Error::Revoked);
        }

        let mut entries = self.entries.write();
        let supersedes = match entries.get(&entry.peer_id) {
            None => true,
            Some(stored) => entry_order_key(&entry) > entry_order_key(stored),
        };
        if !supersedes {
            return Err(Error::StaleWrite);
        }
        entries.insert(entry.peer_id, entry);
        Ok(())
    }

    /// Verify, validate and admit a tombstone (§4.2).
    ///
    /// `remover_pubkey` must be a public key the caller already trusts (a
    /// current or recently-live phonebook entry) — the phonebook itself does
    /// not decide trust, it only verifies the signature against the key it
    /// is handed.
    pub fn add_tombstone(&self, tomb: Tombstone, remover_pubkey: &[u8; 32]) -> Result<()> {
        let bytes = tombstone_sign_bytes(&tomb)?;
        if !verify(remover_pubkey, &bytes, &tomb.signature) {
            debug!(peer_id = %tomb.peer_id, "phonebook: rejecting tombstone with bad signature");
            return Err(Error::InvalidSignature);
        }

        let at = now();
        if is_expired(tomb.timestamp, at) {
            return Err(Error::Expired);
        }

        {
            let mut tombstones = self.tombstones.write();
            let supersedes = match tombstones.get(&tomb.peer_id) {
                None => true,
                Some(stored) => tombstone_order_key(&tomb) > tombstone_order_key(stored),
            };
            if supersedes {
                tombstones.insert(tomb.peer_id, tomb.clone());
            }
        }

        // Always re-assert removal, regardless of whether this tombstone
        // replaced the stored one — applying the same tombstone twice, or in
        // a different merge order relative to a racing entry, must converge.
        self.entries.write().remove(&tomb.peer_id);
        Ok(())
    }

    /// Return the live entry for a peer, if any.
    pub fn get(&self, peer_id: &PeerId) -> Option<PhonebookEntry> {
        let at = now();
        if self.live_tombstone(peer_id, at) {
            return None;
        }
        self.entries
            .read()
            .get(peer_id)
            .filter(|e| !is_expired(e.timestamp, at))
            .cloned()
    }

    /// All currently live entries.
    pub fn all_live(&self) -> Vec<PhonebookEntry> {
        let at = now();
        let tombstones = self.tombstones.read();
        self.entries
            .read()
            .values()
            .filter(|e| !is_expired(e.timestamp, at))
            .filter(|e| {
                tombstones
                    .get(&e.peer_id)
                    .is_none_or(|t| is_expired(t.timestamp, at))
            })
            .cloned()
            .collect()
    }

    /// Whether a peer is currently suppressed by a live tombstone.
    pub fn is_revoked(&self, peer_id: &PeerId) -> bool {
        self.live_tombstone(peer_id, now())
    }

    /// Merge another phonebook's state into this one.
    ///
    /// Idempotent, commutative and associative: each record is re-applied
    /// through the same `add_entry`/`add_tombstone` validation used for
    /// direct writes, so merging converges to the same state regardless of
    /// application order (see module tests).
    pub fn merge(&self, other: &Phonebook) {
        for tomb in other.tombstones.read().values() {
            let pubkey = other
                .entries
                .read()
                .get(&tomb.remover_peer_id)
                .map(|e| e.public_key);
            if let Some(pubkey) = pubkey.or_else(|| self.remover_pubkey_hint(&tomb.remover_peer_id)) {
                let _ = self.add_tombstone(tomb.clone(), &pubkey);
            }
        }
        for entry in other.entries.read().values() {
            let _ = self.add_entry(entry.clone());
        }
    }

    /// Best-effort lookup of a remover's public key from our own entries,
    /// used when merging a tombstone whose remover entry isn't present in
    /// the remote phonebook snapshot (it may have expired there already).
    fn remover_pubkey_hint(&self, peer_id: &PeerId) -> Option<[u8; 32]> {
        self.entries.read().get(peer_id).map(|e| e.public_key)
    }

    /// Drop expired entries and tombstones.
    pub fn cleanup(&self) {
        let at = now();
        self.entries.write().retain(|_, e| !is_expired(e.timestamp, at));
        self.tombstones.write().retain(|_, t| !is_expired(t.timestamp, at));
    }

    /// Serialize the full state (entries + tombstones) to canonical JSON.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        #[derive(serde::Serialize)]
        struct Wire<'a> {
            entries: Vec<&'a PhonebookEntry>,
            tombstones: Vec<&'a Tombstone>,
        }
        let entries = self.entries.read();
        let tombstones = self.tombstones.read();
        let wire = Wire {
            entries: entries.values().collect(),
            tombstones: tombstones.values().collect(),
        };
        Ok(weftmesh_core::canonical::canonical_json_bytes(&wire)?)
    }

    /// Construct a phonebook from serialized state, re-validating nothing —
    /// callers that need validated state should `merge` a deserialized
    /// phonebook into a trusted one rather than trust `from_bytes` directly.
    pub fn from_bytes(bytes: &[u8]) -> Result<Phonebook> {
        #[derive(serde::Deserialize)]
        struct Wire {
            entries: Vec<PhonebookEntry>,
            tombstones: Vec<Tombstone>,
        }
        let wire: Wire = serde_json::from_slice(bytes).map_err(weftmesh_core::Error::from)?;
        let book = Phonebook::new();
        {
            let mut entries = book.entries.write();
            for e in wire.entries {
                entries.insert(e.peer_id, e);
            }
        }
        {
            let mut tombstones = book.tombstones.write();
            for t in wire.tombstones {
                tombstones.insert(t.peer_id, t);
            }
        }
        Ok(book)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;
    use weftmesh_core::crypto::sign;

    fn keypair() -> SigningKey {
        SigningKey::generate(&mut OsRng)
    }

    fn signed_entry(key: &SigningKey, peer_id: PeerId, sequence: u64, timestamp: u64) -> PhonebookEntry {
        let mut entry = PhonebookEntry {
            peer_id,
            ip: "127.0.0.1".parse().unwrap(),
            port: 4000,
            public_key: key.verifying_key().to_bytes(),
            sequence,
            timestamp,
            signature: Vec::new(),
        };
        let bytes = entry_sign_bytes(&entry).unwrap();
        entry.signature = sign(key, &bytes);
        entry
    }

    fn signed_tombstone(key: &SigningKey, peer_id: PeerId, remover: PeerId, timestamp: u64) -> Tombstone {
        let mut tomb = Tombstone {
            peer_id,
            remover_peer_id: remover,
            timestamp,
            signature: Vec::new(),
        };
        let bytes = tombstone_sign_bytes(&tomb).unwrap();
        tomb.signature = sign(key, &bytes);
        tomb
    }

    #[test]
    fn higher_sequence_supersedes() {
        let key = keypair();
        let peer = PeerId([1u8; 32]);
        let book = Phonebook::new();

        book.add_entry(signed_entry(&key, peer, 1, 1000)).unwrap();
        assert_eq!(book.get(&peer).unwrap().sequence, 1);

        book.add_entry(signed_entry(&key, peer, 2, 1001)).unwrap();
        assert_eq!(book.get(&peer).unwrap().sequence, 2);

        // Lower sequence must not replace.
        assert!(book.add_entry(signed_entry(&key, peer, 1, 1002)).is_err());
        assert_eq!(book.get(&peer).unwrap().sequence, 2);
    }

    #[test]
    fn tombstone_suppresses_entry_and_revokes() {
        let a_key = keypair();
        let remover_key = keypair();
        let a = PeerId([2u8; 32]);
        let remover = PeerId([3u8; 32]);
        let book = Phonebook::new();

        book.add_entry(signed_entry(&a_key, a, 1, 1000)).unwrap();
        book.add_entry(signed_entry(&remover_key, remover, 1, 1000)).unwrap();

        let tomb = signed_tombstone(&remover_key, a, remover, 1002);
        book.add_tombstone(tomb, &remover_key.verifying_key().to_bytes())
            .unwrap();

        assert!(book.get(&a).is_none());
        assert!(book.is_revoked(&a));
    }

    #[test]
    fn merge_is_commutative() {
        let key = keypair();
        let remover_key = keypair();
        let peer = PeerId([4u8; 32]);
        let remover = PeerId([5u8; 32]);

        let e1 = signed_entry(&key, peer, 1, 1000);
        let e2 = signed_entry(&key, peer, 2, 1001);
        let tomb = signed_tombstone(&remover_key, peer, remover, 1002);

        let book_a = Phonebook::new();
        book_a.add_entry(e1.clone()).unwrap();
        book_a.add_entry(e2.clone()).unwrap();
        book_a
            .add_tombstone(tomb.clone(), &remover_key.verifying_key().to_bytes())
            .unwrap();

        let book_b = Phonebook::new();
        book_b
            .add_tombstone(tomb.clone(), &remover_key.verifying_key().to_bytes())
            .unwrap();
        book_b.add_entry(e2.clone()).unwrap();
        book_b.add_entry(e1.clone()).unwrap();

        let c1 = Phonebook::new();
        c1.merge(&book_a);
        c1.merge(&book_b);

        let c2 = Phonebook::new();
        c2.merge(&book_b);
        c2.merge(&book_a);

        assert_eq!(c1.get(&peer), c2.get(&peer));
        assert_eq!(c1.is_revoked(&peer), c2.is_revoked(&peer));
        assert!(c1.get(&peer).is_none());
    }

    #[test]
    fn cleanup_drops_expired() {
        let key = keypair();
        let peer = PeerId([6u8; 32]);
        let book = Phonebook::new();
        book.add_entry(signed_entry(&key, peer, 1, 1)).unwrap();
        book.cleanup();
        assert!(book.get(&peer).is_none());
    }

    #[test]
    fn to_bytes_from_bytes_roundtrip() {
        let key = keypair();
        let peer = PeerId([7u8; 32]);
        let book = Phonebook::new();
        book.add_entry(signed_entry(&key, peer, 1, now())).unwrap();

        let bytes = book.to_bytes().unwrap();
        let restored = Phonebook::from_bytes(&bytes).unwrap();
        assert_eq!(restored.get(&peer), book.get(&peer));
    }
}
