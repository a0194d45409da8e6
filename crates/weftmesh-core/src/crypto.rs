//! Identity & Crypto (C1): group key derivation, signing, MACs, content hashing.

use crate::canonical::canonical_json_bytes;
use crate::error::{Error, Result};
use crate::types::{Bytes32, GroupId, PhonebookEntry, Tombstone};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Nonce};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

/// Minimum entropy, in bits, a caller-supplied master secret must carry.
pub const MIN_MASTER_SECRET_BITS: usize = 128;

/// SHA-256 of arbitrary bytes, used for content addressing throughout C7.
pub fn sha256(bytes: &[u8]) -> Bytes32 {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

/// Validate a group or display name against the whitelist: letters, digits,
/// space, `-_.`. Empty names are rejected.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == ' ' || c == '-' || c == '_' || c == '.')
    {
        return Err(Error::InvalidName(name.to_string()));
    }
    Ok(())
}

/// Derive a group's identifier and symmetric key from its name and master secret.
///
/// `group_id = hex(SHA-256(name || master_secret))`; `group_key =
/// HKDF-SHA256(master_secret, info = name)`.
pub fn derive_group(name: &str, master_secret: &[u8]) -> Result<(GroupId, Bytes32)> {
    validate_name(name)?;

    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update(master_secret);
    let group_id = GroupId(hex::encode(hasher.finalize()));

    let hk = Hkdf::<Sha256>::new(None, master_secret);
    let mut group_key = [0u8; 32];
    hk.expand(name.as_bytes(), &mut group_key)
        .expect("32 bytes is a valid HKDF-SHA256 output length");

    Ok((group_id, group_key))
}

/// Sign a message with an Ed25519 signing key.
pub fn sign(signing_key: &SigningKey, bytes: &[u8]) -> Vec<u8> {
    signing_key.sign(bytes).to_bytes().to_vec()
}

/// Verify an Ed25519 signature. Never panics on malformed input — malformed
/// keys or signatures are simply not valid, same as any other failure.
pub fn verify(public_key: &Bytes32, bytes: &[u8], signature: &[u8]) -> bool {
    let Ok(vk) = VerifyingKey::from_bytes(public_key) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let sig = Signature::from_bytes(&sig_bytes);
    vk.verify(bytes, &sig).is_ok()
}

/// HMAC-SHA256 tag, truncated to `len` bytes (8 for invite envelopes, 4 for
/// legacy short codes per spec §4.1/§4.3).
pub fn mac(key: &[u8], bytes: &[u8], len: usize) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(bytes);
    mac.finalize().into_bytes()[..len].to_vec()
}

/// Verify a truncated HMAC-SHA256 tag in constant time.
pub fn verify_mac(key: &[u8], bytes: &[u8], tag: &[u8]) -> bool {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC accepts any key length");
    mac.update(bytes);
    let full = mac.finalize().into_bytes();
    if tag.len() > full.len() {
        return false;
    }
    // `subtle`-style constant-time compare over the truncated prefix.
    let mut diff = 0u8;
    for (a, b) in full[..tag.len()].iter().zip(tag.iter()) {
        diff |= a ^ b;
    }
    diff == 0
}

/// Build the cheap group-shared AEAD cipher derived from a group key.
///
/// Used where the group key's role as a symmetric cipher (spec §3) is needed,
/// distinct from its role as an HMAC key.
pub fn group_cipher(group_key: &Bytes32) -> ChaCha20Poly1305 {
    ChaCha20Poly1305::new(group_key.into())
}

/// Encrypt with the group cipher under an explicit nonce.
pub fn group_encrypt(group_key: &Bytes32, nonce: &[u8; 12], plaintext: &[u8]) -> Result<Vec<u8>> {
    group_cipher(group_key)
        .encrypt(Nonce::from_slice(nonce), plaintext)
        .map_err(|_| Error::InvalidMac)
}

/// Decrypt with the group cipher under an explicit nonce.
pub fn group_decrypt(group_key: &Bytes32, nonce: &[u8; 12], ciphertext: &[u8]) -> Result<Vec<u8>> {
    group_cipher(group_key)
        .decrypt(Nonce::from_slice(nonce), ciphertext)
        .map_err(|_| Error::InvalidMac)
}

/// Canonical bytes to sign/verify for a phonebook entry: the entry with its
/// `signature` field cleared.
pub fn entry_sign_bytes(entry: &PhonebookEntry) -> Result<Vec<u8>> {
    let mut cleared = entry.clone();
    cleared.signature = Vec::new();
    canonical_json_bytes(&cleared)
}

/// Canonical bytes to sign/verify for a tombstone: the tombstone with its
/// `signature` field cleared.
pub fn tombstone_sign_bytes(tomb: &Tombstone) -> Result<Vec<u8>> {
    let mut cleared = tomb.clone();
    cleared.signature = Vec::new();
    canonical_json_bytes(&cleared)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::OsRng;

    #[test]
    fn name_whitelist() {
        assert!(validate_name("My Group-1.0_x").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("emoji😀").is_err());
    }

    #[test]
    fn derive_group_is_deterministic() {
        let secret = [7u8; 32];
        let (g1, k1) = derive_group("friends", &secret).unwrap();
        let (g2, k2) = derive_group("friends", &secret).unwrap();
        assert_eq!(g1, g2);
        assert_eq!(k1, k2);

        let (g3, k3) = derive_group("other", &secret).unwrap();
        assert_ne!(g1, g3);
        assert_ne!(k1, k3);
    }

    #[test]
    fn sign_and_verify_roundtrip() {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public_key = signing_key.verifying_key().to_bytes();
        let msg = b"hello weftmesh";

        let sig = sign(&signing_key, msg);
        assert!(verify(&public_key, msg, &sig));
        assert!(!verify(&public_key, b"tampered", &sig));
    }

    #[test]
    fn mac_truncation_and_verification() {
        let key = b"group key material";
        let tag8 = mac(key, b"payload", 8);
        assert_eq!(tag8.len(), 8);
        assert!(verify_mac(key, b"payload", &tag8));
        assert!(!verify_mac(key, b"payload", &[0u8; 8]));

        let tag4 = mac(key, b"legacy", 4);
        assert_eq!(tag4.len(), 4);
    }

    #[test]
    fn group_cipher_roundtrip() {
        let key = [3u8; 32];
        let nonce = [9u8; 12];
        let ct = group_encrypt(&key, &nonce, b"secret payload").unwrap();
        let pt = group_decrypt(&key, &nonce, &ct).unwrap();
        assert_eq!(pt, b"secret payload");
    }
}
