//! Core data-model types shared by every weftmesh crate.
//!
//! All types here are designed for deterministic serialization via canonical
//! JSON (see [`crate::canonical`]). Field order does not matter for the wire
//! format — canonicalization sorts object keys — but it does matter for the
//! hand-written "bytes to sign" helpers in [`crate::crypto`], which lay out
//! fields explicitly rather than relying on serde.

use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// 32-byte fixed-size array used for hashes and keys.
pub type Bytes32 = [u8; 32];

// =============================================================================
// IDENTITY TYPES
// =============================================================================

/// Stable peer identifier derived from a peer's Ed25519 public key.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub Bytes32);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

/// Group (syncshell) identifier: `hex(SHA-256(name || master_secret))`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct GroupId(pub String);

impl std::fmt::Display for GroupId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// =============================================================================
// PHONEBOOK (C2)
// =============================================================================

/// One member's advertised presence in a group, signed by that member.
///
/// The signature covers the entry with `signature` itself cleared to an empty
/// vec — see [`crate::crypto::entry_sign_bytes`].
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PhonebookEntry {
    pub peer_id: PeerId,
    pub ip: IpAddr,
    pub port: u16,
    pub public_key: Bytes32,
    pub sequence: u64,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

/// A signed revocation of a peer's phonebook entry.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Tombstone {
    pub peer_id: PeerId,
    pub remover_peer_id: PeerId,
    pub timestamp: u64,
    pub signature: Vec<u8>,
}

// =============================================================================
// ROSTER (C6)
// =============================================================================

/// Roster-visible information about one member of a group.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct MemberInfo {
    pub display_name: String,
    pub online: bool,
    pub is_host: bool,
    pub is_local: bool,
}

/// A cached snapshot of a member's current asset set.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PlayerModEntry {
    pub snapshot_hash: Bytes32,
    pub updated_at: u64,
    pub cached_at: u64,
}

// =============================================================================
// CONTENT STORE (C7)
// =============================================================================

/// Typed configuration document kinds a member may advertise.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ConfigKind {
    Appearance,
    Body,
    Heels,
    Title,
}

/// A typed configuration document, addressed by `SHA-256(canonical_json(data))`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ConfigBlob {
    #[serde(rename = "type")]
    pub kind: ConfigKind,
    pub data: serde_json::Value,
    pub stored_at: u64,
}

/// One asset's binding to its configuration snapshot, within a member manifest.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ManifestAssociation {
    pub asset_hash: String,
    pub asset_path: String,
    pub config_hashes: std::collections::BTreeMap<ConfigKind, String>,
}

/// The authoritative binding of one member to their assets and configs.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Manifest {
    pub peer_id: PeerId,
    pub associations: Vec<ManifestAssociation>,
    pub updated_at: u64,
    pub total_size: u64,
}

/// An assembled package returned to a requesting client.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct Package {
    pub assets: Vec<PackageAsset>,
    pub configs: std::collections::BTreeMap<ConfigKind, serde_json::Value>,
    pub package_ts: u64,
    pub last_modified: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PackageAsset {
    pub path: String,
    pub hash: String,
    #[serde(with = "base64_bytes")]
    pub bytes: Vec<u8>,
    pub config_hashes: std::collections::BTreeMap<ConfigKind, String>,
}

/// Base64-encodes `Vec<u8>` fields over JSON, matching how every other binary
/// payload in this protocol (invite envelopes, `register-mods` asset data)
/// crosses the wire.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// INVITE ENVELOPE (C3)
// =============================================================================

/// The kind of invite/signaling payload an envelope carries.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InviteKind {
    Offer,
    Answer,
    Bootstrap,
    Nostr,
    Legacy,
}

/// Unsigned invite/signaling payload, see spec §3 and §4.3.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct InvitePayload {
    pub group_id: GroupId,
    pub kind: InviteKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sdp: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub answer_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bootstrap_hint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relay: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn package_asset_bytes_serialize_as_base64_string() {
        let asset = PackageAsset {
            path: "textures/hair.tex".into(),
            hash: "deadbeef".into(),
            bytes: vec![0xDE, 0xAD, 0xBE, 0xEF],
            config_hashes: Default::default(),
        };
        let value = serde_json::to_value(&asset).unwrap();
        assert_eq!(value["bytes"], serde_json::json!("3q2+7w=="));

        let round_tripped: PackageAsset = serde_json::from_value(value).unwrap();
        assert_eq!(round_tripped, asset);
    }
}
