//! Control-message session handling: the data-channel side of the system
//! (§4.5, §6), as distinct from the HTTP serving surface in `http.rs`.
//!
//! A joining peer's data flow (spec §2) is: decode an invite, establish a
//! channel (C3/C4, out of scope here — see `weftmesh-net::connection`'s
//! `Channel` trait), then exchange `phonebook_request`/`phonebook_response`,
//! `member_list_request`/`member_list_response`, and `mod_sync_request`/
//! `mod_data` over that channel. This module answers those control messages
//! against this node's phonebook, roster, and content store, grounded on
//! `gossipd::server`'s match-and-respond message loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::debug;
use weftmesh_core::types::{MemberInfo, PhonebookEntry};
use weftmesh_net::dispatch::{classify, Classification, ControlMessage, Dispatcher};
use weftmesh_phonebook::Phonebook;
use weftmesh_roster::RosterManager;
use weftmesh_store::Store;

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Per-group phonebooks this node keeps, one CRDT register per syncshell it
/// participates in or hosts. Not persisted here — persistence is
/// `Phonebook::to_bytes`/`from_bytes`, left to the caller's storage policy.
#[derive(Default)]
pub struct PhonebookRegistry {
    books: RwLock<HashMap<String, Arc<Phonebook>>>,
}

impl PhonebookRegistry {
    /// Get or create the phonebook for `group_id`.
    pub fn get_or_create(&self, group_id: &str) -> Arc<Phonebook> {
        if let Some(book) = self.books.read().get(group_id) {
            return book.clone();
        }
        self.books
            .write()
            .entry(group_id.to_string())
            .or_insert_with(|| Arc::new(Phonebook::new()))
            .clone()
    }

    /// Admit an externally-signed entry into `group_id`'s phonebook.
    pub fn add_entry(&self, group_id: &str, entry: PhonebookEntry) -> weftmesh_phonebook::Result<()> {
        self.get_or_create(group_id).add_entry(entry)
    }
}

/// Answers control messages (§4.5, §6) against this node's phonebook,
/// roster, and content store. One instance serves every group this node
/// participates in; `group_id` is carried per-call rather than per-instance
/// since a single host daemon may serve several syncshells at once.
pub struct ControlSession {
    phonebooks: PhonebookRegistry,
    roster: Arc<RosterManager>,
    store: Arc<Store>,
    dispatcher: Dispatcher,
    local_identity: String,
}

impl ControlSession {
    pub fn new(roster: Arc<RosterManager>, store: Arc<Store>, local_identity: impl Into<String>) -> Self {
        let local_identity = local_identity.into();
        Self {
            phonebooks: PhonebookRegistry::default(),
            roster,
            store,
            dispatcher: Dispatcher::new(local_identity.clone()),
            local_identity,
        }
    }

    pub fn phonebooks(&self) -> &PhonebookRegistry {
        &self.phonebooks
    }

    pub fn roster(&self) -> &Arc<RosterManager> {
        &self.roster
    }

    /// Handle one inbound frame from a peer's data channel for `group_id`,
    /// returning zero or more response frames to send back on the same
    /// channel. Binary-classified frames (file-transfer chunks, opaque
    /// control frames) are not this module's concern and are passed through
    /// untouched as `None` — the caller routes them to the binary path.
    pub fn handle(&self, group_id: &str, raw: &[u8]) -> Vec<Vec<u8>> {
        if classify(raw) != Classification::Json {
            return Vec::new();
        }
        let Some(msg) = self.dispatcher.dispatch_json(raw) else {
            return Vec::new();
        };
        self.respond(group_id, msg)
    }

    fn respond(&self, group_id: &str, msg: ControlMessage) -> Vec<Vec<u8>> {
        match msg {
            ControlMessage::PhonebookRequest { .. } => {
                let book = self.phonebooks.get_or_create(group_id);
                let players: Vec<serde_json::Value> = book
                    .all_live()
                    .iter()
                    .filter_map(|e| serde_json::to_value(e).ok())
                    .collect();
                encode_one(ControlMessage::PhonebookResponse {
                    syncshell_id: group_id.to_string(),
                    players,
                    timestamp: now(),
                })
            }
            ControlMessage::MemberListRequest { message_id, .. } => {
                self.roster.ensure_roster(group_id);
                let Some(roster) = self.roster.get_roster(group_id) else {
                    return Vec::new();
                };
                let members: Vec<serde_json::Value> = roster
                    .members
                    .values()
                    .filter_map(|m| serde_json::to_value(m).ok())
                    .collect();
                let is_host = roster.host_name.as_deref() == Some(self.local_identity.as_str());
                encode_one(ControlMessage::MemberListResponse {
                    syncshell_id: group_id.to_string(),
                    host_name: roster.host_name,
                    members,
                    is_host,
                    message_id,
                    timestamp: now(),
                })
            }
            ControlMessage::ModSyncRequest { .. } => {
                self.roster.ensure_roster(group_id);
                let Some(roster) = self.roster.get_roster(group_id) else {
                    return Vec::new();
                };
                roster
                    .members
                    .keys()
                    .filter_map(|player_id| self.store.package(player_id).ok().map(|pkg| (player_id, pkg)))
                    .flat_map(|(player_id, pkg)| {
                        encode_one(ControlMessage::ModData {
                            player_id: player_id.clone(),
                            component_data: serde_json::to_value(&pkg.configs).ok(),
                            // Recipe data is owned by the external game plugin
                            // (spec §1 non-goal); nothing in this store models it.
                            recipe_data: None,
                            timestamp: now(),
                        })
                    })
                    .collect()
            }
            ControlMessage::ClientReady { .. } => {
                self.roster.ensure_roster(group_id);
                Vec::new()
            }
            ControlMessage::MeshJoinRequest { .. } => {
                self.roster.ensure_roster(group_id);
                debug!(%group_id, "control: mesh join request noted, no channel side-effect here");
                Vec::new()
            }
            ControlMessage::PhonebookResponse { .. } | ControlMessage::MemberListResponse { .. } | ControlMessage::ModData { .. } => {
                // Inbound responses from a peer we asked; nothing to answer with.
                Vec::new()
            }
        }
    }
}

fn encode_one(msg: ControlMessage) -> Vec<Vec<u8>> {
    match serde_json::to_vec(&msg) {
        Ok(bytes) => vec![bytes],
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;
    use weftmesh_core::crypto::{entry_sign_bytes, sign};
    use weftmesh_core::types::PeerId;

    fn signed_entry(key: &SigningKey, peer_id: PeerId) -> PhonebookEntry {
        let mut entry = PhonebookEntry {
            peer_id,
            ip: "127.0.0.1".parse().unwrap(),
            port: 4000,
            public_key: key.verifying_key().to_bytes(),
            sequence: 1,
            timestamp: now(),
            signature: Vec::new(),
        };
        let bytes = entry_sign_bytes(&entry).unwrap();
        entry.signature = sign(key, &bytes);
        entry
    }

    fn session() -> (ControlSession, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(Store::open(dir.path()).unwrap());
        let (roster, _rx) = RosterManager::new();
        (ControlSession::new(Arc::new(roster), store, "host"), dir)
    }

    #[test]
    fn phonebook_request_returns_live_entries() {
        let (session, _dir) = session();
        let key = SigningKey::generate(&mut OsRng);
        let entry = signed_entry(&key, PeerId([1u8; 32]));
        session.phonebooks().add_entry("g1", entry).unwrap();

        let req = br#"{"type":"phonebook_request","syncshellId":"g1","timestamp":1}"#;
        let responses = session.handle("g1", req);
        assert_eq!(responses.len(), 1);
        let parsed: ControlMessage = serde_json::from_slice(&responses[0]).unwrap();
        match parsed {
            ControlMessage::PhonebookResponse { players, .. } => assert_eq!(players.len(), 1),
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn member_list_request_reflects_roster() {
        let (session, _dir) = session();
        session.roster().ensure_roster("g1");
        session
            .roster()
            .upsert_member("g1", "alice", MemberInfo { display_name: "alice".into(), online: true, is_host: false, is_local: false })
            .unwrap();

        let req = br#"{"type":"member_list_request","syncshellId":"g1","requestedBy":"bob","messageId":"m1","timestamp":1}"#;
        let responses = session.handle("g1", req);
        assert_eq!(responses.len(), 1);
        let parsed: ControlMessage = serde_json::from_slice(&responses[0]).unwrap();
        match parsed {
            ControlMessage::MemberListResponse { members, message_id, .. } => {
                assert_eq!(members.len(), 1);
                assert_eq!(message_id.as_deref(), Some("m1"));
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn binary_frames_are_not_handled_here() {
        let (session, _dir) = session();
        let mut chunk = b"FCHK".to_vec();
        chunk.extend_from_slice(&[1, 2, 3]);
        assert!(session.handle("g1", &chunk).is_empty());
    }
}
