//! Roster State (C6): in-memory per-group roster, mod-data cache with TTL,
//! and an event stream fanning out every mutation (§4.6).

use crate::error::{Error, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;
use weftmesh_core::types::{MemberInfo, PlayerModEntry};

/// Cached mod-data entries older than this are dropped by `cleanup_stale` (§3, §5).
pub const MOD_CACHE_TTL: Duration = Duration::from_secs(30 * 60);

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// Normalize a syncshell id: lowercased and trimmed on every access (§4.6).
pub fn normalize_group_id(id: &str) -> String {
    id.trim().to_lowercase()
}

/// A group's in-memory roster (§3).
#[derive(Clone, Debug, PartialEq)]
pub struct Roster {
    pub group_id: String,
    pub host_name: Option<String>,
    pub members: HashMap<String, MemberInfo>,
    pub mod_cache: HashMap<String, PlayerModEntry>,
    pub updated_at: u64,
}

impl Roster {
    fn new(group_id: String) -> Self {
        let ts = now();
        Self {
            group_id,
            host_name: None,
            members: HashMap::new(),
            mod_cache: HashMap::new(),
            updated_at: ts,
        }
    }
}

/// The kind of mutation that happened to a roster as a whole (§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RosterChangeKind {
    Created,
    Updated,
    Removed,
    Cleared,
}

/// The kind of mutation that happened to a single member (§4.6).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemberChangeKind {
    Added,
    StatusChanged,
}

/// Events fired by exactly one roster mutation each (§4.6).
#[derive(Clone, Debug, PartialEq)]
pub enum RosterEvent {
    RosterChanged { group_id: String, kind: RosterChangeKind },
    HostChanged { group_id: String, host_name: Option<String> },
    MemberUpdated { group_id: String, name: String, kind: MemberChangeKind },
    MembersRemoved { group_id: String, names: Vec<String> },
    ModDataUpdated { group_id: String, player_id: String },
}

/// Owns every group's roster behind one reader-writer lock per roster's
/// host manager (§4.6: "writers are serialized by a single reader-writer
/// lock per roster; reads take a shared handle and must observe a
/// consistent snapshot").
pub struct RosterManager {
    rosters: RwLock<HashMap<String, Roster>>,
    events: mpsc::UnboundedSender<RosterEvent>,
}

impl RosterManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RosterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { rosters: RwLock::new(HashMap::new()), events: tx }, rx)
    }

    fn emit(&self, event: RosterEvent) {
        let _ = self.events.send(event);
    }

    /// Create the roster for `group_id` if it does not already exist.
    pub fn ensure_roster(&self, group_id: &str) {
        let key = normalize_group_id(group_id);
        let mut rosters = self.rosters.write();
        if rosters.contains_key(&key) {
            return;
        }
        rosters.insert(key.clone(), Roster::new(key.clone()));
        drop(rosters);
        self.emit(RosterEvent::RosterChanged { group_id: key, kind: RosterChangeKind::Created });
    }

    /// A consistent snapshot of a group's roster, if it exists.
    pub fn get_roster(&self, group_id: &str) -> Option<Roster> {
        let key = normalize_group_id(group_id);
        self.rosters.read().get(&key).cloned()
    }

    /// Insert or update a member. Fires `MemberUpdated::Added` for a new
    /// member, `MemberUpdated::StatusChanged` when an existing member's info
    /// differs, and nothing when the call is a no-op repeat (idempotence,
    /// §8).
    pub fn upsert_member(&self, group_id: &str, name: &str, info: MemberInfo) -> Result<()> {
        let key = normalize_group_id(group_id);
        let mut rosters = self.rosters.write();
        let roster = rosters
            .get_mut(&key)
            .ok_or_else(|| Error::NoSuchRoster(key.clone()))?;

        let kind = match roster.members.insert(name.to_string(), info.clone()) {
            None => Some(MemberChangeKind::Added),
            Some(prev) if prev != info => Some(MemberChangeKind::StatusChanged),
            Some(_) => None,
        };
        if kind.is_some() {
            roster.updated_at = now();
        }
        drop(rosters);

        if let Some(kind) = kind {
            self.emit(RosterEvent::MemberUpdated { group_id: key, name: name.to_string(), kind });
        }
        Ok(())
    }

    /// Remove a single member, firing `RosterChanged::Removed`.
    pub fn remove_member(&self, group_id: &str, name: &str) -> Result<()> {
        let key = normalize_group_id(group_id);
        let mut rosters = self.rosters.write();
        let roster = rosters
            .get_mut(&key)
            .ok_or_else(|| Error::NoSuchRoster(key.clone()))?;
        let removed = roster.members.remove(name).is_some();
        if removed {
            roster.updated_at = now();
        }
        drop(rosters);
        if removed {
            self.emit(RosterEvent::RosterChanged { group_id: key, kind: RosterChangeKind::Removed });
        }
        Ok(())
    }

    /// Remove a batch of members in one mutation (e.g. reconciling a fresh
    /// `member_list_response` against the current roster), firing a single
    /// `MembersRemoved` event naming every removed member.
    pub fn remove_members(&self, group_id: &str, names: &[String]) -> Result<()> {
        let key = normalize_group_id(group_id);
        let mut rosters = self.rosters.write();
        let roster = rosters
            .get_mut(&key)
            .ok_or_else(|| Error::NoSuchRoster(key.clone()))?;
        let removed: Vec<String> = names.iter().filter(|n| roster.members.remove(*n).is_some()).cloned().collect();
        if !removed.is_empty() {
            roster.updated_at = now();
        }
        drop(rosters);
        if !removed.is_empty() {
            self.emit(RosterEvent::MembersRemoved { group_id: key, names: removed });
        }
        Ok(())
    }

    /// Set (or clear) the group's host, firing `HostChanged` only if the
    /// value actually changes.
    pub fn set_host(&self, group_id: &str, host_name: Option<String>) -> Result<()> {
        let key = normalize_group_id(group_id);
        let mut rosters = self.rosters.write();
        let roster = rosters
            .get_mut(&key)
            .ok_or_else(|| Error::NoSuchRoster(key.clone()))?;
        if roster.host_name == host_name {
            return Ok(());
        }
        roster.host_name = host_name.clone();
        roster.updated_at = now();
        drop(rosters);
        self.emit(RosterEvent::HostChanged { group_id: key, host_name });
        Ok(())
    }

    /// Update a member's cached mod-data snapshot, firing `ModDataUpdated`.
    pub fn update_mod_data(&self, group_id: &str, player_id: &str, entry: PlayerModEntry) -> Result<()> {
        let key = normalize_group_id(group_id);
        let mut rosters = self.rosters.write();
        let roster = rosters
            .get_mut(&key)
            .ok_or_else(|| Error::NoSuchRoster(key.clone()))?;
        roster.mod_cache.insert(player_id.to_string(), entry);
        roster.updated_at = now();
        drop(rosters);
        self.emit(RosterEvent::ModDataUpdated { group_id: key, player_id: player_id.to_string() });
        Ok(())
    }

    /// Read a member's cached mod-data snapshot, if present and not stale.
    pub fn get_mod_data(&self, group_id: &str, player_id: &str) -> Option<PlayerModEntry> {
        let key = normalize_group_id(group_id);
        let rosters = self.rosters.read();
        let roster = rosters.get(&key)?;
        let entry = roster.mod_cache.get(player_id)?;
        let age = now().saturating_sub(entry.cached_at);
        if age >= MOD_CACHE_TTL.as_secs() {
            return None;
        }
        Some(entry.clone())
    }

    /// Drop mod-cache entries older than [`MOD_CACHE_TTL`] across every
    /// roster, firing `RosterChanged::Cleared` for each roster that had
    /// something pruned.
    pub fn cleanup_stale(&self) {
        let at = now();
        let mut changed = Vec::new();
        {
            let mut rosters = self.rosters.write();
            for (key, roster) in rosters.iter_mut() {
                let before = roster.mod_cache.len();
                roster
                    .mod_cache
                    .retain(|_, entry| at.saturating_sub(entry.cached_at) < MOD_CACHE_TTL.as_secs());
                if roster.mod_cache.len() != before {
                    roster.updated_at = at;
                    changed.push(key.clone());
                }
            }
        }
        for key in changed {
            self.emit(RosterEvent::RosterChanged { group_id: key, kind: RosterChangeKind::Cleared });
        }
    }
}

impl Default for RosterManager {
    fn default() -> Self {
        Self::new().0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(name: &str, online: bool) -> MemberInfo {
        MemberInfo { display_name: name.to_string(), online, is_host: false, is_local: false }
    }

    #[test]
    fn ensure_roster_is_idempotent_in_event_terms() {
        let (mgr, mut rx) = RosterManager::new();
        mgr.ensure_roster("Group-A");
        mgr.ensure_roster("group-a ");
        assert!(matches!(
            rx.try_recv().unwrap(),
            RosterEvent::RosterChanged { kind: RosterChangeKind::Created, .. }
        ));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn group_id_normalized_on_every_access() {
        let (mgr, _rx) = RosterManager::new();
        mgr.ensure_roster("  MyGroup  ");
        assert!(mgr.get_roster("mygroup").is_some());
        assert!(mgr.get_roster("MYGROUP").is_some());
    }

    #[test]
    fn upsert_member_fires_added_then_status_changed_then_nothing() {
        let (mgr, mut rx) = RosterManager::new();
        mgr.ensure_roster("g1");
        rx.try_recv().unwrap(); // Created

        mgr.upsert_member("g1", "alice", member("alice", true)).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            RosterEvent::MemberUpdated { kind: MemberChangeKind::Added, .. }
        ));

        mgr.upsert_member("g1", "alice", member("alice", false)).unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            RosterEvent::MemberUpdated { kind: MemberChangeKind::StatusChanged, .. }
        ));

        // Identical repeat: no event.
        mgr.upsert_member("g1", "alice", member("alice", false)).unwrap();
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn mod_cache_expires_after_ttl() {
        let (mgr, _rx) = RosterManager::new();
        mgr.ensure_roster("g1");
        let stale_entry = PlayerModEntry {
            snapshot_hash: [0u8; 32],
            updated_at: 0,
            cached_at: now().saturating_sub(MOD_CACHE_TTL.as_secs() + 1),
        };
        mgr.update_mod_data("g1", "alice", stale_entry).unwrap();
        assert!(mgr.get_mod_data("g1", "alice").is_none());
    }

    #[test]
    fn cleanup_stale_prunes_expired_entries_and_emits_once() {
        let (mgr, mut rx) = RosterManager::new();
        mgr.ensure_roster("g1");
        rx.try_recv().unwrap();
        let stale_entry = PlayerModEntry {
            snapshot_hash: [0u8; 32],
            updated_at: 0,
            cached_at: now().saturating_sub(MOD_CACHE_TTL.as_secs() + 1),
        };
        mgr.update_mod_data("g1", "alice", stale_entry).unwrap();
        rx.try_recv().unwrap(); // ModDataUpdated

        mgr.cleanup_stale();
        assert!(matches!(
            rx.try_recv().unwrap(),
            RosterEvent::RosterChanged { kind: RosterChangeKind::Cleared, .. }
        ));
        assert!(mgr.get_roster("g1").unwrap().mod_cache.is_empty());
    }
}
