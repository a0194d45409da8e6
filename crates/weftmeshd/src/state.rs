//! Shared daemon state: the content store, cache, roster, and an in-memory
//! player registry backing the HTTP serving surface (§6).

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use weftmesh_roster::RosterManager;
use weftmesh_store::{Cache, Store};

use crate::config::Config;
use crate::control::ControlSession;

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

/// A registered player's presence record, populated by
/// `/api/players/register` and consulted by `/api/players/nearby` and
/// `/api/filter-connected`.
#[derive(Clone, Debug, serde::Serialize)]
pub struct PlayerRecord {
    pub player_name: String,
    pub public_key: String,
    pub registered_at: u64,
    pub last_seen: u64,
}

/// In-memory registry of players currently known to this daemon. Not a
/// source of truth for anything persisted — lost on restart, same as the
/// teacher's in-memory peer tables.
#[derive(Default)]
pub struct PlayerRegistry {
    players: RwLock<HashMap<String, PlayerRecord>>,
}

impl PlayerRegistry {
    pub fn register(&self, player_id: &str, player_name: &str, public_key: &str) {
        let at = now();
        let mut players = self.players.write();
        let entry = players.entry(player_id.to_string()).or_insert_with(|| PlayerRecord {
            player_name: player_name.to_string(),
            public_key: public_key.to_string(),
            registered_at: at,
            last_seen: at,
        });
        entry.player_name = player_name.to_string();
        entry.public_key = public_key.to_string();
        entry.last_seen = at;
    }

    pub fn touch(&self, player_id: &str) {
        if let Some(p) = self.players.write().get_mut(player_id) {
            p.last_seen = now();
        }
    }

    pub fn is_connected(&self, player_id: &str) -> bool {
        self.players.read().contains_key(player_id)
    }

    pub fn connected_of(&self, player_ids: &[String]) -> Vec<String> {
        let players = self.players.read();
        player_ids.iter().filter(|id| players.contains_key(id.as_str())).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.players.read().len()
    }
}

/// Everything an HTTP handler needs, shared behind `Arc` clones (axum's
/// `State` extractor pattern).
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub cache: Arc<Cache>,
    pub roster: Arc<RosterManager>,
    pub players: Arc<PlayerRegistry>,
    /// Answers phonebook/member-list/mod-sync control messages on whatever
    /// data channel a connection manager hands this daemon (§4.5/§6); the
    /// HTTP surface in `http.rs` never calls into it directly.
    pub control: Arc<ControlSession>,
    pub started_at: Instant,
}

impl AppState {
    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
