//! Overlay Relay (C9): a single UDP socket multiplexing load-broadcast,
//! redirect, shutdown-migration, and peer-lookup traffic across a
//! two-byte-prefixed wire format (§4.9).

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{Duration, Instant};
use tracing::debug;

use crate::error::OverlayError;

/// A peer record expires this long after its last load-broadcast (§4.9, §5).
pub const PEER_RECORD_TTL: Duration = Duration::from_secs(2 * 60);

/// How often this relay broadcasts its own load to known peers (§4.9, §5).
pub const LOAD_BROADCAST_INTERVAL: Duration = Duration::from_secs(30);

/// A candidate peer relay is attractive for redirect within this load range.
pub const REDIRECT_CANDIDATE_RANGE: std::ops::Range<u16> = 5..15;

const PREFIX: u8 = 0xFF;
const OP_LOAD_BROADCAST: u8 = 0xFE;
const OP_REDIRECT: u8 = 0xFD;
const OP_SHUTDOWN_MIGRATION: u8 = 0xFA;
const OP_PEER_LOOKUP_REQUEST: u8 = 0xFC;
const OP_PEER_LOOKUP_RESPONSE: u8 = 0xFB;

/// One parsed overlay protocol message (§4.9).
#[derive(Debug, Clone, PartialEq)]
pub enum OverlayMessage {
    LoadBroadcast { active_conns: u16, port: u16 },
    Redirect { url: String },
    ShutdownMigration { url: String },
    PeerLookupRequest { group_id: String, user_id: String },
    PeerLookupResponse { group_id: String, user_id: String },
    /// Anything not matching the known prefixes; out-of-scope STUN/TURN path.
    Unrecognized,
}

/// Parse a datagram's overlay protocol message (§4.9).
pub fn parse(bytes: &[u8]) -> OverlayMessage {
    if bytes.len() < 2 || bytes[0] != PREFIX {
        return OverlayMessage::Unrecognized;
    }
    match bytes[1] {
        OP_LOAD_BROADCAST if bytes.len() >= 6 => {
            let active_conns = u16::from_le_bytes([bytes[2], bytes[3]]);
            let port = u16::from_le_bytes([bytes[4], bytes[5]]);
            OverlayMessage::LoadBroadcast { active_conns, port }
        }
        OP_REDIRECT => OverlayMessage::Redirect { url: String::from_utf8_lossy(&bytes[2..]).into_owned() },
        OP_SHUTDOWN_MIGRATION => {
            OverlayMessage::ShutdownMigration { url: String::from_utf8_lossy(&bytes[2..]).into_owned() }
        }
        OP_PEER_LOOKUP_REQUEST => match parse_group_scoped_payload(&bytes[2..]) {
            Some((group_id, user_id)) => OverlayMessage::PeerLookupRequest { group_id, user_id },
            None => OverlayMessage::Unrecognized,
        },
        OP_PEER_LOOKUP_RESPONSE => match parse_group_scoped_payload(&bytes[2..]) {
            Some((group_id, user_id)) => OverlayMessage::PeerLookupResponse { group_id, user_id },
            None => OverlayMessage::Unrecognized,
        },
        _ => OverlayMessage::Unrecognized,
    }
}

/// Encode a load-broadcast datagram.
pub fn encode_load_broadcast(active_conns: u16, port: u16) -> Vec<u8> {
    let mut out = vec![PREFIX, OP_LOAD_BROADCAST];
    out.extend_from_slice(&active_conns.to_le_bytes());
    out.extend_from_slice(&port.to_le_bytes());
    out
}

/// Encode a redirect datagram carrying the target relay's URL.
pub fn encode_redirect(url: &str) -> Vec<u8> {
    let mut out = vec![PREFIX, OP_REDIRECT];
    out.extend_from_slice(url.as_bytes());
    out
}

/// Encode a shutdown-migration datagram carrying the replacement relay's URL.
pub fn encode_shutdown_migration(url: &str) -> Vec<u8> {
    let mut out = vec![PREFIX, OP_SHUTDOWN_MIGRATION];
    out.extend_from_slice(url.as_bytes());
    out
}

/// Peer-lookup payloads are scoped to a group (§4.9's allow-list applies
/// per group id), so the wire payload is length-prefixed: a one-byte group
/// id length followed by the group id bytes, then the remaining bytes are
/// the user id.
fn encode_group_scoped_payload(group_id: &str, user_id: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(1 + group_id.len() + user_id.len());
    out.push(group_id.len() as u8);
    out.extend_from_slice(group_id.as_bytes());
    out.extend_from_slice(user_id.as_bytes());
    out
}

fn parse_group_scoped_payload(payload: &[u8]) -> Option<(String, String)> {
    let glen = *payload.first()? as usize;
    if payload.len() < 1 + glen {
        return None;
    }
    let group_id = String::from_utf8_lossy(&payload[1..1 + glen]).into_owned();
    let user_id = String::from_utf8_lossy(&payload[1 + glen..]).into_owned();
    Some((group_id, user_id))
}

/// Encode a peer-lookup request for `user_id` within `group_id`.
pub fn encode_peer_lookup_request(group_id: &str, user_id: &str) -> Vec<u8> {
    let mut out = vec![PREFIX, OP_PEER_LOOKUP_REQUEST];
    out.extend(encode_group_scoped_payload(group_id, user_id));
    out
}

/// Encode a peer-lookup response echoing `group_id`/`user_id`.
pub fn encode_peer_lookup_response(group_id: &str, user_id: &str) -> Vec<u8> {
    let mut out = vec![PREFIX, OP_PEER_LOOKUP_RESPONSE];
    out.extend(encode_group_scoped_payload(group_id, user_id));
    out
}

#[derive(Debug, Clone)]
struct PeerRecord {
    active_conns: u16,
    port: u16,
    last_seen: Instant,
}

impl PeerRecord {
    fn is_live(&self) -> bool {
        self.last_seen.elapsed() < PEER_RECORD_TTL
    }
}

/// What a capacity check decided for a new inbound connection (§4.9).
#[derive(Debug, Clone, PartialEq)]
pub enum CapacityDecision {
    Accept,
    Redirect(SocketAddr),
    Reject,
}

/// Relay state: our own load counter, known peer relays, and the set of
/// clients to notify on shutdown migration.
pub struct Relay {
    soft_cap: u16,
    redirect_threshold: u16,
    active_conns: AtomicU16,
    self_port: u16,
    peers: RwLock<HashMap<SocketAddr, PeerRecord>>,
    clients: RwLock<HashSet<SocketAddr>>,
    user_directory: RwLock<HashMap<(String, String), SocketAddr>>,
    /// `None` means "serve every group" (§4.9); `Some` is the configured
    /// allow-list checked by `check_group_allowed`.
    allowed_groups: Option<HashSet<String>>,
}

impl Relay {
    pub fn new(self_port: u16, soft_cap: u16, redirect_threshold: u16, allowed_groups: Vec<String>) -> Self {
        Self {
            soft_cap,
            redirect_threshold,
            active_conns: AtomicU16::new(0),
            self_port,
            peers: RwLock::new(HashMap::new()),
            clients: RwLock::new(HashSet::new()),
            user_directory: RwLock::new(HashMap::new()),
            allowed_groups: (!allowed_groups.is_empty()).then(|| allowed_groups.into_iter().collect()),
        }
    }

    /// Check `group_id` against this relay's allow-list (§4.9).
    fn check_group_allowed(&self, group_id: &str) -> crate::error::Result<()> {
        match &self.allowed_groups {
            Some(allowed) if !allowed.contains(group_id) => Err(OverlayError::GroupNotAllowed(group_id.to_string())),
            _ => Ok(()),
        }
    }

    pub fn active_conns(&self) -> u16 {
        self.active_conns.load(Ordering::Relaxed)
    }

    pub fn record_connect(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_disconnect(&self) {
        self.active_conns.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| Some(v.saturating_sub(1))).ok();
    }

    /// Handle an inbound datagram from `from`, returning any response bytes
    /// that should be sent back to the sender.
    pub fn handle_datagram(&self, from: SocketAddr, bytes: &[u8]) -> Option<(SocketAddr, Vec<u8>)> {
        match parse(bytes) {
            OverlayMessage::LoadBroadcast { active_conns, port } => {
                let addr = SocketAddr::new(from.ip(), port);
                self.peers.write().insert(addr, PeerRecord { active_conns, port, last_seen: Instant::now() });
                None
            }
            OverlayMessage::Redirect { url } => {
                debug!(%from, url, "overlay: received redirect, not acting on it as a server");
                None
            }
            OverlayMessage::ShutdownMigration { url } => {
                debug!(%from, url, "overlay: peer relay is migrating clients away");
                None
            }
            OverlayMessage::PeerLookupRequest { group_id, user_id } => {
                if let Err(e) = self.check_group_allowed(&group_id) {
                    debug!(%from, %e, "overlay: dropping peer-lookup request for disallowed group");
                    return None;
                }
                self.clients.write().insert(from);
                let key = (group_id.clone(), user_id.clone());
                self.user_directory
                    .read()
                    .contains_key(&key)
                    .then(|| (from, encode_peer_lookup_response(&group_id, &user_id)))
            }
            OverlayMessage::PeerLookupResponse { group_id, user_id } => {
                if let Err(e) = self.check_group_allowed(&group_id) {
                    debug!(%from, %e, "overlay: dropping peer-lookup response for disallowed group");
                    return None;
                }
                self.user_directory.write().insert((group_id, user_id), from);
                None
            }
            OverlayMessage::Unrecognized => {
                debug!(%from, "overlay: unrecognized datagram, passing to out-of-scope STUN/TURN path");
                None
            }
        }
    }

    /// Drop peer records that have not broadcast within [`PEER_RECORD_TTL`].
    pub fn prune_peers(&self) -> usize {
        let mut peers = self.peers.write();
        let before = peers.len();
        peers.retain(|_, r| r.is_live());
        before - peers.len()
    }

    /// Decide whether a new inbound connection should be accepted, redirected
    /// to a less-loaded peer, or rejected (§4.9 Capacity policy).
    ///
    /// Availability wins over capacity when no alternative relay is known: a
    /// hard reject only happens at or above the soft cap *and* when some
    /// alternative peer exists to redirect to instead.
    pub fn capacity_decision(&self) -> CapacityDecision {
        let load = self.active_conns();
        if load < self.redirect_threshold {
            return CapacityDecision::Accept;
        }

        let alternative = {
            let peers = self.peers.read();
            peers
                .iter()
                .filter(|(_, r)| r.is_live() && REDIRECT_CANDIDATE_RANGE.contains(&r.active_conns))
                .min_by_key(|(_, r)| r.active_conns)
                .map(|(addr, _)| *addr)
        };

        match alternative {
            Some(_) if load >= self.soft_cap => CapacityDecision::Reject,
            Some(addr) => CapacityDecision::Redirect(addr),
            None => CapacityDecision::Accept,
        }
    }

    /// Every known client, for shutdown migration broadcast.
    pub fn known_clients(&self) -> Vec<SocketAddr> {
        self.clients.read().iter().copied().collect()
    }

    /// The least-loaded live peer, if any, used to pick a migration target
    /// on shutdown.
    pub fn least_loaded_peer(&self) -> Option<SocketAddr> {
        self.peers.read().iter().filter(|(_, r)| r.is_live()).min_by_key(|(_, r)| r.active_conns).map(|(a, _)| *a)
    }

    pub fn self_port(&self) -> u16 {
        self.self_port
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_load_broadcast() {
        let bytes = encode_load_broadcast(7, 7420);
        assert_eq!(parse(&bytes), OverlayMessage::LoadBroadcast { active_conns: 7, port: 7420 });
    }

    #[test]
    fn parse_redirect_and_migration() {
        let r = encode_redirect("relay2.example:7420");
        assert_eq!(parse(&r), OverlayMessage::Redirect { url: "relay2.example:7420".into() });
        let m = encode_shutdown_migration("relay3.example:7420");
        assert_eq!(parse(&m), OverlayMessage::ShutdownMigration { url: "relay3.example:7420".into() });
    }

    #[test]
    fn unrecognized_without_prefix() {
        assert_eq!(parse(b"hello"), OverlayMessage::Unrecognized);
    }

    #[test]
    fn parse_peer_lookup_round_trip() {
        let req = encode_peer_lookup_request("g1", "alice");
        assert_eq!(parse(&req), OverlayMessage::PeerLookupRequest { group_id: "g1".into(), user_id: "alice".into() });
        let resp = encode_peer_lookup_response("g1", "alice");
        assert_eq!(parse(&resp), OverlayMessage::PeerLookupResponse { group_id: "g1".into(), user_id: "alice".into() });
    }

    #[test]
    fn peer_lookup_request_for_disallowed_group_is_dropped() {
        let relay = Relay::new(7420, 20, 18, vec!["g1".into()]);
        let from: SocketAddr = "10.0.0.5:9000".parse().unwrap();
        let req = encode_peer_lookup_request("g2", "alice");
        assert_eq!(relay.handle_datagram(from, &req), None);
        assert!(relay.clients.read().is_empty());
    }

    #[test]
    fn peer_lookup_request_for_allowed_group_is_served() {
        let relay = Relay::new(7420, 20, 18, vec!["g1".into()]);
        let responder: SocketAddr = "10.0.0.5:9000".parse().unwrap();
        let requester: SocketAddr = "10.0.0.6:9001".parse().unwrap();

        let response = encode_peer_lookup_response("g1", "alice");
        assert_eq!(relay.handle_datagram(responder, &response), None);

        let req = encode_peer_lookup_request("g1", "alice");
        let reply = relay.handle_datagram(requester, &req);
        assert_eq!(reply, Some((requester, encode_peer_lookup_response("g1", "alice"))));
    }

    #[test]
    fn empty_allow_list_serves_every_group() {
        let relay = Relay::new(7420, 20, 18, vec![]);
        let from: SocketAddr = "10.0.0.5:9000".parse().unwrap();
        let response = encode_peer_lookup_response("any-group", "alice");
        assert_eq!(relay.handle_datagram(from, &response), None);
        assert!(relay.check_group_allowed("any-group").is_ok());
    }

    #[test]
    fn accepts_below_redirect_threshold() {
        let relay = Relay::new(7420, 20, 18, vec![]);
        for _ in 0..17 {
            relay.record_connect();
        }
        assert_eq!(relay.capacity_decision(), CapacityDecision::Accept);
    }

    #[test]
    fn redirects_in_the_threshold_band_when_alternative_exists() {
        let relay = Relay::new(7420, 20, 18, vec![]);
        for _ in 0..18 {
            relay.record_connect();
        }
        let peer: SocketAddr = "10.0.0.2:7420".parse().unwrap();
        relay.peers.write().insert(peer, PeerRecord { active_conns: 10, port: 7420, last_seen: Instant::now() });
        assert_eq!(relay.capacity_decision(), CapacityDecision::Redirect(peer));
    }

    #[test]
    fn accepts_at_threshold_with_no_alternative_known() {
        let relay = Relay::new(7420, 20, 18, vec![]);
        for _ in 0..19 {
            relay.record_connect();
        }
        assert_eq!(relay.capacity_decision(), CapacityDecision::Accept);
    }

    #[test]
    fn peer_records_expire_after_ttl() {
        let relay = Relay::new(7420, 20, 18, vec![]);
        let peer: SocketAddr = "10.0.0.2:7420".parse().unwrap();
        relay.peers.write().insert(
            peer,
            PeerRecord {
                active_conns: 10,
                port: 7420,
                last_seen: Instant::now() - PEER_RECORD_TTL - Duration::from_secs(1),
            },
        );
        assert_eq!(relay.prune_peers(), 1);
        assert!(relay.peers.read().is_empty());
    }
}
