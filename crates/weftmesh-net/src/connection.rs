//! Connection Manager (C4): tracks one logical channel per `(group, peer)`,
//! preventing duplicate/racing channel creation and honoring in-flight
//! transfer safety on replacement (§4.4).
//!
//! The "robust/libwebrtc/mesh connection variant" hierarchy the design notes
//! (§9) call out is replaced here by a single capability trait, [`Channel`]:
//! the manager only ever needs to send bytes through a channel and dispose
//! of it, everything else (libwebrtc data channel, QUIC stream, mesh relay
//! hop) is the concrete implementation's business.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Pending-handshake reap timeout (§5).
pub const T_HANDSHAKE: Duration = Duration::from_secs(60);
/// A transferring record counts as live as long as a send happened this recently.
pub const T_XFER: Duration = Duration::from_secs(5);

/// The logical identity of one connection-manager slot: the group's host
/// channel (`peer_tag: None`) or a specific peer's channel within the group.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub group_id: String,
    pub peer_tag: Option<String>,
}

impl ChannelKey {
    pub fn host(group_id: impl Into<String>) -> Self {
        Self { group_id: group_id.into(), peer_tag: None }
    }

    pub fn peer(group_id: impl Into<String>, peer_tag: impl Into<String>) -> Self {
        Self { group_id: group_id.into(), peer_tag: Some(peer_tag.into()) }
    }
}

impl fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.peer_tag {
            None => write!(f, "{}", self.group_id),
            Some(tag) => write!(f, "{}_{}", self.group_id, tag),
        }
    }
}

/// The capability interface every concrete channel implementation (libwebrtc
/// data channel, QUIC stream, mesh-relayed hop) must expose to the manager.
pub trait Channel: Send + Sync {
    /// Send bytes on this channel.
    fn send(&self, bytes: Bytes) -> std::result::Result<(), String>;
    /// Tear the channel down. Must be safe to call more than once.
    fn dispose(&self);
}

/// Lifecycle state of one connection record (§4.4).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    Establishing,
    Connected,
    Transferring,
    Closing,
    Dead,
}

impl ChannelState {
    fn is_live(self) -> bool {
        matches!(self, Self::Establishing | Self::Connected | Self::Transferring)
    }
}

struct ConnectionRecord {
    channel: Arc<dyn Channel>,
    created_at: Instant,
    state: ChannelState,
    last_send_at: Instant,
    in_flight_bytes: u64,
}

/// Context a caller needs to attempt reconnection after a send failure.
#[derive(Clone, Debug)]
pub struct RecoveryContext {
    pub group_id: String,
    pub known_relays: Vec<String>,
    pub group_key: Vec<u8>,
}

/// Observable transitions the manager fires for event subscribers (§4.4, §9).
#[derive(Clone, Debug)]
pub enum ConnectionEvent {
    /// A caller attempted to create a channel for a key that already has a
    /// live record; the existing handle was returned instead.
    AttemptedDuplicate(ChannelKey),
    /// A pending-handshake record was reaped after `T_HANDSHAKE`.
    HandshakeFailed(ChannelKey),
    /// A `connected` record's send failed and it transitioned to `dead`.
    Disconnected(ChannelKey, RecoveryContext),
    /// A replacement was rejected because the current record is still live.
    ReplaceRejected(ChannelKey),
    /// A record transitioned to `dead` and was replaced.
    Replaced(ChannelKey),
    /// A record was closed via `disconnect`.
    Closed(ChannelKey),
}

/// Outcome of [`ConnectionManager::create_or_get`].
pub enum CreateOutcome {
    Created(Arc<dyn Channel>),
    ExistingReturned(Arc<dyn Channel>),
}

/// Outcome of [`ConnectionManager::replace`].
pub enum ReplaceOutcome {
    Replaced,
    /// Rejected: the caller's `new_channel` was disposed immediately and the
    /// existing channel is returned, unchanged (§4.4 Conflict semantics).
    Rejected(Arc<dyn Channel>),
}

/// Outcome of [`ConnectionManager::disconnect`].
#[derive(Debug, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Closed,
    /// Deferred: the record is `transferring` or `establishing`; retried at
    /// the next [`ConnectionManager::maintenance_tick`].
    Deferred,
    NotFound,
}

/// Tracks exactly one record per [`ChannelKey`], serialized by a single
/// mutex per §4.4/§5 ("all create/replace/close transitions are serialized
/// by a single mutex per manager").
pub struct ConnectionManager {
    records: Mutex<HashMap<ChannelKey, ConnectionRecord>>,
    pending_disconnects: Mutex<HashSet<ChannelKey>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ConnectionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                records: Mutex::new(HashMap::new()),
                pending_disconnects: Mutex::new(HashSet::new()),
                events: tx,
            },
            rx,
        )
    }

    fn emit(&self, event: ConnectionEvent) {
        // Handler callbacks must not run under our mutex (§4.4 concurrency);
        // this channel send never blocks and never invokes user code itself.
        let _ = self.events.send(event);
    }

    /// Create a channel for `key` unless a live record already exists, in
    /// which case the existing handle is returned and an
    /// `AttemptedDuplicate` event is fired (§4.4 step 2).
    ///
    /// `factory` is only invoked when no live record exists. Callers are
    /// expected to register their data/connect/disconnect handlers on the
    /// channel *inside* `factory`, before it returns — the manager stores
    /// the record only after `factory` completes, matching the "register
    /// handlers before storing the record" ordering in §4.4 step 3.
    pub fn create_or_get(
        &self,
        key: &ChannelKey,
        factory: impl FnOnce() -> Arc<dyn Channel>,
    ) -> CreateOutcome {
        let mut records = self.records.lock();
        if let Some(rec) = records.get(key) {
            if rec.state.is_live() {
                self.emit(ConnectionEvent::AttemptedDuplicate(key.clone()));
                debug!(%key, "connection manager: attempted duplicate channel creation");
                return CreateOutcome::ExistingReturned(rec.channel.clone());
            }
        }

        let channel = factory();
        let now = Instant::now();
        records.insert(
            key.clone(),
            ConnectionRecord {
                channel: channel.clone(),
                created_at: now,
                state: ChannelState::Establishing,
                last_send_at: now,
                in_flight_bytes: 0,
            },
        );
        CreateOutcome::Created(channel)
    }

    /// Replace the record at `key` with `new_channel`. Only proceeds if the
    /// current record is `dead` or absent; otherwise `new_channel` is
    /// disposed immediately and the existing handle is returned (§4.4
    /// replacement contract).
    pub fn replace(&self, key: &ChannelKey, new_channel: Arc<dyn Channel>) -> ReplaceOutcome {
        let mut records = self.records.lock();
        if let Some(rec) = records.get(key) {
            if rec.state.is_live() {
                new_channel.dispose();
                self.emit(ConnectionEvent::ReplaceRejected(key.clone()));
                warn!(%key, "connection manager: replacement rejected, current record is still live");
                return ReplaceOutcome::Rejected(rec.channel.clone());
            }
        }
        let now = Instant::now();
        records.insert(
            key.clone(),
            ConnectionRecord {
                channel: new_channel,
                created_at: now,
                state: ChannelState::Establishing,
                last_send_at: now,
                in_flight_bytes: 0,
            },
        );
        self.emit(ConnectionEvent::Replaced(key.clone()));
        ReplaceOutcome::Replaced
    }

    /// Mark a record `connected` once its handshake completes.
    pub fn mark_connected(&self, key: &ChannelKey) {
        if let Some(rec) = self.records.lock().get_mut(key) {
            if rec.state == ChannelState::Establishing {
                rec.state = ChannelState::Connected;
            }
        }
    }

    /// Record that `bytes_len` bytes are about to be sent, moving a
    /// `connected` record into `transferring`.
    pub fn record_send_start(&self, key: &ChannelKey, bytes_len: u64) {
        if let Some(rec) = self.records.lock().get_mut(key) {
            rec.last_send_at = Instant::now();
            rec.in_flight_bytes += bytes_len;
            if rec.state == ChannelState::Connected {
                rec.state = ChannelState::Transferring;
            }
        }
    }

    /// Record that a previously-started send of `bytes_len` bytes completed.
    pub fn record_send_complete(&self, key: &ChannelKey, bytes_len: u64) {
        if let Some(rec) = self.records.lock().get_mut(key) {
            rec.in_flight_bytes = rec.in_flight_bytes.saturating_sub(bytes_len);
            if rec.in_flight_bytes == 0
                && rec.last_send_at.elapsed() >= T_XFER
                && rec.state == ChannelState::Transferring
            {
                rec.state = ChannelState::Connected;
            }
        }
    }

    /// Record a send failure on a `connected` (or `transferring`) channel:
    /// transitions it to `dead` and fires `Disconnected` with recovery
    /// context (§4.4 failure semantics).
    pub fn record_send_failure(&self, key: &ChannelKey, recovery: RecoveryContext) {
        let disposed = {
            let mut records = self.records.lock();
            match records.get_mut(key) {
                Some(rec) => {
                    rec.state = ChannelState::Dead;
                    Some(rec.channel.clone())
                }
                None => None,
            }
        };
        if let Some(channel) = disposed {
            channel.dispose();
            self.emit(ConnectionEvent::Disconnected(key.clone(), recovery));
        }
    }

    /// Close the channel at `key`. Deferred while the record is
    /// `transferring` or `establishing` (§4.4 close contract); retried by
    /// [`maintenance_tick`](Self::maintenance_tick).
    pub fn disconnect(&self, key: &ChannelKey) -> DisconnectOutcome {
        let mut records = self.records.lock();
        match records.get(key) {
            None => DisconnectOutcome::NotFound,
            Some(rec) if rec.state == ChannelState::Transferring || rec.state == ChannelState::Establishing => {
                self.pending_disconnects.lock().insert(key.clone());
                DisconnectOutcome::Deferred
            }
            Some(_) => {
                let rec = records.remove(key).expect("checked Some above");
                rec.channel.dispose();
                self.emit(ConnectionEvent::Closed(key.clone()));
                DisconnectOutcome::Closed
            }
        }
    }

    /// Periodic maintenance: reap expired handshakes, retire idle
    /// `transferring` records back to `connected`, and retry deferred
    /// disconnects (§5 timeouts).
    pub fn maintenance_tick(&self) {
        let mut to_reap = Vec::new();
        {
            let mut records = self.records.lock();
            for (key, rec) in records.iter_mut() {
                if rec.state == ChannelState::Establishing && rec.created_at.elapsed() >= T_HANDSHAKE {
                    to_reap.push(key.clone());
                }
                if rec.state == ChannelState::Transferring
                    && rec.in_flight_bytes == 0
                    && rec.last_send_at.elapsed() >= T_XFER
                {
                    rec.state = ChannelState::Connected;
                }
            }
            for key in &to_reap {
                if let Some(rec) = records.remove(key) {
                    rec.channel.dispose();
                }
            }
        }
        for key in to_reap {
            self.emit(ConnectionEvent::HandshakeFailed(key));
        }

        let pending: Vec<ChannelKey> = self.pending_disconnects.lock().iter().cloned().collect();
        for key in pending {
            if self.disconnect(&key) != DisconnectOutcome::Deferred {
                self.pending_disconnects.lock().remove(&key);
            }
        }
    }

    /// Whether the manager holds a live record for `key`.
    pub fn is_live(&self, key: &ChannelKey) -> bool {
        self.records.lock().get(key).is_some_and(|r| r.state.is_live())
    }

    pub fn state(&self, key: &ChannelKey) -> Option<ChannelState> {
        self.records.lock().get(key).map(|r| r.state)
    }

    pub fn handle(&self, key: &ChannelKey) -> Option<Arc<dyn Channel>> {
        self.records.lock().get(key).map(|r| r.channel.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct TestChannel {
        disposed: Arc<AtomicBool>,
        instance: u32,
    }

    impl Channel for TestChannel {
        fn send(&self, _bytes: Bytes) -> std::result::Result<(), String> {
            Ok(())
        }
        fn dispose(&self) {
            self.disposed.store(true, Ordering::SeqCst);
        }
    }

    #[test]
    fn duplicate_creation_returns_existing() {
        let (mgr, _rx) = ConnectionManager::new();
        let key = ChannelKey::host("group-a");
        let counter = AtomicU32::new(0);
        let disposed = Arc::new(AtomicBool::new(false));

        let make = |counter: &AtomicU32, disposed: &Arc<AtomicBool>| -> Arc<dyn Channel> {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Arc::new(TestChannel { disposed: disposed.clone(), instance: n })
        };

        let first = match mgr.create_or_get(&key, || make(&counter, &disposed)) {
            CreateOutcome::Created(c) => c,
            CreateOutcome::ExistingReturned(_) => panic!("expected creation"),
        };
        let second = match mgr.create_or_get(&key, || make(&counter, &disposed)) {
            CreateOutcome::ExistingReturned(c) => c,
            CreateOutcome::Created(_) => panic!("expected duplicate suppression"),
        };
        assert_eq!(Arc::as_ptr(&first) as *const (), Arc::as_ptr(&second) as *const ());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn replace_rejected_while_transferring() {
        let (mgr, _rx) = ConnectionManager::new();
        let key = ChannelKey::peer("group-a", "peer-1");
        let disposed_old = Arc::new(AtomicBool::new(false));
        let old: Arc<dyn Channel> = Arc::new(TestChannel { disposed: disposed_old.clone(), instance: 0 });
        mgr.create_or_get(&key, || old.clone());
        mgr.mark_connected(&key);
        mgr.record_send_start(&key, 1024);
        assert_eq!(mgr.state(&key), Some(ChannelState::Transferring));

        let disposed_new = Arc::new(AtomicBool::new(false));
        let candidate: Arc<dyn Channel> = Arc::new(TestChannel { disposed: disposed_new.clone(), instance: 1 });
        match mgr.replace(&key, candidate) {
            ReplaceOutcome::Rejected(_) => {}
            ReplaceOutcome::Replaced => panic!("replacement should have been rejected"),
        }
        assert!(disposed_new.load(Ordering::SeqCst));
        assert!(!disposed_old.load(Ordering::SeqCst));
    }

    #[test]
    fn replace_succeeds_once_dead() {
        let (mgr, _rx) = ConnectionManager::new();
        let key = ChannelKey::host("group-a");
        let old: Arc<dyn Channel> = Arc::new(TestChannel { disposed: Arc::new(AtomicBool::new(false)), instance: 0 });
        mgr.create_or_get(&key, || old);
        mgr.record_send_failure(
            &key,
            RecoveryContext { group_id: "group-a".into(), known_relays: vec![], group_key: vec![] },
        );
        assert_eq!(mgr.state(&key), Some(ChannelState::Dead));

        let new_channel: Arc<dyn Channel> = Arc::new(TestChannel { disposed: Arc::new(AtomicBool::new(false)), instance: 1 });
        match mgr.replace(&key, new_channel) {
            ReplaceOutcome::Replaced => {}
            ReplaceOutcome::Rejected(_) => panic!("replacement should have succeeded"),
        }
        assert_eq!(mgr.state(&key), Some(ChannelState::Establishing));
    }

    #[test]
    fn disconnect_deferred_while_establishing() {
        let (mgr, _rx) = ConnectionManager::new();
        let key = ChannelKey::host("group-a");
        let channel: Arc<dyn Channel> = Arc::new(TestChannel { disposed: Arc::new(AtomicBool::new(false)), instance: 0 });
        mgr.create_or_get(&key, || channel);
        assert_eq!(mgr.disconnect(&key), DisconnectOutcome::Deferred);
        assert!(mgr.is_live(&key));
    }

    #[test]
    fn disconnect_closes_connected_record() {
        let (mgr, _rx) = ConnectionManager::new();
        let key = ChannelKey::host("group-a");
        let disposed = Arc::new(AtomicBool::new(false));
        let channel: Arc<dyn Channel> = Arc::new(TestChannel { disposed: disposed.clone(), instance: 0 });
        mgr.create_or_get(&key, || channel);
        mgr.mark_connected(&key);
        assert_eq!(mgr.disconnect(&key), DisconnectOutcome::Closed);
        assert!(disposed.load(Ordering::SeqCst));
        assert!(!mgr.is_live(&key));
    }
}
