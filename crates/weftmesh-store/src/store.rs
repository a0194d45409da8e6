//! Deduplicated Content Store (C7): content-addressed asset and config blobs
//! with refcounts, per-member manifests binding assets to configs, and
//! package assembly for a requesting recipient (§4.7).

use crate::error::{Result, StoreError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use weftmesh_core::canonical::canonical_json_value_bytes;
use weftmesh_core::types::{ConfigBlob, ConfigKind, Manifest, ManifestAssociation, Package, PackageAsset};

/// A manifest not refreshed within this age is eligible for eviction during
/// periodic maintenance (§4.7, §5).
pub const MANIFEST_STALE_AGE: Duration = Duration::from_secs(24 * 60 * 60);

fn now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Write `bytes` to `path` via temp-file + rename, so readers never observe
/// a partial write (§6 on-disk layout).
fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let tmp = dir.join(format!(
        ".{}.tmp",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("blob")
    ));
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)
}

/// Aggregate storage counters, serialized to `storage-stats.json` and
/// surfaced by the HTTP stats endpoint (§6).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StorageStats {
    pub asset_blobs: usize,
    pub config_blobs: usize,
    pub manifests: usize,
    pub total_bytes: u64,
}

struct StoreState {
    asset_refs: HashMap<String, u64>,
    config_refs: HashMap<String, u64>,
    manifests: HashMap<String, Manifest>,
}

/// Content-addressed deduplicating store (§4.7).
///
/// Ingest and eviction take the write lock; `package` reads take the shared
/// lock; refcount mutation and the file operation for a given hash happen
/// while that same lock is held, so the two never race (§4.7 Concurrency).
pub struct Store {
    root: PathBuf,
    state: RwLock<StoreState>,
}

impl Store {
    /// Open (creating if needed) the on-disk layout rooted at `root`, and
    /// load existing ref tables and manifests into memory.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("content"))?;
        fs::create_dir_all(root.join("configs"))?;
        fs::create_dir_all(root.join("manifests"))?;

        let asset_refs = read_json_or_default(&root.join("asset-refs.json"))?;
        let config_refs = read_json_or_default(&root.join("config-refs.json"))?;

        let mut manifests = HashMap::new();
        for entry in fs::read_dir(root.join("manifests"))? {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let bytes = fs::read(&path)?;
            let manifest: Manifest = serde_json::from_slice(&bytes)?;
            manifests.insert(manifest.peer_id.to_string(), manifest);
        }

        Ok(Self {
            root,
            state: RwLock::new(StoreState { asset_refs, config_refs, manifests }),
        })
    }

    fn content_path(&self, hash: &str) -> PathBuf {
        self.root.join("content").join(hash)
    }

    fn config_path(&self, hash: &str) -> PathBuf {
        self.root.join("configs").join(format!("{hash}.json"))
    }

    fn manifest_path(&self, peer_id: &str) -> PathBuf {
        self.root.join("manifests").join(format!("{peer_id}.json"))
    }

    fn save_refs(&self, state: &StoreState) -> Result<()> {
        atomic_write(
            &self.root.join("asset-refs.json"),
            &serde_json::to_vec(&state.asset_refs)?,
        )?;
        atomic_write(
            &self.root.join("config-refs.json"),
            &serde_json::to_vec(&state.config_refs)?,
        )?;
        Ok(())
    }

    /// Ingest one member's assets and configs (§4.7 Ingest). `assets` pairs
    /// each asset's manifest path with its bytes; `configs` holds at most one
    /// blob per [`ConfigKind`]. Every association in the resulting manifest
    /// carries the same `config_hashes` map, since configs are member-wide.
    pub fn process_player(
        &self,
        peer_id: &str,
        assets: &[(String, Vec<u8>)],
        configs: &BTreeMap<ConfigKind, serde_json::Value>,
    ) -> Result<Manifest> {
        let mut state = self.state.write();
        let at = now();

        let mut config_hashes = BTreeMap::new();
        for (kind, data) in configs {
            if data.is_null() {
                continue;
            }
            let canonical = canonical_json_value_bytes(data).map_err(|e| {
                StoreError::Io(std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))
            })?;
            let hash = sha256_hex(&canonical);
            let refs = state.config_refs.entry(hash.clone()).or_insert(0);
            if *refs == 0 {
                let blob = ConfigBlob { kind: *kind, data: data.clone(), stored_at: at };
                atomic_write(&self.config_path(&hash), &serde_json::to_vec(&blob)?)?;
            }
            *refs += 1;
            config_hashes.insert(*kind, hash);
        }

        let mut associations = Vec::with_capacity(assets.len());
        let mut total_size = 0u64;
        for (path, bytes) in assets {
            let hash = sha256_hex(bytes);
            let refs = state.asset_refs.entry(hash.clone()).or_insert(0);
            if *refs == 0 {
                atomic_write(&self.content_path(&hash), bytes)?;
            }
            *refs += 1;
            total_size += bytes.len() as u64;
            associations.push(ManifestAssociation {
                asset_hash: hash,
                asset_path: path.clone(),
                config_hashes: config_hashes.clone(),
            });
        }

        let manifest = Manifest {
            peer_id: weftmesh_core::types::PeerId(parse_peer_id(peer_id)),
            associations,
            updated_at: at,
            total_size,
        };
        atomic_write(&self.manifest_path(peer_id), &serde_json::to_vec(&manifest)?)?;
        state.manifests.insert(peer_id.to_string(), manifest.clone());
        self.save_refs(&state)?;
        Ok(manifest)
    }

    /// Assemble the package a client should receive for `target_peer_id`
    /// (§4.7 Serve).
    pub fn package(&self, target_peer_id: &str) -> Result<Package> {
        let state = self.state.read();
        let manifest = state
            .manifests
            .get(target_peer_id)
            .ok_or_else(|| StoreError::NoSuchManifest(target_peer_id.to_string()))?;

        let mut assets = Vec::with_capacity(manifest.associations.len());
        let mut configs: BTreeMap<ConfigKind, serde_json::Value> = BTreeMap::new();

        for assoc in &manifest.associations {
            let path = self.content_path(&assoc.asset_hash);
            let bytes = fs::read(&path).map_err(|_| {
                StoreError::MissingBlob(assoc.asset_hash.clone(), target_peer_id.to_string())
            })?;
            for (kind, hash) in &assoc.config_hashes {
                if configs.contains_key(kind) {
                    continue;
                }
                let config_path = self.config_path(hash);
                if let Ok(raw) = fs::read(&config_path) {
                    if let Ok(blob) = serde_json::from_slice::<ConfigBlob>(&raw) {
                        configs.insert(*kind, blob.data);
                    }
                }
            }
            assets.push(PackageAsset {
                path: assoc.asset_path.clone(),
                hash: assoc.asset_hash.clone(),
                bytes,
                config_hashes: assoc.config_hashes.clone(),
            });
        }

        Ok(Package { assets, configs, package_ts: now(), last_modified: manifest.updated_at })
    }

    /// A manifest's `updated_at`, for conditional-retrieval support (ETag /
    /// `Last-Modified`) without assembling the whole package.
    pub fn last_modified(&self, peer_id: &str) -> Option<u64> {
        self.state.read().manifests.get(peer_id).map(|m| m.updated_at)
    }

    /// Remove a member's manifest, decrementing refs for every hash it held
    /// and deleting any blob whose refcount reaches zero (§4.7 Eviction).
    pub fn remove_player(&self, peer_id: &str) -> Result<()> {
        let mut state = self.state.write();
        let Some(manifest) = state.manifests.remove(peer_id) else {
            return Ok(());
        };

        let mut seen_config_hashes = std::collections::HashSet::new();
        for assoc in &manifest.associations {
            if let Some(refs) = state.asset_refs.get_mut(&assoc.asset_hash) {
                *refs = refs.saturating_sub(1);
                if *refs == 0 {
                    let _ = fs::remove_file(self.content_path(&assoc.asset_hash));
                    state.asset_refs.remove(&assoc.asset_hash);
                }
            }
            for hash in assoc.config_hashes.values() {
                if !seen_config_hashes.insert(hash.clone()) {
                    continue;
                }
                if let Some(refs) = state.config_refs.get_mut(hash) {
                    *refs = refs.saturating_sub(1);
                    if *refs == 0 {
                        let _ = fs::remove_file(self.config_path(hash));
                        state.config_refs.remove(hash);
                    }
                }
            }
        }

        let _ = fs::remove_file(self.manifest_path(peer_id));
        self.save_refs(&state)?;
        Ok(())
    }

    /// Evict every manifest older than [`MANIFEST_STALE_AGE`], returning the
    /// evicted peer ids.
    pub fn evict_stale(&self) -> Result<Vec<String>> {
        self.evict_stale_older_than(MANIFEST_STALE_AGE)
    }

    /// Evict every manifest older than `max_age`, returning the evicted peer
    /// ids. Lets callers (e.g. the daemon's configured
    /// `manifest_stale_secs`) override the default staleness age from §4.7.
    pub fn evict_stale_older_than(&self, max_age: Duration) -> Result<Vec<String>> {
        let stale: Vec<String> = {
            let state = self.state.read();
            let at = now();
            state
                .manifests
                .iter()
                .filter(|(_, m)| at.saturating_sub(m.updated_at) > max_age.as_secs())
                .map(|(peer_id, _)| peer_id.clone())
                .collect()
        };
        for peer_id in &stale {
            self.remove_player(peer_id)?;
        }
        Ok(stale)
    }

    /// Delete any on-disk blob whose hash has no (or a zero) refcount entry
    /// (orphan reclamation, §4.7).
    pub fn sweep_orphans(&self) -> Result<Vec<String>> {
        let mut removed = Vec::new();
        let state = self.state.read();

        for dir_name in ["content", "configs"] {
            let dir = self.root.join(dir_name);
            let Ok(entries) = fs::read_dir(&dir) else { continue };
            for entry in entries.flatten() {
                let path = entry.path();
                let stem = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
                if stem.is_empty() || stem.starts_with('.') {
                    continue;
                }
                let refs = if dir_name == "content" { &state.asset_refs } else { &state.config_refs };
                if refs.get(&stem).copied().unwrap_or(0) == 0 {
                    if fs::remove_file(&path).is_ok() {
                        removed.push(stem);
                    }
                }
            }
        }
        Ok(removed)
    }

    /// Current storage counters, persisted to `storage-stats.json` as a side
    /// effect (§6 on-disk layout).
    pub fn stats(&self) -> Result<StorageStats> {
        let state = self.state.read();
        let total_bytes: u64 = state.manifests.values().map(|m| m.total_size).sum();
        let stats = StorageStats {
            asset_blobs: state.asset_refs.len(),
            config_blobs: state.config_refs.len(),
            manifests: state.manifests.len(),
            total_bytes,
        };
        atomic_write(&self.root.join("storage-stats.json"), &serde_json::to_vec(&stats)?)?;
        Ok(stats)
    }
}

fn read_json_or_default<T: Default + serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    match fs::read(path) {
        Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(T::default()),
        Err(e) => Err(e.into()),
    }
}

fn parse_peer_id(s: &str) -> weftmesh_core::types::Bytes32 {
    let mut out = [0u8; 32];
    if let Ok(bytes) = hex::decode(s) {
        let n = bytes.len().min(32);
        out[..n].copy_from_slice(&bytes[..n]);
    } else {
        let mut hasher = Sha256::new();
        hasher.update(s.as_bytes());
        out.copy_from_slice(&hasher.finalize());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn configs_with(kind: ConfigKind, data: serde_json::Value) -> BTreeMap<ConfigKind, serde_json::Value> {
        let mut m = BTreeMap::new();
        m.insert(kind, data);
        m
    }

    #[test]
    fn ingest_dedupes_identical_bytes_across_players() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let red = configs_with(ConfigKind::Appearance, serde_json::json!({"color": "red"}));
        store
            .process_player("p1", &[("mod.bin".into(), b"same-bytes".to_vec())], &red)
            .unwrap();
        store
            .process_player("p2", &[("mod.bin".into(), b"same-bytes".to_vec())], &red)
            .unwrap();

        let hash = sha256_hex(b"same-bytes");
        assert_eq!(store.state.read().asset_refs.get(&hash), Some(&2));
        assert_eq!(
            fs::read_dir(dir.path().join("content")).unwrap().count(),
            1
        );
    }

    #[test]
    fn remove_player_decrements_refs_and_deletes_at_zero() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let cfg = configs_with(ConfigKind::Appearance, serde_json::json!({"x": 1}));

        store.process_player("p1", &[("a.bin".into(), b"bytes".to_vec())], &cfg).unwrap();
        store.process_player("p2", &[("a.bin".into(), b"bytes".to_vec())], &cfg).unwrap();
        store.remove_player("p1").unwrap();

        let hash = sha256_hex(b"bytes");
        assert_eq!(store.state.read().asset_refs.get(&hash), Some(&1));
        assert!(store.content_path(&hash).exists());

        store.remove_player("p2").unwrap();
        assert!(!store.content_path(&hash).exists());
    }

    #[test]
    fn package_returns_missing_blob_error_when_content_deleted() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let cfg = configs_with(ConfigKind::Appearance, serde_json::json!({"x": 1}));
        store.process_player("p1", &[("a.bin".into(), b"bytes".to_vec())], &cfg).unwrap();

        let hash = sha256_hex(b"bytes");
        fs::remove_file(store.content_path(&hash)).unwrap();

        assert!(matches!(store.package("p1"), Err(StoreError::MissingBlob(_, _))));
    }

    #[test]
    fn reingesting_same_data_doubles_refs() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        let cfg = configs_with(ConfigKind::Appearance, serde_json::json!({"x": 1}));

        store.process_player("p1", &[("a.bin".into(), b"bytes".to_vec())], &cfg).unwrap();
        store.process_player("p1", &[("a.bin".into(), b"bytes".to_vec())], &cfg).unwrap();

        let hash = sha256_hex(b"bytes");
        assert_eq!(store.state.read().asset_refs.get(&hash), Some(&2));

        store.remove_player("p1").unwrap();
        assert_eq!(store.state.read().asset_refs.get(&hash), Some(&1));
    }

    #[test]
    fn sweep_orphans_removes_zero_ref_blobs() {
        let dir = tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        fs::write(dir.path().join("content").join("deadbeef"), b"orphan").unwrap();

        let removed = store.sweep_orphans().unwrap();
        assert_eq!(removed, vec!["deadbeef".to_string()]);
        assert!(!dir.path().join("content").join("deadbeef").exists());
    }
}
