//! weftmeshd configuration

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// weftmeshd - weftmesh host daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "weftmeshd")]
#[command(about = "weftmesh host daemon: HTTP serving surface over the content store")]
pub struct Config {
    /// HTTP listen address.
    #[arg(short, long, default_value = "0.0.0.0:8787")]
    pub listen: SocketAddr,

    /// Data directory for the content store's on-disk layout.
    #[arg(short, long, default_value = "./data/weftmeshd")]
    pub data_dir: PathBuf,

    /// Optional password gate for the HTTP surface (also settable via
    /// `x-fyteclub-password` header or `password` query parameter per
    /// request).
    #[arg(long, env = "WEFTMESH_PASSWORD")]
    pub password: Option<String>,

    /// Manifest staleness age, in seconds, before periodic maintenance
    /// evicts a player's manifest.
    #[arg(long, default_value = "86400")]
    pub manifest_stale_secs: u64,

    /// Interval, in seconds, between refcount/orphan maintenance sweeps.
    #[arg(long, default_value = "300")]
    pub maintenance_interval_secs: u64,

    /// Default cache entry TTL, in seconds.
    #[arg(long, default_value = "300")]
    pub cache_ttl_secs: u64,

    /// Chunked pagination page size used when a request omits `limit`.
    #[arg(long, default_value = "50")]
    pub default_chunk_limit: usize,

    /// This node's own identity, used by the message dispatcher's own-origin
    /// filter (§4.5/§9) to drop control messages this node itself sent.
    #[arg(long, default_value = "host", env = "WEFTMESH_LOCAL_IDENTITY")]
    pub local_identity: String,
}

impl Config {
    /// Validate configuration and prepare the data directory.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.default_chunk_limit == 0 {
            anyhow::bail!("default_chunk_limit must be non-zero");
        }
        if let Some(password) = &self.password {
            if password.is_empty() {
                anyhow::bail!("password, if set, must not be empty");
            }
        }
        std::fs::create_dir_all(&self.data_dir)
            .map_err(|e| anyhow::anyhow!("cannot create data dir {}: {e}", self.data_dir.display()))?;
        Ok(())
    }
}
