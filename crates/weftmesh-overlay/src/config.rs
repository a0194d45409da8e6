//! weftmesh-overlay configuration

use clap::Parser;

/// Overlay Relay daemon (C9): UDP load-broadcast, redirect, and
/// shutdown-migration service for syncshell connection overflow.
#[derive(Parser, Debug, Clone)]
#[command(name = "weftmesh-overlay")]
#[command(author, version, about, long_about = None)]
pub struct Config {
    /// UDP bind address for relay protocol traffic.
    #[arg(short, long, default_value = "0.0.0.0:7420")]
    pub listen: String,

    /// Comma-separated syncshell group ids this relay serves. Empty means
    /// "serve every group" (no allow-list enforcement).
    #[arg(long, value_delimiter = ',')]
    pub allowed_groups: Vec<String>,

    /// Seed peer relay addresses to load-broadcast to on startup, in
    /// addition to any peer discovered dynamically.
    #[arg(long, value_delimiter = ',')]
    pub seed_peers: Vec<String>,

    /// Soft connection cap before redirect/reject policy kicks in.
    #[arg(long, default_value = "20")]
    pub soft_cap: u16,

    /// Load at or above which this relay starts looking for somewhere to
    /// redirect new connections.
    #[arg(long, default_value = "18")]
    pub redirect_threshold: u16,
}

impl Config {
    /// Parse and lightly validate CLI-sourced configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.redirect_threshold > self.soft_cap {
            anyhow::bail!(
                "redirect_threshold ({}) must not exceed soft_cap ({})",
                self.redirect_threshold,
                self.soft_cap
            );
        }
        Ok(())
    }
}
