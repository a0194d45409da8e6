//! weftmesh-overlay - Overlay Relay daemon
//!
//! A single UDP socket serving the load-broadcast / redirect /
//! shutdown-migration / peer-lookup protocol of an allow-listed set of
//! syncshell groups.

use clap::Parser;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::interval;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};
use weftmesh_overlay::config::Config;
use weftmesh_overlay::relay::{encode_load_broadcast, encode_shutdown_migration, Relay, LOAD_BROADCAST_INTERVAL, PEER_RECORD_TTL};

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("weftmesh_overlay=info".parse().unwrap()))
        .init();

    let config = Config::parse();
    if let Err(e) = config.validate() {
        eprintln!("invalid configuration: {e}");
        return ExitCode::FAILURE;
    }

    info!("weftmesh-overlay v{} starting on {}", env!("CARGO_PKG_VERSION"), config.listen);
    if config.allowed_groups.is_empty() {
        info!("no group allow-list configured; serving every group");
    } else {
        info!(groups = ?config.allowed_groups, "serving allow-listed groups");
    }

    let socket = match UdpSocket::bind(&config.listen).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            eprintln!("failed to bind {}: {e}", config.listen);
            return ExitCode::FAILURE;
        }
    };
    let self_port = socket.local_addr().map(|a| a.port()).unwrap_or(0);

    let relay = Arc::new(Relay::new(self_port, config.soft_cap, config.redirect_threshold, config.allowed_groups.clone()));

    let seed_peers: Vec<SocketAddr> = config
        .seed_peers
        .iter()
        .filter_map(|s| match s.parse() {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!(peer = %s, error = %e, "ignoring unparsable seed peer address");
                None
            }
        })
        .collect();

    spawn_broadcast_task(socket.clone(), relay.clone(), seed_peers.clone());
    spawn_prune_task(relay.clone());
    spawn_recv_task(socket.clone(), relay.clone());

    tokio::signal::ctrl_c().await.ok();
    info!("shutting down, migrating known clients");

    if let Some(target) = relay.least_loaded_peer() {
        let msg = encode_shutdown_migration(&target.to_string());
        for client in relay.known_clients() {
            let _ = socket.send_to(&msg, client).await;
        }
    } else {
        warn!("no known peer to migrate clients to on shutdown");
    }

    ExitCode::SUCCESS
}

fn spawn_broadcast_task(socket: Arc<UdpSocket>, relay: Arc<Relay>, seed_peers: Vec<SocketAddr>) {
    tokio::spawn(async move {
        let mut ticker = interval(LOAD_BROADCAST_INTERVAL);
        loop {
            ticker.tick().await;
            let msg = encode_load_broadcast(relay.active_conns(), relay.self_port());
            for peer in &seed_peers {
                let _ = socket.send_to(&msg, peer).await;
            }
        }
    });
}

fn spawn_prune_task(relay: Arc<Relay>) {
    tokio::spawn(async move {
        let mut ticker = interval(PEER_RECORD_TTL / 2);
        loop {
            ticker.tick().await;
            let pruned = relay.prune_peers();
            if pruned > 0 {
                info!("pruned {pruned} expired peer records");
            }
        }
    });
}

fn spawn_recv_task(socket: Arc<UdpSocket>, relay: Arc<Relay>) {
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (len, from) = match socket.recv_from(&mut buf).await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(error = %e, "overlay: recv_from failed");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };
            if let Some((to, response)) = relay.handle_datagram(from, &buf[..len]) {
                let _ = socket.send_to(&response, to).await;
            }
        }
    });
}
