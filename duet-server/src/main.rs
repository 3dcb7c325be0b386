//! Duet relay — standalone WebSocket server for collaborative sessions.
//!
//! Configuration comes from the environment:
//!
//! - `DUET_BIND_ADDR` (default `127.0.0.1:9090`)
//! - `DUET_MAX_PEERS` per room (default 100)
//! - `DUET_BROADCAST_CAPACITY` per room (default 256)
//! - `DUET_HEARTBEAT_SECS` (default 30)
//!
//! Logging goes through `env_logger`; set `RUST_LOG=info` to see joins and
//! leaves, `debug` for handshakes.

use std::str::FromStr;

use duet_collab::server::{ServerConfig, ServerError, SyncServer};
use log::{info, warn};

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!("Ignoring invalid {key}={raw:?}");
            default
        }),
        Err(_) => default,
    }
}

fn config_from_env() -> ServerConfig {
    let defaults = ServerConfig::default();
    ServerConfig {
        bind_addr: env_or("DUET_BIND_ADDR", defaults.bind_addr),
        max_peers_per_room: env_or("DUET_MAX_PEERS", defaults.max_peers_per_room),
        broadcast_capacity: env_or("DUET_BROADCAST_CAPACITY", defaults.broadcast_capacity),
        heartbeat_interval_secs: env_or("DUET_HEARTBEAT_SECS", defaults.heartbeat_interval_secs),
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    env_logger::init();

    let config = config_from_env();
    info!(
        "Starting Duet relay on {} (max {} peers per room)",
        config.bind_addr, config.max_peers_per_room
    );
    SyncServer::new(config).run().await
}
