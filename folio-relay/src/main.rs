//! Folio relay: room relay for collaborative section editing.
//!
//! Usage: `folio-relay [BIND_ADDR]`
//!
//! `FOLIO_RELAY_ADDR` sets the bind address when no argument is given
//! (default `127.0.0.1:9090`). `FOLIO_RELAY_TOKEN`, when set, is the bearer
//! token every client must present. Log output follows `RUST_LOG`.

use std::env;

use folio_collab::{RelayConfig, RelayServer};
use log::info;

fn config_from_env() -> RelayConfig {
    let defaults = RelayConfig::default();
    let bind_addr = env::args()
        .nth(1)
        .or_else(|| env::var("FOLIO_RELAY_ADDR").ok())
        .unwrap_or(defaults.bind_addr.clone());
    let auth_token = env::var("FOLIO_RELAY_TOKEN").ok().filter(|t| !t.is_empty());

    RelayConfig {
        bind_addr,
        auth_token,
        ..defaults
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let config = config_from_env();
    if config.auth_token.is_none() {
        log::warn!("FOLIO_RELAY_TOKEN is not set; accepting every client");
    }

    info!("Starting Folio relay on {}...", config.bind_addr);
    let relay = RelayServer::new(config).bind().await?;

    tokio::signal::ctrl_c().await?;
    info!("Interrupted, shutting down");

    let stats = relay.stats().await;
    info!(
        "Served {} connections, relayed {} frames ({} bytes)",
        stats.total_connections, stats.total_frames, stats.total_bytes
    );
    relay.shutdown().await;
    Ok(())
}
