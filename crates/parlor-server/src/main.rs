//! # parlor-server
//!
//! Realtime chat server binary: one WebSocket per client for live events,
//! a REST API for everything else, SQLite for durable state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use parlor_server::api::{self, AppState};
use parlor_server::config::ServerConfig;
use parlor_server::hub::Hub;
use parlor_server::presence::PresenceTracker;
use parlor_server::rate_limit::spawn_purge_task;
use parlor_server::registry::ConnectionRegistry;
use parlor_server::store::Store;
use parlor_shared::session::SessionKeys;
use parlor_store::Database;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,parlor_server=debug")),
        )
        .init();

    info!("Starting Parlor server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Open the database
    // -----------------------------------------------------------------------
    let db = Database::open_at(&config.database_path)?;
    // Nobody can be connected to a process that just started.
    let reset = db.reset_presence()?;
    if reset > 0 {
        info!(users = reset, "Cleared stale online flags");
    }
    let store = Store::new(db);

    // -----------------------------------------------------------------------
    // 4. Initialize subsystems
    // -----------------------------------------------------------------------
    let sessions = match config.session_signing_key.as_deref() {
        Some(hex_key) => SessionKeys::from_hex(hex_key, config.session_ttl())?,
        None => {
            warn!("SESSION_SIGNING_KEY not set, generated an ephemeral key (dev only)");
            SessionKeys::generate(config.session_ttl())
        }
    };

    let hub = Arc::new(Hub::new(
        store.clone(),
        sessions,
        PresenceTracker::new(store, config.retry_policy()),
        ConnectionRegistry::new(),
        config.hub_config(),
    ));

    let http_addr = config.http_addr;
    let app_state = AppState::new(Arc::clone(&hub), config);

    // -----------------------------------------------------------------------
    // 5. Spawn background tasks
    // -----------------------------------------------------------------------

    // Every 5 minutes, evict rate limit buckets idle for more than 10.
    spawn_purge_task(
        app_state.rate_limiter.clone(),
        Duration::from_secs(300),
        Duration::from_secs(600),
    );

    // -----------------------------------------------------------------------
    // 6. Run the HTTP server until it fails or Ctrl+C arrives
    // -----------------------------------------------------------------------
    tokio::select! {
        result = api::serve(app_state, http_addr) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                hub.shutdown().await;
                return Err(e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    hub.shutdown().await;
    // Let the last presence write-through tasks land.
    tokio::time::sleep(Duration::from_millis(250)).await;

    Ok(())
}
