//! # Roomcast Server
//!
//! Room-scoped realtime chat routing over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! roomcast
//!
//! # Override settings through the environment
//! ROOMCAST_PORT=9000 ROOMCAST_OPEN_ROOMS=true ROOMCAST_SESSION__MAX_BATCH=16 roomcast
//! ```
//!
//! Clients connect to `ws://host:port/ws/{room_id}`; the user id is taken
//! from the `x-user-id` header set by an authenticating proxy.

mod config;
mod handlers;
mod metrics;

use anyhow::Result;
use roomcast_core::Hub;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::load()?;

    tracing::info!("Starting Roomcast server on {}:{}", config.host, config.port);

    metrics::init_metrics();

    // The hub must be running before the first connection is accepted.
    let hub = Hub::with_config(config.hub.to_hub_config());
    let handle = hub.handle();
    hub.spawn();

    handlers::run_server(config, handle).await?;

    Ok(())
}
