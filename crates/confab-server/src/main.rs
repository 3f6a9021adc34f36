//! # confab server
//!
//! Real-time chat message delivery over WebSocket.
//!
//! ## Usage
//!
//! ```bash
//! # Run with default settings
//! confab
//!
//! # Run with environment variables
//! CONFAB_PORT=8080 CONFAB_HOST=0.0.0.0 confab
//! ```
//!
//! The binary wires the in-memory backend in for development; production
//! deployments replace it with database-backed repository implementations.

mod config;
mod metrics;
mod serve;
mod session;

use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use confab_core::memory::{MemoryStore, NullNotifier, StaticTokenVerifier};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "confab=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = config::Config::load()?;

    tracing::info!("Starting confab server on {}:{}", config.host, config.port);

    // Initialize metrics
    metrics::init_metrics();

    // Development backend: one demo user with a printable token.
    let store = Arc::new(MemoryStore::new());
    let tokens = Arc::new(StaticTokenVerifier::new());
    let demo = store.add_user("demo");
    let token = std::env::var("CONFAB_DEV_TOKEN")
        .unwrap_or_else(|_| uuid::Uuid::new_v4().simple().to_string());
    tokens.grant(&token, demo);
    tracing::info!(user = %demo, token = %token, "Development login");

    let state = Arc::new(serve::AppState::new(
        config,
        store.clone(),
        store.clone(),
        store,
        tokens,
        Arc::new(NullNotifier),
    ));

    // Start the server
    serve::run_server(state).await?;

    Ok(())
}
