use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod bridge;
mod config;
mod error;
mod history;
mod lifecycle;
mod models;
mod pairing;
mod protocol;
mod registry;
mod router;
mod routes;
mod session_store;
mod state;

use common::inference::{InferenceClient, InferenceConfig};

use crate::{
    bridge::BridgeConnector, config::Settings, history::ChatHistoryStore,
    lifecycle::ConnectionManager, registry::DeviceRegistry, router::MessageRouter,
    session_store::SessionStore, state::AppState,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting device service");

    let settings = Settings::load()?;
    let inference = InferenceClient::new(InferenceConfig::from_env()?)?;
    let store = SessionStore::open(&settings.sessions_dir).await?;

    let registry = DeviceRegistry::new();
    let history = ChatHistoryStore::new(
        settings.history_max_entries,
        chrono::Duration::hours(settings.history_retention_hours),
    );
    let router = MessageRouter::new(
        registry.clone(),
        history.clone(),
        inference,
        settings.fallback_reply.clone(),
        settings.default_country_code.clone(),
    );
    let connector = Arc::new(BridgeConnector::new(
        settings.bridge_command.clone(),
        settings.bridge_args.clone(),
    ));
    let manager = ConnectionManager::new(store, registry, connector, router, settings.lifecycle());

    let _sweeper = history.start_sweep(&settings.history_sweep_schedule).await?;

    // Rehydrate persisted sessions in the background
    let rehydrate = manager.clone();
    tokio::spawn(async move {
        if let Err(e) = rehydrate.reconnect_all().await {
            error!("Failed to rehydrate sessions: {}", e);
        }
    });

    let app_state = AppState { manager, history };
    let app = routes::create_router(app_state);

    let listener = TcpListener::bind(&settings.bind_addr).await?;
    info!("Device service listening on {}", settings.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down device service");
        })
        .await?;

    Ok(())
}
