use anyhow::Result;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

mod availability;
mod booking_service;
mod config;
mod dedup;
mod error;
mod google;
mod models;
mod reconcile;
mod repositories;
mod routes;
mod state;
mod watch;

use common::{
    cache::{RedisConfig, RedisPool},
    database::{DatabaseConfig, init_pool, run_migrations},
    inference::{InferenceClient, InferenceConfig},
};

use crate::{
    booking_service::BookingService,
    config::Settings,
    dedup::{InMemoryDedup, NotificationDedup, RedisDedup},
    google::GoogleCalendarClient,
    reconcile::Reconciler,
    repositories::Repositories,
    state::AppState,
    watch::WatchManager,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .finish();

    tracing::subscriber::set_global_default(subscriber).expect("setting default subscriber failed");

    info!("Starting calendar service");

    let settings = Settings::load()?;

    // Initialize database connection pool
    let db_config = DatabaseConfig::from_env()?;
    let pool = init_pool(&db_config).await?;
    run_migrations(&pool).await?;

    let repos = Repositories::postgres(pool);
    let calendar = Arc::new(GoogleCalendarClient::new(settings.google())?);
    let inference = Arc::new(InferenceClient::new(InferenceConfig::from_env()?)?);

    let dedup: Arc<dyn NotificationDedup> = if settings.use_redis_dedup {
        let redis = RedisPool::new(&RedisConfig::from_env()?).await?;
        info!("Using Redis for webhook deduplication");
        Arc::new(RedisDedup::new(redis, settings.dedup_ttl()))
    } else {
        Arc::new(InMemoryDedup::new(settings.dedup_ttl()))
    };

    if settings.webhook_url.is_empty() {
        warn!("CALENDAR__WEBHOOK_URL is not set, watch registration will fail");
    }
    if settings.cron_secret.is_empty() {
        warn!("CALENDAR__CRON_SECRET is not set, the cron endpoint rejects every call");
    }

    let reconciler = Reconciler::new(
        repos.clone(),
        calendar.clone(),
        inference,
        dedup,
        settings.reconcile(),
    );
    let watches = WatchManager::new(
        repos.integrations.clone(),
        calendar.clone(),
        settings.webhook_url.clone(),
        settings.renewal_window(),
    );
    let bookings = BookingService::new(repos.clone(), calendar, settings.time_zone.clone());

    let _renewal = watches
        .start_schedule(&settings.watch_renewal_schedule)
        .await?;

    let app_state = AppState {
        reconciler,
        watches,
        bookings,
        ledger: repos.ledger.clone(),
        cron_secret: Arc::from(settings.cron_secret.as_str()),
    };
    let app = routes::create_router(app_state);

    let listener = TcpListener::bind(&settings.bind_addr).await?;
    info!("Calendar service listening on {}", settings.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down calendar service");
        })
        .await?;

    Ok(())
}
