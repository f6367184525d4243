//! Calendar service settings

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::google::{DEFAULT_API_BASE, DEFAULT_AUTH_URL, DEFAULT_TOKEN_URL, GoogleConfig};
use crate::reconcile::ReconcileSettings;

/// Settings loaded from defaults, `config/calendar.toml` and `CALENDAR__*` variables
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    /// Bearer secret for the cron endpoint; empty rejects every call
    pub cron_secret: String,
    /// Public URL Google delivers notifications to
    pub webhook_url: String,
    pub sync_window_secs: i64,
    pub dedup_ttl_secs: u64,
    pub watch_renewal_days: i64,
    pub watch_renewal_schedule: String,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_token_url: String,
    pub google_auth_url: String,
    pub calendar_api_base: String,
    pub calendar_timeout_secs: u64,
    pub use_redis_dedup: bool,
    pub time_zone: String,
    pub default_country_code: String,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("bind_addr", "0.0.0.0:3000")?
            .set_default("cron_secret", "")?
            .set_default("webhook_url", "")?
            .set_default("sync_window_secs", 120)?
            .set_default("dedup_ttl_secs", 180)?
            .set_default("watch_renewal_days", 2)?
            .set_default("watch_renewal_schedule", "0 0 3 * * *")?
            .set_default("google_client_id", "")?
            .set_default("google_client_secret", "")?
            .set_default("google_token_url", DEFAULT_TOKEN_URL)?
            .set_default("google_auth_url", DEFAULT_AUTH_URL)?
            .set_default("calendar_api_base", DEFAULT_API_BASE)?
            .set_default("calendar_timeout_secs", 30)?
            .set_default("use_redis_dedup", false)?
            .set_default("time_zone", "America/Sao_Paulo")?
            .set_default("default_country_code", "55")?
            .add_source(File::with_name("config/calendar").required(false))
            .add_source(
                Environment::with_prefix("CALENDAR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn google(&self) -> GoogleConfig {
        GoogleConfig {
            client_id: self.google_client_id.clone(),
            client_secret: self.google_client_secret.clone(),
            auth_url: self.google_auth_url.clone(),
            token_url: self.google_token_url.clone(),
            api_base: self.calendar_api_base.clone(),
            timeout_secs: self.calendar_timeout_secs,
        }
    }

    pub fn reconcile(&self) -> ReconcileSettings {
        ReconcileSettings {
            sync_window: chrono::Duration::seconds(self.sync_window_secs),
            country_code: self.default_country_code.clone(),
        }
    }

    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn renewal_window(&self) -> chrono::Duration {
        chrono::Duration::days(self.watch_renewal_days)
    }
}
