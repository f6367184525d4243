//! Device service settings

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use crate::lifecycle::LifecycleSettings;
use crate::router::DEFAULT_FALLBACK_REPLY;

/// Settings loaded from defaults, `config/devices.toml` and `DEVICES__*` variables
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub bind_addr: String,
    pub sessions_dir: PathBuf,
    pub pairing_timeout_secs: u64,
    pub history_max_entries: usize,
    pub history_retention_hours: i64,
    pub history_sweep_schedule: String,
    pub default_country_code: String,
    pub bridge_command: String,
    pub bridge_args: Vec<String>,
    pub fallback_reply: String,
    pub reconnect_max_attempts: u32,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("bind_addr", "0.0.0.0:4000")?
            .set_default("sessions_dir", ".sessions")?
            .set_default("pairing_timeout_secs", 20)?
            .set_default("history_max_entries", 10)?
            .set_default("history_retention_hours", 24)?
            .set_default("history_sweep_schedule", "0 0 * * * *")?
            .set_default("default_country_code", "55")?
            .set_default("bridge_command", "whatsapp-bridge")?
            .set_default("bridge_args", Vec::<String>::new())?
            .set_default("fallback_reply", DEFAULT_FALLBACK_REPLY)?
            .set_default("reconnect_max_attempts", 5)?
            .add_source(File::with_name("config/devices").required(false))
            .add_source(
                Environment::with_prefix("DEVICES")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("bridge_args")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }

    pub fn lifecycle(&self) -> LifecycleSettings {
        LifecycleSettings {
            pairing_timeout: Duration::from_secs(self.pairing_timeout_secs),
            country_code: self.default_country_code.clone(),
            reconnect_max_attempts: self.reconnect_max_attempts,
            ..Default::default()
        }
    }
}
