use serde::Deserialize;
use soko_shared::Masked;
use std::env;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub telegram: TelegramConfig,
    pub timetable: TimetableConfig,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: Masked<String>,
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 { 5 }

#[derive(Debug, Deserialize, Clone)]
pub struct TelegramConfig {
    pub bot_token: Masked<String>,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    /// Public base URL Telegram delivers updates to.
    pub webhook_host: String,
    /// Echoed back by Telegram in `X-Telegram-Bot-Api-Secret-Token`.
    pub secret_token: Masked<String>,
}

fn default_api_url() -> String { "https://api.telegram.org".to_string() }

#[derive(Debug, Deserialize, Clone)]
pub struct TimetableConfig {
    pub base_url: String,
    pub novi_sad_station_id: u32,
    pub belgrade_centre_station_id: u32,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_seconds: u64,
    #[serde(default = "default_retry_interval")]
    pub retry_interval_seconds: u64,
    #[serde(default = "default_horizon_days")]
    pub horizon_days: u32,
}

fn default_refresh_interval() -> u64 { 12 * 60 * 60 }
fn default_retry_interval() -> u64 { 60 * 60 }
fn default_horizon_days() -> u32 { 2 }

impl TimetableConfig {
    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_seconds)
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_seconds)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleanupConfig {
    #[serde(default = "default_cleanup_interval")]
    pub interval_seconds: u64,
}

fn default_cleanup_interval() -> u64 { 60 }

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_seconds)
    }
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = config::Config::builder()
            .add_source(config::File::with_name("config/default"))
            // Per-environment overrides, optional
            .add_source(config::File::with_name(&format!("config/{}", run_mode)).required(false))
            // Local overrides, not checked in
            .add_source(config::File::with_name("config/local").required(false))
            // Eg. `SOKO__TELEGRAM__BOT_TOKEN=...` sets `telegram.bot_token`
            .add_source(config::Environment::with_prefix("SOKO").separator("__"))
            .build()?;

        s.try_deserialize()
    }
}
