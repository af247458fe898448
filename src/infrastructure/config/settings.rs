use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use super::options::TransportOptions;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub transport: TransportSettings,
    #[serde(default)]
    pub worker: WorkerSettings,
    #[serde(default)]
    pub log: LogSettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TransportSettings {
    #[serde(default = "default_dsn")]
    pub dsn: String,
    /// Extra transport options; these override the DSN query string
    #[serde(default)]
    pub options: TransportOptions,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkerSettings {
    /// Sleep between polls when no message is available, in milliseconds
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    #[serde(default = "default_backoff_initial_delay_ms")]
    pub backoff_initial_delay_ms: u64,
    #[serde(default = "default_backoff_max_delay_ms")]
    pub backoff_max_delay_ms: u64,
    /// Stop after this many messages; 0 runs until interrupted
    #[serde(default)]
    pub max_messages: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogSettings {
    #[serde(default)]
    pub format: LogFormat,
    /// Fallback filter when RUST_LOG is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

fn default_dsn() -> String {
    "redis://localhost:6379".to_string()
}

fn default_idle_sleep_ms() -> u64 {
    1000
}

fn default_backoff_initial_delay_ms() -> u64 {
    100
}

fn default_backoff_max_delay_ms() -> u64 {
    30_000 // 30 seconds
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("transport.dsn", default_dsn())?
            .set_default("worker.idle_sleep_ms", default_idle_sleep_ms())?
            .set_default("worker.backoff_initial_delay_ms", default_backoff_initial_delay_ms())?
            .set_default("worker.backoff_max_delay_ms", default_backoff_max_delay_ms())?
            .set_default("worker.max_messages", 0)?
            .set_default("log.format", "text")?
            .set_default("log.filter", default_log_filter())?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // MESSENGER_TRANSPORT__DSN, MESSENGER_WORKER__IDLE_SLEEP_MS, ...
            .add_source(
                Environment::with_prefix("MESSENGER")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            dsn: default_dsn(),
            options: TransportOptions::new(),
        }
    }
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            idle_sleep_ms: default_idle_sleep_ms(),
            backoff_initial_delay_ms: default_backoff_initial_delay_ms(),
            backoff_max_delay_ms: default_backoff_max_delay_ms(),
            max_messages: 0,
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            format: LogFormat::Text,
            filter: default_log_filter(),
        }
    }
}
