// Process configuration and strategy parameters
pub mod params;

pub use params::{
    Confirmation, ParamCategory, ParamKind, ParamSpec, ParamsHandle, StrategyParams, PARAM_SPECS,
};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Consumer runtime tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsumerSettings {
    /// XREADGROUP block timeout; bounds how long shutdown can take to notice.
    pub block_ms: u64,
    pub batch_size: usize,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    /// Pending entries idle this long are claimed from other consumers.
    pub claim_idle_ms: u64,
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            block_ms: 5_000,
            batch_size: 10,
            max_retries: 3,
            backoff_base_ms: 500,
            claim_idle_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    Paper,
    Alpaca,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerSettings {
    pub kind: BrokerKind,
    pub base_url: String,
    pub data_url: String,
    pub key_id: Option<String>,
    pub secret_key: Option<String>,
    pub requests_per_minute: u32,
    pub timeout_secs: u64,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Paper,
            base_url: "https://paper-api.alpaca.markets".to_string(),
            data_url: "https://data.alpaca.markets".to_string(),
            key_id: None,
            secret_key: None,
            requests_per_minute: 200,
            timeout_secs: 10,
        }
    }
}

/// Process-wide settings.
///
/// Sources, later wins: compiled defaults, `config/quantflow.toml`,
/// `QUANTFLOW__*` environment variables, and the conventional
/// `DATABASE_URL` / `REDIS_URL` variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub database_url: String,
    pub redis_url: String,
    pub portfolio_id: String,
    pub initial_capital: f64,
    pub log_filter: String,
    /// How often running workers reload parameter overrides (0 = never).
    pub params_reload_secs: u64,
    pub consumer: ConsumerSettings,
    pub broker: BrokerSettings,
    pub params: StrategyParams,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            database_url: "postgres://localhost/quantflow".to_string(),
            redis_url: "redis://127.0.0.1:6379".to_string(),
            portfolio_id: "main".to_string(),
            initial_capital: 100_000.0,
            log_filter: "quantflow=info".to_string(),
            params_reload_secs: 300,
            consumer: ConsumerSettings::default(),
            broker: BrokerSettings::default(),
            params: StrategyParams::default(),
        }
    }
}

impl Settings {
    pub fn load() -> Result<Self> {
        Self::load_from("config/quantflow")
    }

    pub fn load_from(path: &str) -> Result<Self> {
        let settings: Settings = ::config::Config::builder()
            .add_source(::config::File::with_name(path).required(false))
            .add_source(
                ::config::Environment::with_prefix("QUANTFLOW")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override_option("database_url", std::env::var("DATABASE_URL").ok())?
            .set_override_option("redis_url", std::env::var("REDIS_URL").ok())?
            .build()?
            .try_deserialize()?;

        settings.params.validate()?;
        Ok(settings)
    }
}
