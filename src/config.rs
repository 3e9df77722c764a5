//! Configuration loading from TOML with environment variable resolution.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs.
//! Secrets (API keys, the vault passphrase) are referenced by env-var
//! name in the config and resolved at runtime via `std::env::var`.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub market: MarketConfig,
    pub oracle: OracleConfig,
    pub exchange: ExchangeConfig,
    pub risk: RiskSettings,
    pub vault: VaultConfig,
    pub database: DatabaseConfig,
    pub api: ApiConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct EngineConfig {
    /// Trading pair the engine runs on, e.g. "BTCUSDT".
    pub symbol: String,
    /// Candle interval code, e.g. "1" for one-minute candles.
    pub interval: String,
    /// Candles requested per cycle.
    pub candle_count: u32,
    /// Minimum window size below which the cycle aborts.
    pub min_candles: u32,
    /// Seconds between cycle triggers.
    pub cycle_interval_secs: u64,
    /// Hard deadline for one cycle; in-flight work past this is
    /// cancelled and recorded failed.
    pub cycle_deadline_secs: u64,
    /// Worker-pool bound for concurrent order submissions.
    pub max_in_flight_orders: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct MarketConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct OracleConfig {
    pub model: String,
    pub api_key_env: String,
    pub max_tokens: u32,
    pub temperature: f64,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub testnet_url: String,
    pub testnet: bool,
    pub recv_window_ms: u64,
    pub order_timeout_secs: u64,
    /// Minimum available USDT below which orders are refused.
    pub min_available_balance: f64,
}

impl ExchangeConfig {
    pub fn effective_url(&self) -> &str {
        if self.testnet {
            &self.testnet_url
        } else {
            &self.base_url
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RiskSettings {
    /// Per-tier confidence thresholds, keyed "low" | "medium" | "high".
    pub confidence_thresholds: HashMap<String, f64>,
    /// System-wide leverage ceiling communicated to the oracle.
    pub max_leverage: u32,
    pub max_stop_loss: f64,
    pub max_take_profit: f64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VaultConfig {
    pub passphrase_env: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ApiConfig {
    pub enabled: bool,
    pub port: u16,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        Ok(config)
    }

    /// Resolve an environment variable name to its value.
    /// Useful for loading secrets referenced in the config.
    pub fn resolve_env(env_name: &str) -> Result<String> {
        std::env::var(env_name)
            .with_context(|| format!("Environment variable not set: {env_name}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[engine]
symbol = "BTCUSDT"
interval = "1"
candle_count = 50
min_candles = 30
cycle_interval_secs = 300
cycle_deadline_secs = 120
max_in_flight_orders = 5

[market]
base_url = "https://api.bybit.com"
request_timeout_secs = 10

[oracle]
model = "gpt-4o"
api_key_env = "OPENAI_API_KEY"
max_tokens = 500
temperature = 0.3
request_timeout_secs = 60

[exchange]
base_url = "https://api.bybit.com"
testnet_url = "https://api-testnet.bybit.com"
testnet = true
recv_window_ms = 5000
order_timeout_secs = 30
min_available_balance = 10.0

[risk]
confidence_thresholds = { low = 0.8, medium = 0.7, high = 0.6 }
max_leverage = 20
max_stop_loss = 0.10
max_take_profit = 0.20

[vault]
passphrase_env = "AUTOPILOT_ENCRYPTION_KEY"

[database]
url = "sqlite://autopilot.db"

[api]
enabled = true
port = 8090
"#;

    #[test]
    fn test_parse_sample_config() {
        let cfg: AppConfig = toml::from_str(SAMPLE).unwrap();
        assert_eq!(cfg.engine.symbol, "BTCUSDT");
        assert_eq!(cfg.engine.cycle_interval_secs, 300);
        assert_eq!(cfg.engine.min_candles, 30);
        assert_eq!(cfg.engine.max_in_flight_orders, 5);
        assert_eq!(cfg.risk.confidence_thresholds["medium"], 0.7);
        assert!(cfg.exchange.testnet);
        assert_eq!(cfg.exchange.effective_url(), "https://api-testnet.bybit.com");
    }

    #[test]
    fn test_effective_url_mainnet() {
        let mut cfg: AppConfig = toml::from_str(SAMPLE).unwrap();
        cfg.exchange.testnet = false;
        assert_eq!(cfg.exchange.effective_url(), "https://api.bybit.com");
    }

    #[test]
    fn test_resolve_env_missing() {
        assert!(AppConfig::resolve_env("AUTOPILOT_DOES_NOT_EXIST_XYZ").is_err());
    }
}
