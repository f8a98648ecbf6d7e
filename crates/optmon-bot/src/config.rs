//! Configuration management.

use crate::error::{AppError, AppResult};
use optmon_broker::{SmartApiConfig, StaticTokenResolver, DEFAULT_BASE_URL};
use optmon_core::{Exchange, MarketHours, DEFAULT_EXPIRY_EXIT_HOUR};
use optmon_position::MonitorConfig;
use optmon_ws::{Credentials, SessionConfig, DEFAULT_MARKET_DATA_URL, DEFAULT_ORDER_STATUS_URL};
use serde::Deserialize;
use std::time::Duration;

// ============================================================================
// Streaming
// ============================================================================

/// Streaming feed credentials. Any empty field disables streaming.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CredentialsConfig {
    #[serde(default)]
    pub auth_token: String,
    #[serde(default)]
    pub api_key: String,
    #[serde(default)]
    pub client_code: String,
    #[serde(default)]
    pub feed_token: String,
}

impl CredentialsConfig {
    #[must_use]
    pub fn is_complete(&self) -> bool {
        !(self.auth_token.is_empty()
            || self.api_key.is_empty()
            || self.client_code.is_empty()
            || self.feed_token.is_empty())
    }
}

impl From<&CredentialsConfig> for Credentials {
    fn from(cfg: &CredentialsConfig) -> Self {
        Self {
            auth_token: cfg.auth_token.clone(),
            api_key: cfg.api_key.clone(),
            client_code: cfg.client_code.clone(),
            feed_token: cfg.feed_token.clone(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StreamingConfig {
    #[serde(default = "default_market_data_url")]
    pub market_data_url: String,
    #[serde(default = "default_order_status_url")]
    pub order_status_url: String,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Consecutive failed attempts before a channel is reported down.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    /// Delay between control frames replayed after a reconnect.
    #[serde(default = "default_subscription_pacing_ms")]
    pub subscription_pacing_ms: u64,
}

fn default_market_data_url() -> String {
    DEFAULT_MARKET_DATA_URL.to_string()
}

fn default_order_status_url() -> String {
    DEFAULT_ORDER_STATUS_URL.to_string()
}

fn default_reconnect_base_delay_ms() -> u64 {
    5_000
}

fn default_reconnect_max_delay_ms() -> u64 {
    300_000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    30_000
}

fn default_subscription_pacing_ms() -> u64 {
    100
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            market_data_url: default_market_data_url(),
            order_status_url: default_order_status_url(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            subscription_pacing_ms: default_subscription_pacing_ms(),
        }
    }
}

impl From<&StreamingConfig> for SessionConfig {
    fn from(cfg: &StreamingConfig) -> Self {
        Self {
            market_data_url: cfg.market_data_url.clone(),
            order_status_url: cfg.order_status_url.clone(),
            reconnect_base_delay_ms: cfg.reconnect_base_delay_ms,
            reconnect_max_delay_ms: cfg.reconnect_max_delay_ms,
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            heartbeat_interval_ms: cfg.heartbeat_interval_ms,
            subscription_pacing_ms: cfg.subscription_pacing_ms,
        }
    }
}

// ============================================================================
// Monitor
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct MonitorSettings {
    /// Fallback timer period.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_price_cache_ttl_ms")]
    pub price_cache_ttl_ms: u64,
    #[serde(default = "default_verify_max_retries")]
    pub verify_max_retries: u32,
    #[serde(default = "default_verify_delay_ms")]
    pub verify_delay_ms: u64,
    /// Evaluate every position on the timer even while ticks are flowing.
    #[serde(default = "default_fallback_polling")]
    pub fallback_polling: bool,
    #[serde(default = "default_market_open")]
    pub market_open: String,
    #[serde(default = "default_market_close")]
    pub market_close: String,
    #[serde(default = "default_expiry_exit_hour")]
    pub expiry_exit_hour: u32,
}

fn default_interval_secs() -> u64 {
    60
}

fn default_price_cache_ttl_ms() -> u64 {
    5_000
}

fn default_verify_max_retries() -> u32 {
    3
}

fn default_verify_delay_ms() -> u64 {
    5_000
}

fn default_fallback_polling() -> bool {
    true
}

fn default_market_open() -> String {
    "09:15".to_string()
}

fn default_market_close() -> String {
    "15:30".to_string()
}

fn default_expiry_exit_hour() -> u32 {
    DEFAULT_EXPIRY_EXIT_HOUR
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval_secs: default_interval_secs(),
            price_cache_ttl_ms: default_price_cache_ttl_ms(),
            verify_max_retries: default_verify_max_retries(),
            verify_delay_ms: default_verify_delay_ms(),
            fallback_polling: default_fallback_polling(),
            market_open: default_market_open(),
            market_close: default_market_close(),
            expiry_exit_hour: default_expiry_exit_hour(),
        }
    }
}

impl MonitorSettings {
    #[must_use]
    pub fn monitor_config(&self) -> MonitorConfig {
        MonitorConfig {
            verify_max_retries: self.verify_max_retries,
            verify_delay: Duration::from_millis(self.verify_delay_ms),
            expiry_exit_hour: self.expiry_exit_hour,
        }
    }

    pub fn market_hours(&self) -> AppResult<MarketHours> {
        MarketHours::parse(&self.market_open, &self.market_close).ok_or_else(|| {
            AppError::Config(format!(
                "Invalid market hours: {} - {}",
                self.market_open, self.market_close
            ))
        })
    }

    #[must_use]
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    #[must_use]
    pub fn price_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.price_cache_ttl_ms)
    }
}

// ============================================================================
// Persistence, accounts, instruments
// ============================================================================

#[derive(Debug, Clone, Deserialize)]
pub struct PersistenceConfig {
    #[serde(default = "default_trades_file")]
    pub trades_file: String,
    #[serde(default = "default_completed_trades_file")]
    pub completed_trades_file: String,
}

fn default_trades_file() -> String {
    "option_trades.json".to_string()
}

fn default_completed_trades_file() -> String {
    "completed_option_trades.jsonl".to_string()
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            trades_file: default_trades_file(),
            completed_trades_file: default_completed_trades_file(),
        }
    }
}

/// One broker account the monitor places exits for.
#[derive(Debug, Clone, Deserialize)]
pub struct AccountConfig {
    pub client_id: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    pub auth_token: String,
    pub api_key: String,
    #[serde(default = "default_client_ip")]
    pub client_local_ip: String,
    #[serde(default = "default_client_ip")]
    pub client_public_ip: String,
    #[serde(default = "default_mac_address")]
    pub mac_address: String,
}

fn default_api_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_client_ip() -> String {
    "127.0.0.1".to_string()
}

fn default_mac_address() -> String {
    "00:00:00:00:00:00".to_string()
}

impl From<&AccountConfig> for SmartApiConfig {
    fn from(cfg: &AccountConfig) -> Self {
        Self {
            base_url: cfg.api_base_url.clone(),
            auth_token: cfg.auth_token.clone(),
            api_key: cfg.api_key.clone(),
            client_local_ip: cfg.client_local_ip.clone(),
            client_public_ip: cfg.client_public_ip.clone(),
            mac_address: cfg.mac_address.clone(),
        }
    }
}

/// Static symbol-to-token row.
#[derive(Debug, Clone, Deserialize)]
pub struct InstrumentConfig {
    pub symbol: String,
    pub exchange: String,
    pub token: String,
}

// ============================================================================
// AppConfig
// ============================================================================

/// Application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub streaming: StreamingConfig,
    #[serde(default)]
    pub monitor: MonitorSettings,
    #[serde(default)]
    pub persistence: PersistenceConfig,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub instruments: Vec<InstrumentConfig>,
}

impl AppConfig {
    /// Load configuration from file.
    pub fn from_file(path: &str) -> AppResult<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| AppError::Config(format!("Failed to read config: {e}")))?;

        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> AppResult<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| AppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that serde cannot.
    pub fn validate(&self) -> AppResult<()> {
        self.monitor.market_hours()?;
        for instrument in &self.instruments {
            instrument.exchange.parse::<Exchange>().map_err(|e| {
                AppError::Config(format!("instrument {}: {e}", instrument.symbol))
            })?;
        }
        let mut seen = std::collections::HashSet::new();
        for account in &self.accounts {
            if !seen.insert(account.client_id.as_str()) {
                return Err(AppError::Config(format!(
                    "duplicate account {}",
                    account.client_id
                )));
            }
        }
        Ok(())
    }

    /// Token resolver over the configured instruments.
    pub fn token_resolver(&self) -> AppResult<StaticTokenResolver> {
        let mut resolver = StaticTokenResolver::new();
        for instrument in &self.instruments {
            let exchange: Exchange = instrument
                .exchange
                .parse()
                .map_err(|e| AppError::Config(format!("instrument {}: {e}", instrument.symbol)))?;
            resolver.insert(&instrument.symbol, exchange, instrument.token.clone());
        }
        Ok(resolver)
    }
}
