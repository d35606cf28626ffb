//! Configuration management for the trade sentinel.
//!
//! Loads settings from environment variables and config files.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Main application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Broker API credentials and endpoint
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Position sizing and risk budget parameters
    #[serde(default)]
    pub risk: RiskConfig,
    /// Order lifecycle monitor timing
    #[serde(default)]
    pub monitor: MonitorConfig,
    /// Key-level watcher settings
    #[serde(default)]
    pub watcher: WatcherConfig,
    /// Telegram notification channel
    #[serde(default)]
    pub telegram: TelegramConfig,
    /// Local persistence
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    /// REST API base URL (no trailing slash)
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Login user name
    #[serde(default)]
    pub username: String,
    /// API key used with `/Auth/loginKey`
    #[serde(default)]
    pub api_key: String,
    /// Preferred account name; the first active account is used when unset
    #[serde(default)]
    pub account_name: Option<String>,
    /// Assumed session token lifetime
    #[serde(default = "default_token_ttl_hours")]
    pub token_ttl_hours: u32,
    /// HTTP request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Profit that makes a winning day; sizing reports whether a plan reaches it
    #[serde(default = "default_daily_target_usd")]
    pub daily_target_usd: Decimal,
    /// Lower bound for the risk percent proposed by the decision workflow
    #[serde(default = "default_min_risk_percent")]
    pub min_risk_percent: Decimal,
    /// Upper bound for the risk percent proposed by the decision workflow
    #[serde(default = "default_max_risk_percent")]
    pub max_risk_percent: Decimal,
    /// Risk percent used when a plan carries none
    #[serde(default = "default_risk_percent")]
    pub default_risk_percent: Decimal,
    /// Per-symbol contract ceiling (venue/personal position limits)
    #[serde(default = "default_max_contracts")]
    pub max_contracts: HashMap<String, Decimal>,
    /// Ceiling for symbols missing from `max_contracts`
    #[serde(default = "default_fallback_max_contracts")]
    pub fallback_max_contracts: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Delay after the first order status poll
    #[serde(default = "default_initial_poll_secs")]
    pub initial_poll_secs: u64,
    /// Delay between subsequent order status polls
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Give up waiting for a terminal order status after this many hours
    #[serde(default = "default_timeout_hours")]
    pub timeout_hours: u64,
    /// Look-back window for order and trade queries
    #[serde(default = "default_order_lookback_hours")]
    pub order_lookback_hours: i64,
    /// Interval between position supervision passes once filled
    #[serde(default = "default_supervise_interval_secs")]
    pub supervise_interval_secs: u64,
    /// Restarts allowed for a panicked monitor task
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    /// External command consulted while supervising a filled position; prints a decision as JSON
    #[serde(default)]
    pub advisor_command: Option<String>,
    /// Seconds an external analysis or advisor command may run
    #[serde(default = "default_command_timeout_secs")]
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatcherConfig {
    /// Price polling interval
    #[serde(default = "default_watch_interval_secs")]
    pub poll_interval_secs: u64,
    /// Proximity threshold in percent of the level (0.05 = 0.05%)
    #[serde(default = "default_threshold_percent")]
    pub threshold_percent: Decimal,
    /// How long to wait for a human acknowledgment
    #[serde(default = "default_confirmation_timeout_secs")]
    pub confirmation_timeout_secs: u64,
    /// Quiet period for a level after an abandoned trigger
    #[serde(default = "default_retrigger_cooldown_secs")]
    pub retrigger_cooldown_secs: u64,
    /// Bars older than this are not used as the latest price
    #[serde(default = "default_price_lookback_minutes")]
    pub price_lookback_minutes: i64,
    /// External analysis command; receives instrument and price, prints a trade plan as JSON
    #[serde(default)]
    pub analysis_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Bot token from @BotFather
    #[serde(default)]
    pub bot_token: String,
    /// Channel or chat receiving the alerts
    #[serde(default)]
    pub chat_id: String,
    /// Send through Telegram; alerts only go to the log when disabled
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bot API base URL
    #[serde(default = "default_telegram_api_base")]
    pub api_base: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

// Default value functions
fn default_base_url() -> String {
    "https://api.topstepx.com/api".to_string()
}

fn default_token_ttl_hours() -> u32 {
    24
}

fn default_request_timeout() -> u64 {
    30
}

fn default_daily_target_usd() -> Decimal {
    Decimal::new(150, 0)
}

fn default_min_risk_percent() -> Decimal {
    Decimal::new(2, 0)
}

fn default_max_risk_percent() -> Decimal {
    Decimal::new(20, 0)
}

fn default_risk_percent() -> Decimal {
    Decimal::new(3, 0)
}

fn default_max_contracts() -> HashMap<String, Decimal> {
    HashMap::from([
        ("MGC".to_string(), Decimal::new(50, 0)),
        ("GC".to_string(), Decimal::new(5, 0)),
        ("CL".to_string(), Decimal::new(10, 0)),
        ("ES".to_string(), Decimal::new(10, 0)),
    ])
}

fn default_fallback_max_contracts() -> Decimal {
    Decimal::ONE
}

fn default_initial_poll_secs() -> u64 {
    15
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_timeout_hours() -> u64 {
    8
}

fn default_order_lookback_hours() -> i64 {
    24
}

fn default_supervise_interval_secs() -> u64 {
    180
}

fn default_max_restarts() -> u32 {
    3
}

fn default_command_timeout_secs() -> u64 {
    120
}

fn default_watch_interval_secs() -> u64 {
    15
}

fn default_threshold_percent() -> Decimal {
    Decimal::new(5, 2) // 0.05%
}

fn default_confirmation_timeout_secs() -> u64 {
    15
}

fn default_retrigger_cooldown_secs() -> u64 {
    300
}

fn default_price_lookback_minutes() -> i64 {
    5
}

fn default_true() -> bool {
    true
}

fn default_telegram_api_base() -> String {
    "https://api.telegram.org".to_string()
}

fn default_db_path() -> String {
    "data/trade_sentinel.db".to_string()
}

impl Config {
    /// Load configuration from environment variables and config files.
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config = config::Config::builder()
            .add_source(config::File::with_name("config").required(false))
            .add_source(config::Environment::default().separator("__").prefix("SENTINEL"))
            .build()
            .context("Failed to build configuration")?;

        config
            .try_deserialize()
            .context("Failed to deserialize configuration")
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(
            self.risk.min_risk_percent > Decimal::ZERO
                && self.risk.min_risk_percent <= self.risk.max_risk_percent
                && self.risk.max_risk_percent <= Decimal::ONE_HUNDRED,
            "risk percent range must satisfy 0 < min <= max <= 100"
        );

        anyhow::ensure!(
            self.risk.default_risk_percent >= self.risk.min_risk_percent
                && self.risk.default_risk_percent <= self.risk.max_risk_percent,
            "default_risk_percent must lie inside the configured risk range"
        );

        anyhow::ensure!(
            self.risk.fallback_max_contracts > Decimal::ZERO
                && self.risk.max_contracts.values().all(|cap| *cap > Decimal::ZERO),
            "contract caps must be positive"
        );

        anyhow::ensure!(
            self.monitor.initial_poll_secs > 0
                && self.monitor.poll_interval_secs > 0
                && self.monitor.supervise_interval_secs > 0,
            "monitor poll intervals must be positive"
        );

        anyhow::ensure!(
            self.watcher.threshold_percent > Decimal::ZERO && self.watcher.poll_interval_secs > 0,
            "watcher threshold and interval must be positive"
        );

        Ok(())
    }

    /// True when Telegram credentials are present and the channel is enabled.
    pub fn telegram_configured(&self) -> bool {
        self.telegram.enabled
            && !self.telegram.bot_token.is_empty()
            && !self.telegram.chat_id.is_empty()
    }
}

impl RiskConfig {
    /// Contract ceiling for a symbol. Keys are matched case-insensitively since
    /// the environment source lowercases them.
    pub fn max_contracts_for(&self, symbol: &str) -> Decimal {
        self.max_contracts
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(symbol))
            .map(|(_, cap)| *cap)
            .unwrap_or(self.fallback_max_contracts)
    }
}

impl MonitorConfig {
    pub fn initial_poll(&self) -> Duration {
        Duration::from_secs(self.initial_poll_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_hours * 3600)
    }

    pub fn supervise_interval(&self) -> Duration {
        Duration::from_secs(self.supervise_interval_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn order_lookback(&self) -> chrono::Duration {
        chrono::Duration::hours(self.order_lookback_hours)
    }
}

impl WatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn confirmation_timeout(&self) -> Duration {
        Duration::from_secs(self.confirmation_timeout_secs)
    }

    pub fn retrigger_cooldown(&self) -> Duration {
        Duration::from_secs(self.retrigger_cooldown_secs)
    }

    pub fn price_lookback(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.price_lookback_minutes)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            broker: BrokerConfig::default(),
            risk: RiskConfig::default(),
            monitor: MonitorConfig::default(),
            watcher: WatcherConfig::default(),
            telegram: TelegramConfig::default(),
            storage: StorageConfig::default(),
        }
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            username: String::new(),
            api_key: String::new(),
            account_name: None,
            token_ttl_hours: default_token_ttl_hours(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            daily_target_usd: default_daily_target_usd(),
            min_risk_percent: default_min_risk_percent(),
            max_risk_percent: default_max_risk_percent(),
            default_risk_percent: default_risk_percent(),
            max_contracts: default_max_contracts(),
            fallback_max_contracts: default_fallback_max_contracts(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            initial_poll_secs: default_initial_poll_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            timeout_hours: default_timeout_hours(),
            order_lookback_hours: default_order_lookback_hours(),
            supervise_interval_secs: default_supervise_interval_secs(),
            max_restarts: default_max_restarts(),
            advisor_command: None,
            command_timeout_secs: default_command_timeout_secs(),
        }
    }
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_watch_interval_secs(),
            threshold_percent: default_threshold_percent(),
            confirmation_timeout_secs: default_confirmation_timeout_secs(),
            retrigger_cooldown_secs: default_retrigger_cooldown_secs(),
            price_lookback_minutes: default_price_lookback_minutes(),
            analysis_command: None,
        }
    }
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: String::new(),
            chat_id: String::new(),
            enabled: default_true(),
            api_base: default_telegram_api_base(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inverted_risk_range_is_rejected() {
        let mut config = Config::default();
        config.risk.min_risk_percent = dec!(25);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_max_contracts_lookup_ignores_case() {
        let mut risk = RiskConfig::default();
        risk.max_contracts = HashMap::from([("mgc".to_string(), dec!(50))]);

        assert_eq!(risk.max_contracts_for("MGC"), dec!(50));
        assert_eq!(risk.max_contracts_for("NQ"), Decimal::ONE);
    }

    #[test]
    fn test_monitor_defaults_match_poll_schedule() {
        let monitor = MonitorConfig::default();
        assert_eq!(monitor.initial_poll(), Duration::from_secs(15));
        assert_eq!(monitor.poll_interval(), Duration::from_secs(30));
        assert_eq!(monitor.timeout(), Duration::from_secs(8 * 3600));
    }

    #[test]
    fn test_telegram_requires_credentials() {
        let mut config = Config::default();
        assert!(!config.telegram_configured());

        config.telegram.bot_token = "token".to_string();
        config.telegram.chat_id = "-100123".to_string();
        assert!(config.telegram_configured());
    }
}
