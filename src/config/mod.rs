//! Configuration for the trading bot.
//!
//! Everything is loaded from environment variables (a local `.env` is read
//! by `main` before this runs), organized by concern: auth, broker endpoints,
//! strategy parameters, and scanner parameters.

use crate::domain::types::Uic;
use anyhow::{Context, Result};
use std::env;
use std::str::FromStr;

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("Invalid {key}: {raw:?}")),
        Err(_) => Ok(default),
    }
}

fn env_list(key: &str, default: &[&str]) -> Vec<String> {
    match env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default.iter().map(|s| s.to_string()).collect(),
    }
}

/// OAuth application credentials and endpoints.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    pub app_key: String,
    pub app_secret: String,
    pub auth_endpoint: String,
    pub token_endpoint: String,
    pub redirect_url: String,
    /// Bootstrap refresh credential; once running, the rotated credential in
    /// the state store is authoritative.
    pub refresh_token: Option<String>,
    /// Local `.env` file updated as a best-effort backup of the rotated
    /// refresh credential.
    pub env_backup_path: Option<String>,
}

impl AuthConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            app_key: env::var("APP_KEY").context("APP_KEY is required")?,
            app_secret: env::var("APP_SECRET").context("APP_SECRET is required")?,
            auth_endpoint: env_or(
                "AUTH_ENDPOINT",
                "https://sim.logonvalidation.net/authorize",
            ),
            token_endpoint: env_or("TOKEN_ENDPOINT", "https://sim.logonvalidation.net/token"),
            redirect_url: env_or("REDIRECT_URL", "http://localhost:8080/callback"),
            refresh_token: env::var("REFRESH_TOKEN").ok(),
            env_backup_path: Some(env_or("ENV_BACKUP_PATH", ".env")),
        })
    }
}

/// Broker REST and streaming endpoints plus the state-store address.
/// Simulation and live differ only by host.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub base_url: String,
    pub ws_url: String,
    pub redis_url: Option<String>,
    pub rate_limit: usize,
    pub rate_window_secs: u64,
}

impl BrokerConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            base_url: env_or("SAXO_BASE_URL", "https://gateway.saxobank.com/sim/openapi"),
            ws_url: env_or(
                "SAXO_WS_URL",
                "wss://sim-streaming.saxobank.com/sim/oapi/streaming/ws/connect",
            ),
            redis_url: env::var("REDIS_URL").ok(),
            // Broker cap is 120 calls / 60s; keep a margin of 5.
            rate_limit: env_parse("RATE_LIMIT", 115)?,
            rate_window_secs: env_parse("RATE_WINDOW_SECS", 60)?,
        })
    }
}

/// Entry/exit parameters for the trend follower and profit guard.
#[derive(Debug, Clone)]
pub struct StrategyConfig {
    pub short_period: usize,
    pub long_period: usize,
    pub history_cap: usize,
    pub stop_loss_pct: f64,
    pub trade_quantity: f64,
    pub account_currency: String,
    pub instrument_currency: String,
}

impl StrategyConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            short_period: env_parse("EMA_SHORT_PERIOD", 5)?,
            long_period: env_parse("EMA_LONG_PERIOD", 20)?,
            history_cap: env_parse("PRICE_HISTORY_CAP", 30)?,
            stop_loss_pct: env_parse("STOP_LOSS_PCT", 0.01)?,
            trade_quantity: env_parse("TRADE_QUANTITY", 10.0)?,
            account_currency: env_or("ACCOUNT_CURRENCY", "EUR"),
            instrument_currency: env_or("INSTRUMENT_CURRENCY", "USD"),
        })
    }
}

/// Universe discovery and momentum filter parameters.
#[derive(Debug, Clone)]
pub struct ScannerConfig {
    pub exchanges: Vec<String>,
    pub fallback_keywords: Vec<String>,
    pub min_price: f64,
    pub max_price: f64,
    pub min_percent_change: f64,
    pub scan_interval_secs: u64,
}

impl ScannerConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            exchanges: env_list("SCANNER_EXCHANGES", &["NYSE", "NASDAQ"]),
            fallback_keywords: env_list(
                "SCANNER_KEYWORDS",
                &["Apple", "Microsoft", "Tesla", "Amazon", "Nvidia"],
            ),
            min_price: env_parse("SCANNER_MIN_PRICE", 1.0)?,
            max_price: env_parse("SCANNER_MAX_PRICE", 20.0)?,
            min_percent_change: env_parse("SCANNER_MIN_PERCENT_CHANGE", 1.5)?,
            scan_interval_secs: env_parse("SCAN_INTERVAL_SECS", 600)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub auth: AuthConfig,
    pub broker: BrokerConfig,
    pub strategy: StrategyConfig,
    pub scanner: ScannerConfig,
    /// When true, signals are logged through the reporter instead of hitting
    /// the order endpoint.
    pub dry_run: bool,
    /// UICs enrolled on startup before the scanner finds anything.
    pub watchlist: Vec<Uic>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let watchlist = env_list("WATCHLIST_UICS", &["211"])
            .iter()
            .map(|s| {
                s.parse::<Uic>()
                    .with_context(|| format!("Invalid UIC in WATCHLIST_UICS: {s:?}"))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            auth: AuthConfig::from_env()?,
            broker: BrokerConfig::from_env()?,
            strategy: StrategyConfig::from_env()?,
            scanner: ScannerConfig::from_env()?,
            dry_run: env_parse("DRY_RUN", true)?,
            watchlist,
        })
    }
}
