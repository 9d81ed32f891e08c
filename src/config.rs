use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub trade: TradeConfig,
    pub lnd: LndConfig,
    pub database: DatabaseConfig,
    pub price: PriceConfig,
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Thresholds governing both the state machine guards and the scheduler
/// sweep windows. All values are read once at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct TradeConfig {
    /// Seconds a funded hold invoice may stay held before the escrow is
    /// force-canceled and the order expires
    pub hold_invoice_expiration_secs: u64,
    /// Seconds a taken order may wait for funding / a payout invoice
    pub order_taken_expiration_secs: u64,
    /// Seconds after `taken_at` before a dispute may be opened
    pub dispute_delay_secs: u64,
    /// Lifetime dispute count that triggers a platform-wide ban
    pub max_disputes_before_ban: u32,
    /// Maximum payout attempts per pending payment
    pub max_payment_attempts: u32,
    /// Routing fee cap as a fraction of the amount (e.g. 0.001 = 0.1%)
    pub max_routing_fee_pct: Decimal,
    /// Smallest tradable amount in sats
    pub min_payment_amount_sats: i64,
    /// Largest tradable amount in sats
    pub max_payment_amount_sats: i64,
    /// Platform fee rate applied once at order creation (e.g. 0.006)
    pub fee_rate: Decimal,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LndConfig {
    /// LND REST endpoint, e.g. "https://localhost:8080"
    pub rest_url: String,
    /// Hex-encoded admin macaroon
    pub macaroon_hex: String,
    /// Invoice expiry passed to the node when registering hold invoices
    #[serde(default = "default_invoice_expiry")]
    pub invoice_expiry_secs: u64,
    /// Timeout for a single outbound payment attempt
    #[serde(default = "default_payment_timeout")]
    pub payment_timeout_secs: u64,
}

fn default_invoice_expiry() -> u64 {
    3600
}

fn default_payment_timeout() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// PostgreSQL connection URL
    pub url: String,
    /// Maximum connections in pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Deserialize)]
pub struct PriceConfig {
    /// Fiat exchange-rate API base URL (sats resolved per fiat code)
    pub api_url: String,
    #[serde(default = "default_price_timeout")]
    pub request_timeout_secs: u64,
}

fn default_price_timeout() -> u64 {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Interval between expired-order sweeps
    #[serde(default = "default_sweep_interval")]
    pub order_sweep_interval_secs: u64,
    /// Interval between pending-payment retry passes
    #[serde(default = "default_payment_interval")]
    pub pending_payment_interval_secs: u64,
    /// Interval between held-invoice reconciliation passes
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval_secs: u64,
    /// Interval between community earnings aggregation passes
    #[serde(default = "default_earnings_interval")]
    pub earnings_interval_secs: u64,
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_payment_interval() -> u64 {
    300
}

fn default_reconcile_interval() -> u64 {
    600
}

fn default_earnings_interval() -> u64 {
    3600
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            order_sweep_interval_secs: default_sweep_interval(),
            pending_payment_interval_secs: default_payment_interval(),
            reconcile_interval_secs: default_reconcile_interval(),
            earnings_interval_secs: default_earnings_interval(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from files and environment
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default values
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            .set_default("database.max_connections", 5)?
            .set_default("scheduler.order_sweep_interval_secs", 60)?
            .set_default("scheduler.pending_payment_interval_secs", 300)?
            .set_default("scheduler.reconcile_interval_secs", 600)?
            .set_default("scheduler.earnings_interval_secs", 3600)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("LNBARTER_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (LNBARTER_LND__REST_URL, etc.)
            .add_source(
                Environment::with_prefix("LNBARTER")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.trade.min_payment_amount_sats <= 0 {
            errors.push("min_payment_amount_sats must be positive".to_string());
        }

        if self.trade.max_payment_amount_sats <= self.trade.min_payment_amount_sats {
            errors.push(
                "max_payment_amount_sats must exceed min_payment_amount_sats".to_string(),
            );
        }

        if self.trade.max_payment_attempts == 0 {
            errors.push("max_payment_attempts must be at least 1".to_string());
        }

        if self.trade.max_routing_fee_pct <= Decimal::ZERO
            || self.trade.max_routing_fee_pct >= Decimal::ONE
        {
            errors.push("max_routing_fee_pct must be between 0 and 1".to_string());
        }

        if self.trade.fee_rate < Decimal::ZERO || self.trade.fee_rate >= Decimal::ONE {
            errors.push("fee_rate must be in [0, 1)".to_string());
        }

        if self.trade.dispute_delay_secs >= self.trade.hold_invoice_expiration_secs {
            errors.push(
                "dispute_delay_secs should be less than hold_invoice_expiration_secs".to_string(),
            );
        }

        if self.lnd.macaroon_hex.is_empty() {
            errors.push("lnd.macaroon_hex must be set".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
