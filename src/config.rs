use config::{Config, ConfigError, Environment, File};
use rust_decimal::Decimal;
use serde::Deserialize;
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info};
use validator::{Validate, ValidationError};

use crate::services::checkout::CheckoutSettings;
use crate::services::pricing::{PricingRules, TaxBase};

/// Default values for configuration
const DEFAULT_LOG_LEVEL: &str = "info";
const DEFAULT_ENV: &str = "development";
const DEFAULT_PORT: u16 = 8080;
const CONFIG_DIR: &str = "config";
const DEFAULT_STORE_BACKEND: &str = "in-memory";
const DEFAULT_CURRENCY: &str = "USD";
const DEFAULT_RESERVATION_TTL_SECS: u64 = 30 * 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 60;

/// Application configuration structure with validation
#[derive(Clone, Debug, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    /// Database connection URL (used when `store_backend = "database"`)
    pub database_url: String,

    /// Persistence backend: "in-memory" or "database"
    #[serde(default = "default_store_backend")]
    #[validate(custom = "validate_store_backend")]
    pub store_backend: String,

    /// Create missing tables from the entity definitions on startup
    #[serde(default)]
    pub auto_create_schema: bool,

    /// Server host address
    pub host: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Application environment
    pub environment: String,

    /// Logging level
    #[serde(default = "default_log_level")]
    #[validate(custom = "validate_log_level")]
    pub log_level: String,

    /// Log in JSON format (structured logging)
    #[serde(default)]
    pub log_json: bool,

    /// DB pool: max connections
    #[serde(default = "default_db_max_connections")]
    pub db_max_connections: u32,

    /// DB pool: min connections
    #[serde(default = "default_db_min_connections")]
    pub db_min_connections: u32,

    /// DB timeouts (seconds)
    #[serde(default = "default_db_connect_timeout_secs")]
    pub db_connect_timeout_secs: u64,
    #[serde(default = "default_db_acquire_timeout_secs")]
    pub db_acquire_timeout_secs: u64,

    /// Settlement currency (single-currency marketplace)
    #[serde(default = "default_currency")]
    pub currency: String,

    /// Tax rate as a fraction, e.g. 0.18 for 18%
    #[serde(default = "default_tax_rate")]
    #[validate(custom = "validate_rate")]
    pub tax_rate: Decimal,

    /// "discounted" taxes `subtotal - discount`; "gross" taxes `subtotal`
    #[serde(default = "default_tax_base")]
    #[validate(custom = "validate_tax_base")]
    pub tax_base: String,

    /// Flat shipping fee in minor units
    #[serde(default = "default_shipping_flat_fee")]
    #[validate(range(min = 0))]
    pub shipping_flat_fee: i64,

    /// Discounted subtotal (minor units) at which shipping becomes free
    #[serde(default)]
    pub free_shipping_threshold: Option<i64>,

    /// Platform commission as a fraction of each seller's subtotal
    #[serde(default = "default_commission_rate")]
    #[validate(custom = "validate_rate")]
    pub commission_rate: Decimal,

    /// How long a PENDING_PAYMENT order holds its stock
    #[serde(default = "default_reservation_ttl_secs")]
    #[validate(range(min = 1))]
    pub reservation_ttl_secs: u64,

    /// Interval between expiry sweeps
    #[serde(default = "default_sweep_interval_secs")]
    #[validate(range(min = 1))]
    pub expiry_sweep_interval_secs: u64,

    /// Maximum orders cancelled per sweep
    #[serde(default = "default_expiry_batch_size")]
    #[validate(range(min = 1))]
    pub expiry_batch_size: u64,

    /// Upper bound for a whole checkout request
    #[serde(default = "default_checkout_timeout_ms")]
    #[validate(range(min = 1))]
    pub checkout_timeout_ms: u64,

    /// Upper bound for the payment intent call
    #[serde(default = "default_gateway_timeout_ms")]
    #[validate(range(min = 1))]
    pub gateway_timeout_ms: u64,

    /// Payment gateway base URL; a simulated gateway is used when unset
    #[serde(default)]
    pub payment_gateway_url: Option<String>,

    /// Payment gateway secret API key
    #[serde(default)]
    pub payment_gateway_api_key: Option<String>,

    /// Shared secret used to verify webhook signatures
    #[serde(default)]
    pub payment_webhook_secret: Option<String>,

    /// Accepted clock skew for signed webhook timestamps
    #[serde(default = "default_webhook_tolerance_secs")]
    pub payment_webhook_tolerance_secs: u64,

    /// Catalog service base URL for live price lookups
    #[serde(default)]
    pub catalog_url: Option<String>,

    /// Key expected in `X-API-Key` on operator routes; they are closed when unset
    #[serde(default)]
    pub operator_api_key: Option<String>,

    /// Capacity of the notification dispatch queue
    #[serde(default = "default_notification_queue_capacity")]
    #[validate(range(min = 1))]
    pub notification_queue_capacity: usize,

    /// Circuit breaker: failures before the gateway circuit opens
    #[serde(default = "default_circuit_breaker_failures")]
    pub circuit_breaker_failure_threshold: u32,

    /// Circuit breaker: seconds before a half-open trial call
    #[serde(default = "default_circuit_breaker_timeout")]
    pub circuit_breaker_timeout_secs: u64,
}

/// Configuration loading error
#[derive(Debug, Error)]
pub enum AppConfigError {
    #[error("Configuration loading failed: {0}")]
    Load(#[from] ConfigError),

    #[error("Configuration validation failed: {0}")]
    Validation(#[from] validator::ValidationErrors),
}

impl AppConfig {
    /// Creates a configuration with defaults for everything but the
    /// connection and bind settings.
    pub fn new(database_url: String, host: String, port: u16, environment: String) -> Self {
        Self {
            database_url,
            store_backend: default_store_backend(),
            auto_create_schema: false,
            host,
            port,
            environment,
            log_level: default_log_level(),
            log_json: false,
            db_max_connections: default_db_max_connections(),
            db_min_connections: default_db_min_connections(),
            db_connect_timeout_secs: default_db_connect_timeout_secs(),
            db_acquire_timeout_secs: default_db_acquire_timeout_secs(),
            currency: default_currency(),
            tax_rate: default_tax_rate(),
            tax_base: default_tax_base(),
            shipping_flat_fee: default_shipping_flat_fee(),
            free_shipping_threshold: None,
            commission_rate: default_commission_rate(),
            reservation_ttl_secs: default_reservation_ttl_secs(),
            expiry_sweep_interval_secs: default_sweep_interval_secs(),
            expiry_batch_size: default_expiry_batch_size(),
            checkout_timeout_ms: default_checkout_timeout_ms(),
            gateway_timeout_ms: default_gateway_timeout_ms(),
            payment_gateway_url: None,
            payment_gateway_api_key: None,
            payment_webhook_secret: None,
            payment_webhook_tolerance_secs: default_webhook_tolerance_secs(),
            catalog_url: None,
            operator_api_key: None,
            notification_queue_capacity: default_notification_queue_capacity(),
            circuit_breaker_failure_threshold: default_circuit_breaker_failures(),
            circuit_breaker_timeout_secs: default_circuit_breaker_timeout(),
        }
    }

    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }

    pub fn uses_database(&self) -> bool {
        self.store_backend.eq_ignore_ascii_case("database")
    }

    pub fn log_level(&self) -> &str {
        &self.log_level
    }

    pub fn pricing_rules(&self) -> PricingRules {
        PricingRules {
            tax_rate: self.tax_rate,
            tax_base: if self.tax_base.eq_ignore_ascii_case("gross") {
                TaxBase::Gross
            } else {
                TaxBase::Discounted
            },
            shipping_flat_fee: self.shipping_flat_fee,
            free_shipping_threshold: self.free_shipping_threshold,
            commission_rate: self.commission_rate,
        }
    }

    pub fn checkout_settings(&self) -> CheckoutSettings {
        CheckoutSettings {
            currency: self.currency.clone(),
            reservation_ttl: Duration::from_secs(self.reservation_ttl_secs),
            checkout_timeout: Duration::from_millis(self.checkout_timeout_ms),
            gateway_timeout: Duration::from_millis(self.gateway_timeout_ms),
        }
    }

    /// Checks that only hold outside development.
    fn validate_additional_constraints(&self) -> Result<(), ValidationError> {
        if self.is_production() && self.payment_webhook_secret.is_none() {
            let mut err = ValidationError::new("payment_webhook_secret");
            err.message =
                Some("payment_webhook_secret is required in production".into());
            return Err(err);
        }
        if self.is_production() && !self.uses_database() {
            let mut err = ValidationError::new("store_backend");
            err.message = Some("production requires store_backend = \"database\"".into());
            return Err(err);
        }
        Ok(())
    }
}

/// Default value functions
fn default_log_level() -> String {
    DEFAULT_LOG_LEVEL.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_store_backend() -> String {
    DEFAULT_STORE_BACKEND.to_string()
}

fn default_db_max_connections() -> u32 {
    10
}
fn default_db_min_connections() -> u32 {
    1
}
fn default_db_connect_timeout_secs() -> u64 {
    30
}
fn default_db_acquire_timeout_secs() -> u64 {
    8
}

fn default_currency() -> String {
    DEFAULT_CURRENCY.to_string()
}

fn default_tax_rate() -> Decimal {
    Decimal::new(18, 2)
}

fn default_tax_base() -> String {
    "discounted".to_string()
}

fn default_shipping_flat_fee() -> i64 {
    500
}

fn default_commission_rate() -> Decimal {
    Decimal::new(10, 2)
}

fn default_reservation_ttl_secs() -> u64 {
    DEFAULT_RESERVATION_TTL_SECS
}

fn default_sweep_interval_secs() -> u64 {
    DEFAULT_SWEEP_INTERVAL_SECS
}

fn default_expiry_batch_size() -> u64 {
    100
}

fn default_checkout_timeout_ms() -> u64 {
    15_000
}

fn default_gateway_timeout_ms() -> u64 {
    5_000
}

fn default_webhook_tolerance_secs() -> u64 {
    300
}

fn default_notification_queue_capacity() -> usize {
    1024
}

fn default_circuit_breaker_failures() -> u32 {
    5
}

fn default_circuit_breaker_timeout() -> u64 {
    60
}

fn validate_store_backend(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "in-memory" | "database" => Ok(()),
        _ => {
            let mut err = ValidationError::new("store_backend");
            err.message = Some("Must be one of: in-memory, database".into());
            Err(err)
        }
    }
}

fn validate_tax_base(value: &str) -> Result<(), ValidationError> {
    match value.to_ascii_lowercase().as_str() {
        "discounted" | "gross" => Ok(()),
        _ => {
            let mut err = ValidationError::new("tax_base");
            err.message = Some("Must be one of: discounted, gross".into());
            Err(err)
        }
    }
}

/// Validates log level values
fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    let valid_levels = ["trace", "debug", "info", "warn", "error"];
    if valid_levels.contains(&level.to_lowercase().as_str()) {
        Ok(())
    } else {
        let mut err = ValidationError::new("log_level");
        err.message = Some("Must be one of: trace, debug, info, warn, error".into());
        Err(err)
    }
}

fn validate_rate(rate: &Decimal) -> Result<(), ValidationError> {
    if rate.is_sign_negative() || *rate > Decimal::ONE {
        let mut err = ValidationError::new("rate");
        err.message = Some("rates must be between 0.0 and 1.0".into());
        return Err(err);
    }
    Ok(())
}

/// Initializes tracing using the provided log level as the default filter
pub fn init_tracing(level: &str, json: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let default_directive = format!("marketplace_checkout={},tower_http=debug", level);
    let filter_directive = env::var("RUST_LOG")
        .ok()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(default_directive);

    let result = if json {
        fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .json()
            .try_init()
    } else {
        fmt()
            .with_env_filter(EnvFilter::new(filter_directive))
            .try_init()
    };
    if let Err(err) = result {
        eprintln!("tracing subscriber already installed: {err}");
    }
}

/// Loads application configuration
///
/// Layers configuration sources in this order:
/// 1. Built-in defaults
/// 2. Default config (config/default.toml)
/// 3. Environment-specific config (config/{env}.toml)
/// 4. Environment variables (APP__*)
pub fn load_config() -> Result<AppConfig, AppConfigError> {
    // Support both RUN_ENV and APP_ENV for selecting config profile
    let run_env = env::var("RUN_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| DEFAULT_ENV.to_string());
    info!("Loading configuration for environment: {}", run_env);

    if !Path::new(CONFIG_DIR).exists() {
        info!(
            "Config directory '{}' not found; relying on built-in defaults and environment variables",
            CONFIG_DIR
        );
    }

    let config = Config::builder()
        .set_default("database_url", "sqlite://checkout.db?mode=rwc")?
        .set_default("host", "0.0.0.0")?
        .set_default("port", i64::from(DEFAULT_PORT))?
        .set_default("environment", run_env.as_str())?
        .set_default("log_level", DEFAULT_LOG_LEVEL)?
        .add_source(File::with_name(&format!("{}/default", CONFIG_DIR)).required(false))
        .add_source(File::with_name(&format!("{}/{}", CONFIG_DIR, run_env)).required(false))
        .add_source(Environment::with_prefix("APP").separator("__"))
        .build()?;

    let app_config: AppConfig = config.try_deserialize()?;

    app_config.validate().map_err(|e| {
        error!("Configuration validation failed: {:?}", e);
        AppConfigError::Validation(e)
    })?;

    app_config.validate_additional_constraints().map_err(|e| {
        error!("Configuration constraint failed: {:?}", e);
        let mut errors = validator::ValidationErrors::new();
        errors.add("environment", e);
        AppConfigError::Validation(errors)
    })?;

    info!("Configuration loaded successfully");
    Ok(app_config)
}
