//! Warehouse engine configuration loaded from environment variables.
//!
//! # Environment Variables
//!
//! ## Required
//! - `WAREHOUSE_DATABASE_URL` - `PostgreSQL` connection string (falls back to `DATABASE_URL`)
//!
//! ## Optional
//! - `WAREHOUSE_DB_MAX_CONNECTIONS` - Pool size (default: 10)
//! - `WAREHOUSE_LOCK_TIMEOUT_MS` - Row lock / transaction acquire timeout (default: 5000)
//! - `WAREHOUSE_YIELD_POLICY` - `permit`, `warn` or `reject:<max>` (default: permit)
//! - `WAREHOUSE_LINEAGE_MAX_DEPTH` - Genealogy traversal bound (default: 32)
//! - `WAREHOUSE_ELIGIBLE_PAGE_SIZE` - Rows per FIFO cursor page (default: 50)
//! - `SENTRY_DSN` - Sentry error tracking DSN
//! - `SENTRY_ENVIRONMENT` - Sentry environment name

use std::str::FromStr;
use std::time::Duration;

use rust_decimal::Decimal;
use secrecy::SecretString;
use thiserror::Error;

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const DEFAULT_LOCK_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_LINEAGE_MAX_DEPTH: usize = 32;
const DEFAULT_ELIGIBLE_PAGE_SIZE: i64 = 50;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
}

/// What to do when a conversion produces more than it consumed.
///
/// Yield is `quantity_produced / sum(quantity_consumed)`. Values above one are
/// legitimate for some processes (brining, hydration) and nonsense for others,
/// so the bound is a deployment decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum YieldPolicy {
    /// Accept any yield.
    #[default]
    Permit,
    /// Accept, but log a warning when yield exceeds one.
    Warn,
    /// Reject conversions whose yield exceeds the given ratio.
    Reject {
        /// Largest accepted yield ratio.
        max_yield: Decimal,
    },
}

impl FromStr for YieldPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().to_ascii_lowercase();
        match s.as_str() {
            "permit" => Ok(Self::Permit),
            "warn" => Ok(Self::Warn),
            _ => {
                let Some(max) = s.strip_prefix("reject:") else {
                    return Err(format!(
                        "invalid yield policy '{s}' (expected permit, warn or reject:<max>)"
                    ));
                };
                let max_yield = Decimal::from_str(max.trim())
                    .map_err(|e| format!("invalid reject bound '{max}': {e}"))?;
                if max_yield <= Decimal::ZERO {
                    return Err(format!("reject bound must be positive, got {max_yield}"));
                }
                Ok(Self::Reject { max_yield })
            }
        }
    }
}

/// Engine behaviour knobs, independent of how the store is reached.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long a unit of work may wait for a row lock before failing.
    pub lock_timeout: Duration,
    /// Bound applied to production yield.
    pub yield_policy: YieldPolicy,
    /// Maximum number of production hops a genealogy traversal follows.
    pub lineage_max_depth: usize,
    /// Rows fetched per page by the FIFO eligible-lot cursor.
    pub eligible_page_size: i64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lock_timeout: Duration::from_millis(DEFAULT_LOCK_TIMEOUT_MS),
            yield_policy: YieldPolicy::Permit,
            lineage_max_depth: DEFAULT_LINEAGE_MAX_DEPTH,
            eligible_page_size: DEFAULT_ELIGIBLE_PAGE_SIZE,
        }
    }
}

impl EngineConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let lock_timeout_ms: u64 = parse_env_or_default(
            "WAREHOUSE_LOCK_TIMEOUT_MS",
            DEFAULT_LOCK_TIMEOUT_MS,
        )?;
        let yield_policy = get_optional_env("WAREHOUSE_YIELD_POLICY")
            .map(|raw| {
                raw.parse::<YieldPolicy>()
                    .map_err(|e| ConfigError::InvalidEnvVar("WAREHOUSE_YIELD_POLICY".into(), e))
            })
            .transpose()?
            .unwrap_or_default();
        let lineage_max_depth =
            parse_env_or_default("WAREHOUSE_LINEAGE_MAX_DEPTH", DEFAULT_LINEAGE_MAX_DEPTH)?;
        let eligible_page_size: i64 =
            parse_env_or_default("WAREHOUSE_ELIGIBLE_PAGE_SIZE", DEFAULT_ELIGIBLE_PAGE_SIZE)?;
        if eligible_page_size <= 0 {
            return Err(ConfigError::InvalidEnvVar(
                "WAREHOUSE_ELIGIBLE_PAGE_SIZE".to_string(),
                "must be positive".to_string(),
            ));
        }

        Ok(Self {
            lock_timeout: Duration::from_millis(lock_timeout_ms),
            yield_policy,
            lineage_max_depth,
            eligible_page_size,
        })
    }
}

/// Warehouse application configuration.
#[derive(Clone)]
pub struct WarehouseConfig {
    /// `PostgreSQL` database connection URL (contains password)
    pub database_url: SecretString,
    /// Maximum pooled connections
    pub max_connections: u32,
    /// Engine behaviour
    pub engine: EngineConfig,
    /// Sentry DSN for error tracking
    pub sentry_dsn: Option<String>,
    /// Sentry environment (e.g., "development", "staging", "production")
    pub sentry_environment: Option<String>,
}

impl std::fmt::Debug for WarehouseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WarehouseConfig")
            .field("database_url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("engine", &self.engine)
            .field("sentry_dsn", &self.sentry_dsn.as_ref().map(|_| "[REDACTED]"))
            .field("sentry_environment", &self.sentry_environment)
            .finish()
    }
}

impl WarehouseConfig {
    /// Load configuration from environment variables.
    ///
    /// Calls `dotenvy::dotenv()` to load from `.env` file if present.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if required variables are missing or invalid.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env file if present (ignore errors if not found)
        let _ = dotenvy::dotenv();

        let database_url = get_database_url("WAREHOUSE_DATABASE_URL")?;
        let max_connections =
            parse_env_or_default("WAREHOUSE_DB_MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        let engine = EngineConfig::from_env()?;

        Ok(Self {
            database_url,
            max_connections,
            engine,
            sentry_dsn: get_optional_env("SENTRY_DSN"),
            sentry_environment: get_optional_env("SENTRY_ENVIRONMENT"),
        })
    }
}

// =============================================================================
// Helper Functions
// =============================================================================

/// Get database URL with fallback to generic `DATABASE_URL`.
fn get_database_url(primary_key: &str) -> Result<SecretString, ConfigError> {
    if let Ok(value) = std::env::var(primary_key) {
        return Ok(SecretString::from(value));
    }
    if let Ok(value) = std::env::var("DATABASE_URL") {
        return Ok(SecretString::from(value));
    }
    Err(ConfigError::MissingEnvVar(primary_key.to_string()))
}

/// Get an optional environment variable.
fn get_optional_env(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

/// Parse an environment variable, falling back to a default when unset.
fn parse_env_or_default<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    get_optional_env(key).map_or(Ok(default), |raw| parse_value(key, &raw))
}

fn parse_value<T>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse::<T>()
        .map_err(|e| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}
