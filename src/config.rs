// 7.0 config.rs: all settings in one place. funding, sync, propagation, limits.
// 7.1 has environment presets, 7.2 env var overrides.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

const ENV_PREFIX: &str = "ROOM_LEDGER_";

// Funding distribution settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FundingConfig {
    // Length of one funding period; rates in the same period share an idempotency key
    pub interval_ms: i64,
    // How long a cached funding rate counts as fresh
    pub rate_ttl_ms: i64,
    // Tries per rate read or position write before the unit is counted failed
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_ms: u64,
}

impl Default for FundingConfig {
    fn default() -> Self {
        Self {
            interval_ms: 8 * 3_600_000, // 8h
            rate_ttl_ms: 5 * 60_000,    // 5 minutes
            retry_attempts: 3,
            retry_base_ms: 100,
            retry_max_ms: 1_000,
        }
    }
}

impl FundingConfig {
    pub fn retry_base(&self) -> Duration {
        Duration::from_millis(self.retry_base_ms)
    }

    pub fn retry_max(&self) -> Duration {
        Duration::from_millis(self.retry_max_ms)
    }
}

// Client-side sync and reconnect settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    // Coalescing window when few mutations are pending
    pub coalesce_base_ms: u64,
    // Window once pending count reaches medium_pending_threshold
    pub coalesce_medium_ms: u64,
    // Window once pending count reaches high_pending_threshold
    pub coalesce_max_ms: u64,
    pub medium_pending_threshold: usize,
    pub high_pending_threshold: usize,
    // Minimum gap between two authoritative refetches
    pub refetch_min_interval_ms: u64,
    // Attempts for the initial fetch before giving up and waiting for a signal
    pub initial_fetch_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            coalesce_base_ms: 50,
            coalesce_medium_ms: 75,
            coalesce_max_ms: 100,
            medium_pending_threshold: 10,
            high_pending_threshold: 50,
            refetch_min_interval_ms: 2_000,
            initial_fetch_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
        }
    }
}

impl SyncConfig {
    pub fn refetch_min_interval(&self) -> Duration {
        Duration::from_millis(self.refetch_min_interval_ms)
    }
}

// Change propagation settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PropagationConfig {
    // Per-room broadcast buffer. slow subscribers past this lag and must resync
    pub channel_capacity: usize,
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

// Trade request limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    pub max_leverage: Decimal,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_leverage: dec!(125),
        }
    }
}

// The complete ledger configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    pub funding: FundingConfig,
    pub sync: SyncConfig,
    pub propagation: PropagationConfig,
    pub limits: LimitsConfig,
}

impl LedgerConfig {
    // 7.1: short windows so tests and local runs don't wait on timers
    pub fn testing() -> Self {
        let mut config = Self::default();
        config.funding.interval_ms = 60_000;
        config.funding.rate_ttl_ms = 1_000;
        config.funding.retry_base_ms = 1;
        config.funding.retry_max_ms = 5;
        config.sync.refetch_min_interval_ms = 200;
        config.sync.backoff_base_ms = 10;
        config.sync.backoff_max_ms = 50;
        config.propagation.channel_capacity = 64;
        config
    }

    // conservative leverage cap, larger buffers
    pub fn production() -> Self {
        let mut config = Self::default();
        config.limits.max_leverage = dec!(100);
        config.propagation.channel_capacity = 4096;
        config
    }

    // 7.2: preset from ROOM_LEDGER_ENV, then individual overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = match std::env::var(format!("{ENV_PREFIX}ENV")) {
            Ok(value) => Environment::from_str(&value)?,
            Err(_) => Environment::Development,
        };
        let mut config = environment.config();

        if let Some(v) = env_override("MAX_LEVERAGE")? {
            config.limits.max_leverage = v;
        }
        if let Some(v) = env_override("FUNDING_INTERVAL_MS")? {
            config.funding.interval_ms = v;
        }
        if let Some(v) = env_override("RATE_TTL_MS")? {
            config.funding.rate_ttl_ms = v;
        }
        if let Some(v) = env_override("FUNDING_RETRY_ATTEMPTS")? {
            config.funding.retry_attempts = v;
        }
        if let Some(v) = env_override("CHANNEL_CAPACITY")? {
            config.propagation.channel_capacity = v;
        }
        if let Some(v) = env_override("REFETCH_MIN_INTERVAL_MS")? {
            config.sync.refetch_min_interval_ms = v;
        }

        config.validate()?;
        Ok(config)
    }

    // Validate the configuration for internal consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.funding.interval_ms <= 0 {
            return Err(ConfigError::InvalidFunding {
                reason: "Funding interval must be positive".to_string(),
            });
        }
        if self.funding.rate_ttl_ms < 0 {
            return Err(ConfigError::InvalidFunding {
                reason: "Rate TTL cannot be negative".to_string(),
            });
        }
        if self.funding.retry_attempts == 0 {
            return Err(ConfigError::InvalidFunding {
                reason: "Need at least one attempt per funding unit".to_string(),
            });
        }
        if self.funding.retry_base_ms > self.funding.retry_max_ms {
            return Err(ConfigError::InvalidFunding {
                reason: "Funding retry base exceeds retry cap".to_string(),
            });
        }

        let sync = &self.sync;
        if sync.coalesce_base_ms == 0
            || sync.coalesce_base_ms > sync.coalesce_medium_ms
            || sync.coalesce_medium_ms > sync.coalesce_max_ms
        {
            return Err(ConfigError::InvalidSync {
                reason: "Coalesce windows must be positive and non-decreasing".to_string(),
            });
        }
        if sync.medium_pending_threshold >= sync.high_pending_threshold {
            return Err(ConfigError::InvalidSync {
                reason: "Medium pending threshold must be below the high threshold".to_string(),
            });
        }
        if sync.initial_fetch_attempts == 0 {
            return Err(ConfigError::InvalidSync {
                reason: "Need at least one initial fetch attempt".to_string(),
            });
        }
        if sync.backoff_base_ms > sync.backoff_max_ms {
            return Err(ConfigError::InvalidSync {
                reason: "Backoff base exceeds backoff cap".to_string(),
            });
        }

        if self.propagation.channel_capacity == 0 {
            return Err(ConfigError::InvalidPropagation {
                reason: "Channel capacity must be positive".to_string(),
            });
        }

        if self.limits.max_leverage < Decimal::ONE {
            return Err(ConfigError::InvalidLimits {
                reason: "Max leverage must be at least 1x".to_string(),
            });
        }

        Ok(())
    }
}

fn env_override<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    let full_key = format!("{ENV_PREFIX}{key}");
    match std::env::var(&full_key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv { key: full_key, value: raw }),
        Err(_) => Ok(None),
    }
}

// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid funding config: {reason}")]
    InvalidFunding { reason: String },
    #[error("Invalid sync config: {reason}")]
    InvalidSync { reason: String },
    #[error("Invalid propagation config: {reason}")]
    InvalidPropagation { reason: String },
    #[error("Invalid limits: {reason}")]
    InvalidLimits { reason: String },
    #[error("Cannot parse {key}={value}")]
    InvalidEnv { key: String, value: String },
}

// Environment presets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Development,
    Testing,
    Production,
}

impl Environment {
    pub fn config(&self) -> LedgerConfig {
        match self {
            Environment::Development => LedgerConfig::default(),
            Environment::Testing => LedgerConfig::testing(),
            Environment::Production => LedgerConfig::production(),
        }
    }
}

impl FromStr for Environment {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Ok(Environment::Development),
            "testing" | "test" => Ok(Environment::Testing),
            "production" | "prod" => Ok(Environment::Production),
            _ => Err(ConfigError::InvalidEnv {
                key: format!("{ENV_PREFIX}ENV"),
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_valid() {
        assert!(Environment::Development.config().validate().is_ok());
        assert!(Environment::Testing.config().validate().is_ok());
        assert!(Environment::Production.config().validate().is_ok());
    }

    #[test]
    fn test_sync_defaults() {
        let config = LedgerConfig::default();
        assert_eq!(config.sync.coalesce_base_ms, 50);
        assert_eq!(config.sync.coalesce_max_ms, 100);
        assert_eq!(config.sync.refetch_min_interval(), Duration::from_secs(2));
        assert_eq!(config.sync.initial_fetch_attempts, 3);
    }

    #[test]
    fn test_invalid_coalesce_order() {
        let mut config = LedgerConfig::default();
        config.sync.coalesce_medium_ms = 200;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidSync { .. })));
    }

    #[test]
    fn test_invalid_funding_interval() {
        let mut config = LedgerConfig::default();
        config.funding.interval_ms = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidFunding { .. })));
    }

    #[test]
    fn test_invalid_funding_retry() {
        let mut config = LedgerConfig::default();
        config.funding.retry_attempts = 0;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidFunding { .. })));

        let mut config = LedgerConfig::default();
        config.funding.retry_base_ms = 2_000;
        assert!(matches!(config.validate(), Err(ConfigError::InvalidFunding { .. })));
    }

    #[test]
    fn test_invalid_leverage_cap() {
        let mut config = LedgerConfig::default();
        config.limits.max_leverage = dec!(0.5);
        assert!(matches!(config.validate(), Err(ConfigError::InvalidLimits { .. })));
    }

    #[test]
    fn test_environment_parse() {
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Production);
        assert_eq!("test".parse::<Environment>().unwrap(), Environment::Testing);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_config_serialization() {
        let config = LedgerConfig::production();
        let json = serde_json::to_string(&config).unwrap();
        let back: LedgerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.limits.max_leverage, config.limits.max_leverage);
        assert_eq!(back.propagation.channel_capacity, 4096);
    }
}
