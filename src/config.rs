//! Configuration management for llm-relay.
//!
//! Configuration can be set via environment variables:
//! - `LLM_RELAY_HOST` - Optional. Server host. Defaults to `127.0.0.1`.
//! - `LLM_RELAY_PORT` - Optional. Server port. Defaults to `8080`.
//! - `LLM_RELAY_DB` - Optional. SQLite database path. Defaults to `llm-relay.db`.
//! - `LLM_RELAY_ADMIN_TOKEN` - Required. Bearer token for the `/admin` surface.
//! - `LLM_RELAY_CACHE_TTL_SECS` - Optional. Provider cache TTL. Defaults to `60`.
//! - `LLM_RELAY_PUBSUB_CHANNEL` - Optional. Invalidation channel name.
//! - `LLM_RELAY_UTC_OFFSET_MINUTES` - Optional. Fixed offset for daily anchors. Defaults to `0`.
//! - `LLM_RELAY_CACHE_TIER_DEFAULT` - Optional. `5m` or `1h`. Defaults to `5m`.
//! - `LLM_RELAY_SHUTDOWN_GRACE_SECS` - Optional. Drain deadline. Defaults to `30`.
//! - `API_TEST_TIMEOUT_MS` - Optional. Connectivity test timeout, 5000-120000.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Which prompt-cache pricing tier applies when a provider says `inherit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheTier {
    FiveMinute,
    OneHour,
}

impl CacheTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheTier::FiveMinute => "5m",
            CacheTier::OneHour => "1h",
        }
    }
}

/// Process-wide configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// SQLite database path
    pub db_path: PathBuf,

    /// Bearer token guarding the /admin surface
    pub admin_token: String,

    /// Provider cache TTL in seconds
    pub provider_cache_ttl_secs: u64,

    /// Name of the invalidation channel
    pub pubsub_channel: String,

    /// Fixed UTC offset (minutes) used to anchor fixed daily windows
    pub utc_offset_minutes: i32,

    /// Cache tier applied when a provider's preference is `inherit`
    pub cache_tier_default: CacheTier,

    /// How long to drain in-flight requests on shutdown
    pub shutdown_grace_secs: u64,

    /// Connectivity / admin test timeout in milliseconds (5000-120000)
    pub api_test_timeout_ms: u64,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if `LLM_RELAY_ADMIN_TOKEN` is not
    /// set, or `ConfigError::InvalidValue` for unparseable numeric values.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = std::env::var("LLM_RELAY_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());

        let port = std::env::var("LLM_RELAY_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("LLM_RELAY_PORT".to_string(), format!("{}", e))
            })?;

        let db_path = std::env::var("LLM_RELAY_DB")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("llm-relay.db"));

        let admin_token = std::env::var("LLM_RELAY_ADMIN_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("LLM_RELAY_ADMIN_TOKEN".to_string()))?;

        let provider_cache_ttl_secs = std::env::var("LLM_RELAY_CACHE_TTL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("LLM_RELAY_CACHE_TTL_SECS".to_string(), format!("{}", e))
            })?;

        let pubsub_channel = std::env::var("LLM_RELAY_PUBSUB_CHANNEL")
            .unwrap_or_else(|_| "provider-cache-invalidation".to_string());

        let utc_offset_minutes = std::env::var("LLM_RELAY_UTC_OFFSET_MINUTES")
            .unwrap_or_else(|_| "0".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue(
                    "LLM_RELAY_UTC_OFFSET_MINUTES".to_string(),
                    format!("{}", e),
                )
            })?;

        let cache_tier_default = match std::env::var("LLM_RELAY_CACHE_TIER_DEFAULT")
            .unwrap_or_else(|_| "5m".to_string())
            .as_str()
        {
            "5m" => CacheTier::FiveMinute,
            "1h" => CacheTier::OneHour,
            other => {
                return Err(ConfigError::InvalidValue(
                    "LLM_RELAY_CACHE_TIER_DEFAULT".to_string(),
                    format!("expected '5m' or '1h', got '{}'", other),
                ))
            }
        };

        let shutdown_grace_secs = std::env::var("LLM_RELAY_SHUTDOWN_GRACE_SECS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue(
                    "LLM_RELAY_SHUTDOWN_GRACE_SECS".to_string(),
                    format!("{}", e),
                )
            })?;

        let api_test_timeout_ms: u64 = std::env::var("API_TEST_TIMEOUT_MS")
            .unwrap_or_else(|_| "15000".to_string())
            .parse()
            .map_err(|e| {
                ConfigError::InvalidValue("API_TEST_TIMEOUT_MS".to_string(), format!("{}", e))
            })?;
        if !(5_000..=120_000).contains(&api_test_timeout_ms) {
            return Err(ConfigError::InvalidValue(
                "API_TEST_TIMEOUT_MS".to_string(),
                format!("must be within 5000-120000, got {}", api_test_timeout_ms),
            ));
        }

        Ok(Self {
            host,
            port,
            db_path,
            admin_token,
            provider_cache_ttl_secs,
            pubsub_channel,
            utc_offset_minutes,
            cache_tier_default,
            shutdown_grace_secs,
            api_test_timeout_ms,
        })
    }

    /// Create a config with custom values (useful for testing).
    pub fn for_tests(db_path: PathBuf) -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            db_path,
            admin_token: "test-admin-token".to_string(),
            provider_cache_ttl_secs: 60,
            pubsub_channel: "provider-cache-invalidation".to_string(),
            utc_offset_minutes: 0,
            cache_tier_default: CacheTier::FiveMinute,
            shutdown_grace_secs: 5,
            api_test_timeout_ms: 15_000,
        }
    }
}
