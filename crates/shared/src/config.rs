//! Environment configuration shared by the api, worker and admin binaries

use std::str::FromStr;

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Read a required variable
pub fn require_env(name: &'static str) -> Result<String, ConfigError> {
    match std::env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

/// Read an optional variable, parsing it if present
pub fn env_or<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim().parse().map_err(|_| ConfigError::Invalid {
                name,
                value: raw.clone(),
            })
        }
        _ => Ok(default),
    }
}

/// Read an optional boolean (`true/false`, `1/0`, `yes/no`)
pub fn env_flag(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => parse_flag(&raw).ok_or(ConfigError::Invalid {
            name,
            value: raw,
        }),
        _ => Ok(default),
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Counter store connection settings
#[derive(Debug, Clone)]
pub struct CounterStoreConfig {
    pub url: String,
    pub tls: bool,
    /// Fall back to the degraded store when the counter store is unreachable
    pub allow_degraded: bool,
}

impl Default for CounterStoreConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            tls: false,
            allow_degraded: true,
        }
    }
}

impl CounterStoreConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        Ok(Self {
            url: env_or("COUNTER_STORE_URL", defaults.url)?,
            tls: env_flag("COUNTER_STORE_TLS", defaults.tls)?,
            allow_degraded: env_flag("ALLOW_DEGRADED_COUNTER_STORE", defaults.allow_degraded)?,
        })
    }

    /// URL handed to the Redis client, upgraded to `rediss://` when TLS is on
    pub fn connection_url(&self) -> String {
        if self.tls {
            if let Some(rest) = self.url.strip_prefix("redis://") {
                return format!("rediss://{}", rest);
            }
        }
        self.url.clone()
    }
}

/// Yearly reset scheduler settings
#[derive(Debug, Clone)]
pub struct ResetConfig {
    /// Days after each 30-day boundary during which a reset may run
    pub eligibility_window_days: u32,
    /// Lifetime of a ledger key
    pub ledger_ttl_seconds: u64,
    /// Users processed concurrently by one sweep
    pub concurrency: usize,
}

impl Default for ResetConfig {
    fn default() -> Self {
        Self {
            eligibility_window_days: 2,
            ledger_ttl_seconds: 3_456_000,
            concurrency: 8,
        }
    }
}

impl ResetConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            eligibility_window_days: env_or(
                "YEARLY_RESET_ELIGIBILITY_WINDOW_DAYS",
                defaults.eligibility_window_days,
            )?,
            ledger_ttl_seconds: env_or(
                "YEARLY_RESET_LEDGER_TTL_SECONDS",
                defaults.ledger_ttl_seconds,
            )?,
            concurrency: env_or("YEARLY_RESET_CONCURRENCY", defaults.concurrency)?,
        };

        if config.eligibility_window_days == 0 || config.eligibility_window_days > 30 {
            return Err(ConfigError::Invalid {
                name: "YEARLY_RESET_ELIGIBILITY_WINDOW_DAYS",
                value: config.eligibility_window_days.to_string(),
            });
        }
        if config.concurrency == 0 {
            return Err(ConfigError::Invalid {
                name: "YEARLY_RESET_CONCURRENCY",
                value: "0".to_string(),
            });
        }
        Ok(config)
    }
}
