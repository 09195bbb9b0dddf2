//! API server configuration

use venuelens_shared::config::{env_or, require_env};
use venuelens_shared::ConfigError;

/// Server configuration loaded from the environment
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_address: String,
    /// HS256 secret for bearer tokens
    pub jwt_secret: String,
    pub transform_service_url: String,
    pub transform_timeout_secs: u64,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let allowed_origins: String = env_or(
            "ALLOWED_ORIGINS",
            "http://localhost:3000,http://127.0.0.1:3000".to_string(),
        )?;

        Ok(Self {
            database_url: require_env("DATABASE_URL")?,
            bind_address: env_or("BIND_ADDRESS", "0.0.0.0:8080".to_string())?,
            jwt_secret: require_env("AUTH_JWT_SECRET")?,
            transform_service_url: require_env("TRANSFORM_SERVICE_URL")?,
            transform_timeout_secs: env_or("TRANSFORM_TIMEOUT_SECS", 120)?,
            allowed_origins: split_origins(&allowed_origins),
        })
    }
}

fn split_origins(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_origins() {
        assert_eq!(
            split_origins(" https://a.example , ,https://b.example"),
            vec!["https://a.example", "https://b.example"]
        );
        assert!(split_origins("").is_empty());
    }
}
