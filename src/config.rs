//! Boot-time configuration, read from the environment.
//!
//! Missing required variables are a fatal boot error: the process should
//! not start serving connections in a half-configured state.

use std::time::Duration;

use anyhow::{Context, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Environment {
    Production,
    Development,
}

impl Environment {
    fn parse(raw: &str) -> Self {
        match raw.to_ascii_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }

    pub fn is_production(self) -> bool {
        matches!(self, Environment::Production)
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: Environment,
    pub allowed_origins: Vec<String>,
    pub port: u16,
    pub database_url: String,
    pub redis_url: String,
    pub jwt_secret: String,

    pub flush_interval: Duration,
    pub cleanup_interval: Duration,
    pub session_inactivity: Duration,

    pub lsh_bands: u32,
    pub lsh_hamming_threshold: u32,

    pub max_user_connections: usize,
    pub max_ip_connections: usize,
}

impl AppConfig {
    /// Load configuration from the environment, failing fast on anything
    /// required but absent.
    pub fn from_env() -> Result<Self> {
        let environment = Environment::parse(&env_or("ENVIRONMENT", "development"));

        let allowed_origins = std::env::var("ALLOWED_ORIGINS")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let database_url = std::env::var("DATABASE_URL")
            .context("DATABASE_URL must be set (durable session store)")?;
        let redis_url =
            std::env::var("REDIS_URL").context("REDIS_URL must be set (hot write-through cache)")?;
        let jwt_secret =
            std::env::var("JWT_SECRET").context("JWT_SECRET must be set (gateway authentication)")?;

        let port = env_or("PORT", "8080")
            .parse()
            .context("PORT must be a valid u16")?;

        Ok(Self {
            environment,
            allowed_origins,
            port,
            database_url,
            redis_url,
            jwt_secret,
            flush_interval: Duration::from_secs(env_parse("FLUSH_INTERVAL_SECS", 5)?),
            cleanup_interval: Duration::from_secs(env_parse("CLEANUP_INTERVAL_SECS", 300)?),
            session_inactivity: Duration::from_secs(env_parse("SESSION_INACTIVITY_SECS", 1800)?),
            lsh_bands: env_parse("LSH_BANDS", 4)?,
            lsh_hamming_threshold: env_parse("LSH_HAMMING_THRESHOLD", 10)?,
            max_user_connections: env_parse("MAX_USER_CONNECTIONS", 5)?,
            max_ip_connections: env_parse("MAX_IP_CONNECTIONS", 10)?,
        })
    }

    /// Whether `origin` is acceptable for a WS upgrade under this config.
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        if !self.environment.is_production() {
            return true;
        }
        match origin {
            Some(o) => self.allowed_origins.iter().any(|allowed| allowed == o),
            None => false,
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| anyhow::anyhow!("{key} is invalid: {e}")),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dev_environment_allows_any_origin() {
        let cfg = AppConfig {
            environment: Environment::Development,
            allowed_origins: vec![],
            port: 8080,
            database_url: String::new(),
            redis_url: String::new(),
            jwt_secret: String::new(),
            flush_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(300),
            session_inactivity: Duration::from_secs(1800),
            lsh_bands: 4,
            lsh_hamming_threshold: 10,
            max_user_connections: 5,
            max_ip_connections: 10,
        };
        assert!(cfg.origin_allowed(Some("https://evil.example")));
        assert!(cfg.origin_allowed(None));
    }

    #[test]
    fn prod_environment_requires_exact_match() {
        let cfg = AppConfig {
            environment: Environment::Production,
            allowed_origins: vec!["https://strudel.cc".to_string()],
            port: 8080,
            database_url: String::new(),
            redis_url: String::new(),
            jwt_secret: String::new(),
            flush_interval: Duration::from_secs(5),
            cleanup_interval: Duration::from_secs(300),
            session_inactivity: Duration::from_secs(1800),
            lsh_bands: 4,
            lsh_hamming_threshold: 10,
            max_user_connections: 5,
            max_ip_connections: 10,
        };
        assert!(cfg.origin_allowed(Some("https://strudel.cc")));
        assert!(!cfg.origin_allowed(Some("https://strudel.cc.evil.com")));
        assert!(!cfg.origin_allowed(None));
    }
}
