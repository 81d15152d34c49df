//! Layered configuration: built-in defaults, then `credvault.toml`, then
//! `CREDVAULT_*` environment variables (nested keys split on `__`).

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const DEFAULT_CONFIG_FILE: &str = "credvault.toml";
const CONFIG_PATH_ENV: &str = "CREDVAULT_CONFIG";
const ENV_PREFIX: &str = "CREDVAULT_";

#[derive(Debug, thiserror::Error)]
#[error("configuration error: {0}")]
pub struct ConfigError(#[from] Box<figment::Error>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub loglevel: String,
    pub database: DatabaseConfig,
    pub hashing: HashingConfig,
    pub retry: RetryConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            loglevel: "info".to_string(),
            database: DatabaseConfig::default(),
            hashing: HashingConfig::default(),
            retry: RetryConfig::default(),
        }
    }
}

impl Config {
    /// Load from the config file named by `CREDVAULT_CONFIG` (or
    /// `credvault.toml` in the working directory) and the environment.
    pub fn load() -> Result<Self, ConfigError> {
        let path = std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::figment(&path)
            .extract()
            .map_err(|e| ConfigError(Box::new(e)))
    }

    pub fn figment(path: &str) -> Figment {
        Figment::from(Serialized::defaults(Config::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// sqlx connection string, e.g. `sqlite:credvault.db`.
    pub url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    /// SQLite `busy_timeout` applied to every pooled connection.
    pub busy_timeout_ms: u64,
    /// Upper bound on waiting for the in-process write gate.
    pub write_lock_timeout_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:credvault.db".to_string(),
            max_connections: 4,
            acquire_timeout_secs: 5,
            busy_timeout_ms: 2000,
            write_lock_timeout_ms: 5000,
        }
    }
}

impl DatabaseConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }

    pub fn write_lock_timeout(&self) -> Duration {
        Duration::from_millis(self.write_lock_timeout_ms)
    }
}

/// Argon2id cost parameters for newly written password hashes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HashingConfig {
    /// Memory cost in KiB.
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for HashingConfig {
    fn default() -> Self {
        Self {
            m_cost: 19 * 1024,
            t_cost: 2,
            p_cost: 1,
        }
    }
}

/// Backoff applied to transient SQLite contention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_times: usize,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_times: 3,
            min_delay_ms: 50,
            max_delay_ms: 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_when_nothing_is_configured() {
        Jail::expect_with(|_jail| {
            let cfg: Config = Config::figment("missing.toml").extract()?;
            assert_eq!(cfg, Config::default());
            assert_eq!(cfg.database.busy_timeout(), Duration::from_secs(2));
            Ok(())
        });
    }

    #[test]
    fn file_then_env_layering() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "vault.toml",
                r#"
                loglevel = "debug"

                [database]
                url = "sqlite:from-file.db"
                max_connections = 8

                [hashing]
                t_cost = 3
                "#,
            )?;
            jail.set_env("CREDVAULT_DATABASE__URL", "sqlite:from-env.db");
            jail.set_env("CREDVAULT_RETRY__MAX_TIMES", "7");

            let cfg: Config = Config::figment("vault.toml").extract()?;
            assert_eq!(cfg.loglevel, "debug");
            assert_eq!(cfg.database.url, "sqlite:from-env.db");
            assert_eq!(cfg.database.max_connections, 8);
            assert_eq!(cfg.hashing.t_cost, 3);
            assert_eq!(cfg.hashing.m_cost, HashingConfig::default().m_cost);
            assert_eq!(cfg.retry.max_times, 7);
            Ok(())
        });
    }
}
