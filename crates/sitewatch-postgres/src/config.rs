use config::{Config, ConfigError, Environment};
use serde::{Deserialize, Serialize};

/// PostgreSQL configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostgresConfig {
    /// Database host
    #[serde(default = "default_host")]
    pub host: String,

    /// Database port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database name
    #[serde(default = "default_database")]
    pub database: String,

    /// Database username
    #[serde(default = "default_username")]
    pub username: String,

    /// Database password
    #[serde(default = "default_password")]
    pub password: String,

    /// Maximum number of connections in the pool
    #[serde(default = "default_max_pool_size")]
    pub max_pool_size: usize,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_database() -> String {
    "sitewatch".to_string()
}

fn default_username() -> String {
    "sitewatch".to_string()
}

fn default_password() -> String {
    "sitewatch".to_string()
}

fn default_max_pool_size() -> usize {
    10
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: default_database(),
            username: default_username(),
            password: default_password(),
            max_pool_size: default_max_pool_size(),
        }
    }
}

impl PostgresConfig {
    /// Loads configuration from `SITEWATCH_POSTGRES_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(Environment::with_prefix("SITEWATCH_POSTGRES"))
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to ensure tests run serially and don't interfere with each other
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_default_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        std::env::remove_var("SITEWATCH_POSTGRES_HOST");
        std::env::remove_var("SITEWATCH_POSTGRES_PORT");

        let config = PostgresConfig::from_env().unwrap();
        assert_eq!(config.host, "localhost");
        assert_eq!(config.port, 5432);
        assert_eq!(config.database, "sitewatch");
        assert_eq!(config.max_pool_size, 10);
    }

    #[test]
    fn test_custom_config() {
        let _lock = TEST_LOCK.lock().unwrap();

        std::env::set_var("SITEWATCH_POSTGRES_HOST", "db.internal");
        std::env::set_var("SITEWATCH_POSTGRES_PORT", "6432");

        let config = PostgresConfig::from_env().unwrap();
        assert_eq!(config.host, "db.internal");
        assert_eq!(config.port, 6432);

        // Clean up
        std::env::remove_var("SITEWATCH_POSTGRES_HOST");
        std::env::remove_var("SITEWATCH_POSTGRES_PORT");
    }
}
