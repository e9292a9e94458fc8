use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Default configuration file, looked up in the working directory
pub const CONFIG_FILE: &str = "registry-bridge.toml";

/// Prefix of environment variable overrides, nested keys split on `__`
pub const ENV_PREFIX: &str = "REGISTRY_BRIDGE__";

/// Connection settings of the external registry
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Registry endpoint (required), e.g. `nats://127.0.0.1:4222`
    pub connection: String,
    /// Reconnect attempts made while establishing the connection
    pub max_retries: u32,
    /// Seed of the exponential backoff between reconnect attempts
    #[serde(with = "humantime_serde")]
    pub base_retry_delay: Duration,
    /// Watched subtree of the registry
    pub base_path: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            connection: String::new(),
            max_retries: 3,
            base_retry_delay: Duration::from_millis(1000),
            base_path: String::from("/discovery"),
        }
    }
}

impl RegistryConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: self.base_retry_delay,
        }
    }
}

/// Exponential backoff used while connecting to the registry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor)
    }
}

/// Configuration of the local catalog receiving the records
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CatalogConfig {
    /// Data source name of the catalog database (PostgreSQL or SQLite DSN)
    pub dsn: String,
}

impl Default for CatalogConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite::memory:"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// External registry the bridge imports from
    pub registry: RegistryConfig,
    /// Local catalog the bridge publishes into
    pub catalog: CatalogConfig,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("registry.connection is required")]
    MissingConnection,
    #[error("registry.connection '{connection}' is not a valid URL: {source}")]
    InvalidConnection {
        connection: String,
        source: url::ParseError,
    },
    #[error("registry.base_path cannot be empty")]
    EmptyBasePath,
    #[error("catalog.dsn cannot be empty")]
    EmptyCatalogDsn,
}

impl Configuration {
    fn figment() -> Figment {
        Figment::from(Serialized::defaults(Configuration::default()))
    }

    pub fn load() -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Self::figment()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let connection = self.registry.connection.trim();
        if connection.is_empty() {
            return Err(ConfigError::MissingConnection);
        }
        url::Url::parse(connection).map_err(|source| ConfigError::InvalidConnection {
            connection: connection.to_string(),
            source,
        })?;

        if self.registry.base_path.trim_matches('/').is_empty() {
            return Err(ConfigError::EmptyBasePath);
        }
        if self.catalog.dsn.is_empty() {
            return Err(ConfigError::EmptyCatalogDsn);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Configuration::default();

        assert!(config.registry.connection.is_empty());
        assert_eq!(config.registry.max_retries, 3);
        assert_eq!(config.registry.base_retry_delay, Duration::from_millis(1000));
        assert_eq!(config.registry.base_path, "/discovery");
        assert_eq!(config.catalog.dsn, "sqlite::memory:");
    }

    #[test]
    fn test_connection_is_required() {
        let config = Configuration::default();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::MissingConnection)
        ));

        let mut config = Configuration::default();
        config.registry.connection = "not a url".to_string();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidConnection { .. })
        ));

        config.registry.connection = "nats://127.0.0.1:4222".to_string();
        assert!(config.validate().is_ok());

        config.registry.base_path = "/".to_string();
        assert!(matches!(config.validate(), Err(ConfigError::EmptyBasePath)));
    }

    #[test]
    fn test_toml_and_env_override() {
        Jail::expect_with(|jail| {
            jail.create_file(
                CONFIG_FILE,
                r#"
                [registry]
                connection = "nats://registry:4222"
                base_retry_delay = "250ms"
                "#,
            )?;
            jail.set_env("REGISTRY_BRIDGE__REGISTRY__MAX_RETRIES", "7");
            jail.set_env("REGISTRY_BRIDGE__CATALOG__DSN", "sqlite://./catalog.db");

            let config = Configuration::load().map_err(|e| *e)?;
            assert_eq!(config.registry.connection, "nats://registry:4222");
            assert_eq!(config.registry.base_retry_delay, Duration::from_millis(250));
            assert_eq!(config.registry.max_retries, 7);
            assert_eq!(config.registry.base_path, "/discovery");
            assert_eq!(config.catalog.dsn, "sqlite://./catalog.db");
            Ok(())
        });
    }

    #[test]
    fn test_load_from_path() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[registry]\nconnection = \"nats://elsewhere:4222\"\nbase_path = \"/services\""
        )
        .unwrap();

        let config = Configuration::load_from_path(file.path()).unwrap();
        assert_eq!(config.registry.connection, "nats://elsewhere:4222");
        assert_eq!(config.registry.base_path, "/services");
    }

    #[test]
    fn test_retry_policy_backoff() {
        let policy = RegistryConfig::default().retry_policy();
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay_for(0), Duration::from_millis(1000));
        assert_eq!(policy.delay_for(1), Duration::from_millis(2000));
        assert_eq!(policy.delay_for(3), Duration::from_millis(8000));
        // Saturates instead of overflowing
        assert!(policy.delay_for(64) >= policy.delay_for(31));
    }
}
