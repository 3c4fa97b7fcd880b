//! Configuration management for the server.

use std::env;

/// Where the change log is kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Persistence {
    /// In process memory; lost on restart
    Memory,
    /// PostgreSQL, by connection URL
    Postgres { database_url: String },
    /// CouchDB, by database URL
    CouchDb { url: String },
}

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Change log backend
    pub persistence: Persistence,
    /// Bearer token clients must present; open access when unset
    pub auth_secret: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let host = var("HOST").unwrap_or_else(|| "0.0.0.0".to_string());

        let port = var("PORT")
            .unwrap_or_else(|| "8080".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let persistence = match var("PERSISTENCE").as_deref().unwrap_or("memory") {
            "memory" => Persistence::Memory,
            "postgres" | "postgresql" => Persistence::Postgres {
                database_url: var("DATABASE_URL").ok_or(ConfigError::MissingDatabaseUrl)?,
            },
            "couchdb" => Persistence::CouchDb {
                url: var("COUCHDB_URL").ok_or(ConfigError::MissingCouchDbUrl)?,
            },
            other => return Err(ConfigError::UnknownPersistence(other.to_string())),
        };

        let auth_secret = var("AUTH_SECRET").filter(|s| !s.is_empty());

        Ok(Self {
            host,
            port,
            persistence,
            auth_secret,
        })
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required for postgres persistence")]
    MissingDatabaseUrl,

    #[error("COUCHDB_URL environment variable is required for couchdb persistence")]
    MissingCouchDbUrl,

    #[error("Unknown PERSISTENCE value: {0}")]
    UnknownPersistence(String),

    #[error("Invalid PORT value")]
    InvalidPort,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|name| vars.get(name).cloned())
    }

    #[test]
    fn defaults_to_memory_on_8080() {
        let config = load(&[]).unwrap();
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 8080);
        assert_eq!(config.persistence, Persistence::Memory);
        assert!(config.auth_secret.is_none());
    }

    #[test]
    fn postgres_requires_database_url() {
        assert!(matches!(
            load(&[("PERSISTENCE", "postgres")]),
            Err(ConfigError::MissingDatabaseUrl)
        ));
        let config = load(&[
            ("PERSISTENCE", "postgres"),
            ("DATABASE_URL", "postgres://localhost/tether"),
        ])
        .unwrap();
        assert_eq!(
            config.persistence,
            Persistence::Postgres {
                database_url: "postgres://localhost/tether".into()
            }
        );
    }

    #[test]
    fn rejects_bad_values() {
        assert!(matches!(load(&[("PORT", "http")]), Err(ConfigError::InvalidPort)));
        assert!(matches!(
            load(&[("PERSISTENCE", "mysql")]),
            Err(ConfigError::UnknownPersistence(_))
        ));
        assert!(matches!(
            load(&[("PERSISTENCE", "couchdb")]),
            Err(ConfigError::MissingCouchDbUrl)
        ));
    }
}
