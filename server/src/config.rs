//! Configuration management for the server.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Server host address
    pub host: String,
    /// Server port
    pub port: u16,
    /// PostgreSQL connection URL
    pub database_url: String,
    /// Shared secret subscribers and pushers must present
    pub auth_token: Option<String>,
    /// JSON file with the routing rules
    pub routing_rules_path: Option<PathBuf>,
    /// How long loaded routing rules stay cached
    pub routing_cache_ttl: Option<Duration>,
    /// Database name reported as the relation schema
    pub source_database: String,
    /// Delay between change log polls when caught up
    pub change_poll_interval: Duration,
    /// Outbound frames buffered per session before backpressure
    pub session_buffer: usize,
    /// Attempts to mint a watermark before giving up
    pub watermark_max_attempts: u32,
}

impl Config {
    /// Defaults for everything but the database.
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            database_url: database_url.into(),
            auth_token: None,
            routing_rules_path: None,
            routing_cache_ttl: None,
            source_database: "public".to_string(),
            change_poll_interval: Duration::from_millis(250),
            session_buffer: 256,
            watermark_max_attempts: 8,
        }
    }

    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let host = env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());

        let port = env::var("PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;

        let database_url = env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)?;

        let auth_token = env::var("AUTH_TOKEN").ok().filter(|t| !t.is_empty());
        let routing_rules_path = env::var("ROUTING_RULES_PATH").ok().map(PathBuf::from);
        let routing_cache_ttl = optional::<u64>("ROUTING_CACHE_TTL_SECS")?.map(Duration::from_secs);
        let source_database = env::var("SOURCE_DATABASE").unwrap_or_else(|_| "public".to_string());
        let change_poll_interval =
            Duration::from_millis(optional("CHANGE_POLL_INTERVAL_MS")?.unwrap_or(250));
        let session_buffer = optional("SESSION_BUFFER")?.unwrap_or(256);
        let watermark_max_attempts = optional("WATERMARK_MAX_ATTEMPTS")?.unwrap_or(8);

        if session_buffer == 0 {
            return Err(ConfigError::Invalid {
                name: "SESSION_BUFFER",
                value: "0".into(),
            });
        }

        Ok(Self {
            host,
            port,
            database_url,
            auth_token,
            routing_rules_path,
            routing_cache_ttl,
            source_database,
            change_poll_interval,
            session_buffer,
            watermark_max_attempts,
        })
    }
}

fn optional<T: std::str::FromStr>(name: &'static str) -> Result<Option<T>, ConfigError> {
    match env::var(name) {
        Ok(value) => value
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { name, value }),
        Err(_) => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("DATABASE_URL environment variable is required")]
    MissingDatabaseUrl,

    #[error("Invalid PORT value")]
    InvalidPort,

    #[error("Invalid {name} value '{value}'")]
    Invalid { name: &'static str, value: String },

    #[error("Cannot read routing rules from {path}: {source}")]
    UnreadableRules {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid routing rules: {0}")]
    InvalidRules(String),
}
