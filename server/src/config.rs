//! Server configuration module.
//!
//! Parses configuration from environment variables (and a `.env` file, when
//! present) for the Hestate server.
//!
//! # Environment Variables
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `CLIENT_BASE_URL` | Yes | - | Origin of the web client (CORS and socket origin) |
//! | `MONGODB_URL` | Yes | - | MongoDB connection string |
//! | `NODE_ENV` | Yes | - | Environment name, `development` disables secure cookies |
//! | `JWT_TOKEN` | Yes | - | Secret used by auth routes to sign tokens |
//! | `FIRST_SECRET_KEY` | Yes | - | Current session signing key |
//! | `SECOND_SECRET_KEY` | Yes | - | Previous session signing key (rotation) |
//! | `REDIS_HOST` | Yes | - | Redis URL for realtime fan-out |
//! | `PORT` | No | 4000 | HTTP server port |

use std::env;
use std::fmt;

use axum::http::HeaderValue;
use thiserror::Error;
use url::Url;

/// Default HTTP server port.
pub const DEFAULT_PORT: u16 = 4000;

/// Environment name that relaxes production-only settings.
const DEVELOPMENT_ENV: &str = "development";

/// Required variables, in the order they are checked.
pub const REQUIRED_VARS: [&str; 7] = [
    "CLIENT_BASE_URL",
    "MONGODB_URL",
    "NODE_ENV",
    "JWT_TOKEN",
    "FIRST_SECRET_KEY",
    "SECOND_SECRET_KEY",
    "REDIS_HOST",
];

/// Errors that can occur when parsing configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Required environment variable is missing or empty.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    /// Environment variable has invalid format.
    #[error("invalid format for {var}: {message}")]
    InvalidFormat { var: String, message: String },

    /// Port number is invalid.
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] std::num::ParseIntError),
}

/// Server configuration parsed from environment variables.
///
/// Built once at startup and shared read-only through the application state.
#[derive(Clone, PartialEq, Eq)]
pub struct Config {
    /// Origin of the web client, e.g. `http://localhost:3000`.
    pub client_base_url: String,

    /// MongoDB connection string.
    pub mongodb_url: String,

    /// Environment name (`development`, `production`, ...).
    pub node_env: String,

    /// Secret for signing auth tokens.
    pub jwt_token: String,

    /// Current session signing key.
    pub first_secret_key: String,

    /// Previous session signing key, still accepted for verification.
    pub second_secret_key: String,

    /// Redis URL for the realtime fan-out adapter.
    pub redis_host: String,

    /// HTTP server port.
    pub port: u16,
}

impl Config {
    /// Parse configuration from environment variables.
    ///
    /// Loads a `.env` file from the working directory first, if one exists.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if:
    /// - A required environment variable is missing or empty
    /// - `CLIENT_BASE_URL` is not an absolute http(s) URL
    /// - `PORT` is not a valid u16
    ///
    /// # Example
    ///
    /// ```no_run
    /// use hestate_server::config::Config;
    ///
    /// let config = Config::from_env().expect("Failed to load config");
    /// println!("Server will listen on port {}", config.port);
    /// ```
    pub fn from_env() -> Result<Self, ConfigError> {
        // A missing .env file is not an error; real deployments set variables directly.
        let _ = dotenvy::dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Parse configuration through an arbitrary variable lookup.
    ///
    /// `from_env` delegates here with `std::env::var`.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| -> Result<String, ConfigError> {
            match lookup(key) {
                Some(value) if !value.is_empty() => Ok(value),
                _ => Err(ConfigError::MissingEnvVar(key.to_string())),
            }
        };

        let config = Self {
            client_base_url: required("CLIENT_BASE_URL")?,
            mongodb_url: required("MONGODB_URL")?,
            node_env: required("NODE_ENV")?,
            jwt_token: required("JWT_TOKEN")?,
            first_secret_key: required("FIRST_SECRET_KEY")?,
            second_secret_key: required("SECOND_SECRET_KEY")?,
            redis_host: required("REDIS_HOST")?,
            port: parse_port(lookup("PORT"))?,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Every required value must be non-empty, and the client base URL must be
    /// an absolute http(s) URL usable as an `Origin` header value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (key, value) in self.required_values() {
            if value.is_empty() {
                return Err(ConfigError::MissingEnvVar(key.to_string()));
            }
        }

        let url = Url::parse(&self.client_base_url).map_err(|e| ConfigError::InvalidFormat {
            var: "CLIENT_BASE_URL".to_string(),
            message: e.to_string(),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidFormat {
                var: "CLIENT_BASE_URL".to_string(),
                message: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        if HeaderValue::from_str(&self.client_base_url).is_err() {
            return Err(ConfigError::InvalidFormat {
                var: "CLIENT_BASE_URL".to_string(),
                message: "not a valid header value".to_string(),
            });
        }

        Ok(())
    }

    /// Returns `true` when running in the development environment.
    #[must_use]
    pub fn is_development(&self) -> bool {
        self.node_env == DEVELOPMENT_ENV
    }

    /// The client origin as browsers send it in the `Origin` header.
    #[must_use]
    pub fn client_origin(&self) -> &str {
        self.client_base_url.trim_end_matches('/')
    }

    /// Session signing keys, current key first.
    #[must_use]
    pub fn session_secrets(&self) -> [&str; 2] {
        [&self.first_secret_key, &self.second_secret_key]
    }

    fn required_values(&self) -> [(&'static str, &str); 7] {
        [
            ("CLIENT_BASE_URL", &self.client_base_url),
            ("MONGODB_URL", &self.mongodb_url),
            ("NODE_ENV", &self.node_env),
            ("JWT_TOKEN", &self.jwt_token),
            ("FIRST_SECRET_KEY", &self.first_secret_key),
            ("SECOND_SECRET_KEY", &self.second_secret_key),
            ("REDIS_HOST", &self.redis_host),
        ]
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("client_base_url", &self.client_base_url)
            .field("mongodb_url", &"<redacted>")
            .field("node_env", &self.node_env)
            .field("jwt_token", &"<redacted>")
            .field("first_secret_key", &"<redacted>")
            .field("second_secret_key", &"<redacted>")
            .field("redis_host", &"<redacted>")
            .field("port", &self.port)
            .finish()
    }
}

/// Parse the PORT value.
///
/// Returns the default port if not set.
fn parse_port(value: Option<String>) -> Result<u16, ConfigError> {
    match value {
        Some(port_str) if !port_str.is_empty() => Ok(port_str.trim().parse()?),
        _ => Ok(DEFAULT_PORT),
    }
}
