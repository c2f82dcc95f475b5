//! Upstream database configuration types.
//!
//! Each entry describes how the proxy reaches the real PostgreSQL server
//! behind one target database, and with which credentials.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Configuration for one upstream Postgres database.
#[derive(Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// Hostname of the upstream Postgres server.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port of the upstream Postgres server.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Database name on the upstream server. Defaults to the name the
    /// client asked for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Username for the upstream connection.
    #[serde(default = "default_username")]
    pub username: String,

    /// Password for the upstream connection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable containing the password.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// SSL mode for the connection.
    #[serde(default)]
    pub ssl_mode: SslMode,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            database: None,
            username: default_username(),
            password: None,
            password_env: None,
            ssl_mode: SslMode::default(),
        }
    }
}

// Passwords must never reach logs.
impl fmt::Debug for UpstreamConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("password_env", &self.password_env)
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

/// SSL mode for upstream connections, with libpq semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SslMode {
    /// Never use TLS.
    Disable,
    /// Use TLS if the server supports it, without verification.
    Allow,
    /// Prefer TLS (default).
    #[default]
    Prefer,
    /// Require TLS, without certificate verification.
    Require,
    /// Require TLS with CA verification.
    #[serde(rename = "verify-ca")]
    VerifyCa,
    /// Require TLS with full verification.
    #[serde(rename = "verify-full")]
    VerifyFull,
}

impl SslMode {
    /// Whether an `SSLRequest` should be sent at all.
    pub fn attempts_tls(&self) -> bool {
        !matches!(self, Self::Disable)
    }

    /// Whether a server refusing TLS is fatal.
    pub fn requires_tls(&self) -> bool {
        matches!(self, Self::Require | Self::VerifyCa | Self::VerifyFull)
    }

    /// Whether the server certificate is checked against trusted roots.
    pub fn verifies_certificate(&self) -> bool {
        matches!(self, Self::VerifyCa | Self::VerifyFull)
    }
}

impl UpstreamConfig {
    /// Resolve the password, checking `password_env` first.
    pub fn resolve_password(&self) -> Option<String> {
        if let Some(env_var) = &self.password_env {
            if let Ok(password) = std::env::var(env_var) {
                return Some(password);
            }
        }
        self.password.clone()
    }

    /// `host:port` of the upstream server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    5432
}

fn default_username() -> String {
    "postgres".to_string()
}
