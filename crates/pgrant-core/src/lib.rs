//! # pgrant-core
//!
//! Types shared across all pgrant crates:
//!
//! - [`Grant`]: the authorization unit binding a user to a database with a
//!   control set, a validity window and optional usage quotas.
//! - [`config`]: the YAML configuration loaded by `pgrant serve`.

pub mod config;
pub mod grant;

pub use config::{
    AuditConfig, ConfigError, LogFormat, LoggingConfig, PgrantConfig, ProxyConfig, SslMode,
    UpstreamConfig, UserConfig,
};
pub use grant::{Control, DenialReason, Grant, QuotaKind};
