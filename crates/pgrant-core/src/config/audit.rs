//! Audit logging configuration.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration for audit logging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Whether audit logging is enabled.
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Print events to stdout as JSON lines.
    #[serde(default)]
    pub stdout: bool,

    /// Append events to this file as JSON lines.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,

    /// Maximum length of the SQL preview carried by `query.blocked` events.
    #[serde(default = "default_sql_preview_len")]
    pub sql_preview_len: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            stdout: false,
            file: None,
            sql_preview_len: default_sql_preview_len(),
        }
    }
}

fn default_enabled() -> bool {
    true
}

fn default_sql_preview_len() -> usize {
    200
}
