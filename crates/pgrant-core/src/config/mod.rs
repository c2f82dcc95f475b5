//! Configuration types for the pgrant proxy.
//!
//! Configuration is loaded from a YAML file (`pgrant.yaml`). Grants can be
//! declared inline or in separate files listed under `grant_files` /
//! `grants_dir`, each containing a YAML list of grants.
//!
//! ```yaml
//! proxy:
//!   listen_port: 5433
//! upstreams:
//!   sales:
//!     host: db.internal
//!     username: pgrant_sales
//!     password_env: SALES_DB_PASSWORD
//!     ssl_mode: require
//! users:
//!   - name: alice
//!     password_hash: "$argon2id$v=19$..."
//! grants:
//!   - id: g-001
//!     user: alice
//!     database: sales
//!     controls: [read_only]
//!     starts_at: 2026-10-01T00:00:00Z
//!     expires_at: 2026-10-08T00:00:00Z
//!     max_query_counts: 500
//! ```

pub mod audit;
pub mod logging;
pub mod proxy;
pub mod upstream;

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::grant::Grant;

pub use audit::AuditConfig;
pub use logging::{LogFormat, LoggingConfig};
pub use proxy::ProxyConfig;
pub use upstream::{SslMode, UpstreamConfig};

/// Complete pgrant configuration loaded from files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PgrantConfig {
    /// Proxy listener settings.
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Upstream servers keyed by the database name clients connect to.
    #[serde(default)]
    pub upstreams: BTreeMap<String, UpstreamConfig>,

    /// Users allowed to authenticate against the proxy.
    #[serde(default)]
    pub users: Vec<UserConfig>,

    /// Inline grants.
    #[serde(default)]
    pub grants: Vec<Grant>,

    /// Additional grant files (YAML lists), relative to the config file.
    #[serde(default)]
    pub grant_files: Vec<PathBuf>,

    /// Directory of grant files (YAML lists), relative to the config file.
    #[serde(default)]
    pub grants_dir: Option<PathBuf>,

    /// Audit logging configuration.
    #[serde(default)]
    pub audit: AuditConfig,

    /// Process logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// A user that may authenticate against the proxy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserConfig {
    /// Login name presented in the startup packet.
    pub name: String,

    /// Argon2 PHC string (see `pgrant hash-password`).
    pub password_hash: String,
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("invalid configuration:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

impl PgrantConfig {
    /// Load configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML content.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(ConfigError::from)
    }

    /// Load configuration and resolve all external grant files.
    pub fn load_with_context(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = Self::from_file(path)?;

        let base_dir = path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let resolve = |p: &Path| {
            if p.is_absolute() {
                p.to_path_buf()
            } else {
                base_dir.join(p)
            }
        };

        if let Some(grants_dir) = &config.grants_dir {
            let dir = resolve(grants_dir);
            if !dir.is_dir() {
                return Err(ConfigError::Config(format!(
                    "grants_dir {} is not a directory",
                    dir.display()
                )));
            }

            let mut files: Vec<PathBuf> = fs::read_dir(&dir)?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| {
                    p.extension()
                        .map(|e| e == "yaml" || e == "yml")
                        .unwrap_or(false)
                })
                .collect();
            // Directory order is not stable across platforms.
            files.sort();

            for file in files {
                config.grants.extend(load_grant_file(&file)?);
            }
        }

        for grant_file in &config.grant_files.clone() {
            config.grants.extend(load_grant_file(&resolve(grant_file))?);
        }

        Ok(config)
    }

    /// Check the configuration for inconsistencies.
    ///
    /// All problems are collected and reported together.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        let mut user_names = HashSet::new();
        for user in &self.users {
            if !user_names.insert(user.name.as_str()) {
                problems.push(format!("user '{}' is declared twice", user.name));
            }
            if argon2::PasswordHash::new(&user.password_hash).is_err() {
                problems.push(format!(
                    "user '{}' has a password_hash that is not a PHC string",
                    user.name
                ));
            }
        }

        let mut grant_ids = HashSet::new();
        for grant in &self.grants {
            if !grant_ids.insert(grant.id.as_str()) {
                problems.push(format!("grant '{}' is declared twice", grant.id));
            }
            if grant.starts_at >= grant.expires_at {
                problems.push(format!(
                    "grant '{}' has starts_at >= expires_at",
                    grant.id
                ));
            }
            if !self.upstreams.contains_key(&grant.database) {
                problems.push(format!(
                    "grant '{}' targets database '{}' which has no upstream",
                    grant.id, grant.database
                ));
            }
            if !user_names.contains(grant.user.as_str()) {
                problems.push(format!(
                    "grant '{}' is for unknown user '{}'",
                    grant.id, grant.user
                ));
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Look up a configured user.
    pub fn get_user(&self, name: &str) -> Option<&UserConfig> {
        self.users.iter().find(|u| u.name == name)
    }

    /// Look up the upstream for a database.
    pub fn get_upstream(&self, database: &str) -> Option<&UpstreamConfig> {
        self.upstreams.get(database)
    }
}

fn load_grant_file(path: &Path) -> Result<Vec<Grant>, ConfigError> {
    let content = fs::read_to_string(path)?;
    serde_yaml::from_str(&content).map_err(|e| {
        ConfigError::Config(format!("failed to parse grant file {}: {}", path.display(), e))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    // Well-formed Argon2id PHC string; only its shape is checked here.
    const HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$c29tZXNhbHRzb21lc2FsdA$Zq0OFsJ2mQ8cO4aIKqS0ivm4sMErmCq2tTZR8eQxjV4";

    fn base_yaml() -> String {
        format!(
            r#"
upstreams:
  sales:
    host: db.internal
    username: svc
users:
  - name: alice
    password_hash: "{HASH}"
grants:
  - id: g1
    user: alice
    database: sales
    starts_at: 2026-01-01T00:00:00Z
    expires_at: 2026-02-01T00:00:00Z
"#
        )
    }

    #[test]
    fn test_from_yaml_and_validate() {
        let config = PgrantConfig::from_yaml(&base_yaml()).unwrap();
        assert_eq!(config.proxy.listen_port, 5433);
        assert_eq!(config.grants.len(), 1);
        assert!(config.get_user("alice").is_some());
        assert_eq!(config.get_upstream("sales").unwrap().host, "db.internal");
        config.validate().unwrap();
    }

    #[test]
    fn test_validate_collects_all_problems() {
        let mut config = PgrantConfig::from_yaml(&base_yaml()).unwrap();
        let mut bad = config.grants[0].clone();
        bad.database = "missing".to_string();
        bad.user = "mallory".to_string();
        bad.expires_at = bad.starts_at;
        config.grants.push(bad);

        let err = config.validate().unwrap_err();
        let ConfigError::Invalid(problems) = err else {
            panic!("expected Invalid");
        };
        assert!(problems.iter().any(|p| p.contains("declared twice")));
        assert!(problems.iter().any(|p| p.contains("starts_at >= expires_at")));
        assert!(problems.iter().any(|p| p.contains("no upstream")));
        assert!(problems.iter().any(|p| p.contains("unknown user 'mallory'")));
    }

    #[test]
    fn test_validate_rejects_plaintext_password_hash() {
        let mut config = PgrantConfig::from_yaml(&base_yaml()).unwrap();
        config.users[0].password_hash = "secret".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_with_context_reads_grant_files() {
        let dir = tempfile::tempdir().unwrap();
        let grants_dir = dir.path().join("grants");
        fs::create_dir(&grants_dir).unwrap();
        fs::write(
            grants_dir.join("b.yaml"),
            r#"
- id: g3
  user: alice
  database: sales
  controls: [block_ddl]
  starts_at: 2026-01-01T00:00:00Z
  expires_at: 2026-02-01T00:00:00Z
"#,
        )
        .unwrap();
        fs::write(
            dir.path().join("extra.yaml"),
            r#"
- id: g2
  user: alice
  database: sales
  starts_at: 2026-01-01T00:00:00Z
  expires_at: 2026-02-01T00:00:00Z
"#,
        )
        .unwrap();

        let config_path = dir.path().join("pgrant.yaml");
        fs::write(
            &config_path,
            format!("{}grants_dir: grants\ngrant_files: [extra.yaml]\n", base_yaml()),
        )
        .unwrap();

        let config = PgrantConfig::load_with_context(&config_path).unwrap();
        let ids: Vec<&str> = config.grants.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["g1", "g3", "g2"]);
        config.validate().unwrap();
    }
}
