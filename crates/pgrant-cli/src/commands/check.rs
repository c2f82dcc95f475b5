//! `pgrant check` command implementation.
//!
//! Loads the configuration the way `serve` does, reports every problem
//! found, and lists the grants with their current state.

use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use pgrant_core::{ConfigError, Grant, PgrantConfig, SslMode};

/// Severity level for check results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "INFO"),
            Severity::Warning => write!(f, "WARN"),
            Severity::Error => write!(f, "ERROR"),
        }
    }
}

/// A single check finding.
#[derive(Debug, Clone)]
pub struct CheckFinding {
    pub severity: Severity,
    pub message: String,
}

impl CheckFinding {
    fn error(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Error,
            message: message.into(),
        }
    }

    fn warning(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Warning,
            message: message.into(),
        }
    }

    fn info(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Info,
            message: message.into(),
        }
    }
}

pub fn run(path: &Path) -> Result<()> {
    let config = PgrantConfig::load_with_context(path)
        .with_context(|| format!("failed to load {}", path.display()))?;
    let now = Utc::now();

    println!("Configuration: {}", path.display());
    println!(
        "  {} upstream(s), {} user(s), {} grant(s)",
        config.upstreams.len(),
        config.users.len(),
        config.grants.len()
    );
    println!();

    if !config.grants.is_empty() {
        println!("Grants:");
        for grant in &config.grants {
            println!("  {}", describe_grant(grant, now));
        }
        println!();
    }

    let findings = check_config(&config, now);
    for finding in &findings {
        println!("[{}] {}", finding.severity, finding.message);
    }

    let errors = findings
        .iter()
        .filter(|f| f.severity == Severity::Error)
        .count();
    if errors > 0 {
        bail!("{} error(s) found", errors);
    }
    println!("Configuration is valid.");
    Ok(())
}

/// Everything worth telling the operator about a loaded configuration.
pub fn check_config(config: &PgrantConfig, now: DateTime<Utc>) -> Vec<CheckFinding> {
    let mut findings = Vec::new();

    match config.validate() {
        Ok(()) => {}
        Err(ConfigError::Invalid(problems)) => {
            findings.extend(problems.into_iter().map(CheckFinding::error));
        }
        Err(e) => findings.push(CheckFinding::error(e.to_string())),
    }

    for (database, upstream) in &config.upstreams {
        if upstream.resolve_password().is_none() {
            findings.push(CheckFinding::warning(format!(
                "upstream '{}' has no password; only trust authentication will work",
                database
            )));
        }
        if upstream.ssl_mode == SslMode::Disable {
            findings.push(CheckFinding::warning(format!(
                "upstream '{}' has TLS disabled",
                database
            )));
        }
    }

    for user in &config.users {
        if !config.grants.iter().any(|g| g.user == user.name) {
            findings.push(CheckFinding::info(format!(
                "user '{}' has no grants",
                user.name
            )));
        }
    }

    for grant in &config.grants {
        if grant.expires_at <= now && grant.revoked_at.is_none() {
            findings.push(CheckFinding::info(format!(
                "grant '{}' expired at {}",
                grant.id, grant.expires_at
            )));
        }
    }

    if !config.audit.enabled {
        findings.push(CheckFinding::warning("audit logging is disabled"));
    }

    findings.sort_by(|a, b| b.severity.cmp(&a.severity));
    findings
}

fn describe_grant(grant: &Grant, now: DateTime<Utc>) -> String {
    let status = match grant.check_active(now) {
        Ok(()) => "active",
        Err(reason) => reason.as_str(),
    };
    let controls: Vec<&str> = grant.controls.iter().map(|c| c.as_str()).collect();
    let mut line = format!(
        "{} {}@{} [{}] {} .. {} ({})",
        grant.id,
        grant.user,
        grant.database,
        controls.join(","),
        grant.starts_at.format("%Y-%m-%d %H:%M"),
        grant.expires_at.format("%Y-%m-%d %H:%M"),
        status
    );
    if let Some(max) = grant.max_query_counts {
        line.push_str(&format!(" queries {}/{}", grant.query_count, max));
    }
    if let Some(max) = grant.max_bytes_transferred {
        line.push_str(&format!(" bytes {}/{}", grant.bytes_transferred, max));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use pgrant_core::{Control, UpstreamConfig, UserConfig};

    fn config() -> PgrantConfig {
        let now = Utc::now();
        let mut config = PgrantConfig::default();
        config.upstreams.insert(
            "sales".to_string(),
            UpstreamConfig {
                host: "db.internal".to_string(),
                password: Some("pw".to_string()),
                ssl_mode: SslMode::Require,
                ..Default::default()
            },
        );
        config.users.push(UserConfig {
            name: "alice".to_string(),
            password_hash: pgrant_proxy::hash_password("pw").unwrap(),
        });
        config.grants.push(
            Grant::new("g1", "alice", "sales", now - Duration::hours(1), now + Duration::hours(1))
                .with_control(Control::ReadOnly),
        );
        config
    }

    #[test]
    fn test_clean_config_has_no_findings() {
        assert!(check_config(&config(), Utc::now()).is_empty());
    }

    #[test]
    fn test_findings_are_sorted_by_severity() {
        let mut config = config();
        config.upstreams.get_mut("sales").unwrap().ssl_mode = SslMode::Disable;
        config.grants[0].database = "hr".to_string();
        config.users.push(UserConfig {
            name: "bob".to_string(),
            password_hash: "plaintext".to_string(),
        });

        let findings = check_config(&config, Utc::now());
        let severities: Vec<Severity> = findings.iter().map(|f| f.severity).collect();
        assert_eq!(
            severities,
            vec![
                Severity::Error,
                Severity::Error,
                Severity::Warning,
                Severity::Info
            ]
        );
        assert!(findings[2].message.contains("TLS disabled"));
        assert!(findings[3].message.contains("'bob' has no grants"));
    }

    #[test]
    fn test_expired_grant_is_reported() {
        let config = config();
        let later = Utc::now() + Duration::days(1);
        let findings = check_config(&config, later);
        assert_eq!(findings.len(), 1);
        assert!(findings[0].message.contains("grant 'g1' expired"));
        assert!(describe_grant(&config.grants[0], later).ends_with("(expired)"));
    }

    #[test]
    fn test_run_reports_errors() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pgrant.yaml");
        std::fs::write(
            &path,
            "grants:\n  - id: g1\n    user: alice\n    database: sales\n    starts_at: 2026-01-01T00:00:00Z\n    expires_at: 2026-01-02T00:00:00Z\n",
        )
        .unwrap();
        let err = run(&path).unwrap_err();
        assert!(err.to_string().contains("2 error(s)"));
    }
}
