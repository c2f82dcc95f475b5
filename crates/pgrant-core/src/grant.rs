//! Grant data model.
//!
//! A [`Grant`] is created and revoked by the management plane. From the
//! proxy's point of view it is read-only, except for the usage counters which
//! the quota store increments on the proxy's behalf.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A named restriction applied to a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Control {
    /// Reject every statement classified as a write (DML, DDL, `COPY ... FROM`).
    ReadOnly,
    /// Reject `COPY` in either direction.
    BlockCopy,
    /// Reject schema changes.
    BlockDdl,
}

impl Control {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ReadOnly => "read_only",
            Self::BlockCopy => "block_copy",
            Self::BlockDdl => "block_ddl",
        }
    }
}

impl fmt::Display for Control {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The two independently limited usage counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaKind {
    /// Number of executed statements.
    Queries,
    /// Bytes of result rows relayed to the client.
    Bytes,
}

impl QuotaKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queries => "queries",
            Self::Bytes => "bytes",
        }
    }
}

impl fmt::Display for QuotaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a grant could not be handed to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    NoGrant,
    Expired,
    NotStarted,
    Revoked,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoGrant => "no_grant",
            Self::Expired => "expired",
            Self::NotStarted => "not_started",
            Self::Revoked => "revoked",
        }
    }

    /// Message shown to the client in the `ErrorResponse`.
    pub fn message(&self) -> &'static str {
        match self {
            Self::NoGrant => "no access grant exists for this user and database",
            Self::Expired => "access grant has expired",
            Self::NotStarted => "access grant is not active yet",
            Self::Revoked => "access grant has been revoked",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time-boxed, quota-limited access for one (user, database) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Grant {
    /// Stable identifier used for usage accounting.
    pub id: String,

    /// Subject of the grant.
    pub user: String,

    /// Target database (key into the configured upstreams).
    pub database: String,

    /// Restrictions. Empty means unrestricted read/write.
    #[serde(default)]
    pub controls: BTreeSet<Control>,

    /// Start of the validity window (inclusive).
    pub starts_at: DateTime<Utc>,

    /// End of the validity window (exclusive).
    pub expires_at: DateTime<Utc>,

    /// Set once the grant has been revoked.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<DateTime<Utc>>,

    /// Maximum number of executed statements. `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_query_counts: Option<u64>,

    /// Maximum number of result bytes. `None` means unlimited.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_bytes_transferred: Option<u64>,

    /// Statements executed so far, across all sessions.
    #[serde(default)]
    pub query_count: u64,

    /// Result bytes transferred so far, across all sessions.
    #[serde(default)]
    pub bytes_transferred: u64,
}

impl Grant {
    /// Create an unrestricted grant valid over `[starts_at, expires_at)`.
    pub fn new(
        id: impl Into<String>,
        user: impl Into<String>,
        database: impl Into<String>,
        starts_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            user: user.into(),
            database: database.into(),
            controls: BTreeSet::new(),
            starts_at,
            expires_at,
            revoked_at: None,
            max_query_counts: None,
            max_bytes_transferred: None,
            query_count: 0,
            bytes_transferred: 0,
        }
    }

    /// Add a control.
    pub fn with_control(mut self, control: Control) -> Self {
        self.controls.insert(control);
        self
    }

    /// Set the statement quota.
    pub fn with_max_query_counts(mut self, max: u64) -> Self {
        self.max_query_counts = Some(max);
        self
    }

    /// Set the byte quota.
    pub fn with_max_bytes_transferred(mut self, max: u64) -> Self {
        self.max_bytes_transferred = Some(max);
        self
    }

    pub fn has_control(&self, control: Control) -> bool {
        self.controls.contains(&control)
    }

    /// Check whether the grant may be used at `now`.
    ///
    /// Revocation wins over the window checks.
    pub fn check_active(&self, now: DateTime<Utc>) -> Result<(), DenialReason> {
        if self.revoked_at.is_some_and(|revoked| revoked <= now) {
            return Err(DenialReason::Revoked);
        }
        if now < self.starts_at {
            return Err(DenialReason::NotStarted);
        }
        if now >= self.expires_at {
            return Err(DenialReason::Expired);
        }
        Ok(())
    }

    /// Configured limit for a quota kind.
    pub fn limit(&self, kind: QuotaKind) -> Option<u64> {
        match kind {
            QuotaKind::Queries => self.max_query_counts,
            QuotaKind::Bytes => self.max_bytes_transferred,
        }
    }

    /// Usage recorded for a quota kind.
    pub fn usage(&self, kind: QuotaKind) -> u64 {
        match kind {
            QuotaKind::Queries => self.query_count,
            QuotaKind::Bytes => self.bytes_transferred,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn grant_around(now: DateTime<Utc>) -> Grant {
        Grant::new("g1", "alice", "sales", now - Duration::hours(1), now + Duration::hours(1))
    }

    #[test]
    fn test_active_window() {
        let now = Utc::now();
        let grant = grant_around(now);
        assert_eq!(grant.check_active(now), Ok(()));
        assert_eq!(grant.check_active(grant.starts_at), Ok(()));
        assert_eq!(
            grant.check_active(grant.expires_at),
            Err(DenialReason::Expired)
        );
        assert_eq!(
            grant.check_active(now - Duration::hours(2)),
            Err(DenialReason::NotStarted)
        );
    }

    #[test]
    fn test_revoked_wins() {
        let now = Utc::now();
        let mut grant = grant_around(now);
        grant.revoked_at = Some(now - Duration::minutes(5));
        assert_eq!(grant.check_active(now), Err(DenialReason::Revoked));

        // Revocation scheduled in the future does not apply yet.
        grant.revoked_at = Some(now + Duration::minutes(5));
        assert_eq!(grant.check_active(now), Ok(()));
    }

    #[test]
    fn test_controls_deserialize() {
        let yaml = r#"
id: g1
user: alice
database: sales
controls: [read_only, block_copy]
starts_at: 2026-01-01T00:00:00Z
expires_at: 2026-02-01T00:00:00Z
max_query_counts: 10
"#;
        let grant: Grant = serde_yaml::from_str(yaml).unwrap();
        assert!(grant.has_control(Control::ReadOnly));
        assert!(grant.has_control(Control::BlockCopy));
        assert!(!grant.has_control(Control::BlockDdl));
        assert_eq!(grant.limit(QuotaKind::Queries), Some(10));
        assert_eq!(grant.limit(QuotaKind::Bytes), None);
        assert_eq!(grant.usage(QuotaKind::Queries), 0);
    }
}
