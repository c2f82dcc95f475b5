//! Audit event types.
//!
//! One event describes one thing that happened in a proxy session: a
//! connection opening or closing, a statement running, failing or being
//! blocked, a quota running out, or a login being refused.

use chrono::{DateTime, Utc};
use pgrant_core::QuotaKind;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Type of audit event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuditEventType {
    // ===== Connection lifecycle =====
    /// Session authenticated and connected upstream.
    #[serde(rename = "connection.opened")]
    ConnectionOpened,
    /// Session ended. Carries aggregate counts.
    #[serde(rename = "connection.closed")]
    ConnectionClosed,

    // ===== Statements =====
    /// Statement completed upstream.
    #[serde(rename = "query.executed")]
    QueryExecuted,
    /// Statement was forwarded and upstream returned an error.
    #[serde(rename = "query.failed")]
    QueryFailed,
    /// Statement was rejected by the grant's controls and never forwarded.
    #[serde(rename = "query.blocked")]
    QueryBlocked,
    /// Statement was rejected because a quota is exhausted.
    #[serde(rename = "quota.exceeded")]
    QuotaExceeded,

    // ===== Auth events =====
    /// Bad credentials or no usable grant.
    #[serde(rename = "auth.failed")]
    AuthFailed,
}

impl AuditEventType {
    /// Wire name, as serialized.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConnectionOpened => "connection.opened",
            Self::ConnectionClosed => "connection.closed",
            Self::QueryExecuted => "query.executed",
            Self::QueryFailed => "query.failed",
            Self::QueryBlocked => "query.blocked",
            Self::QuotaExceeded => "quota.exceeded",
            Self::AuthFailed => "auth.failed",
        }
    }
}

impl std::fmt::Display for AuditEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionOpened => write!(f, "CONNECTION_OPENED"),
            Self::ConnectionClosed => write!(f, "CONNECTION_CLOSED"),
            Self::QueryExecuted => write!(f, "QUERY_EXECUTED"),
            Self::QueryFailed => write!(f, "QUERY_FAILED"),
            Self::QueryBlocked => write!(f, "QUERY_BLOCKED"),
            Self::QuotaExceeded => write!(f, "QUOTA_EXCEEDED"),
            Self::AuthFailed => write!(f, "AUTH_FAILED"),
        }
    }
}

/// An audit event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEvent {
    /// Unique event ID.
    pub event_id: Uuid,

    /// When the event occurred.
    pub occurred_at: DateTime<Utc>,

    /// Event type.
    pub event_type: AuditEventType,

    // ===== Session context =====
    /// Proxy-assigned connection ID.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_id: Option<String>,

    /// Authenticated (or claimed, for `auth.failed`) user.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    /// Target database.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    /// Grant the session runs under.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub grant_id: Option<String>,

    /// Client IP address.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_ip: Option<String>,

    // ===== Statement =====
    /// Full SQL text (`query.executed`, `query.failed`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,

    /// Truncated SQL text (`query.blocked`, `quota.exceeded`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sql_preview: Option<String>,

    /// `simple` or `extended`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,

    /// Machine-readable denial reason (`write_not_permitted`, `expired`, ...).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Rows affected, parsed from the command tag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rows_affected: Option<u64>,

    /// Command tag as sent by the server (`SELECT 3`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command_tag: Option<String>,

    /// Duration in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,

    /// Error message (if event_type indicates failure).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    // ===== Usage =====
    /// Statements executed in the session (`connection.closed`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query_count: Option<u64>,

    /// Result bytes relayed (per statement or per session).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bytes: Option<u64>,

    /// Exhausted quota (`quota.exceeded`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quota_kind: Option<QuotaKind>,

    /// Configured quota limit (`quota.exceeded`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u64>,

    /// Usage at the time of the denial (`quota.exceeded`).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub used: Option<u64>,
}

impl AuditEvent {
    /// Create a new audit event with no context.
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            occurred_at: Utc::now(),
            event_type,
            connection_id: None,
            user: None,
            database: None,
            grant_id: None,
            client_ip: None,
            sql: None,
            sql_preview: None,
            protocol: None,
            reason: None,
            rows_affected: None,
            command_tag: None,
            duration_ms: None,
            error: None,
            query_count: None,
            bytes: None,
            quota_kind: None,
            limit: None,
            used: None,
        }
    }

    /// Create a builder for an audit event.
    pub fn builder(event_type: AuditEventType) -> AuditEventBuilder {
        AuditEventBuilder::new(event_type)
    }

    /// Format the event as a human-readable log line.
    ///
    /// Format: `[timestamp] EVENT_TYPE conn=... user=... db=... [sql=...]`
    pub fn to_log_line(&self) -> String {
        let mut line = format!(
            "[{}] {}",
            self.occurred_at.format("%Y-%m-%dT%H:%M:%S%.3fZ"),
            self.event_type,
        );

        if let Some(ref id) = self.connection_id {
            line.push_str(&format!(" conn={}", id));
        }
        if let Some(ref user) = self.user {
            line.push_str(&format!(" user={}", user));
        }
        if let Some(ref db) = self.database {
            line.push_str(&format!(" db={}", db));
        }
        if let Some(ref grant) = self.grant_id {
            line.push_str(&format!(" grant={}", grant));
        }

        if let Some(sql) = self.sql.as_ref().or(self.sql_preview.as_ref()) {
            line.push_str(&format!(
                " sql=\"{}\"",
                preview(sql, 100).replace('\n', " ")
            ));
        }
        if let Some(ref reason) = self.reason {
            line.push_str(&format!(" reason={}", reason));
        }
        if let Some(rows) = self.rows_affected {
            line.push_str(&format!(" rows={}", rows));
        }
        if let Some(duration) = self.duration_ms {
            line.push_str(&format!(" duration_ms={}", duration));
        }
        if let Some(count) = self.query_count {
            line.push_str(&format!(" queries={}", count));
        }
        if let Some(bytes) = self.bytes {
            line.push_str(&format!(" bytes={}", bytes));
        }
        if let (Some(kind), Some(limit), Some(used)) = (self.quota_kind, self.limit, self.used) {
            line.push_str(&format!(" quota={} limit={} used={}", kind, limit, used));
        }
        if let Some(ref error) = self.error {
            line.push_str(&format!(" error=\"{}\"", error.replace('"', "'")));
        }

        line
    }
}

/// Truncate `sql` to at most `max` characters, appending `...` when cut.
pub fn preview(sql: &str, max: usize) -> String {
    match sql.char_indices().nth(max) {
        Some((cut, _)) => format!("{}...", &sql[..cut]),
        None => sql.to_string(),
    }
}

/// Builder for creating audit events.
#[derive(Debug)]
pub struct AuditEventBuilder {
    event: AuditEvent,
}

impl AuditEventBuilder {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event: AuditEvent::new(event_type),
        }
    }

    pub fn connection_id(mut self, id: impl Into<String>) -> Self {
        self.event.connection_id = Some(id.into());
        self
    }

    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.event.user = Some(user.into());
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.event.database = Some(database.into());
        self
    }

    pub fn grant_id(mut self, id: impl Into<String>) -> Self {
        self.event.grant_id = Some(id.into());
        self
    }

    pub fn client_ip(mut self, ip: impl Into<String>) -> Self {
        self.event.client_ip = Some(ip.into());
        self
    }

    pub fn sql(mut self, sql: impl Into<String>) -> Self {
        self.event.sql = Some(sql.into());
        self
    }

    pub fn sql_preview(mut self, sql: &str, max: usize) -> Self {
        self.event.sql_preview = Some(preview(sql, max));
        self
    }

    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.event.protocol = Some(protocol.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.event.reason = Some(reason.into());
        self
    }

    pub fn rows_affected(mut self, rows: u64) -> Self {
        self.event.rows_affected = Some(rows);
        self
    }

    pub fn command_tag(mut self, tag: impl Into<String>) -> Self {
        self.event.command_tag = Some(tag.into());
        self
    }

    pub fn duration_ms(mut self, duration: u64) -> Self {
        self.event.duration_ms = Some(duration);
        self
    }

    pub fn error(mut self, error: impl Into<String>) -> Self {
        self.event.error = Some(error.into());
        self
    }

    pub fn query_count(mut self, count: u64) -> Self {
        self.event.query_count = Some(count);
        self
    }

    pub fn bytes(mut self, bytes: u64) -> Self {
        self.event.bytes = Some(bytes);
        self
    }

    /// Set the exhausted quota with its limit and current usage.
    pub fn quota(mut self, kind: QuotaKind, limit: u64, used: u64) -> Self {
        self.event.quota_kind = Some(kind);
        self.event.limit = Some(limit);
        self.event.used = Some(used);
        self
    }

    /// Build the audit event.
    pub fn build(self) -> AuditEvent {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_builder() {
        let event = AuditEvent::builder(AuditEventType::QueryExecuted)
            .connection_id("c1")
            .user("alice")
            .database("sales")
            .sql("SELECT * FROM orders")
            .rows_affected(42)
            .duration_ms(15)
            .build();

        assert_eq!(event.event_type, AuditEventType::QueryExecuted);
        assert_eq!(event.user.as_deref(), Some("alice"));
        assert_eq!(event.rows_affected, Some(42));
    }

    #[test]
    fn test_serialized_names() {
        let event = AuditEvent::builder(AuditEventType::QuotaExceeded)
            .quota(QuotaKind::Queries, 2, 2)
            .build();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], "quota.exceeded");
        assert_eq!(json["quota_kind"], "queries");
        assert_eq!(json["limit"], 2);
        assert!(json.get("sql").is_none());
    }

    #[test]
    fn test_to_log_line() {
        let event = AuditEvent::builder(AuditEventType::QueryBlocked)
            .user("alice")
            .sql_preview("UPDATE t\nSET x = 1", 200)
            .reason("write_not_permitted")
            .build();

        let line = event.to_log_line();
        assert!(line.contains("QUERY_BLOCKED"));
        assert!(line.contains("user=alice"));
        assert!(line.contains("sql=\"UPDATE t SET x = 1\""));
        assert!(line.contains("reason=write_not_permitted"));
    }

    #[test]
    fn test_preview_respects_char_boundaries() {
        assert_eq!(preview("SELECT 1", 100), "SELECT 1");
        assert_eq!(preview("SELECT 'héllo'", 10), "SELECT 'hé...");
    }
}
