//! Audit logger implementation.

use pgrant_core::AuditConfig;
use std::sync::Arc;

use crate::error::AuditError;
use crate::event::{AuditEvent, AuditEventType};
use crate::storage::{AuditStorage, ConsoleStorage, DualStorage, FileStorage, NullStorage};

/// The main audit logger.
///
/// Shared by every session through an `Arc`. Storage failures are returned to
/// the caller, which logs them and carries on: an audit outage never breaks
/// client traffic.
pub struct AuditLogger {
    config: AuditConfig,
    storage: Arc<dyn AuditStorage>,
}

impl AuditLogger {
    /// Create a new audit logger with the given configuration.
    ///
    /// `file` and `stdout` can be combined; with neither set, events are only
    /// mirrored to `tracing` at debug level.
    pub async fn new(config: AuditConfig) -> Result<Self, AuditError> {
        let storage: Arc<dyn AuditStorage> = match (config.enabled, &config.file, config.stdout) {
            (false, _, _) => Arc::new(NullStorage::new()),
            (true, Some(path), true) => Arc::new(DualStorage::open(path).await?),
            (true, Some(path), false) => Arc::new(FileStorage::open(path).await?),
            (true, None, true) => Arc::new(ConsoleStorage::new()),
            (true, None, false) => Arc::new(NullStorage::new()),
        };

        Ok(Self { config, storage })
    }

    /// Create a logger with a custom storage backend.
    pub fn with_storage(config: AuditConfig, storage: Arc<dyn AuditStorage>) -> Self {
        Self { config, storage }
    }

    /// Create a disabled (no-op) logger.
    pub fn disabled() -> Self {
        Self {
            config: AuditConfig {
                enabled: false,
                ..Default::default()
            },
            storage: Arc::new(NullStorage::new()),
        }
    }

    /// Check if logging is enabled.
    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Maximum SQL preview length for blocked statements.
    pub fn sql_preview_len(&self) -> usize {
        self.config.sql_preview_len
    }

    /// Log an audit event.
    pub async fn log(&self, event: AuditEvent) -> Result<(), AuditError> {
        if !self.config.enabled {
            return Ok(());
        }

        // Also log to tracing for structured logging integration
        tracing::debug!(
            event_id = %event.event_id,
            event_type = event.event_type.as_str(),
            connection_id = event.connection_id.as_deref().unwrap_or("-"),
            user = event.user.as_deref().unwrap_or("-"),
            database = event.database.as_deref().unwrap_or("-"),
            "Audit event"
        );

        self.storage.store(event).await
    }

    /// Log an authentication failure event.
    pub async fn log_auth_failed(
        &self,
        user: &str,
        database: &str,
        reason: &str,
        client_ip: Option<&str>,
    ) -> Result<(), AuditError> {
        let mut builder = AuditEvent::builder(AuditEventType::AuthFailed)
            .user(user)
            .database(database)
            .reason(reason);

        if let Some(ip) = client_ip {
            builder = builder.client_ip(ip);
        }

        self.log(builder.build()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStorage;

    #[tokio::test]
    async fn test_disabled_logger() {
        let logger = AuditLogger::disabled();
        assert!(!logger.is_enabled());

        // Should not error even when logging
        logger
            .log_auth_failed("alice", "sales", "no_grant", None)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_logs_to_custom_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let logger = AuditLogger::with_storage(AuditConfig::default(), storage.clone());

        logger
            .log_auth_failed("alice", "sales", "expired", Some("10.0.0.7"))
            .await
            .unwrap();

        let events = storage.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type, AuditEventType::AuthFailed);
        assert_eq!(events[0].reason.as_deref(), Some("expired"));
        assert_eq!(events[0].client_ip.as_deref(), Some("10.0.0.7"));
    }

    #[tokio::test]
    async fn test_new_from_config_writes_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let logger = AuditLogger::new(AuditConfig {
            file: Some(path.clone()),
            ..Default::default()
        })
        .await
        .unwrap();

        logger
            .log(AuditEvent::new(AuditEventType::ConnectionOpened))
            .await
            .unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("connection.opened"));
    }
}
