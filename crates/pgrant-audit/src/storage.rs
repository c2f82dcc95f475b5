//! Audit storage backends.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::error::AuditError;
use crate::event::AuditEvent;

/// Trait for audit storage backends.
#[async_trait]
pub trait AuditStorage: Send + Sync {
    /// Store an audit event.
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError>;
}

/// Console storage (JSON lines on stdout).
#[derive(Debug, Default)]
pub struct ConsoleStorage;

impl ConsoleStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditStorage for ConsoleStorage {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        let json = serde_json::to_string(&event)?;
        println!("{}", json);
        Ok(())
    }
}

/// File storage (appends JSON lines to a file).
pub struct FileStorage {
    path: PathBuf,
    file: Mutex<tokio::fs::File>,
}

impl FileStorage {
    /// Open (or create) the file for appending.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| AuditError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditStorage for FileStorage {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        // One write per event keeps lines whole across concurrent sessions.
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

/// Dual storage: file plus console.
pub struct DualStorage {
    file: FileStorage,
    console: ConsoleStorage,
}

impl DualStorage {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        Ok(Self {
            file: FileStorage::open(path).await?,
            console: ConsoleStorage,
        })
    }
}

#[async_trait]
impl AuditStorage for DualStorage {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.console.store(event.clone()).await?;
        self.file.store(event).await
    }
}

/// Discards everything.
#[derive(Debug, Default)]
pub struct NullStorage;

impl NullStorage {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuditStorage for NullStorage {
    async fn store(&self, _event: AuditEvent) -> Result<(), AuditError> {
        Ok(())
    }
}

/// In-memory storage, mainly for tests.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    events: RwLock<Vec<AuditEvent>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything stored so far, in order.
    pub fn events(&self) -> Vec<AuditEvent> {
        self.events
            .read()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl AuditStorage for MemoryStorage {
    async fn store(&self, event: AuditEvent) -> Result<(), AuditError> {
        self.events
            .write()
            .map_err(|e| AuditError::Storage(format!("write lock poisoned: {}", e)))?
            .push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AuditEventType;

    #[tokio::test]
    async fn test_console_storage() {
        let storage = ConsoleStorage::new();
        let event = AuditEvent::new(AuditEventType::ConnectionOpened);

        // Should not error
        storage.store(event).await.unwrap();
    }

    #[tokio::test]
    async fn test_file_storage_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("audit/audit.jsonl"))
            .await
            .unwrap();

        let event1 = AuditEvent::builder(AuditEventType::QueryExecuted)
            .connection_id("c1")
            .build();
        let event2 = AuditEvent::builder(AuditEventType::QueryBlocked)
            .connection_id("c2")
            .build();
        storage.store(event1.clone()).await.unwrap();
        storage.store(event2).await.unwrap();

        let content = std::fs::read_to_string(storage.path()).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: AuditEvent = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, event1);
        assert!(lines[1].contains("query.blocked"));
    }

    #[tokio::test]
    async fn test_memory_storage_keeps_order() {
        let storage = MemoryStorage::new();
        for event_type in [
            AuditEventType::ConnectionOpened,
            AuditEventType::QueryExecuted,
            AuditEventType::QueryExecuted,
            AuditEventType::ConnectionClosed,
        ] {
            storage.store(AuditEvent::new(event_type)).await.unwrap();
        }

        let types: Vec<_> = storage.events().iter().map(|e| e.event_type).collect();
        assert_eq!(
            types,
            vec![
                AuditEventType::ConnectionOpened,
                AuditEventType::QueryExecuted,
                AuditEventType::QueryExecuted,
                AuditEventType::ConnectionClosed,
            ]
        );
    }
}
