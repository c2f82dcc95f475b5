//! # pgrant-audit
//!
//! Audit events emitted by the pgrant proxy.
//!
//! ## Event Types
//!
//! | Event | Emitted when |
//! |-------|--------------|
//! | `connection.opened` | a session is authenticated and holds a grant |
//! | `connection.closed` | a session ends, with aggregate query and byte counts |
//! | `query.executed` | a forwarded statement completes |
//! | `query.failed` | a forwarded statement returns an error |
//! | `query.blocked` | a statement is rejected by the grant's controls |
//! | `quota.exceeded` | a statement is rejected because a quota ran out |
//! | `auth.failed` | a login is refused |
//!
//! Events are written as JSON lines to a file and/or stdout.
//!
//! ```rust,no_run
//! use pgrant_audit::{AuditEvent, AuditEventType, AuditLogger};
//! use pgrant_core::AuditConfig;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let logger = AuditLogger::new(AuditConfig::default()).await?;
//! logger
//!     .log(
//!         AuditEvent::builder(AuditEventType::QueryExecuted)
//!             .user("alice")
//!             .sql("SELECT 1")
//!             .rows_affected(1)
//!             .build(),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod event;
pub mod logger;
pub mod storage;

pub use error::AuditError;
pub use event::{preview, AuditEvent, AuditEventBuilder, AuditEventType};
pub use logger::AuditLogger;
pub use storage::{
    AuditStorage, ConsoleStorage, DualStorage, FileStorage, MemoryStorage, NullStorage,
};
