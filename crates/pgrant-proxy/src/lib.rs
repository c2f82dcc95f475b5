//! # pgrant-proxy
//!
//! Postgres wire protocol proxy that enforces pgrant access grants.
//!
//! Each client connection gets its own session and its own upstream
//! connection. The session:
//! - Answers the client's startup with a cleartext password request and
//!   checks the password
//! - Resolves the active grant for the user and database
//! - Logs in to the upstream server with credentials the client never sees
//! - Relays both directions, checking every statement against the grant's
//!   controls and quotas
//! - Audits connections, statements and denials
//!
//! ## Architecture
//!
//! ```text
//!  client ──► RequestInterceptor ──────────────► upstream
//!                  │  policy, quota, tracker
//!                  │ Expectation (FIFO)
//!                  ▼
//!  client ◄── ResponseCorrelator ◄────────────── upstream
//!                     audit, byte accounting
//! ```
//!
//! Denied statements never reach the upstream. The proxy answers them with
//! an `ErrorResponse` queued behind the responses the client is still
//! waiting for, so the client sees them in order.
//!
//! ## Usage
//!
//! ```no_run
//! use pgrant_audit::AuditLogger;
//! use pgrant_core::PgrantConfig;
//! use pgrant_proxy::PgrantProxy;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PgrantConfig::from_file("pgrant.yaml")?;
//!     let audit = AuditLogger::new(config.audit.clone()).await?;
//!     PgrantProxy::from_config(&config, audit).run().await?;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod cancel;
pub mod codec;
pub mod collaborators;
pub mod correlator;
pub mod error;
pub mod interceptor;
pub mod proxy;
pub mod quota;
pub mod session;
pub mod store;
pub mod tls;
pub mod tracker;
pub mod upstream;

pub use cancel::CancelRegistry;
pub use collaborators::{
    AsyncStream, Authenticator, BoxedStream, CredentialProvider, GrantResolver, QuotaStatus,
    QuotaStore, TcpConnector, UpstreamConnector, UpstreamCredentials,
};
pub use error::ProxyError;
pub use interceptor::Denial;
pub use proxy::PgrantProxy;
pub use quota::{QuotaExceeded, QuotaTracker};
pub use session::{serve_connection, SessionContext, SessionServices};
pub use store::{hash_password, ConfigAuthenticator, ConfigCredentialProvider, MemoryGrantStore};
pub use tracker::StatementTracker;
pub use upstream::UpstreamError;
