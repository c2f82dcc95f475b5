//! Interfaces to the systems around the proxy.
//!
//! The session engine never reaches for global state: user authentication,
//! grant lookup, upstream credentials, quota accounting and the network are
//! all handed to it as trait objects. [`crate::store`] has implementations
//! backed by the configuration file; tests substitute their own.

use std::fmt;
use std::io;

use async_trait::async_trait;
use pgrant_core::{DenialReason, Grant, QuotaKind, SslMode};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::error::ProxyError;

/// Any bidirectional byte stream a session can run over.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

/// Verifies the password a client presents to the proxy.
#[async_trait]
pub trait Authenticator: Send + Sync {
    /// `Ok(false)` for unknown users and wrong passwords alike.
    async fn authenticate(&self, user: &str, password: &str) -> Result<bool, ProxyError>;
}

/// Looks up the active grant for a user and database.
#[async_trait]
pub trait GrantResolver: Send + Sync {
    async fn resolve_grant(&self, user: &str, database: &str) -> Result<Grant, DenialReason>;
}

/// Decrypted credentials for the upstream server of a database.
#[derive(Clone)]
pub struct UpstreamCredentials {
    pub host: String,
    pub port: u16,
    /// Database name on the upstream server.
    pub database: String,
    pub username: String,
    pub password: Option<String>,
    pub ssl_mode: SslMode,
}

impl fmt::Debug for UpstreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamCredentials")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("ssl_mode", &self.ssl_mode)
            .finish()
    }
}

#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn upstream_credentials(&self, database: &str)
        -> Result<UpstreamCredentials, ProxyError>;
}

/// Answer of the quota store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaStatus {
    Ok,
    Exceeded,
}

/// Authoritative usage counters, shared by every session of a grant.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Whether any usage of `kind` remains.
    async fn check_quota(&self, grant_id: &str, kind: QuotaKind) -> Result<QuotaStatus, ProxyError>;

    /// Add `amount` to the counter. `Exceeded` means the store considers the
    /// limit overrun; the session stops admitting work of that kind.
    async fn increment_usage(
        &self,
        grant_id: &str,
        kind: QuotaKind,
        amount: u64,
    ) -> Result<QuotaStatus, ProxyError>;
}

/// Opens transport connections to upstream servers.
#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream>;
}

/// Plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl UpstreamConnector for TcpConnector {
    async fn connect(&self, host: &str, port: u16) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
