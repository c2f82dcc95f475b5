//! Error types for the proxy crate.

use pgrant_core::DenialReason;
use thiserror::Error;

use crate::codec::CodecError;
use crate::upstream::UpstreamError;

/// Errors that end a proxy session or stop the listener.
///
/// Policy and quota denials are not errors: they are answered in-band and the
/// session continues.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Failed to bind to the listen address.
    #[error("failed to bind to {address}: {source}")]
    BindFailed {
        address: String,
        source: std::io::Error,
    },

    /// Failed to accept a connection.
    #[error("failed to accept connection: {0}")]
    AcceptFailed(#[source] std::io::Error),

    /// Bad credentials.
    #[error("authentication failed for user {0}")]
    AuthenticationFailed(String),

    /// No usable grant for the user and database.
    #[error("access denied: {0}")]
    GrantDenied(DenialReason),

    /// No upstream is configured for the database.
    #[error("no upstream configured for database {0}")]
    UnknownDatabase(String),

    /// Failed to connect or log in to upstream Postgres.
    #[error("failed to connect to upstream: {0}")]
    UpstreamConnectionFailed(#[from] UpstreamError),

    /// The quota store could not be reached or does not know the grant.
    #[error("quota store error: {0}")]
    QuotaStore(String),

    /// The client broke the protocol.
    #[error("protocol error: {0}")]
    ProtocolError(String),

    /// Framing error on either connection.
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}
