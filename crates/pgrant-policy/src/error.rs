//! Policy violation types.
//!
//! A violation is not a failure of the proxy: it is a decision that is
//! serialized to the client as an ordinary PostgreSQL `ErrorResponse`, after
//! which the session carries on.

use pgrant_core::DenialReason;
use std::fmt;

/// A statement rejected by the grant's controls.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyViolation {
    /// The kind of violation.
    pub kind: ViolationKind,
    /// Message sent to the client.
    pub message: String,
}

impl PolicyViolation {
    pub fn new(kind: ViolationKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    // =========================================================================
    // CONTROL VIOLATIONS
    // =========================================================================

    pub fn write_not_permitted() -> Self {
        Self::new(
            ViolationKind::WriteNotPermitted,
            "write not permitted: access grant is read-only",
        )
    }

    pub fn ddl_not_permitted() -> Self {
        Self::new(
            ViolationKind::DdlNotPermitted,
            "ddl not permitted: access grant blocks schema changes",
        )
    }

    pub fn copy_not_permitted() -> Self {
        Self::new(
            ViolationKind::CopyNotPermitted,
            "copy not permitted: access grant blocks COPY",
        )
    }

    pub fn read_only_bypass() -> Self {
        Self::new(
            ViolationKind::ReadOnlyBypass,
            "read-only bypass not permitted: transaction read-only mode cannot be changed under a read-only access grant",
        )
    }

    // =========================================================================
    // GRANT LIFECYCLE
    // =========================================================================

    /// The grant stopped being active after the session started.
    pub fn grant_inactive(reason: DenialReason) -> Self {
        Self::new(ViolationKind::GrantInactive(reason), reason.message())
    }

    /// Reason string used in audit events.
    pub fn reason(&self) -> &'static str {
        self.kind.reason()
    }

    /// SQLSTATE sent with the `ErrorResponse`.
    pub fn sqlstate(&self) -> &'static str {
        self.kind.sqlstate()
    }
}

impl fmt::Display for PolicyViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for PolicyViolation {}

/// Kinds of policy violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    WriteNotPermitted,
    DdlNotPermitted,
    CopyNotPermitted,
    ReadOnlyBypass,
    /// Grant expired or was revoked mid-session.
    GrantInactive(DenialReason),
}

impl ViolationKind {
    pub fn reason(&self) -> &'static str {
        match self {
            Self::WriteNotPermitted => "write_not_permitted",
            Self::DdlNotPermitted => "ddl_not_permitted",
            Self::CopyNotPermitted => "copy_not_permitted",
            Self::ReadOnlyBypass => "read_only_bypass",
            Self::GrantInactive(DenialReason::Revoked) => "grant_revoked",
            Self::GrantInactive(_) => "grant_expired",
        }
    }

    pub fn sqlstate(&self) -> &'static str {
        match self {
            // insufficient_privilege
            Self::WriteNotPermitted
            | Self::DdlNotPermitted
            | Self::CopyNotPermitted
            | Self::ReadOnlyBypass => "42501",
            // invalid_authorization_specification
            Self::GrantInactive(_) => "28000",
        }
    }
}
