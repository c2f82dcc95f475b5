//! Allow/deny decisions for a grant's control set.

use std::collections::BTreeSet;

use pgrant_core::{Control, Grant};

use crate::classify::{classify, Classification};
use crate::error::PolicyViolation;

/// Applies a grant's controls to classified SQL.
///
/// Rules, first match wins:
///
/// 1. `read_only` and the statement writes: `write_not_permitted`. This
///    covers DDL and `COPY ... FROM` as both are writes.
/// 2. `block_ddl` and the statement is DDL: `ddl_not_permitted`.
/// 3. `block_copy` and the statement is a `COPY` in either direction:
///    `copy_not_permitted`. `read_only` alone does not stop `COPY ... TO`.
/// 4. `read_only` and the statement tries to leave read-only transaction mode:
///    `read_only_bypass`.
#[derive(Debug, Clone, Default)]
pub struct PolicyEngine {
    controls: BTreeSet<Control>,
}

impl PolicyEngine {
    pub fn new(controls: impl IntoIterator<Item = Control>) -> Self {
        Self {
            controls: controls.into_iter().collect(),
        }
    }

    pub fn for_grant(grant: &Grant) -> Self {
        Self::new(grant.controls.iter().copied())
    }

    pub fn controls(&self) -> &BTreeSet<Control> {
        &self.controls
    }

    fn has(&self, control: Control) -> bool {
        self.controls.contains(&control)
    }

    /// Classify `sql` and decide. The classification is returned on allow so
    /// callers can log it.
    pub fn check(&self, sql: &str) -> Result<Classification, PolicyViolation> {
        let class = classify(sql);
        self.decide(&class)?;
        Ok(class)
    }

    /// Decide on an existing classification.
    pub fn decide(&self, class: &Classification) -> Result<(), PolicyViolation> {
        let read_only = self.has(Control::ReadOnly);

        if read_only && class.is_write {
            return Err(PolicyViolation::write_not_permitted());
        }
        if self.has(Control::BlockDdl) && class.is_ddl {
            return Err(PolicyViolation::ddl_not_permitted());
        }
        if self.has(Control::BlockCopy) && class.is_copy {
            return Err(PolicyViolation::copy_not_permitted());
        }
        if read_only && class.is_read_only_bypass {
            tracing::debug!("read-only bypass attempt detected");
            return Err(PolicyViolation::read_only_bypass());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViolationKind;

    fn kind(engine: &PolicyEngine, sql: &str) -> Option<ViolationKind> {
        engine.check(sql).err().map(|v| v.kind)
    }

    #[test]
    fn test_unrestricted_allows_everything() {
        let engine = PolicyEngine::default();
        for sql in [
            "SELECT 1",
            "INSERT INTO t VALUES (1)",
            "DROP TABLE t",
            "COPY t FROM STDIN",
            "SET default_transaction_read_only = off",
        ] {
            assert!(engine.check(sql).is_ok(), "{sql}");
        }
    }

    #[test]
    fn test_read_only() {
        let engine = PolicyEngine::new([Control::ReadOnly]);
        assert_eq!(kind(&engine, "SELECT 1"), None);
        assert_eq!(
            kind(&engine, "UPDATE t SET x = 1"),
            Some(ViolationKind::WriteNotPermitted)
        );
        assert_eq!(
            kind(&engine, "CREATE TABLE t (a int)"),
            Some(ViolationKind::WriteNotPermitted)
        );
        assert_eq!(
            kind(&engine, "COPY t FROM STDIN"),
            Some(ViolationKind::WriteNotPermitted)
        );
        // Export is a read.
        assert_eq!(kind(&engine, "COPY t TO STDOUT"), None);
        assert_eq!(
            kind(&engine, "SET default_transaction_read_only = off"),
            Some(ViolationKind::ReadOnlyBypass)
        );
    }

    #[test]
    fn test_block_ddl() {
        let engine = PolicyEngine::new([Control::BlockDdl]);
        assert_eq!(kind(&engine, "INSERT INTO t VALUES (1)"), None);
        assert_eq!(
            kind(&engine, "ALTER TABLE t ADD b int"),
            Some(ViolationKind::DdlNotPermitted)
        );
    }

    #[test]
    fn test_block_copy_applies_under_read_only() {
        let engine = PolicyEngine::new([Control::ReadOnly, Control::BlockCopy]);
        assert_eq!(
            kind(&engine, "COPY t TO STDOUT"),
            Some(ViolationKind::CopyNotPermitted)
        );
        // Writes are reported as such even when they are also copies.
        assert_eq!(
            kind(&engine, "COPY t FROM STDIN"),
            Some(ViolationKind::WriteNotPermitted)
        );
        assert_eq!(kind(&engine, "SELECT * FROM t"), None);
    }

    #[test]
    fn test_bypass_only_matters_under_read_only() {
        let engine = PolicyEngine::new([Control::BlockCopy]);
        assert_eq!(kind(&engine, "BEGIN READ WRITE"), None);
    }
}
