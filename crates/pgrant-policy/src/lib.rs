//! # pgrant-policy
//!
//! Decides whether a SQL statement may run under a grant's control set.
//!
//! Classification is deliberately lexical: the statement's leading keyword
//! (after whitespace and comments) decides whether it is a write, a schema
//! change or a `COPY`. There is no SQL AST. Wrapped or CTE-prefixed writes
//! (`WITH x AS (...) UPDATE ...`) are not recognised; for `read_only` grants
//! the proxy additionally opens the upstream session with
//! `default_transaction_read_only=on`, and the engine blocks attempts to turn
//! that setting off.
//!
//! ```
//! use pgrant_core::Control;
//! use pgrant_policy::PolicyEngine;
//!
//! let engine = PolicyEngine::new([Control::ReadOnly]);
//! assert!(engine.check("SELECT * FROM orders").is_ok());
//! assert!(engine.check("UPDATE orders SET paid = true").is_err());
//! ```

pub mod classify;
pub mod engine;
pub mod error;
pub mod lexer;

pub use classify::{classify, classify_statement, Classification, CopyDirection};
pub use engine::PolicyEngine;
pub use error::{PolicyViolation, ViolationKind};
pub use lexer::{split_statements, string_value, Lexer, Spanned, Token};
