//! CLI command implementations.

pub mod check;
pub mod classify;
pub mod hash_password;
pub mod serve;
