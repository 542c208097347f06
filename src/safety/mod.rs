//! Safety & cleanup
//!
//! Request-scoped workspaces and the removal path they rely on.

pub mod safe_cleanup;
pub mod workspace;
