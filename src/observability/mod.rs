//! Observability
//!
//! Process-wide request metrics.

pub mod metrics;
