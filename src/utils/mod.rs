//! Utilities
//!
//! Child environment construction and bounded output capture.

pub mod env_hygiene;
pub mod output;
