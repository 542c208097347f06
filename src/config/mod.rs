//! Configuration
//!
//! Service configuration, built-in language presets, and the engine error type.

pub mod presets;
pub mod service;
pub mod types;
