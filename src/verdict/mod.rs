//! Outcome classification
//!
//! Derives caller-facing results as pure functions over step outcomes.

pub mod classifier;

pub use classifier::OutcomeClassifier;
