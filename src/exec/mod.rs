//! Execution control
//!
//! Runs a single pipeline step as an isolated process group with a deadline.

pub mod runner;

pub use runner::{ProcessRunner, StepExecutor, StepInput};
