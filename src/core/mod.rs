//! Request core.
//!
//! Core owns the request types, the per-request flow from resolution to
//! release, and the worker pool that bounds how many flows run at once.

pub mod orchestrator;
pub mod pool;
pub mod types;

pub use orchestrator::{Orchestrator, Stage};
pub use pool::{Completed, ExecutionPool, Job, PoolError};
pub use types::{ErrorKind, ExecutionRequest, ExecutionResult, StepOutcome};
