//! polyrun: multi-language execution of untrusted source code
//! Each request runs in its own scratch workspace, under per-step deadlines,
//! with every spawned process confined to a single process group.
//!
//! # Architecture
//!
//! ## Request Core ([`core`])
//! - [`core::orchestrator`]: Resolve, compile, run, classify, release
//! - [`core::pool`]: Bounded worker pool for batch submission
//! - [`core::types`]: Requests, results and raw step outcomes
//!
//! ## Language Pipelines ([`pipeline`])
//! - [`pipeline::registry`]: Data-driven language lookup by id or alias
//! - [`pipeline::step`]: Compile/run step templates and rendering
//!
//! ## Execution Control ([`exec`])
//! - [`exec::runner`]: One step under a wall-clock deadline with bounded capture
//!
//! ## Kernel Primitives ([`kernel`])
//! - [`kernel::signal`]: Session setup and process-group termination
//! - [`kernel::cgroup`]: Per-step cgroups that hold descendants which leave the group
//!
//! ## Verdict ([`verdict`])
//! - [`verdict::classifier`]: Exit status to caller-facing error kind
//!
//! ## Safety & Cleanup ([`safety`])
//! - [`safety::workspace`]: Request-scoped workspaces released on drop
//! - [`safety::safe_cleanup`]: Symlink-safe recursive removal
//!
//! ## Observability ([`observability`])
//! - [`observability::metrics`]: Outcome counters and latency histogram
//!
//! ## Configuration ([`config`])
//! - [`config::service`]: JSON service configuration
//! - [`config::presets`]: Built-in language pipelines
//! - [`config::types`]: Engine error type
//!
//! ## Utilities ([`utils`])
//! - [`utils::env_hygiene`]: Scrubbed child environments
//! - [`utils::output`]: Bounded output collection
//!
//! # Design Principles
//!
//! 1. **Languages are data** - Adding a language never touches the flow
//! 2. **Exit status is truth** - Never guess error kinds from output text
//! 3. **Groups, not pids** - Deadlines and sweeps signal the process group and the step cgroup
//! 4. **Scoped cleanup** - Workspaces are released by `Drop` on every path
//! 5. **Minimal unsafe** - Only the pre-exec hook and its raw cgroup attach, with explicit preconditions

// Kernel Primitives
pub mod kernel;

// Execution Control
pub mod exec;

// Request core
pub mod core;

// Language pipelines
pub mod pipeline;

// Verdict
pub mod verdict;

// Safety & Cleanup
pub mod safety;

// Observability
pub mod observability;

// Configuration
pub mod config;

// Utilities
pub mod utils;

// CLI entrypoint wiring for the polyrun binary.
pub mod cli;

pub use crate::config::service::ServiceConfig;
pub use crate::config::types::{EngineError, Result};
pub use crate::core::orchestrator::Orchestrator;
pub use crate::core::pool::{Completed, ExecutionPool, Job, PoolError};
pub use crate::core::types::{ErrorKind, ExecutionRequest, ExecutionResult};
pub use crate::pipeline::registry::PipelineRegistry;
