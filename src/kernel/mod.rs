//! Thin wrappers around Linux process primitives.
//!
//! Session setup before exec, process-group signalling and per-step cgroups
//! live here.

pub mod cgroup;
pub mod signal;
