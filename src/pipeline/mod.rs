//! Language pipelines.
//!
//! The execution core stays language-agnostic. A pipeline declares the
//! source file name, the compile steps and the run step for one language.

pub mod registry;
pub mod step;

pub use registry::PipelineRegistry;
pub use step::{LanguagePipeline, PipelineStep, RenderedStep, StdinPolicy};
