use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Placeholder replaced with the absolute workspace directory.
pub const WORKDIR_PLACEHOLDER: &str = "{workdir}";
/// Placeholder replaced with the absolute path of the materialised source file.
pub const SOURCE_PLACEHOLDER: &str = "{source}";

/// One external process invocation, before workspace paths are substituted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub executable: String,
    #[serde(default)]
    pub args: Vec<String>,
    pub timeout_ms: u64,
}

/// Whether the run step may receive request input on stdin.
///
/// Compile steps always get a closed stdin regardless of this policy.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StdinPolicy {
    #[default]
    Closed,
    Forward,
}

/// Declarative description of how to execute one language.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LanguagePipeline {
    /// Canonical language id (e.g. "python", "cpp")
    pub id: String,
    /// Human-readable name
    #[serde(default)]
    pub name: String,
    /// Alternative ids accepted by `resolve`
    #[serde(default)]
    pub aliases: Vec<String>,
    /// File name the source is written to inside the workspace
    pub source_file: String,
    /// Compile steps, run in order before the run step
    #[serde(default)]
    pub compile: Vec<PipelineStep>,
    pub run: PipelineStep,
    #[serde(default)]
    pub stdin: StdinPolicy,
    /// Extra environment for every step of this language
    #[serde(default)]
    pub environment: Vec<(String, String)>,
}

impl LanguagePipeline {
    pub fn has_compile_stage(&self) -> bool {
        !self.compile.is_empty()
    }

    /// Every step in execution order.
    pub fn steps(&self) -> impl Iterator<Item = &PipelineStep> {
        self.compile.iter().chain(std::iter::once(&self.run))
    }
}

/// A step with workspace paths substituted, ready to spawn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedStep {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl PipelineStep {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Substitute `{workdir}` and `{source}` in the executable and every argument.
    pub fn render(&self, workdir: &Path, source: &Path) -> RenderedStep {
        let workdir = workdir.to_string_lossy();
        let source = source.to_string_lossy();
        let expand = |template: &str| {
            template
                .replace(WORKDIR_PLACEHOLDER, &workdir)
                .replace(SOURCE_PLACEHOLDER, &source)
        };

        RenderedStep {
            program: expand(&self.executable),
            args: self.args.iter().map(|arg| expand(arg)).collect(),
            timeout: self.timeout(),
        }
    }

    /// True when the executable lives inside the workspace (a build artifact).
    pub fn executable_is_artifact(&self) -> bool {
        self.executable.contains(WORKDIR_PLACEHOLDER) || self.executable.contains(SOURCE_PLACEHOLDER)
    }

    /// Short form for logs and listings, e.g. `g++ -O2 ... (15000ms)`.
    pub fn describe(&self) -> String {
        let mut parts = vec![self.executable.clone()];
        parts.extend(self.args.iter().cloned());
        format!("{} ({}ms)", parts.join(" "), self.timeout_ms)
    }
}
