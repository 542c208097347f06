/// Request flow: resolve, materialise, compile, run, classify, release
///
/// Every request runs on the caller's thread. The only shared state is the
/// read-only registry and the atomic metrics registry.
use crate::config::service::ServiceConfig;
use crate::config::types::Result;
use crate::core::types::{ErrorKind, ExecutionRequest, ExecutionResult};
use crate::exec::runner::{ProcessRunner, StepExecutor, StepInput};
use crate::observability::metrics;
use crate::pipeline::registry::PipelineRegistry;
use crate::pipeline::step::{LanguagePipeline, StdinPolicy};
use crate::safety::workspace::{Workspace, WorkspaceManager};
use crate::verdict::classifier::OutcomeClassifier;
use sha2::{Digest, Sha256};
use std::cell::Cell;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Instant;

/// Where a request currently is. Reported in debug logs and in SystemError text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stage {
    Created,
    PipelineResolved,
    WorkspaceReady,
    Compiling(usize),
    Running,
    Classified,
    Released,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Created => write!(f, "created"),
            Stage::PipelineResolved => write!(f, "pipeline resolved"),
            Stage::WorkspaceReady => write!(f, "workspace ready"),
            Stage::Compiling(i) => write!(f, "compile step {}", i + 1),
            Stage::Running => write!(f, "running"),
            Stage::Classified => write!(f, "classified"),
            Stage::Released => write!(f, "released"),
        }
    }
}

struct StageTracker {
    current: Cell<Stage>,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            current: Cell::new(Stage::Created),
        }
    }

    fn enter(&self, stage: Stage) {
        log::debug!("{} -> {}", self.current.get(), stage);
        self.current.set(stage);
    }

    fn get(&self) -> Stage {
        self.current.get()
    }
}

#[derive(Debug, Clone)]
pub struct Orchestrator {
    registry: Arc<PipelineRegistry>,
    workspaces: WorkspaceManager,
    runner: Arc<dyn StepExecutor>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<PipelineRegistry>,
        workspaces: WorkspaceManager,
        runner: ProcessRunner,
    ) -> Self {
        Self::with_executor(registry, workspaces, Arc::new(runner))
    }

    /// Orchestrator whose steps are run by `runner` instead of a [`ProcessRunner`].
    pub fn with_executor(
        registry: Arc<PipelineRegistry>,
        workspaces: WorkspaceManager,
        runner: Arc<dyn StepExecutor>,
    ) -> Self {
        Self {
            registry,
            workspaces,
            runner,
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::new(
            Arc::new(PipelineRegistry::from_config(config)?),
            WorkspaceManager::new(config.workspace_root.clone()),
            ProcessRunner::from_config(config),
        ))
    }

    pub fn registry(&self) -> &PipelineRegistry {
        &self.registry
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Inbound entry point: run `source` as `language`.
    pub fn submit(&self, language: &str, source: &str) -> ExecutionResult {
        self.execute(&ExecutionRequest::new(language, source))
    }

    /// Run one request to a result. Never panics and never returns an error:
    /// engine failures become `SystemError`.
    pub fn execute(&self, request: &ExecutionRequest) -> ExecutionResult {
        let started = Instant::now();
        let stage = StageTracker::new();

        let flow = panic::catch_unwind(AssertUnwindSafe(|| self.run_flow(request, &stage)));
        let result = match flow {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                log::error!("Request failed during {}: {}", stage.get(), e);
                ExecutionResult::failure(
                    ErrorKind::SystemError,
                    format!("internal error during {}: {}", stage.get(), e),
                )
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                log::error!("Request panicked during {}: {}", stage.get(), message);
                ExecutionResult::failure(
                    ErrorKind::SystemError,
                    format!("internal panic during {}: {}", stage.get(), message),
                )
            }
        };

        let elapsed = started.elapsed();
        metrics::global().record_outcome(result.error_kind, elapsed);
        log::info!(
            "language={} source_sha256={} result={} elapsed_ms={}",
            request.language,
            source_digest(&request.source),
            result
                .error_kind
                .map(|kind| kind.as_str())
                .unwrap_or("ok"),
            elapsed.as_millis()
        );
        result
    }

    fn run_flow(&self, request: &ExecutionRequest, stage: &StageTracker) -> Result<ExecutionResult> {
        let Some(pipeline) = self.registry.resolve(&request.language) else {
            log::debug!("No pipeline for language '{}'", request.language);
            return Ok(ExecutionResult::unsupported());
        };
        stage.enter(Stage::PipelineResolved);

        let workspace = self.workspaces.acquire()?;
        stage.enter(Stage::WorkspaceReady);

        let result = self.run_pipeline(pipeline, &workspace, request, stage)?;
        stage.enter(Stage::Classified);

        drop(workspace);
        stage.enter(Stage::Released);
        Ok(result)
    }

    fn run_pipeline(
        &self,
        pipeline: &LanguagePipeline,
        workspace: &Workspace,
        request: &ExecutionRequest,
        stage: &StageTracker,
    ) -> Result<ExecutionResult> {
        let workdir = workspace.run_dir();
        let source_path = workspace.write_source(&pipeline.source_file, &request.source)?;

        for (index, step) in pipeline.compile.iter().enumerate() {
            stage.enter(Stage::Compiling(index));
            let rendered = step.render(workdir, &source_path);
            let outcome = self.runner.run_step(
                &rendered,
                workdir,
                &pipeline.environment,
                StepInput::Closed,
            )?;
            if outcome.timed_out {
                metrics::global().record_deadline_kill();
            }
            if let Some(failure) = OutcomeClassifier::classify_compile(&outcome) {
                log::debug!(
                    "{} compile step {} failed in workspace {}",
                    pipeline.id,
                    index + 1,
                    workspace.run_id()
                );
                return Ok(failure);
            }
        }

        stage.enter(Stage::Running);
        let input = match (pipeline.stdin, request.stdin.as_deref()) {
            (StdinPolicy::Forward, Some(data)) => StepInput::Data(data),
            _ => StepInput::Closed,
        };
        let rendered = pipeline.run.render(workdir, &source_path);
        let outcome = self
            .runner
            .run_step(&rendered, workdir, &pipeline.environment, input)?;
        if outcome.timed_out {
            metrics::global().record_deadline_kill();
        }

        Ok(OutcomeClassifier::classify(&outcome))
    }
}

fn source_digest(source: &str) -> String {
    format!("{:x}", Sha256::digest(source.as_bytes()))
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
