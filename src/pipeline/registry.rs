use crate::config::presets::builtin_pipelines;
use crate::config::service::ServiceConfig;
use crate::config::types::{EngineError, Result};
use crate::pipeline::step::{LanguagePipeline, PipelineStep};
use std::collections::HashMap;
use std::path::{Component, Path};

/// Read-only map from language id or alias to its pipeline.
///
/// Built once at startup and shared between request threads; it has no
/// interior mutability, so concurrent `resolve` calls need no locking.
#[derive(Debug, Clone)]
pub struct PipelineRegistry {
    pipelines: Vec<LanguagePipeline>,
    index: HashMap<String, usize>,
}

impl PipelineRegistry {
    /// Build a registry from explicit entries, validating each one.
    pub fn new(pipelines: Vec<LanguagePipeline>) -> Result<Self> {
        let mut index = HashMap::new();
        for (position, pipeline) in pipelines.iter().enumerate() {
            validate_pipeline(pipeline)?;
            let keys = std::iter::once(&pipeline.id).chain(pipeline.aliases.iter());
            for key in keys {
                let key = key.to_lowercase();
                if let Some(existing) = index.insert(key.clone(), position) {
                    return Err(EngineError::Config(format!(
                        "language key '{}' is claimed by both '{}' and '{}'",
                        key, pipelines[existing].id, pipeline.id
                    )));
                }
            }
        }

        Ok(Self { pipelines, index })
    }

    /// Registry containing only the built-in languages.
    pub fn builtin() -> Result<Self> {
        Self::new(builtin_pipelines())
    }

    /// Built-ins (unless disabled) with the config's entries merged over them.
    /// An entry whose id already exists replaces it; a new id is appended.
    pub fn from_config(config: &ServiceConfig) -> Result<Self> {
        let mut pipelines = if config.include_builtin_languages {
            builtin_pipelines()
        } else {
            Vec::new()
        };

        for entry in &config.languages {
            match pipelines.iter_mut().find(|p| p.id.eq_ignore_ascii_case(&entry.id)) {
                Some(slot) => {
                    log::debug!("Language '{}' overridden by config", entry.id);
                    *slot = entry.clone();
                }
                None => pipelines.push(entry.clone()),
            }
        }

        Self::new(pipelines)
    }

    /// Look up a pipeline by id or alias, case-insensitively.
    pub fn resolve(&self, language: &str) -> Option<&LanguagePipeline> {
        self.index
            .get(&language.trim().to_lowercase())
            .map(|&position| &self.pipelines[position])
    }

    pub fn languages(&self) -> &[LanguagePipeline] {
        &self.pipelines
    }

    pub fn len(&self) -> usize {
        self.pipelines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pipelines.is_empty()
    }
}

fn validate_step(language: &str, step: &PipelineStep) -> Result<()> {
    if step.executable.trim().is_empty() {
        return Err(EngineError::Config(format!(
            "language '{}' has a step with an empty executable",
            language
        )));
    }
    if step.timeout_ms == 0 {
        return Err(EngineError::Config(format!(
            "language '{}' step '{}' must have a timeout greater than zero",
            language, step.executable
        )));
    }
    Ok(())
}

/// True when `name` is a single plain file name with no directory parts.
pub fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    )
}

fn validate_pipeline(pipeline: &LanguagePipeline) -> Result<()> {
    if pipeline.id.trim().is_empty() {
        return Err(EngineError::Config("language id must not be empty".to_string()));
    }
    if !is_plain_file_name(&pipeline.source_file) {
        return Err(EngineError::Config(format!(
            "language '{}' source_file '{}' must be a plain file name",
            pipeline.id, pipeline.source_file
        )));
    }
    for step in pipeline.steps() {
        validate_step(&pipeline.id, step)?;
    }
    Ok(())
}
