/// Service configuration loading from a JSON file
use crate::config::types::{EngineError, Result};
use crate::kernel::cgroup::CgroupConfig;
use crate::pipeline::step::LanguagePipeline;
use crate::utils::output::OutputLimits;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level service configuration.
///
/// Every field has a default, so an empty JSON object is a valid config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    /// Directory under which per-request workspaces are created
    pub workspace_root: PathBuf,
    /// Worker threads in the execution pool
    pub max_concurrency: usize,
    /// Requests allowed to wait for a worker before submit blocks or rejects
    pub queue_capacity: usize,
    /// Per-stream capture bounds
    pub output: OutputLimits,
    /// Time between SIGTERM and SIGKILL when a step overruns its deadline
    pub kill_grace_ms: u64,
    /// Per-step cgroup containment
    pub cgroup: CgroupConfig,
    /// Variables copied from the service environment into every step
    pub preserve_env: Vec<String>,
    /// Workspaces older than this are swept at startup
    pub stale_workspace_secs: u64,
    /// Start from the built-in language table before applying `languages`
    pub include_builtin_languages: bool,
    /// Additional or replacement pipelines, keyed by id
    pub languages: Vec<LanguagePipeline>,
}

impl ServiceConfig {
    /// Runtime root scoped by effective UID so that different users
    /// never share a workspace tree.
    pub fn runtime_root_dir() -> PathBuf {
        let euid = unsafe { libc::geteuid() };
        std::env::temp_dir().join(format!("polyrun-uid-{}", euid))
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            EngineError::Config(format!("Failed to read config file {}: {}", path.display(), e))
        })?;

        let config: ServiceConfig = serde_json::from_str(&content).map_err(|e| {
            EngineError::Config(format!("Failed to parse config JSON {}: {}", path.display(), e))
        })?;

        config.validate()?;
        log::info!(
            "Loaded service config from {} ({} language override(s))",
            path.display(),
            config.languages.len()
        );
        Ok(config)
    }

    /// Load from `path` if given, otherwise use defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(EngineError::Config("max_concurrency must be at least 1".to_string()));
        }
        if self.queue_capacity == 0 {
            return Err(EngineError::Config("queue_capacity must be at least 1".to_string()));
        }
        if self.output.stdout_limit == 0 || self.output.stderr_limit == 0 {
            return Err(EngineError::Config("output limits must be non-zero".to_string()));
        }
        if self.workspace_root.as_os_str().is_empty() {
            return Err(EngineError::Config("workspace_root must not be empty".to_string()));
        }
        Ok(())
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn stale_workspace_age(&self) -> Duration {
        Duration::from_secs(self.stale_workspace_secs)
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            workspace_root: Self::runtime_root_dir(),
            max_concurrency: 4,
            queue_capacity: 64,
            output: OutputLimits::default(),
            kill_grace_ms: 200,
            cgroup: CgroupConfig::default(),
            preserve_env: vec!["PATH".to_string(), "LANG".to_string(), "LC_ALL".to_string()],
            stale_workspace_secs: 3600,
            include_builtin_languages: true,
            languages: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_object_is_default() {
        let config: ServiceConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.max_concurrency, 4);
        assert_eq!(config.kill_grace_ms, 200);
        assert!(config.cgroup.enabled);
        assert!(config.cgroup.parent.is_none());
        assert!(config.include_builtin_languages);
        assert!(config.preserve_env.contains(&"PATH".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file_with_language() {
        let path = std::env::temp_dir().join(format!("polyrun_config_{}.json", std::process::id()));
        let json = r#"{
            "max_concurrency": 2,
            "output": { "stdout_limit": 1024 },
            "languages": [{
                "id": "shell",
                "source_file": "main.sh",
                "run": { "executable": "/bin/sh", "args": ["{source}"], "timeout_ms": 1000 }
            }]
        }"#;
        std::fs::write(&path, json).unwrap();

        let config = ServiceConfig::load_from_file(&path).unwrap();
        assert_eq!(config.max_concurrency, 2);
        assert_eq!(config.output.stdout_limit, 1024);
        assert_eq!(config.output.stderr_limit, OutputLimits::default().stderr_limit);
        assert_eq!(config.languages[0].id, "shell");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let config: ServiceConfig = serde_json::from_str(r#"{"max_concurrency": 0}"#).unwrap();
        assert!(matches!(config.validate(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_config_error() {
        let result = ServiceConfig::load_from_file("/nonexistent/polyrun.json");
        assert!(matches!(result, Err(EngineError::Config(_))));
    }
}
