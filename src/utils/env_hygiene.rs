/// Environment hygiene for spawned steps
///
/// Steps never inherit the service environment wholesale. They get an
/// explicit allow-list copied from the service, a workspace-local HOME and
/// TMPDIR, and the pipeline's own variables.
use std::collections::BTreeMap;
use std::env;
use std::path::Path;

/// Used when PATH is not preserved or not set in the service environment.
pub const FALLBACK_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Loader variables that are dropped even when listed in the allow-list.
const DANGEROUS_VARS: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "LD_AUDIT",
    "LD_DEBUG",
    "LD_PROFILE",
];

/// Environment policy for every step the runner spawns.
#[derive(Debug, Clone)]
pub struct EnvPolicy {
    /// Variables copied from the service environment
    pub preserve: Vec<String>,
}

impl EnvPolicy {
    pub fn new(preserve: Vec<String>) -> Self {
        Self { preserve }
    }

    /// Build the complete, deterministic environment for one step.
    ///
    /// Precedence, lowest first: preserved variables, workspace defaults,
    /// pipeline variables.
    pub fn build(&self, workdir: &Path, pipeline_env: &[(String, String)]) -> Vec<(String, String)> {
        let mut vars = BTreeMap::new();

        for key in &self.preserve {
            if DANGEROUS_VARS.contains(&key.as_str()) {
                log::warn!("Refusing to preserve loader variable {}", key);
                continue;
            }
            if let Ok(value) = env::var(key) {
                vars.insert(key.clone(), value);
            }
        }

        vars.entry("PATH".to_string())
            .or_insert_with(|| FALLBACK_PATH.to_string());
        vars.entry("LANG".to_string())
            .or_insert_with(|| "C.UTF-8".to_string());

        let workdir = workdir.to_string_lossy().to_string();
        vars.insert("HOME".to_string(), workdir.clone());
        vars.insert("TMPDIR".to_string(), workdir);

        for (key, value) in pipeline_env {
            vars.insert(key.clone(), value.clone());
        }

        vars.into_iter().collect()
    }
}

impl Default for EnvPolicy {
    fn default() -> Self {
        Self::new(vec!["PATH".to_string(), "LANG".to_string(), "LC_ALL".to_string()])
    }
}
