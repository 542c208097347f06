use crate::kernel::signal::KillReport;
use serde::{Deserialize, Serialize};

/// One submission: source text plus the language to run it as.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub language: String,
    #[serde(alias = "code")]
    pub source: String,
    /// Forwarded to the run step only when its pipeline allows stdin
    #[serde(default)]
    pub stdin: Option<String>,
}

impl ExecutionRequest {
    pub fn new(language: impl Into<String>, source: impl Into<String>) -> Self {
        Self {
            language: language.into(),
            source: source.into(),
            stdin: None,
        }
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Error taxonomy reported to callers. Closed set.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Language not registered
    Unsupported,
    /// Compiler rejected the source or could not be started
    CompileError,
    /// Program exited non-zero or was killed by a signal
    RuntimeError,
    /// A step exceeded its deadline
    Timeout,
    /// Run step could not be started, or the engine itself failed
    SystemError,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 5] = [
        ErrorKind::Unsupported,
        ErrorKind::CompileError,
        ErrorKind::RuntimeError,
        ErrorKind::Timeout,
        ErrorKind::SystemError,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Unsupported => "Unsupported",
            ErrorKind::CompileError => "CompileError",
            ErrorKind::RuntimeError => "RuntimeError",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::SystemError => "SystemError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The only artifact returned to the caller.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub output_text: String,
    pub error_kind: Option<ErrorKind>,
}

impl ExecutionResult {
    pub fn success(output_text: impl Into<String>) -> Self {
        Self {
            output_text: output_text.into(),
            error_kind: None,
        }
    }

    pub fn failure(kind: ErrorKind, output_text: impl Into<String>) -> Self {
        Self {
            output_text: output_text.into(),
            error_kind: Some(kind),
        }
    }

    pub fn unsupported() -> Self {
        Self::failure(ErrorKind::Unsupported, "language not supported")
    }

    pub fn is_success(&self) -> bool {
        self.error_kind.is_none()
    }
}

/// Raw result of one step, as observed by the runner.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StepOutcome {
    pub exit_code: Option<i32>,
    /// Terminating signal when the process did not exit normally
    pub signal: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub timed_out: bool,
    pub spawn_error: Option<String>,
    /// The step ran inside its own cgroup, so setsid descendants were killed too
    pub cgroup_contained: bool,
    pub wall_time_ms: u64,
    pub kill_report: Option<KillReport>,
}

impl StepOutcome {
    pub fn spawn_failed(error: impl Into<String>) -> Self {
        Self {
            spawn_error: Some(error.into()),
            ..Self::default()
        }
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}
