/// Outcome classification
///
/// Maps a raw step outcome to the caller-facing result using exit status and
/// stream emptiness only. Output content is never inspected.
use crate::core::types::{ErrorKind, ExecutionResult, StepOutcome};

pub const EMPTY_OUTPUT_TEXT: &str = "(no output)";

/// Result classifier - pure functions over a step outcome
pub struct OutcomeClassifier;

impl OutcomeClassifier {
    /// Classify the run step. Total over every outcome the runner produces.
    pub fn classify(outcome: &StepOutcome) -> ExecutionResult {
        if outcome.timed_out {
            return Self::timeout(outcome);
        }

        if let Some(error) = &outcome.spawn_error {
            return ExecutionResult::failure(ErrorKind::SystemError, error.clone());
        }

        match (outcome.exit_code, outcome.signal) {
            (Some(0), _) => {
                let stdout = outcome.stdout_text();
                if stdout.is_empty() {
                    ExecutionResult::success(EMPTY_OUTPUT_TEXT)
                } else {
                    ExecutionResult::success(stdout)
                }
            }
            (Some(code), _) => Self::runtime_error(
                outcome,
                format!("process exited with code {}", code),
            ),
            (None, Some(signal)) => Self::runtime_error(
                outcome,
                format!("process terminated by signal {}", signal),
            ),
            (None, None) => ExecutionResult::failure(
                ErrorKind::SystemError,
                "process ended without exit code or signal",
            ),
        }
    }

    /// Classify a compile step. `None` means the pipeline continues; a zero
    /// exit with warnings on stderr still continues.
    pub fn classify_compile(outcome: &StepOutcome) -> Option<ExecutionResult> {
        if outcome.timed_out {
            return Some(Self::timeout(outcome));
        }

        if let Some(error) = &outcome.spawn_error {
            return Some(ExecutionResult::failure(ErrorKind::CompileError, error.clone()));
        }

        if outcome.exit_code == Some(0) {
            return None;
        }

        let text = if !outcome.stderr.is_empty() {
            outcome.stderr_text()
        } else if !outcome.stdout.is_empty() {
            outcome.stdout_text()
        } else {
            match (outcome.exit_code, outcome.signal) {
                (Some(code), _) => format!("compiler exited with code {}", code),
                (None, Some(signal)) => format!("compiler terminated by signal {}", signal),
                (None, None) => "compiler failed".to_string(),
            }
        };
        Some(ExecutionResult::failure(ErrorKind::CompileError, text))
    }

    fn runtime_error(outcome: &StepOutcome, fallback: String) -> ExecutionResult {
        if !outcome.stderr.is_empty() {
            ExecutionResult::failure(ErrorKind::RuntimeError, outcome.stderr_text())
        } else {
            ExecutionResult::failure(ErrorKind::RuntimeError, fallback)
        }
    }

    fn timeout(outcome: &StepOutcome) -> ExecutionResult {
        ExecutionResult::failure(
            ErrorKind::Timeout,
            format!("time limit exceeded after {}ms", outcome.wall_time_ms),
        )
    }
}
