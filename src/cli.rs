use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::BufRead;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::service::ServiceConfig;
use crate::core::orchestrator::Orchestrator;
use crate::core::pool::{ExecutionPool, Job};
use crate::core::types::{ErrorKind, ExecutionRequest, ExecutionResult};
use crate::observability::metrics;
use crate::pipeline::registry::PipelineRegistry;
use crate::safety::workspace::WorkspaceManager;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// JSON service configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute one program and print the result as JSON
    ExecuteCode {
        /// Language id or alias (python, javascript, cpp, c, java)
        #[arg(long)]
        language: String,
        /// Source code as string
        #[arg(long, conflicts_with = "file", required_unless_present = "file")]
        code: Option<String>,
        /// Read the source code from a file
        #[arg(long)]
        file: Option<PathBuf>,
        /// Input data to pass to stdin
        #[arg(long)]
        stdin: Option<String>,
    },
    /// Execute JSON-lines requests from stdin through the worker pool
    Batch {
        /// Number of concurrent executions (defaults to max_concurrency)
        #[arg(long)]
        workers: Option<usize>,
        /// Pending request capacity (defaults to queue_capacity)
        #[arg(long)]
        queue: Option<usize>,
        /// Write Prometheus text metrics here when the batch finishes
        #[arg(long)]
        metrics_file: Option<PathBuf>,
    },
    /// List registered languages and their pipelines
    Languages,
    /// Check that every pipeline executable is installed
    CheckDeps {
        /// Show where each executable resolved to
        #[arg(long)]
        verbose: bool,
    },
    /// Remove workspaces left behind by crashed processes
    Cleanup {
        /// Minimum age of a workspace to remove (defaults to stale_workspace_secs)
        #[arg(long)]
        max_age_secs: Option<u64>,
    },
}

/// One line of `batch` input.
#[derive(Debug, Deserialize)]
struct BatchRequest {
    #[serde(default)]
    id: serde_json::Value,
    #[serde(flatten)]
    request: ExecutionRequest,
}

/// One line of `batch` output.
#[derive(Debug, Serialize)]
struct BatchResponse {
    id: serde_json::Value,
    #[serde(flatten)]
    result: ExecutionResult,
}

pub fn run() -> Result<()> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.config.as_deref())
        .with_context(|| "Failed to load service configuration")?;

    match cli.command {
        Commands::ExecuteCode {
            language,
            code,
            file,
            stdin,
        } => {
            let source = match (code, file) {
                (Some(code), _) => code,
                (None, Some(path)) => std::fs::read_to_string(&path)
                    .with_context(|| format!("Failed to read source file {}", path.display()))?,
                (None, None) => anyhow::bail!("either --code or --file is required"),
            };

            let orchestrator = build_orchestrator(&config)?;
            let mut request = ExecutionRequest::new(language, source);
            request.stdin = stdin;

            let result = orchestrator.execute(&request);
            println!("{}", serde_json::to_string_pretty(&result)?);

            if !result.is_success() {
                std::process::exit(1);
            }
            Ok(())
        }
        Commands::Batch {
            workers,
            queue,
            metrics_file,
        } => {
            run_batch(
                &config,
                workers.unwrap_or(config.max_concurrency),
                queue.unwrap_or(config.queue_capacity),
            )?;
            if let Some(path) = metrics_file {
                write_metrics(&path)?;
            }
            Ok(())
        }
        Commands::Languages => {
            let registry = PipelineRegistry::from_config(&config)?;
            for pipeline in registry.languages() {
                if pipeline.aliases.is_empty() {
                    println!("{} ({})", pipeline.id, pipeline.name);
                } else {
                    println!(
                        "{} ({}) aliases: {}",
                        pipeline.id,
                        pipeline.name,
                        pipeline.aliases.join(", ")
                    );
                }
                for step in &pipeline.compile {
                    println!("  compile: {}", step.describe());
                }
                println!("  run:     {}", pipeline.run.describe());
            }
            Ok(())
        }
        Commands::CheckDeps { verbose } => check_language_dependencies(&config, verbose),
        Commands::Cleanup { max_age_secs } => {
            let max_age = max_age_secs
                .map(Duration::from_secs)
                .unwrap_or_else(|| config.stale_workspace_age());
            let manager = WorkspaceManager::new(config.workspace_root.clone());
            let swept = manager.sweep_stale(max_age)?;
            eprintln!(
                "Removed {} stale workspace(s) from {}",
                swept,
                manager.root().display()
            );
            Ok(())
        }
    }
}

/// Sweep workspaces orphaned by an earlier crash, then build the orchestrator.
fn build_orchestrator(config: &ServiceConfig) -> Result<Orchestrator> {
    let orchestrator = Orchestrator::from_config(config)?;
    match orchestrator
        .workspaces()
        .sweep_stale(config.stale_workspace_age())
    {
        Ok(0) => {}
        Ok(swept) => log::info!("Removed {} stale workspace(s) at startup", swept),
        Err(e) => log::warn!("Stale workspace sweep failed: {}", e),
    }
    Ok(orchestrator)
}

fn run_batch(config: &ServiceConfig, workers: usize, queue: usize) -> Result<()> {
    let orchestrator = Arc::new(build_orchestrator(config)?);
    let (pool, results) = ExecutionPool::start(orchestrator, workers, queue)?;

    // Job ids are line numbers; callers' ids may be any JSON value
    let ids: Arc<Mutex<HashMap<String, serde_json::Value>>> = Arc::new(Mutex::new(HashMap::new()));

    let printer_ids = Arc::clone(&ids);
    let printer = std::thread::Builder::new()
        .name("polyrun-batch-output".to_string())
        .spawn(move || {
            for completed in results.iter() {
                let id = printer_ids
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .remove(&completed.id)
                    .unwrap_or(serde_json::Value::Null);
                emit_line(&BatchResponse {
                    id,
                    result: completed.result,
                });
            }
        })
        .with_context(|| "Failed to start batch output thread")?;

    let stdin = std::io::stdin();
    for (line_no, line) in stdin.lock().lines().enumerate() {
        let line = line.with_context(|| "Failed to read batch input")?;
        if line.trim().is_empty() {
            continue;
        }

        match serde_json::from_str::<BatchRequest>(&line) {
            Ok(parsed) => {
                let job_id = line_no.to_string();
                ids.lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .insert(job_id.clone(), parsed.id);
                if let Err(e) = pool.submit(Job {
                    id: job_id,
                    request: parsed.request,
                }) {
                    anyhow::bail!("batch line {}: {}", line_no + 1, e);
                }
            }
            Err(e) => emit_line(&BatchResponse {
                id: serde_json::Value::Null,
                result: ExecutionResult::failure(
                    ErrorKind::SystemError,
                    format!("invalid request on line {}: {}", line_no + 1, e),
                ),
            }),
        }
    }

    pool.shutdown();
    if printer.join().is_err() {
        log::warn!("Batch output thread panicked");
    }

    log::info!(
        "Batch finished: {}",
        serde_json::to_string(&metrics::global().snapshot())?
    );
    Ok(())
}

fn write_metrics(path: &Path) -> Result<()> {
    std::fs::write(path, metrics::global().export_prometheus())
        .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
    log::info!("Wrote metrics to {}", path.display());
    Ok(())
}

fn emit_line(response: &BatchResponse) {
    match serde_json::to_string(response) {
        Ok(line) => println!("{}", line),
        Err(e) => log::error!("Failed to encode batch response: {}", e),
    }
}

/// Resolve `executable` the way exec(3) would: paths containing a slash are
/// taken as-is, anything else is searched on `path_var`.
fn resolve_executable(executable: &str, path_var: Option<&std::ffi::OsStr>) -> Option<PathBuf> {
    fn is_executable(path: &Path) -> bool {
        std::fs::metadata(path)
            .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    }

    if executable.contains('/') {
        let path = PathBuf::from(executable);
        return is_executable(&path).then_some(path);
    }

    std::env::split_paths(path_var?)
        .map(|dir| dir.join(executable))
        .find(|candidate| is_executable(candidate))
}

fn check_language_dependencies(config: &ServiceConfig, verbose: bool) -> Result<()> {
    let registry = PipelineRegistry::from_config(config)?;
    let path_var = std::env::var_os("PATH");

    println!("🔍 Checking language dependencies...");
    println!();

    let mut missing_languages = Vec::new();

    for pipeline in registry.languages() {
        let mut lang_ok = true;
        let mut details = Vec::new();

        for step in pipeline.steps() {
            // Build artifacts only exist once the compile step has run
            if step.executable_is_artifact() {
                if verbose {
                    details.push(format!("  {} -> built by compile step", step.executable));
                }
                continue;
            }

            match resolve_executable(&step.executable, path_var.as_deref()) {
                Some(path) => {
                    if verbose {
                        details.push(format!("  {} -> {}", step.executable, path.display()));
                    }
                }
                None => {
                    lang_ok = false;
                    details.push(format!("  {} -> NOT FOUND", step.executable));
                }
            }
        }

        if lang_ok {
            println!("✅ {} - OK", pipeline.name);
        } else {
            println!("❌ {} - MISSING", pipeline.name);
            missing_languages.push(pipeline.id.clone());
        }
        if verbose || !lang_ok {
            for line in details {
                println!("{}", line);
            }
        }
    }

    println!();

    if missing_languages.is_empty() {
        println!("🎉 All language dependencies are installed!");
        Ok(())
    } else {
        println!("Missing toolchains for: {}", missing_languages.join(", "));
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_execute_code() {
        let cli = Cli::try_parse_from([
            "polyrun",
            "--config",
            "/etc/polyrun.json",
            "execute-code",
            "--language",
            "python",
            "--code",
            "print(1)",
        ])
        .unwrap();

        assert_eq!(cli.config, Some(PathBuf::from("/etc/polyrun.json")));
        match cli.command {
            Commands::ExecuteCode { language, code, .. } => {
                assert_eq!(language, "python");
                assert_eq!(code.as_deref(), Some("print(1)"));
            }
            _ => panic!("wrong subcommand"),
        }
    }

    #[test]
    fn test_cli_requires_code_or_file() {
        assert!(Cli::try_parse_from(["polyrun", "execute-code", "--language", "c"]).is_err());
        assert!(Cli::try_parse_from([
            "polyrun",
            "execute-code",
            "--language",
            "c",
            "--code",
            "x",
            "--file",
            "main.c"
        ])
        .is_err());
    }

    #[test]
    fn test_batch_metrics_file() {
        let cli = Cli::try_parse_from(["polyrun", "batch", "--metrics-file", "/tmp/m.prom"]).unwrap();
        match cli.command {
            Commands::Batch { metrics_file, .. } => {
                assert_eq!(metrics_file, Some(PathBuf::from("/tmp/m.prom")));
            }
            _ => panic!("wrong subcommand"),
        }

        let path = std::env::temp_dir().join(format!("polyrun-metrics-{}.prom", std::process::id()));
        write_metrics(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("# TYPE polyrun_requests_total counter"));
        assert!(text.contains("polyrun_deadline_kills_total"));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_batch_request_parsing() {
        let parsed: BatchRequest = serde_json::from_str(
            r#"{"id": 7, "language": "js", "code": "console.log(1)", "stdin": "x"}"#,
        )
        .unwrap();
        assert_eq!(parsed.id, serde_json::json!(7));
        assert_eq!(parsed.request.language, "js");
        assert_eq!(parsed.request.source, "console.log(1)");
        assert_eq!(parsed.request.stdin.as_deref(), Some("x"));
    }

    #[test]
    fn test_batch_response_shape() {
        let response = BatchResponse {
            id: serde_json::json!("a"),
            result: ExecutionResult::failure(ErrorKind::Timeout, "slow"),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["id"], "a");
        assert_eq!(json["outputText"], "slow");
        assert_eq!(json["errorKind"], "Timeout");
    }

    #[test]
    fn test_resolve_executable() {
        assert_eq!(
            resolve_executable("/bin/sh", None),
            Some(PathBuf::from("/bin/sh"))
        );
        assert_eq!(resolve_executable("sh", None), None);

        let path = std::ffi::OsString::from("/nonexistent:/bin");
        assert_eq!(
            resolve_executable("sh", Some(&path)),
            Some(PathBuf::from("/bin/sh"))
        );
        assert_eq!(resolve_executable("polyrun-no-such-tool", Some(&path)), None);
    }
}
