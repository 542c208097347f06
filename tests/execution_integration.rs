//! End-to-end tests for the request flow
//!
//! Pipelines here are built on /bin/sh so the tests run on any Unix host.
//! Examples that need python3 or a C compiler skip themselves when absent.

use polyrun::core::types::StepOutcome;
use polyrun::exec::{StepExecutor, StepInput};
use polyrun::kernel::cgroup::CgroupManager;
use polyrun::pipeline::RenderedStep;
use polyrun::safety::workspace::WorkspaceManager;
use polyrun::{
    ErrorKind, ExecutionPool, ExecutionRequest, ExecutionResult, Job, Orchestrator, PipelineRegistry,
    PoolError, ServiceConfig,
};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn test_root(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "polyrun-it-{}-{}",
        name,
        std::process::id()
    ));
    let _ = std::fs::remove_dir_all(&root);
    root
}

/// `script` runs the source with sh; `checked` syntax-checks it first.
fn shell_config(root: &Path) -> ServiceConfig {
    let json = serde_json::json!({
        "workspace_root": root,
        "include_builtin_languages": false,
        "languages": [
            {
                "id": "script",
                "name": "Shell script",
                "aliases": ["sh"],
                "source_file": "main.sh",
                "run": { "executable": "/bin/sh", "args": ["{source}"], "timeout_ms": 600 },
                "stdin": "forward"
            },
            {
                "id": "checked",
                "name": "Syntax-checked shell",
                "source_file": "main.sh",
                "compile": [
                    { "executable": "/bin/sh", "args": ["-n", "{source}"], "timeout_ms": 5000 }
                ],
                "run": { "executable": "/bin/sh", "args": ["{source}"], "timeout_ms": 5000 }
            },
            {
                "id": "missing",
                "name": "Uninstalled toolchain",
                "source_file": "main.txt",
                "run": { "executable": "/nonexistent/tool", "args": ["{source}"], "timeout_ms": 1000 }
            }
        ]
    });
    serde_json::from_value(json).unwrap()
}

fn shell_orchestrator(root: &Path) -> Orchestrator {
    Orchestrator::from_config(&shell_config(root)).unwrap()
}

fn workspace_count(root: &Path) -> usize {
    match std::fs::read_dir(root) {
        Ok(entries) => entries.count(),
        Err(_) => 0,
    }
}

/// True once `pid` no longer exists or is only a zombie awaiting reaping.
fn process_gone(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Err(_) => true,
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
    }
}

fn wait_until_gone(pid: i32) -> bool {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !process_gone(pid) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(20));
    }
    process_gone(pid)
}

fn read_pid(path: &Path) -> i32 {
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}

fn tool_available(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}

#[test]
fn test_successful_program_returns_stdout() {
    let root = test_root("success");
    let result = shell_orchestrator(&root).submit("script", "echo hello; echo world");

    assert_eq!(result, ExecutionResult::success("hello\nworld\n"));
    assert_eq!(workspace_count(&root), 0);
}

#[test]
fn test_runtime_error_prefers_stderr() {
    let root = test_root("runtime");
    let orchestrator = shell_orchestrator(&root);

    let result = orchestrator.submit("script", "echo partial; echo boom >&2; exit 4");
    assert_eq!(result, ExecutionResult::failure(ErrorKind::RuntimeError, "boom\n"));

    let result = orchestrator.submit("script", "exit 1");
    assert_eq!(
        result,
        ExecutionResult::failure(ErrorKind::RuntimeError, "process exited with code 1")
    );
}

#[test]
fn test_compile_error_skips_run_step() {
    let root = test_root("compile");
    let marker = std::env::temp_dir().join(format!("polyrun-it-marker-{}", std::process::id()));
    let _ = std::fs::remove_file(&marker);

    let source = format!("touch {}\nif then fi (\n", marker.display());
    let result = shell_orchestrator(&root).submit("checked", &source);

    assert_eq!(result.error_kind, Some(ErrorKind::CompileError));
    assert!(!result.output_text.trim().is_empty());
    assert!(!marker.exists(), "run step must not execute after a compile failure");
    assert_eq!(workspace_count(&root), 0);
}

#[test]
fn test_compiled_pipeline_success() {
    let root = test_root("checked-ok");
    let result = shell_orchestrator(&root).submit("checked", "echo $((6 * 7))");
    assert_eq!(result, ExecutionResult::success("42\n"));
}

#[test]
fn test_timeout_kills_descendants() {
    let root = test_root("timeout");
    let pid_file = std::env::temp_dir().join(format!("polyrun-it-pid-{}", std::process::id()));
    let _ = std::fs::remove_file(&pid_file);

    let source = format!("sleep 60 &\necho $! > {}\nwait\n", pid_file.display());
    let started = Instant::now();
    let result = shell_orchestrator(&root).submit("script", &source);
    let elapsed = started.elapsed();

    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    // 600ms deadline plus kill grace and drain timeout
    assert!(elapsed < Duration::from_secs(5), "took {:?}", elapsed);

    let pid = read_pid(&pid_file);
    assert!(wait_until_gone(pid), "background child {} survived the timeout", pid);
    assert_eq!(workspace_count(&root), 0);

    let _ = std::fs::remove_file(&pid_file);
}

#[test]
fn test_timeout_kills_descendant_in_new_session() {
    let root = test_root("setsid");
    let config = shell_config(&root);
    if !tool_available("setsid") || !CgroupManager::detect(&config.cgroup).is_available() {
        eprintln!("setsid or delegated cgroups unavailable; skipping");
        return;
    }
    let pid_file = std::env::temp_dir().join(format!("polyrun-it-setsid-{}", std::process::id()));
    let _ = std::fs::remove_file(&pid_file);

    // The descendant leaves the step's process group; only the cgroup still holds it
    let source = format!(
        "setsid sleep 120 </dev/null >/dev/null 2>&1 &\necho $! > {}\nwhile :; do :; done\n",
        pid_file.display()
    );
    let result = Orchestrator::from_config(&config).unwrap().submit("script", &source);
    assert_eq!(result.error_kind, Some(ErrorKind::Timeout));

    let pid = read_pid(&pid_file);
    assert!(wait_until_gone(pid), "setsid descendant {} survived the timeout", pid);
    assert_eq!(workspace_count(&root), 0);

    let _ = std::fs::remove_file(&pid_file);
}

#[test]
fn test_missing_run_executable_is_system_error() {
    let root = test_root("missing-tool");
    let result = shell_orchestrator(&root).submit("missing", "anything");

    assert_eq!(result.error_kind, Some(ErrorKind::SystemError));
    assert!(result.output_text.contains("/nonexistent/tool"), "{}", result.output_text);
    assert_eq!(workspace_count(&root), 0);
}

#[derive(Debug)]
struct PanickingExecutor;

impl StepExecutor for PanickingExecutor {
    fn run_step(
        &self,
        _step: &RenderedStep,
        _workdir: &Path,
        _pipeline_env: &[(String, String)],
        _input: StepInput<'_>,
    ) -> polyrun::Result<StepOutcome> {
        panic!("step runner crashed")
    }
}

#[test]
fn test_panic_in_flow_is_system_error_and_removes_workspace() {
    let root = test_root("panic");
    let config = shell_config(&root);
    let orchestrator = Orchestrator::with_executor(
        Arc::new(PipelineRegistry::from_config(&config).unwrap()),
        WorkspaceManager::new(root.clone()),
        Arc::new(PanickingExecutor),
    );

    let result = orchestrator.submit("script", "echo never");
    assert_eq!(
        result,
        ExecutionResult::failure(
            ErrorKind::SystemError,
            "internal panic during running: step runner crashed"
        )
    );
    // The root was created for the workspace, which unwinding then removed
    assert!(root.exists());
    assert_eq!(workspace_count(&root), 0);

    // The service keeps working after a panicked request
    let result = shell_orchestrator(&root).submit("script", "echo still up");
    assert_eq!(result, ExecutionResult::success("still up\n"));
}

#[test]
fn test_unsupported_language_touches_nothing() {
    let root = test_root("unsupported");
    let result = shell_orchestrator(&root).submit("brainfuck", "+++.");

    assert_eq!(result, ExecutionResult::unsupported());
    assert_eq!(result.output_text, "language not supported");
    assert!(!root.exists());
}

#[test]
fn test_alias_lookup_is_case_insensitive() {
    let root = test_root("alias");
    let result = shell_orchestrator(&root).submit(" SH ", "echo ok");
    assert_eq!(result.output_text, "ok\n");
}

#[test]
fn test_stdin_forwarded_to_run_step() {
    let root = test_root("stdin");
    let request = ExecutionRequest::new("script", "read a; read b; echo $((a + b))").with_stdin("2\n3\n");
    let result = shell_orchestrator(&root).execute(&request);
    assert_eq!(result, ExecutionResult::success("5\n"));
}

#[test]
fn test_concurrent_requests_do_not_interfere() {
    let root = test_root("concurrent");
    let orchestrator = Arc::new(shell_orchestrator(&root));

    let handles: Vec<_> = (0..8)
        .map(|i| {
            let orchestrator = Arc::clone(&orchestrator);
            std::thread::spawn(move || {
                // Same relative file name in every request
                let source = format!("echo {} > out.txt; sleep 0.1; cat out.txt", i);
                (i, orchestrator.submit("script", &source))
            })
        })
        .collect();

    for handle in handles {
        let (i, result) = handle.join().unwrap();
        assert_eq!(result, ExecutionResult::success(format!("{}\n", i)));
    }
    assert_eq!(workspace_count(&root), 0);
}

#[test]
fn test_pool_runs_jobs_concurrently() {
    let root = test_root("pool");
    let orchestrator = Arc::new(shell_orchestrator(&root));
    let (pool, results) = ExecutionPool::start(orchestrator, 3, 8).unwrap();

    for i in 0..6 {
        pool.submit(Job {
            id: format!("job-{}", i),
            request: ExecutionRequest::new("script", format!("echo {}", i)),
        })
        .unwrap();
    }
    pool.shutdown();

    let mut completed: Vec<_> = results.iter().collect();
    completed.sort_by(|a, b| a.id.cmp(&b.id));
    assert_eq!(completed.len(), 6);
    for (i, done) in completed.iter().enumerate() {
        assert_eq!(done.id, format!("job-{}", i));
        assert_eq!(done.result.output_text, format!("{}\n", i));
    }
    assert_eq!(workspace_count(&root), 0);
}

#[test]
fn test_pool_rejects_when_saturated() {
    let root = test_root("saturated");
    let orchestrator = Arc::new(shell_orchestrator(&root));
    // One busy worker and one queue slot: the third job cannot fit
    let (pool, _results) = ExecutionPool::start(orchestrator, 1, 1).unwrap();

    let mut saturated = 0;
    for i in 0..3 {
        let job = Job {
            id: i.to_string(),
            request: ExecutionRequest::new("checked", "sleep 1"),
        };
        match pool.try_submit(job) {
            Ok(()) => {}
            Err(PoolError::Saturated(job)) => {
                assert_eq!(job.id, i.to_string());
                saturated += 1;
            }
            Err(e) => panic!("unexpected pool error: {}", e),
        }
    }
    assert!(saturated >= 1);
    pool.shutdown();
}

#[test]
fn test_builtin_python_example() {
    if !tool_available("python3") {
        eprintln!("python3 not installed; skipping");
        return;
    }
    let root = test_root("python");
    let config = ServiceConfig {
        workspace_root: root.clone(),
        ..ServiceConfig::default()
    };
    let orchestrator = Orchestrator::from_config(&config).unwrap();

    let result = orchestrator.submit("python", "print(1+1)");
    assert_eq!(result, ExecutionResult::success("2\n"));

    let result = orchestrator.submit("py", "print(1+\n");
    assert_eq!(result.error_kind, Some(ErrorKind::RuntimeError));
    assert_eq!(workspace_count(&root), 0);
}

#[test]
fn test_builtin_c_example() {
    if !tool_available("gcc") {
        eprintln!("gcc not installed; skipping");
        return;
    }
    let root = test_root("c");
    let config = ServiceConfig {
        workspace_root: root.clone(),
        ..ServiceConfig::default()
    };
    let orchestrator = Orchestrator::from_config(&config).unwrap();

    let result = orchestrator.submit("c", "int main(){return 1;}");
    assert_eq!(
        result,
        ExecutionResult::failure(ErrorKind::RuntimeError, "process exited with code 1")
    );

    let result = orchestrator.submit("c", "int main( { return 0 }");
    assert_eq!(result.error_kind, Some(ErrorKind::CompileError));
    assert_eq!(workspace_count(&root), 0);
}
