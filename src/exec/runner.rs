/// Process runner: one external step under a hard wall-clock deadline
///
/// The runner spawns, captures and enforces the deadline. It never decides
/// whether an exit code means success; that belongs to the classifier.
use crate::config::service::ServiceConfig;
use crate::config::types::{EngineError, Result};
use crate::core::types::StepOutcome;
use crate::kernel::cgroup::{self, CgroupConfig, CgroupManager, StepCgroup};
use crate::kernel::signal::{self, KillReport};
use crate::pipeline::step::RenderedStep;
use crate::utils::env_hygiene::EnvPolicy;
use crate::utils::output::{OutputLimits, StreamCollector};
use nix::unistd::Pid;
use std::io::Write;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// What the child sees on stdin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepInput<'a> {
    /// `/dev/null`: reads return EOF immediately
    Closed,
    /// Written in full, then the pipe is closed
    Data(&'a str),
}

/// Runs one rendered step in a workspace.
///
/// [`ProcessRunner`] is the real implementation; the orchestrator only sees
/// this trait.
pub trait StepExecutor: Send + Sync + std::fmt::Debug {
    fn run_step(
        &self,
        step: &RenderedStep,
        workdir: &Path,
        pipeline_env: &[(String, String)],
        input: StepInput<'_>,
    ) -> Result<StepOutcome>;
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    limits: OutputLimits,
    kill_grace: Duration,
    env: EnvPolicy,
    cgroups: CgroupManager,
}

impl ProcessRunner {
    /// Runner with cgroups detected from the default config.
    pub fn new(limits: OutputLimits, kill_grace: Duration, env: EnvPolicy) -> Self {
        Self {
            limits,
            kill_grace,
            env,
            cgroups: CgroupManager::detect(&CgroupConfig::default()),
        }
    }

    pub fn from_config(config: &ServiceConfig) -> Self {
        Self {
            limits: config.output.clone(),
            kill_grace: config.kill_grace(),
            env: EnvPolicy::new(config.preserve_env.clone()),
            cgroups: CgroupManager::detect(&config.cgroup),
        }
    }

    pub fn with_cgroups(mut self, cgroups: CgroupManager) -> Self {
        self.cgroups = cgroups;
        self
    }

    pub fn cgroups(&self) -> &CgroupManager {
        &self.cgroups
    }

    /// Run one step to completion or deadline.
    ///
    /// A step that cannot be started yields `spawn_error` in the outcome.
    /// `Err` is reserved for failures of the runner itself (collector threads,
    /// wait errors); the step's process group is gone by the time it returns.
    pub fn run(
        &self,
        step: &RenderedStep,
        workdir: &Path,
        pipeline_env: &[(String, String)],
        input: StepInput<'_>,
    ) -> Result<StepOutcome> {
        let started = Instant::now();

        let mut cmd = Command::new(&step.program);
        cmd.args(&step.args)
            .current_dir(workdir)
            .env_clear()
            .envs(self.env.build(workdir, pipeline_env))
            .stdin(match input {
                StepInput::Closed => Stdio::null(),
                StepInput::Data(_) => Stdio::piped(),
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let step_cgroup = self.cgroups.create_step();
        let attach_to = step_cgroup.as_ref().map(|cg| cg.procs_path().to_owned());

        // SAFETY: the hook runs open/write/close on a path allocated before
        // fork, then setsid(2) and prctl(2). All are async-signal-safe and
        // nothing else is shared with the parent.
        unsafe {
            cmd.pre_exec(move || {
                if let Some(procs) = &attach_to {
                    // Failure is detected by the parent after spawn
                    cgroup::attach_self(procs);
                }
                signal::enter_new_session()
            });
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                log::debug!("Failed to spawn '{}': {}", step.program, e);
                return Ok(StepOutcome::spawn_failed(format!(
                    "failed to start '{}': {}",
                    step.program, e
                )));
            }
        };

        // The child called setsid(), so its pid is also its process group id.
        let pgid = Pid::from_raw(child.id() as i32);
        log::debug!("Spawned '{}' as process group {}", step.program, pgid);

        let step_cgroup = step_cgroup.filter(|cg| {
            let attached = cg.contains(child.id());
            if !attached {
                log::warn!(
                    "'{}' did not join cgroup {}; falling back to process-group kill",
                    step.program,
                    cg.path().display()
                );
            }
            attached
        });

        match self.supervise(&mut child, pgid, step_cgroup.as_ref(), step, input, started) {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                signal::sweep_group(pgid);
                if let Some(cg) = &step_cgroup {
                    cg.kill_all();
                }
                let _ = child.kill();
                let _ = child.wait();
                Err(e)
            }
        }
    }

    fn supervise(
        &self,
        child: &mut Child,
        pgid: Pid,
        step_cgroup: Option<&StepCgroup>,
        step: &RenderedStep,
        input: StepInput<'_>,
        started: Instant,
    ) -> Result<StepOutcome> {
        if let (StepInput::Data(data), Some(mut pipe)) = (input, child.stdin.take()) {
            let data = data.to_owned();
            // A child that never reads makes this block until it dies, then EPIPE ends it.
            thread::Builder::new()
                .name("polyrun-stdin".to_string())
                .spawn(move || {
                    let _ = pipe.write_all(data.as_bytes());
                })
                .map_err(|e| EngineError::Process(format!("failed to start stdin writer: {}", e)))?;
        }

        let stdout = StreamCollector::spawn("stdout", child.stdout.take(), self.limits.stdout_limit)?;
        let stderr = StreamCollector::spawn("stderr", child.stderr.take(), self.limits.stderr_limit)?;

        let (status, kill_report) = self.wait_with_deadline(child, pgid, step_cgroup, step, started)?;
        let wall_time_ms = started.elapsed().as_millis() as u64;

        // Helpers that outlived the leader would otherwise keep running and hold the pipes open.
        // The cgroup also catches those that left the group with setsid.
        signal::sweep_group(pgid);
        let escaped = step_cgroup.map(StepCgroup::kill_all).unwrap_or(0);
        if escaped > 0 {
            log::debug!("Killed {} leftover process(es) of '{}'", escaped, step.program);
        }

        let drain_deadline = Instant::now() + self.limits.drain_timeout();
        let stdout = stdout.finish(drain_deadline);
        let stderr = stderr.finish(drain_deadline);

        log::debug!(
            "'{}' finished in {}ms (status: {}, stdout: {} bytes, stderr: {} bytes)",
            step.program,
            wall_time_ms,
            status,
            stdout.total_bytes,
            stderr.total_bytes
        );

        Ok(StepOutcome {
            exit_code: status.code(),
            signal: status.signal(),
            stdout_truncated: stdout.is_truncated(),
            stderr_truncated: stderr.is_truncated(),
            stdout: stdout.into_bytes_with_marker(),
            stderr: stderr.into_bytes_with_marker(),
            timed_out: kill_report.is_some(),
            spawn_error: None,
            cgroup_contained: step_cgroup.is_some(),
            wall_time_ms,
            kill_report,
        })
    }

    /// Poll the child until it exits or the step deadline passes. On expiry
    /// the whole process group is terminated and the report is returned.
    fn wait_with_deadline(
        &self,
        child: &mut Child,
        pgid: Pid,
        step_cgroup: Option<&StepCgroup>,
        step: &RenderedStep,
        started: Instant,
    ) -> Result<(ExitStatus, Option<KillReport>)> {
        let deadline = started + step.timeout;

        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok((status, None)),
                Ok(None) => {}
                Err(e) => {
                    return Err(EngineError::Process(format!(
                        "wait for '{}' failed: {}",
                        step.program, e
                    )))
                }
            }

            let now = Instant::now();
            if now >= deadline {
                log::warn!(
                    "'{}' exceeded its {}ms deadline; terminating process group {}",
                    step.program,
                    step.timeout.as_millis(),
                    pgid
                );
                let mut reaped = None;
                let mut report = signal::terminate_group(pgid, self.kill_grace, || {
                    if let Ok(Some(status)) = child.try_wait() {
                        reaped = Some(status);
                    }
                    reaped.is_some()
                });
                if let Some(cg) = step_cgroup {
                    let killed = cg.kill_all();
                    if killed > 0 {
                        report.notes.push(format!("cgroup kill reached {} process(es)", killed));
                    }
                }
                let status = match reaped {
                    Some(status) => status,
                    None => {
                        // Direct kill as a fallback if the group signal was refused
                        let _ = child.kill();
                        child.wait().map_err(|e| {
                            EngineError::Process(format!("reap of '{}' failed: {}", step.program, e))
                        })?
                    }
                };
                return Ok((status, Some(report)));
            }

            thread::sleep(POLL_INTERVAL.min(deadline - now));
        }
    }
}

impl StepExecutor for ProcessRunner {
    fn run_step(
        &self,
        step: &RenderedStep,
        workdir: &Path,
        pipeline_env: &[(String, String)],
        input: StepInput<'_>,
    ) -> Result<StepOutcome> {
        self.run(step, workdir, pipeline_env, input)
    }
}

impl Default for ProcessRunner {
    fn default() -> Self {
        Self::new(
            OutputLimits::default(),
            Duration::from_millis(200),
            EnvPolicy::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str, timeout_ms: u64) -> RenderedStep {
        RenderedStep {
            program: "/bin/sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            timeout: Duration::from_millis(timeout_ms),
        }
    }

    /// Gone, or a zombie waiting for init to reap it.
    fn process_gone(pid: i32) -> bool {
        match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
            Err(_) => true,
            Ok(stat) => stat
                .rsplit_once(')')
                .map(|(_, rest)| rest.trim_start().starts_with('Z'))
                .unwrap_or(false),
        }
    }

    fn run(runner: &ProcessRunner, step: &RenderedStep, input: StepInput<'_>) -> StepOutcome {
        runner.run(step, &std::env::temp_dir(), &[], input).unwrap()
    }

    #[test]
    fn test_captures_streams_separately() {
        let outcome = run(
            &ProcessRunner::default(),
            &sh("echo out; echo err >&2; exit 3", 5000),
            StepInput::Closed,
        );
        assert_eq!(outcome.exit_code, Some(3));
        assert_eq!(outcome.stdout, b"out\n");
        assert_eq!(outcome.stderr, b"err\n");
        assert!(!outcome.timed_out);
        assert!(outcome.spawn_error.is_none());
    }

    #[test]
    fn test_stdin_closed_by_default() {
        // `cat` would block forever on an open stdin
        let outcome = run(&ProcessRunner::default(), &sh("cat", 5000), StepInput::Closed);
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout.is_empty());
        assert!(!outcome.timed_out);
    }

    #[test]
    fn test_stdin_data_forwarded() {
        let outcome = run(
            &ProcessRunner::default(),
            &sh("read line; echo \"got $line\"", 5000),
            StepInput::Data("hello\n"),
        );
        assert_eq!(outcome.stdout, b"got hello\n");
    }

    #[test]
    fn test_spawn_error() {
        let step = RenderedStep {
            program: "/nonexistent/polyrun-tool".to_string(),
            args: Vec::new(),
            timeout: Duration::from_secs(1),
        };
        let outcome = run(&ProcessRunner::default(), &step, StepInput::Closed);
        assert!(outcome.exit_code.is_none());
        assert!(outcome.spawn_error.unwrap().contains("/nonexistent/polyrun-tool"));
    }

    #[test]
    fn test_timeout_terminates() {
        let started = Instant::now();
        let outcome = run(&ProcessRunner::default(), &sh("sleep 30", 300), StepInput::Closed);
        assert!(outcome.timed_out);
        assert!(outcome.exit_code.is_none());
        assert!(outcome.kill_report.is_some());
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn test_output_bounded() {
        let limits = OutputLimits {
            stdout_limit: 100,
            ..OutputLimits::default()
        };
        let runner = ProcessRunner::new(limits, Duration::from_millis(100), EnvPolicy::default());
        let outcome = run(
            &runner,
            &sh("i=0; while [ $i -lt 2000 ]; do echo 0123456789; i=$((i+1)); done", 10_000),
            StepInput::Closed,
        );
        assert_eq!(outcome.exit_code, Some(0));
        assert!(outcome.stdout_truncated);
        let text = String::from_utf8_lossy(&outcome.stdout);
        assert!(text.contains("[output truncated after 100 bytes]"));
    }

    #[test]
    fn test_cgroup_fallback_still_enforces_deadline() {
        let runner = ProcessRunner::default().with_cgroups(CgroupManager::disabled());
        let outcome = run(&runner, &sh("sleep 30", 200), StepInput::Closed);
        assert!(outcome.timed_out);
        assert!(!outcome.cgroup_contained);
    }

    #[test]
    fn test_leftover_setsid_child_killed_after_exit() {
        let runner = ProcessRunner::default();
        if !runner.cgroups().is_available() {
            eprintln!("cgroups not delegated to this user; skipping");
            return;
        }
        let pid_file = std::env::temp_dir().join(format!("polyrun-runner-pid-{}", std::process::id()));
        let script = format!(
            "setsid sleep 120 </dev/null >/dev/null 2>&1 & echo $! > {}",
            pid_file.display()
        );
        let outcome = run(&runner, &sh(&script, 5000), StepInput::Closed);
        if !outcome.cgroup_contained {
            eprintln!("step did not join its cgroup; skipping");
            return;
        }
        assert_eq!(outcome.exit_code, Some(0));

        let pid: i32 = std::fs::read_to_string(&pid_file).unwrap().trim().parse().unwrap();
        let _ = std::fs::remove_file(&pid_file);
        let deadline = Instant::now() + Duration::from_secs(2);
        while !process_gone(pid) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        assert!(process_gone(pid), "setsid child {} survived", pid);
    }

    #[test]
    fn test_environment_is_scrubbed() {
        std::env::set_var("POLYRUN_RUNNER_SECRET", "leak");
        let outcome = run(
            &ProcessRunner::default(),
            &sh("echo \"[$POLYRUN_RUNNER_SECRET]\"", 5000),
            StepInput::Closed,
        );
        assert_eq!(outcome.stdout, b"[]\n");
    }
}
