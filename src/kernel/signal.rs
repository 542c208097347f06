/// Process-group lifecycle for spawned steps
///
/// Every step is started as the leader of a new session, so the step and
/// everything it forks share one process group. Deadline enforcement and the
/// post-exit sweep both signal the group, never just the direct child.
use log::{debug, warn};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

const GRACE_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Signal escalation report for timeout termination.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    pub waited_ms: u64,
    pub notes: Vec<String>,
}

/// Runs in the forked child before exec.
///
/// Only async-signal-safe calls are allowed here: `setsid` makes the child a
/// session and group leader, `PR_SET_PDEATHSIG` kills it if the spawning
/// thread dies first.
pub fn enter_new_session() -> std::io::Result<()> {
    nix::unistd::setsid().map_err(std::io::Error::from)?;
    nix::sys::prctl::set_pdeathsig(Signal::SIGKILL).map_err(std::io::Error::from)?;
    Ok(())
}

/// SIGTERM the group, give it up to `grace` to exit, then SIGKILL the group.
///
/// The group is polled during the grace period and escalation is skipped as
/// soon as it is empty. A group whose leader is an unreaped zombie still
/// exists, so `reap_leader` is called on each poll; it should reap the leader
/// without blocking and return true once it has.
pub fn terminate_group(pgid: Pid, grace: Duration, mut reap_leader: impl FnMut() -> bool) -> KillReport {
    let mut report = KillReport::default();
    let start = Instant::now();

    match killpg(pgid, Signal::SIGTERM) {
        Ok(()) => report.term_sent = true,
        Err(Errno::ESRCH) => {
            report.notes.push("process group already gone before SIGTERM".to_string());
            report.waited_ms = start.elapsed().as_millis() as u64;
            return report;
        }
        Err(e) => {
            warn!("SIGTERM to process group {} failed: {}", pgid, e);
            report.notes.push(format!("group SIGTERM failed: {}", e));
        }
    }

    let deadline = start + grace;
    let mut leader_reaped = false;
    loop {
        if !leader_reaped {
            leader_reaped = reap_leader();
        }
        if leader_reaped && !group_exists(pgid) {
            report.notes.push("process group exited during grace period".to_string());
            report.waited_ms = start.elapsed().as_millis() as u64;
            return report;
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep(GRACE_POLL_INTERVAL.min(deadline - now));
    }

    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => report.kill_sent = true,
        Err(Errno::ESRCH) => report.notes.push("process group exited during grace period".to_string()),
        Err(e) => {
            warn!("SIGKILL to process group {} failed: {}", pgid, e);
            report.notes.push(format!("group SIGKILL failed: {}", e));
        }
    }

    report.waited_ms = start.elapsed().as_millis() as u64;
    report
}

/// Signal 0 checks for existence without delivering anything.
fn group_exists(pgid: Pid) -> bool {
    !matches!(killpg(pgid, None), Err(Errno::ESRCH))
}

/// SIGKILL whatever is left of the group after its leader exited.
/// Returns true when at least one straggler was signalled.
pub fn sweep_group(pgid: Pid) -> bool {
    match killpg(pgid, Signal::SIGKILL) {
        Ok(()) => {
            debug!("Swept lingering members of process group {}", pgid);
            true
        }
        Err(Errno::ESRCH) => false,
        Err(e) => {
            warn!("Sweep of process group {} failed: {}", pgid, e);
            false
        }
    }
}
