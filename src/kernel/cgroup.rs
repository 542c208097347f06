/// Per-step cgroups for descendant containment
///
/// A process group only holds descendants that stay in it; one that calls
/// `setsid` leaves. Cgroup membership is inherited across fork and cannot be
/// dropped by the child, so each step gets its own cgroup and the whole tree
/// is killed through it. When no writable hierarchy exists the runner falls
/// back to process-group signalling alone.
use log::{debug, info, warn};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::ffi::{CStr, CString};
use std::fs;
use std::io::ErrorKind as IoErrorKind;
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

const CGROUP_MOUNT: &str = "/sys/fs/cgroup";
const V1_HIERARCHY: &str = "pids";
const KILL_ROUNDS: usize = 50;
const REMOVE_ATTEMPTS: usize = 100;
const SETTLE_INTERVAL: Duration = Duration::from_millis(10);

static STEP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Cgroup backend type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CgroupBackendType {
    V1,
    V2,
}

/// Cgroup settings in the service config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CgroupConfig {
    /// Use per-step cgroups when the host allows it
    pub enabled: bool,
    /// Parent cgroup directory for step cgroups; defaults to the service's own cgroup
    pub parent: Option<PathBuf>,
}

impl Default for CgroupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            parent: None,
        }
    }
}

/// Detect which cgroup version is mounted
pub fn detect_cgroup_backend() -> Option<CgroupBackendType> {
    let mount = Path::new(CGROUP_MOUNT);
    if mount.join("cgroup.controllers").exists() {
        Some(CgroupBackendType::V2)
    } else if mount.join(V1_HIERARCHY).join("cgroup.procs").exists() {
        Some(CgroupBackendType::V1)
    } else {
        None
    }
}

/// Relative cgroup path of this process from `/proc/self/cgroup` contents.
/// v2 uses the `0::` line; v1 uses the line whose controller list has `pids`.
fn own_cgroup_path(proc_cgroup: &str, kind: CgroupBackendType) -> Option<String> {
    proc_cgroup.lines().find_map(|line| {
        let mut fields = line.splitn(3, ':');
        let id = fields.next()?;
        let controllers = fields.next()?;
        let path = fields.next()?;
        let matches = match kind {
            CgroupBackendType::V2 => id == "0" && controllers.is_empty(),
            CgroupBackendType::V1 => controllers.split(',').any(|c| c == V1_HIERARCHY),
        };
        matches.then(|| path.to_string())
    })
}

fn hierarchy_root(kind: CgroupBackendType) -> PathBuf {
    match kind {
        CgroupBackendType::V2 => PathBuf::from(CGROUP_MOUNT),
        CgroupBackendType::V1 => Path::new(CGROUP_MOUNT).join(V1_HIERARCHY),
    }
}

#[derive(Debug, Clone)]
struct CgroupBase {
    kind: CgroupBackendType,
    parent: PathBuf,
}

/// Creates step cgroups under one parent directory, or nothing when
/// containment is unavailable.
#[derive(Debug, Clone, Default)]
pub struct CgroupManager {
    base: Option<CgroupBase>,
}

impl CgroupManager {
    /// Manager that never creates cgroups
    pub fn disabled() -> Self {
        Self { base: None }
    }

    /// Find a writable parent cgroup. Every failure is logged once and
    /// yields a disabled manager.
    pub fn detect(config: &CgroupConfig) -> Self {
        if !config.enabled {
            info!("Step cgroups disabled by config; using process-group kill only");
            return Self::disabled();
        }

        let kind = match detect_cgroup_backend() {
            Some(kind) => kind,
            None => {
                warn!("No cgroup hierarchy mounted; falling back to process-group kill");
                return Self::disabled();
            }
        };

        let parent = match &config.parent {
            Some(parent) => parent.clone(),
            None => {
                let own = fs::read_to_string("/proc/self/cgroup")
                    .ok()
                    .and_then(|contents| own_cgroup_path(&contents, kind));
                match own {
                    Some(rel) => hierarchy_root(kind).join(rel.trim_start_matches('/')),
                    None => {
                        warn!("Cannot locate own {:?} cgroup; falling back to process-group kill", kind);
                        return Self::disabled();
                    }
                }
            }
        };

        let scratch = parent.join(format!("polyrun-{}-check", std::process::id()));
        match fs::create_dir(&scratch) {
            Ok(()) => {
                let _ = fs::remove_dir(&scratch);
            }
            Err(e) if e.kind() == IoErrorKind::AlreadyExists => {}
            Err(e) => {
                warn!(
                    "Cannot create cgroups under {}: {}; falling back to process-group kill",
                    parent.display(),
                    e
                );
                return Self::disabled();
            }
        }

        info!("Step cgroups enabled ({:?}) under {}", kind, parent.display());
        Self {
            base: Some(CgroupBase { kind, parent }),
        }
    }

    pub fn is_available(&self) -> bool {
        self.base.is_some()
    }

    /// Create a fresh cgroup for one step. `None` means the caller runs
    /// with process-group containment only.
    pub fn create_step(&self) -> Option<StepCgroup> {
        let base = self.base.as_ref()?;
        let name = format!(
            "polyrun-{}-{}",
            std::process::id(),
            STEP_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let path = base.parent.join(name);

        if let Err(e) = fs::create_dir(&path) {
            warn!(
                "Failed to create step cgroup {}: {}; falling back to process-group kill",
                path.display(),
                e
            );
            return None;
        }

        match CString::new(path.join("cgroup.procs").as_os_str().as_bytes()) {
            Ok(procs) => Some(StepCgroup {
                kind: base.kind,
                path,
                procs,
            }),
            Err(_) => {
                let _ = fs::remove_dir(&path);
                None
            }
        }
    }
}

/// One step's cgroup. Dropping it kills any remaining members and removes
/// the directory.
#[derive(Debug)]
pub struct StepCgroup {
    kind: CgroupBackendType,
    path: PathBuf,
    procs: CString,
}

impl StepCgroup {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `cgroup.procs` path, prepared for [`attach_self`] in a forked child.
    pub fn procs_path(&self) -> &CStr {
        &self.procs
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.members().contains(&(pid as i32))
    }

    fn members(&self) -> Vec<i32> {
        fs::read_to_string(self.path.join("cgroup.procs"))
            .map(|contents| {
                contents
                    .lines()
                    .filter_map(|line| line.trim().parse().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// SIGKILL every member. Uses `cgroup.kill` where the kernel has it,
    /// otherwise signals the pids in `cgroup.procs` until none remain.
    /// Returns the number of members seen before the kill.
    pub fn kill_all(&self) -> usize {
        let found = self.members().len();
        if found == 0 {
            return 0;
        }

        let kill_file = self.path.join("cgroup.kill");
        if self.kind == CgroupBackendType::V2 && kill_file.exists() {
            match fs::write(&kill_file, "1") {
                Ok(()) => {
                    debug!("Killed {} member(s) of {} via cgroup.kill", found, self.path.display());
                    return found;
                }
                Err(e) => warn!("Write to {} failed: {}", kill_file.display(), e),
            }
        }

        // Repeated rounds catch children forked between read and kill
        for _ in 0..KILL_ROUNDS {
            let members = self.members();
            if members.is_empty() {
                break;
            }
            for pid in members {
                let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
            }
            std::thread::sleep(SETTLE_INTERVAL);
        }
        debug!("Killed {} member(s) of {} via cgroup.procs", found, self.path.display());
        found
    }

    /// rmdir succeeds only once the last member has fully exited.
    fn remove(&self) {
        for _ in 0..REMOVE_ATTEMPTS {
            match fs::remove_dir(&self.path) {
                Ok(()) => return,
                Err(e) if e.kind() == IoErrorKind::NotFound => return,
                Err(e) if e.raw_os_error() == Some(libc::EBUSY) => {
                    std::thread::sleep(SETTLE_INTERVAL);
                }
                Err(e) => {
                    warn!("Failed to remove step cgroup {}: {}", self.path.display(), e);
                    return;
                }
            }
        }
        warn!("Step cgroup {} still busy; leaving it in place", self.path.display());
    }
}

impl Drop for StepCgroup {
    fn drop(&mut self) {
        self.kill_all();
        self.remove();
    }
}

/// Move the calling process into the cgroup whose `cgroup.procs` is `procs`.
///
/// Runs in the forked child before exec, so it allocates nothing and uses
/// only open(2), write(2) and close(2).
pub fn attach_self(procs: &CStr) -> bool {
    // SAFETY: `procs` is a NUL-terminated path allocated before fork; the
    // three syscalls are async-signal-safe and the fd is closed before return.
    unsafe {
        let fd = libc::open(procs.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return false;
        }
        let written = libc::write(fd, b"0".as_ptr().cast(), 1);
        libc::close(fd);
        written == 1
    }
}
