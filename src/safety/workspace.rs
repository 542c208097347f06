/// Workspace management for request-scoped artifacts
///
/// Every request gets its own directory named by a process-wide sequence
/// number plus a random UUID. The name never depends on the language or the
/// source, so concurrent requests for the same language cannot collide.
use crate::config::types::{EngineError, Result};
use crate::observability::metrics;
use crate::pipeline::registry::is_plain_file_name;
use crate::safety::safe_cleanup;
use std::fs;
use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime};
use uuid::Uuid;

/// Monotonic per-process counter; together with the UUID it guarantees an
/// identifier is never handed out twice while the process lives.
static NEXT_SEQUENCE: AtomicU64 = AtomicU64::new(1);

fn next_run_id() -> String {
    let sequence = NEXT_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    format!("{:08}-{}", sequence, Uuid::new_v4().simple())
}

/// Scratch directory owned by exactly one in-flight request.
///
/// Dropping the workspace removes it. This is the only release path, so the
/// directory goes away on normal returns, early returns and unwinding alike.
#[derive(Debug)]
pub struct Workspace {
    run_id: String,
    run_dir: PathBuf,
}

impl Workspace {
    fn create(root: &Path) -> Result<Self> {
        let run_id = next_run_id();
        let run_dir = root.join(&run_id);

        // create() rather than create_all(): an existing directory must fail, never be shared
        fs::DirBuilder::new().mode(0o700).create(&run_dir).map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to create workspace directory {}: {}",
                run_dir.display(),
                e
            ))
        })?;

        log::debug!("Workspace {} created at {}", run_id, run_dir.display());
        Ok(Self { run_id, run_dir })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Materialise the request source as UTF-8 text under `file_name`.
    pub fn write_source(&self, file_name: &str, source: &str) -> Result<PathBuf> {
        if !is_plain_file_name(file_name) {
            return Err(EngineError::Internal(format!(
                "source file name '{}' escapes the workspace",
                file_name
            )));
        }

        let source_path = self.run_dir.join(file_name);
        fs::write(&source_path, source.as_bytes()).map_err(|e| {
            EngineError::Workspace(format!(
                "Failed to write source file {}: {}",
                source_path.display(),
                e
            ))
        })?;

        Ok(source_path)
    }

    fn release(&self) {
        match safe_cleanup::remove_tree_secure(&self.run_dir) {
            Ok(()) => log::debug!("Workspace {} released", self.run_id),
            Err(e) => {
                metrics::global().record_cleanup_failure();
                log::warn!(
                    "Failed to remove workspace {}: {}",
                    self.run_dir.display(),
                    e
                );
            }
        }
    }
}

impl Drop for Workspace {
    fn drop(&mut self) {
        self.release();
    }
}

/// Hands out workspaces under a common root.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    /// The root is created lazily by `acquire`, so building a manager never
    /// touches the filesystem.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Create a fresh workspace for one request.
    pub fn acquire(&self) -> Result<Workspace> {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.root)
            .map_err(|e| {
                EngineError::Workspace(format!(
                    "Failed to create workspace root {}: {}",
                    self.root.display(),
                    e
                ))
            })?;

        Workspace::create(&self.root)
    }

    /// Remove workspace directories older than `max_age`.
    ///
    /// Live workspaces are never older than the longest pipeline, so anything
    /// past a generous age was orphaned by a process that died mid-request.
    pub fn sweep_stale(&self, max_age: Duration) -> Result<usize> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(e) => {
                return Err(EngineError::Workspace(format!(
                    "Failed to read workspace root {}: {}",
                    self.root.display(),
                    e
                )))
            }
        };

        let now = SystemTime::now();
        let mut swept = 0;

        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };

            let path = entry.path();
            let modified = match entry.metadata().and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(e) => {
                    log::warn!("Failed to stat {}: {}", path.display(), e);
                    continue;
                }
            };

            // Future timestamps are left alone
            let Ok(age) = now.duration_since(modified) else {
                continue;
            };

            if age >= max_age {
                match safe_cleanup::remove_tree_secure(&path) {
                    Ok(()) => {
                        log::info!("Swept stale workspace {}", path.display());
                        swept += 1;
                    }
                    Err(e) => log::warn!("Failed to sweep stale workspace {}: {}", path.display(), e),
                }
            }
        }

        Ok(swept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_root(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("polyrun_ws_{}_{}", name, std::process::id()))
    }

    #[test]
    fn test_manager_is_lazy() {
        let root = test_root("lazy");
        let _ = fs::remove_dir_all(&root);
        let _manager = WorkspaceManager::new(root.clone());
        assert!(!root.exists());
    }

    #[test]
    fn test_drop_removes_directory() {
        let root = test_root("drop");
        let manager = WorkspaceManager::new(root.clone());

        let workspace = manager.acquire().unwrap();
        let run_dir = workspace.run_dir().to_path_buf();
        let source = workspace.write_source("main.py", "print(1)\n").unwrap();
        fs::create_dir(run_dir.join("build")).unwrap();
        assert_eq!(fs::read_to_string(&source).unwrap(), "print(1)\n");

        drop(workspace);
        assert!(!run_dir.exists());
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_run_ids_are_unique() {
        let root = test_root("unique");
        let manager = WorkspaceManager::new(root.clone());

        let workspaces: Vec<Workspace> = (0..32).map(|_| manager.acquire().unwrap()).collect();
        let ids: HashSet<&str> = workspaces.iter().map(|w| w.run_id()).collect();
        assert_eq!(ids.len(), workspaces.len());

        drop(workspaces);
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_write_source_rejects_paths() {
        let root = test_root("reject");
        let manager = WorkspaceManager::new(root.clone());
        let workspace = manager.acquire().unwrap();

        let result = workspace.write_source("../outside.py", "x");
        assert!(matches!(result, Err(EngineError::Internal(_))));

        drop(workspace);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_sweep_stale() {
        let root = test_root("sweep");
        let manager = WorkspaceManager::new(root.clone());
        fs::create_dir_all(root.join("orphan-1/nested")).unwrap();
        fs::create_dir_all(root.join("orphan-2")).unwrap();

        assert_eq!(manager.sweep_stale(Duration::from_secs(3600)).unwrap(), 0);
        assert_eq!(manager.sweep_stale(Duration::ZERO).unwrap(), 2);
        assert_eq!(fs::read_dir(&root).unwrap().count(), 0);
        let _ = fs::remove_dir_all(&root);
    }

    #[test]
    fn test_sweep_missing_root() {
        let manager = WorkspaceManager::new(test_root("sweep_missing"));
        assert_eq!(manager.sweep_stale(Duration::ZERO).unwrap(), 0);
    }
}
