/// Symlink-safe recursive removal of workspace trees.
///
/// Untrusted programs can leave symlinks pointing anywhere on the host inside
/// their workspace, so the tree is walked relative to directory descriptors
/// and nothing is ever followed: every entry is inspected with
/// `fstatat(AT_SYMLINK_NOFOLLOW)` and removed with `unlinkat`.
use crate::config::types::{EngineError, Result};
use nix::dir::Dir;
use nix::fcntl::{AtFlags, OFlag};
use nix::sys::stat::{fchmodat, fstatat, FchmodatFlags, FileStat, Mode, SFlag};
use nix::unistd::{unlinkat, UnlinkatFlags};
use nix::NixPath;
use std::ffi::CString;
use std::fmt::Debug;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;

fn cleanup_error(op: &str, target: impl Debug, err: nix::errno::Errno) -> EngineError {
    EngineError::Workspace(format!("{} failed for {:?}: {}", op, target, err))
}

fn dir_flags() -> OFlag {
    OFlag::O_RDONLY | OFlag::O_DIRECTORY | OFlag::O_CLOEXEC | OFlag::O_NOFOLLOW
}

fn is_dir(st: &FileStat) -> bool {
    SFlag::from_bits_truncate(st.st_mode) & SFlag::S_IFMT == SFlag::S_IFDIR
}

fn stat_nofollow<P>(dir_fd: RawFd, name: &P) -> Result<FileStat>
where
    P: ?Sized + NixPath + Debug,
{
    fstatat(dir_fd, name, AtFlags::AT_SYMLINK_NOFOLLOW).map_err(|e| cleanup_error("fstatat", name, e))
}

/// Remove the directory `name` (relative to `parent_fd`) and everything in it.
fn remove_dir_at<P>(parent_fd: RawFd, name: &P, st: &FileStat, root_dev: libc::dev_t) -> Result<()>
where
    P: ?Sized + NixPath + Debug,
{
    // Programs may chmod their own directories to 000; we need rwx to empty them.
    if st.st_mode & 0o700 != 0o700 {
        fchmodat(
            Some(parent_fd),
            name,
            Mode::from_bits_truncate(0o700),
            FchmodatFlags::FollowSymlink,
        )
        .map_err(|e| cleanup_error("fchmodat", name, e))?;
    }

    let mut dir = Dir::openat(parent_fd, name, dir_flags(), Mode::empty())
        .map_err(|e| cleanup_error("openat", name, e))?;
    let dir_fd = dir.as_raw_fd();

    let mut children: Vec<CString> = Vec::new();
    for entry in dir.iter() {
        let entry = entry.map_err(|e| cleanup_error("readdir", name, e))?;
        let child = entry.file_name();
        let bytes = child.to_bytes();
        if bytes == b"." || bytes == b".." {
            continue;
        }
        children.push(child.to_owned());
    }

    for child in &children {
        let child_st = stat_nofollow(dir_fd, child.as_c_str())?;
        if is_dir(&child_st) {
            if child_st.st_dev != root_dev {
                return Err(EngineError::Workspace(format!(
                    "Refusing to cross filesystem boundary at directory {:?}",
                    child
                )));
            }
            remove_dir_at(dir_fd, child.as_c_str(), &child_st, root_dev)?;
        } else {
            unlinkat(Some(dir_fd), child.as_c_str(), UnlinkatFlags::NoRemoveDir)
                .map_err(|e| cleanup_error("unlinkat", child, e))?;
        }
    }

    drop(dir);
    unlinkat(Some(parent_fd), name, UnlinkatFlags::RemoveDir).map_err(|e| cleanup_error("rmdir", name, e))
}

/// Remove a tree without following symlinks or crossing mount points.
/// A missing path is not an error.
pub fn remove_tree_secure(path: &Path) -> Result<()> {
    match std::fs::symlink_metadata(path) {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(EngineError::Io(e)),
    }

    let parent = path.parent().ok_or_else(|| {
        EngineError::Workspace(format!("Cannot remove path without parent: {}", path.display()))
    })?;
    let name = path.file_name().ok_or_else(|| {
        EngineError::Workspace(format!("Cannot remove path without file name: {}", path.display()))
    })?;

    let parent_dir = Dir::open(parent, dir_flags(), Mode::empty())
        .map_err(|e| cleanup_error("open", parent, e))?;
    let parent_fd = parent_dir.as_raw_fd();

    let st = stat_nofollow(parent_fd, name)?;
    if is_dir(&st) {
        remove_dir_at(parent_fd, name, &st, st.st_dev)
    } else {
        unlinkat(Some(parent_fd), name, UnlinkatFlags::NoRemoveDir).map_err(|e| cleanup_error("unlinkat", name, e))
    }
}
