//! Filesystem primitives for project transitions.
//!
//! All of these are blocking and are called from `spawn_blocking`.

use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::Path;

use omni_common::AgentError;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// Directory names never copied between roots.
const SKIPPED_DIRS: &[&str] = &["__pycache__"];

/// Regenerable files and folders left out of tree copies.
pub fn is_copy_noise(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    SKIPPED_DIRS.contains(&name.as_ref())
        || name.ends_with(".pyc")
        || (name.starts_with("launch_log") && name.ends_with(".txt"))
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CopyStats {
    pub files: u64,
    pub dirs: u64,
    pub bytes: u64,
}

/// Copy `src` into `dst`, merging with anything already there.
///
/// Works across devices. Symlinks are recreated as links on Unix.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<CopyStats, AgentError> {
    let mut stats = CopyStats::default();
    fs::create_dir_all(dst).map_err(|e| AgentError::io("create destination", dst, e))?;

    let walker = WalkDir::new(src)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_copy_noise(entry.file_name()));

    for entry in walker {
        let entry = entry.map_err(|e| AgentError::io("walk source tree", src, io::Error::from(e)))?;
        let rel = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| AgentError::io("walk source tree", entry.path(), io::Error::other(e)))?;
        if rel.as_os_str().is_empty() {
            continue;
        }
        let target = dst.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target).map_err(|e| AgentError::io("create directory", &target, e))?;
            stats.dirs += 1;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
            stats.files += 1;
        } else {
            if target.exists() {
                make_writable(&target).map_err(|e| AgentError::io("unlock file", &target, e))?;
            }
            let bytes =
                fs::copy(entry.path(), &target).map_err(|e| AgentError::io("copy file", &target, e))?;
            stats.files += 1;
            stats.bytes += bytes;
        }
    }

    debug!(
        src = %src.display(),
        dst = %dst.display(),
        files = stats.files,
        bytes = stats.bytes,
        "copied tree"
    );
    Ok(stats)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), AgentError> {
    let link = fs::read_link(src).map_err(|e| AgentError::io("read symlink", src, e))?;
    if fs::symlink_metadata(dst).is_ok() {
        fs::remove_file(dst).map_err(|e| AgentError::io("replace symlink", dst, e))?;
    }
    std::os::unix::fs::symlink(&link, dst).map_err(|e| AgentError::io("create symlink", dst, e))
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, dst: &Path) -> Result<(), AgentError> {
    if src.is_dir() {
        copy_tree(src, dst).map(|_| ())
    } else {
        fs::copy(src, dst)
            .map(|_| ())
            .map_err(|e| AgentError::io("copy file", dst, e))
    }
}

/// Clear the read-only bit on one entry. Symlinks are left alone.
fn make_writable(path: &Path) -> io::Result<()> {
    let meta = fs::symlink_metadata(path)?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    let mut perms = meta.permissions();
    if !perms.readonly() {
        return Ok(());
    }
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        perms.set_mode(perms.mode() | 0o200);
    }
    #[cfg(not(unix))]
    {
        #[allow(clippy::permissions_set_readonly_false)]
        perms.set_readonly(false);
    }
    fs::set_permissions(path, perms)
}

/// Recursively delete a tree, clearing read-only attributes entry by entry
/// first so VCS object stores cannot block the removal.
pub fn remove_tree_force(path: &Path) -> Result<(), AgentError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(AgentError::io("inspect tree", path, e)),
    };
    if !meta.is_dir() {
        make_writable(path).map_err(|e| AgentError::io("unlock file", path, e))?;
        return fs::remove_file(path).map_err(|e| AgentError::io("remove file", path, e));
    }

    for entry in WalkDir::new(path).follow_links(false).into_iter().filter_map(Result::ok) {
        if let Err(e) = make_writable(entry.path()) {
            debug!(path = %entry.path().display(), error = %e, "could not clear read-only bit");
        }
    }
    fs::remove_dir_all(path).map_err(|e| AgentError::io("remove tree", path, e))
}

/// Move a file or directory to `dst`, which must not exist yet.
///
/// Directories are renamed, falling back to copy-and-delete across devices.
/// Files are always copied and then deleted.
pub fn move_path(src: &Path, dst: &Path) -> Result<(), AgentError> {
    if fs::symlink_metadata(dst).is_ok() {
        return Err(AgentError::io(
            "move resource",
            dst,
            io::Error::new(io::ErrorKind::AlreadyExists, "destination already exists"),
        ));
    }
    if let Some(parent) = dst.parent() {
        fs::create_dir_all(parent).map_err(|e| AgentError::io("create parent", parent, e))?;
    }

    let meta = fs::symlink_metadata(src).map_err(|e| AgentError::io("inspect resource", src, e))?;
    if meta.is_dir() {
        if fs::rename(src, dst).is_ok() {
            return Ok(());
        }
        copy_tree(src, dst)?;
        remove_tree_force(src)
    } else {
        fs::copy(src, dst).map_err(|e| AgentError::io("copy resource", dst, e))?;
        remove_tree_force(src)
    }
}

/// Put `staged` in place of `target`, which may or may not exist.
///
/// An existing `target` is first renamed to `retired` and deleted once the
/// swap succeeded. If `staged` cannot be renamed in, the old tree is moved
/// back. All three paths must be on the same filesystem.
pub fn replace_dir(staged: &Path, target: &Path, retired: &Path) -> Result<(), AgentError> {
    remove_tree_force(retired)?;
    if let Some(parent) = retired.parent() {
        fs::create_dir_all(parent).map_err(|e| AgentError::io("create parent", parent, e))?;
    }
    let had_target = fs::symlink_metadata(target).is_ok();
    if had_target {
        fs::rename(target, retired).map_err(|e| AgentError::io("retire old tree", target, e))?;
    }
    if let Err(e) = fs::rename(staged, target) {
        if had_target {
            if let Err(back) = fs::rename(retired, target) {
                warn!(path = %retired.display(), error = %back, "old tree left in retired slot");
            }
        }
        return Err(AgentError::io("swap in new tree", target, e));
    }
    if had_target {
        if let Err(e) = remove_tree_force(retired) {
            warn!(path = %retired.display(), error = %e, "could not remove retired tree");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write(path: &Path, contents: &str) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    #[test]
    fn copy_tree_copies_nested_content_and_skips_noise() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        write(&src.join("main.py"), "print('hi')");
        write(&src.join("pkg/mod.py"), "x = 1");
        write(&src.join("pkg/mod.pyc"), "bytecode");
        write(&src.join("__pycache__/mod.cpython.pyc"), "bytecode");
        write(&src.join("launch_log_1.txt"), "noise");
        write(&src.join(".git/HEAD"), "ref: refs/heads/main");

        let dst = tmp.path().join("dst");
        let stats = copy_tree(&src, &dst).unwrap();

        assert_eq!(fs::read_to_string(dst.join("main.py")).unwrap(), "print('hi')");
        assert!(dst.join("pkg/mod.py").exists());
        assert!(dst.join(".git/HEAD").exists());
        assert!(!dst.join("pkg/mod.pyc").exists());
        assert!(!dst.join("__pycache__").exists());
        assert!(!dst.join("launch_log_1.txt").exists());
        assert_eq!(stats.files, 3);
    }

    #[test]
    fn copy_tree_merges_into_existing_destination() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("src");
        let dst = tmp.path().join("dst");
        write(&src.join("a.txt"), "new");
        write(&dst.join("a.txt"), "old");
        write(&dst.join("keep.txt"), "keep");

        copy_tree(&src, &dst).unwrap();
        assert_eq!(fs::read_to_string(dst.join("a.txt")).unwrap(), "new");
        assert!(dst.join("keep.txt").exists());
    }

    #[test]
    fn remove_tree_force_handles_read_only_entries() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("proj");
        let object = root.join(".git/objects/ab/cdef");
        write(&object, "blob");
        let mut perms = fs::metadata(&object).unwrap().permissions();
        perms.set_readonly(true);
        fs::set_permissions(&object, perms).unwrap();

        remove_tree_force(&root).unwrap();
        assert!(!root.exists());
        remove_tree_force(&root).unwrap();
    }

    #[test]
    fn move_path_moves_files_and_directories() {
        let tmp = TempDir::new().unwrap();
        let file = tmp.path().join("config.ini");
        write(&file, "k=v");
        let dir = tmp.path().join("cache");
        write(&dir.join("inner/blob.bin"), "data");

        let file_dst = tmp.path().join("assets/one");
        let dir_dst = tmp.path().join("assets/two");
        move_path(&file, &file_dst).unwrap();
        move_path(&dir, &dir_dst).unwrap();

        assert!(!file.exists());
        assert!(!dir.exists());
        assert_eq!(fs::read_to_string(&file_dst).unwrap(), "k=v");
        assert_eq!(fs::read_to_string(dir_dst.join("inner/blob.bin")).unwrap(), "data");
    }

    #[test]
    fn move_path_refuses_to_overwrite() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a");
        let dst = tmp.path().join("b");
        write(&src, "a");
        write(&dst, "b");
        let err = move_path(&src, &dst).unwrap_err();
        assert_eq!(err.code(), "io_error");
        assert!(src.exists());
        assert_eq!(fs::read_to_string(&dst).unwrap(), "b");
    }

    #[test]
    fn replace_dir_swaps_whole_tree() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("backup/demo");
        let staged = tmp.path().join("backup/_omni_sync/staging/demo");
        let retired = tmp.path().join("backup/_omni_sync/retired/demo");
        write(&target.join("stale.txt"), "old");
        write(&target.join("keep.txt"), "v1");
        write(&staged.join("keep.txt"), "v2");

        replace_dir(&staged, &target, &retired).unwrap();

        assert_eq!(fs::read_to_string(target.join("keep.txt")).unwrap(), "v2");
        assert!(!target.join("stale.txt").exists());
        assert!(!staged.exists());
        assert!(!retired.exists());
    }

    #[test]
    fn replace_dir_into_empty_slot_and_failed_swap_keeps_old_tree() {
        let tmp = TempDir::new().unwrap();
        let target = tmp.path().join("demo");
        let retired = tmp.path().join("retired/demo");
        let staged = tmp.path().join("staged");
        write(&staged.join("a.txt"), "a");
        replace_dir(&staged, &target, &retired).unwrap();
        assert_eq!(fs::read_to_string(target.join("a.txt")).unwrap(), "a");

        let err = replace_dir(&tmp.path().join("missing"), &target, &retired).unwrap_err();
        assert_eq!(err.code(), "io_error");
        assert_eq!(fs::read_to_string(target.join("a.txt")).unwrap(), "a");
        assert!(!retired.exists());
    }
}
