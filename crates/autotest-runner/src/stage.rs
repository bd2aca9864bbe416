use crate::fsutil::copy_tree;
use crate::versions::ScriptVersionStore;
use anyhow::{Context, Result};
use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Sandbox root: group-writable with the sticky bit, no access for others.
pub const SANDBOX_ROOT_MODE: u32 = 0o1770;
/// Directories and declared test scripts.
pub const EXECUTABLE_MODE: u32 = 0o755;
/// Every other file.
pub const DATA_FILE_MODE: u32 = 0o644;

/// Copy submission files and the current test scripts into `tests_path`,
/// then normalise permissions across the whole tree.
///
/// When `files_path` is the working directory itself nothing is copied and
/// only the permission pass runs.
pub fn stage_files(
    versions: &ScriptVersionStore,
    files_path: &Path,
    tests_path: &Path,
    script_names: &BTreeSet<String>,
    service: &str,
    assignment: &str,
) -> Result<()> {
    if files_path != tests_path {
        copy_tree(files_path, tests_path)
            .with_context(|| format!("copy submission files from {}", files_path.display()))?;
        let scripts = versions.copy_current(service, assignment, tests_path)?;
        debug!(scripts = %scripts.display(), tests_path = %tests_path.display(), "test scripts staged");
        set_mode(tests_path, SANDBOX_ROOT_MODE)?;
    }
    normalize_permissions(tests_path, script_names)
}

/// Breadth-first walk below `root` setting every directory and declared
/// script to `rwxr-xr-x` and every other file to `rw-r--r--`. `root` itself
/// is left alone.
pub fn normalize_permissions(root: &Path, script_names: &BTreeSet<String>) -> Result<()> {
    let mut pending: VecDeque<PathBuf> = VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = pending.pop_front() {
        let entries = fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))?;
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if entry.file_type()?.is_dir() {
                set_mode(&path, EXECUTABLE_MODE)?;
                pending.push_back(path);
                continue;
            }
            let rel = path.strip_prefix(root)?.to_string_lossy().to_string();
            let mode = if script_names.contains(&rel) {
                EXECUTABLE_MODE
            } else {
                DATA_FILE_MODE
            };
            set_mode(&path, mode)?;
        }
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> Result<()> {
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("chmod {:o} {}", mode, path.display()))
}
