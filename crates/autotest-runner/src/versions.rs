//! Current test-script directory per (service, assignment).
//!
//! Readers copy out of the current directory under a shared `flock` on the
//! directory handle. A writer installs a new directory, swaps the pointer,
//! and only deletes the superseded directory once it holds an exclusive
//! `flock` on it, which waits out every reader still copying.

use crate::fsutil::{clean_dir_name, copy_tree, ensure_dir, remove_tree_if_exists};
use crate::store::SharedStore;
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use fs2::FileExt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

const READ_ATTEMPTS: usize = 5;

/// Advisory lock on an open directory handle. Unlocked on drop.
#[derive(Debug)]
pub struct DirLock {
    file: fs::File,
    path: PathBuf,
}

impl DirLock {
    pub fn shared(path: &Path) -> std::io::Result<Self> {
        let file = fs::File::open(path)?;
        FileExt::lock_shared(&file)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn exclusive(path: &Path) -> std::io::Result<Self> {
        let file = fs::File::open(path)?;
        FileExt::lock_exclusive(&file)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    /// Non-blocking exclusive attempt. `Ok(None)` when another handle holds
    /// a conflicting lock.
    pub fn try_exclusive(path: &Path) -> std::io::Result<Option<Self>> {
        let file = fs::File::open(path)?;
        match FileExt::try_lock_exclusive(&file) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(path = %self.path.display(), error = %e, "failed to unlock directory");
        }
    }
}

pub struct ScriptVersionStore {
    store: Arc<dyn SharedStore>,
    hash_key: String,
    root: PathBuf,
}

impl ScriptVersionStore {
    /// `root` is where versioned script directories are created.
    pub fn new(store: Arc<dyn SharedStore>, hash_key: impl Into<String>, root: PathBuf) -> Self {
        Self {
            store,
            hash_key: hash_key.into(),
            root,
        }
    }

    pub fn pointer_key(service: &str, assignment: &str) -> String {
        format!("{}_{}", clean_dir_name(service), assignment)
    }

    pub fn get(&self, service: &str, assignment: &str) -> Result<Option<PathBuf>> {
        let key = Self::pointer_key(service, assignment);
        Ok(self.store.hget(&self.hash_key, &key)?.map(PathBuf::from))
    }

    pub fn set(&self, service: &str, assignment: &str, path: &Path) -> Result<()> {
        let key = Self::pointer_key(service, assignment);
        self.store
            .hset(&self.hash_key, &key, &path.to_string_lossy())?;
        Ok(())
    }

    /// Copy the current script tree for an assignment into `dst`.
    ///
    /// The copy runs under a shared lock on the source directory. If the
    /// pointer moved between reading it and locking, the lock is dropped and
    /// the read starts over with the new pointer.
    pub fn copy_current(&self, service: &str, assignment: &str, dst: &Path) -> Result<PathBuf> {
        for attempt in 1..=READ_ATTEMPTS {
            let current = self.get(service, assignment)?.ok_or_else(|| {
                anyhow!(
                    "no test scripts registered for assignment {} on {}",
                    assignment,
                    service
                )
            })?;
            let lock = match DirLock::shared(&current) {
                Ok(lock) => lock,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    debug!(path = %current.display(), attempt, "script directory vanished before lock");
                    continue;
                }
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("lock script directory {}", current.display()))
                }
            };
            let still_current = self.get(service, assignment)?.as_deref() == Some(lock.path());
            if !still_current || !current.is_dir() {
                debug!(path = %current.display(), attempt, "script directory superseded during lock");
                continue;
            }
            copy_tree(&current, dst)?;
            return Ok(current);
        }
        Err(anyhow!(
            "test scripts for assignment {} on {} kept changing; gave up after {} attempts",
            assignment,
            service,
            READ_ATTEMPTS
        ))
    }

    /// Install the tree at `files_path` as the new current version and delete
    /// the version it replaces once no reader holds it.
    pub fn replace(&self, service: &str, assignment: &str, files_path: &Path) -> Result<PathBuf> {
        let new_dir = self.create_version_dir(service, assignment)?;
        if let Err(e) = copy_tree(files_path, &new_dir) {
            if let Err(cleanup) = remove_tree_if_exists(&new_dir) {
                warn!(
                    path = %new_dir.display(),
                    error = %cleanup,
                    "failed to remove incomplete script directory"
                );
            }
            return Err(e)
                .with_context(|| format!("install test scripts from {}", files_path.display()));
        }
        let old_dir = self.get(service, assignment)?;
        self.set(service, assignment, &new_dir)?;
        info!(
            service,
            assignment,
            path = %new_dir.display(),
            "test scripts updated"
        );
        if let Some(old_dir) = old_dir.filter(|old| old != &new_dir) {
            retire_version(&old_dir)?;
        }
        Ok(new_dir)
    }

    fn create_version_dir(&self, service: &str, assignment: &str) -> Result<PathBuf> {
        let parent = self
            .root
            .join(clean_dir_name(service))
            .join(clean_dir_name(assignment));
        ensure_dir(&parent)?;
        loop {
            let dir = parent.join(format!("test_scripts_{}", Utc::now().timestamp_micros()));
            match fs::create_dir(&dir) {
                Ok(()) => return Ok(dir),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(e).with_context(|| format!("create {}", dir.display()));
                }
            }
        }
    }
}

/// Delete a superseded version directory once every shared holder is gone.
fn retire_version(dir: &Path) -> Result<()> {
    let locked = match DirLock::try_exclusive(dir) {
        Ok(Some(lock)) => Ok(lock),
        Ok(None) => {
            debug!(path = %dir.display(), "waiting for readers of old test scripts");
            DirLock::exclusive(dir)
        }
        Err(e) => Err(e),
    };
    let _lock = match locked {
        Ok(lock) => lock,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => {
            return Err(e).with_context(|| format!("lock old script directory {}", dir.display()))
        }
    };
    remove_tree_if_exists(dir)?;
    info!(path = %dir.display(), "old test scripts removed");
    Ok(())
}
