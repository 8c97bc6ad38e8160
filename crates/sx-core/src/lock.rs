//! Advisory file locks used for all mutual exclusion between sx processes.
//!
//! Locks are `flock`-style and belong to the open file description, so two
//! handles opened on the same path conflict even inside one process.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use anyhow::{Context, Result};
use fs4::FileExt;
use tracing::info;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LockType {
    /// Shared lock.
    Read,
    /// Exclusive lock.
    Write,
    /// Release whatever lock is held.
    None,
}

/// Open (optionally creating) a lock file. Returns `None` when the file does
/// not exist and `create` is false.
pub fn open_lock_file(path: &Path, create: bool) -> Result<Option<File>> {
    if create {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create lock directory {}", parent.display()))?;
        }
    }
    match OpenOptions::new()
        .read(true)
        .write(true)
        .create(create)
        .open(path)
    {
        Ok(file) => Ok(Some(file)),
        Err(err) if !create && err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("failed to open lock {}", path.display())),
    }
}

/// Acquire or release a lock. With `wait == false` this returns `Ok(false)`
/// when another holder prevents acquisition.
pub fn lock_file(file: &File, lock: LockType, wait: bool) -> Result<bool> {
    let outcome = match (lock, wait) {
        (LockType::Read, true) => FileExt::lock_shared(file),
        (LockType::Write, true) => FileExt::lock_exclusive(file),
        (LockType::Read, false) => FileExt::try_lock_shared(file),
        (LockType::Write, false) => FileExt::try_lock_exclusive(file),
        (LockType::None, _) => FileExt::unlock(file),
    };
    match outcome {
        Ok(()) => Ok(true),
        Err(err) if !wait && is_contended(&err) => Ok(false),
        Err(err) => Err(err).context("failed to change file lock"),
    }
}

pub fn try_lock_file(file: &File, lock: LockType) -> Result<bool> {
    lock_file(file, lock, false)
}

pub fn unlock_file(file: &File) -> Result<()> {
    lock_file(file, LockType::None, true).map(|_| ())
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == ErrorKind::WouldBlock
}

/// Delete a lock file whose holder is gone. The file is unlinked and then
/// marked with a sentinel byte, so a process that opened it before the unlink
/// sees a non-empty file once it obtains its lock and knows to start over.
pub fn delete_lock_file(path: &Path, file: &File) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => {
            return Err(err).with_context(|| format!("failed to delete lock {}", path.display()))
        }
    }
    let mut handle = file;
    handle
        .write_all(b"d")
        .with_context(|| format!("failed to mark lock {} stale", path.display()))?;
    Ok(())
}

/// Whether a lock file was deleted by [`delete_lock_file`] after we opened it.
pub fn is_stale(file: &File) -> Result<bool> {
    Ok(file.metadata().context("failed to stat lock file")?.len() != 0)
}

/// Scoped lock on an open file; released when dropped.
#[derive(Debug)]
pub struct FdLock<'a> {
    file: &'a File,
    acquired: bool,
}

impl<'a> FdLock<'a> {
    /// Take `lock` on `file`. When `wait` is set and the lock is contended,
    /// `wait_msg` is logged before blocking.
    pub fn new(file: &'a File, lock: LockType, wait: bool, wait_msg: &str) -> Result<Self> {
        let acquired = if wait {
            if !try_lock_file(file, lock)? {
                if !wait_msg.is_empty() {
                    info!("{wait_msg}");
                }
                lock_file(file, lock, true)?;
            }
            true
        } else {
            try_lock_file(file, lock)?
        };
        Ok(Self { file, acquired })
    }

    #[must_use]
    pub fn acquired(&self) -> bool {
        self.acquired
    }
}

impl Drop for FdLock<'_> {
    fn drop(&mut self) {
        if self.acquired {
            let _ = unlock_file(self.file);
        }
    }
}
