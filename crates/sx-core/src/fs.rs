use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{anyhow, Context, Result};

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Recursively delete `path`, returning the bytes released. A missing path
/// counts as zero bytes. Non-directory entries are only counted when the
/// deletion drops their last store-visible link (the `.links` pool may hold
/// one more).
pub fn delete_path(path: &Path) -> Result<u64> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err).with_context(|| format!("failed to stat {}", path.display())),
    };

    let mut freed = 0;
    if meta.is_dir() {
        if meta.permissions().mode() & 0o700 != 0o700 {
            fs::set_permissions(path, fs::Permissions::from_mode(meta.mode() | 0o700))
                .with_context(|| format!("failed to make {} writable", path.display()))?;
        }
        let entries =
            fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?;
        for entry in entries {
            let entry = entry.with_context(|| format!("failed to read {}", path.display()))?;
            freed += delete_path(&entry.path())?;
        }
        match fs::remove_dir(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    } else {
        if meta.nlink() <= 2 {
            freed += meta.len();
        }
        match fs::remove_file(path) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(0),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", path.display()))
            }
        }
    }
    Ok(freed)
}

/// Strip write permissions from every file and directory under `path`.
pub fn make_read_only_recursive(path: &Path) -> Result<()> {
    let meta = fs::symlink_metadata(path)
        .with_context(|| format!("failed to stat {}", path.display()))?;
    if meta.file_type().is_symlink() {
        return Ok(());
    }
    if meta.is_dir() {
        for entry in
            fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?
        {
            make_read_only_recursive(&entry?.path())?;
        }
    }
    let mode = meta.permissions().mode() & !0o222;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
        .with_context(|| format!("failed to make {} read-only", path.display()))?;
    Ok(())
}

/// Atomically point `link` at `target`, replacing any existing entry.
///
/// The new symlink is created under a unique temporary name next to `link`
/// and renamed over it, so readers never observe a missing link.
pub fn replace_symlink(target: &Path, link: &Path) -> Result<()> {
    let parent = link
        .parent()
        .ok_or_else(|| anyhow!("link {} has no parent directory", link.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("failed to create {}", parent.display()))?;
    let name = link
        .file_name()
        .ok_or_else(|| anyhow!("link {} has no file name", link.display()))?
        .to_string_lossy();

    loop {
        let temp = temp_sibling(parent, &name);
        match std::os::unix::fs::symlink(target, &temp) {
            Ok(()) => {
                if let Err(err) = fs::rename(&temp, link) {
                    let _ = fs::remove_file(&temp);
                    return Err(err).with_context(|| {
                        format!("failed to move symlink into place at {}", link.display())
                    });
                }
                return Ok(());
            }
            Err(err) if err.kind() == ErrorKind::AlreadyExists => continue,
            Err(err) => {
                return Err(err).with_context(|| {
                    format!(
                        "failed to create symlink {} -> {}",
                        temp.display(),
                        target.display()
                    )
                })
            }
        }
    }
}

fn temp_sibling(parent: &Path, name: &str) -> PathBuf {
    let counter = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    parent.join(format!(".{name}.{}.{counter}.tmp", std::process::id()))
}
