use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Read};
use std::path::{Component, Path, PathBuf};

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{GcCoordinator, GcError, Roots, CENSORED};
use crate::config::absolutize;
use crate::fs::replace_symlink;
use crate::lock::{delete_lock_file, try_lock_file, LockType};
use crate::store_path::StorePath;

const ENOTDIR: i32 = 20;

impl GcCoordinator {
    /// All roots: permanent, runtime, and per-process temporary ones.
    ///
    /// # Errors
    /// Fails on unexpected filesystem errors or a corrupt temp-roots directory.
    pub fn find_roots(&self, censor: bool) -> Result<Roots> {
        let mut roots = Roots::new();
        self.find_roots_no_temp(&mut roots, censor)?;
        self.find_temp_roots(&mut roots, censor)?;
        Ok(roots)
    }

    pub(crate) fn find_roots_no_temp(&self, roots: &mut Roots, censor: bool) -> Result<()> {
        self.find_roots_in(&self.config.gc_roots_dir(), roots)?;
        self.find_roots_in(&self.config.profiles_dir(), roots)?;
        self.find_runtime_roots(roots, censor)
    }

    fn find_roots_in(&self, path: &Path, roots: &mut Roots) -> Result<()> {
        self.interrupt.check()?;
        match self.scan_root(path, roots) {
            Ok(()) => Ok(()),
            Err(err) if is_unreadable(&err) => {
                info!(path = %path.display(), "cannot read potential root");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    fn scan_root(&self, path: &Path, roots: &mut Roots) -> Result<()> {
        let meta = fs::symlink_metadata(path)
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let file_type = meta.file_type();
        if file_type.is_dir() {
            let entries =
                fs::read_dir(path).with_context(|| format!("failed to read {}", path.display()))?;
            for entry in entries {
                let entry = entry.with_context(|| format!("failed to read {}", path.display()))?;
                self.find_roots_in(&entry.path(), roots)?;
            }
        } else if file_type.is_symlink() {
            let target = read_link_absolute(path)?;
            let store_dir = self.store.store_dir();
            if store_dir.is_in_store(&target) {
                self.found_root(path, &target, roots)?;
            } else if fs::symlink_metadata(&target).is_err() {
                if path.starts_with(self.config.auto_roots_dir()) {
                    info!(
                        link = %path.display(),
                        target = %target.display(),
                        "removing stale link"
                    );
                    fs::remove_file(path)
                        .with_context(|| format!("failed to remove {}", path.display()))?;
                }
            } else if fs::symlink_metadata(&target)
                .with_context(|| format!("failed to stat {}", target.display()))?
                .file_type()
                .is_symlink()
            {
                let final_target = read_link_absolute(&target)?;
                if store_dir.is_in_store(&final_target) {
                    self.found_root(&target, &final_target, roots)?;
                }
            }
        } else if file_type.is_file() {
            let name = path.file_name().map(|name| name.to_string_lossy());
            if let Some(store_path) = name.and_then(|name| StorePath::parse_base_name(&name).ok())
            {
                if self.store.is_valid_path(&store_path)? {
                    roots
                        .entry(store_path)
                        .or_default()
                        .insert(path.display().to_string());
                }
            }
        }
        Ok(())
    }

    fn found_root(&self, link: &Path, target: &Path, roots: &mut Roots) -> Result<()> {
        let Ok((store_path, _)) = self.store.store_dir().to_store_path(target) else {
            return Ok(());
        };
        if self.store.is_valid_path(&store_path)? {
            debug!(link = %link.display(), path = %store_path, "found root");
            roots
                .entry(store_path)
                .or_default()
                .insert(link.display().to_string());
        } else {
            info!(
                link = %link.display(),
                target = %target.display(),
                "skipping invalid root"
            );
        }
        Ok(())
    }

    /// Roots held by running processes, as reported by the platform hook.
    pub(crate) fn find_runtime_roots(&self, roots: &mut Roots, censor: bool) -> Result<()> {
        let store_dir = self.store.store_dir();
        let unchecked = self.platform.find_platform_roots(store_dir)?;
        for (target, links) in unchecked {
            self.interrupt.check()?;
            let target = Path::new(&target);
            if !store_dir.is_in_store(target) {
                continue;
            }
            let Ok((path, _)) = store_dir.to_store_path(target) else {
                continue;
            };
            if !self.store.is_valid_path(&path)? {
                continue;
            }
            debug!(%path, "got additional root");
            let descriptions = roots.entry(path).or_default();
            if censor {
                descriptions.insert(CENSORED.to_string());
            } else {
                descriptions.extend(links);
            }
        }
        Ok(())
    }

    /// Read every per-process temp-roots file. Files whose owner has exited
    /// are removed instead.
    pub(crate) fn find_temp_roots(&self, roots: &mut Roots, censor: bool) -> Result<()> {
        let dir = self.config.temp_roots_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
        };
        let store_dir = self.store.store_dir();
        for entry in entries {
            self.interrupt.check()?;
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let pid: u32 = name.parse().map_err(|_| {
                GcError::TempRootsCorrupt(format!("unexpected entry '{name}' in {}", dir.display()))
            })?;
            let path = entry.path();
            debug!(path = %path.display(), "reading temporary root file");
            let mut file = match OpenOptions::new().read(true).write(true).open(&path) {
                Ok(file) => file,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to open temp roots {}", path.display()))
                }
            };

            if try_lock_file(&file, LockType::Write)? {
                info!(path = %path.display(), "removing stale temporary roots file");
                delete_lock_file(&path, &file)?;
                continue;
            }

            let mut contents = Vec::new();
            file.read_to_end(&mut contents)
                .with_context(|| format!("failed to read temp roots {}", path.display()))?;
            let mut records = contents.split(|byte| *byte == 0).collect::<Vec<_>>();
            records.pop();
            for record in records {
                let text = String::from_utf8_lossy(record);
                let root = store_dir.parse_store_path(&text).map_err(|err| {
                    GcError::TempRootsCorrupt(format!("{}: {err}", path.display()))
                })?;
                debug!(path = %root, pid, "got temporary root");
                let description = if censor {
                    CENSORED.to_string()
                } else {
                    format!("{{temp:{pid}}}")
                };
                roots.entry(root).or_default().insert(description);
            }
        }
        Ok(())
    }

    /// Register `link` as an indirect root: a symlink under
    /// `gcroots/auto` points at it, so whatever `link` points to is kept.
    pub fn add_indirect_root(&self, link: &Path) -> Result<PathBuf> {
        let link = absolutize(link)?;
        let digest = Sha256::digest(link.display().to_string().as_bytes());
        let auto_root = self.config.auto_roots_dir().join(hex::encode(digest));
        replace_symlink(&link, &auto_root)?;
        debug!(link = %link.display(), auto = %auto_root.display(), "added indirect root");
        Ok(auto_root)
    }

    /// Point `gc_root` at `path` and register it as an indirect root.
    ///
    /// # Errors
    /// Refuses roots inside the store and existing entries that are not
    /// links into the store.
    pub fn add_perm_root(&self, path: &StorePath, gc_root: &Path) -> Result<PathBuf> {
        let gc_root = absolutize(gc_root)?;
        let store_dir = self.store.store_dir();
        if store_dir.is_in_store(&gc_root) || gc_root == store_dir.as_path() {
            bail!(
                "creating a garbage collector root ({}) in the store is forbidden",
                gc_root.display()
            );
        }

        self.temp_roots.add_temp_root(path)?;

        if let Ok(meta) = fs::symlink_metadata(&gc_root) {
            let points_into_store = meta.file_type().is_symlink()
                && read_link_absolute(&gc_root)
                    .map(|target| store_dir.is_in_store(&target))
                    .unwrap_or(false);
            if !points_into_store {
                bail!("cannot create symlink '{}'; already exists", gc_root.display());
            }
        }
        replace_symlink(&store_dir.path_of(path), &gc_root)?;
        self.add_indirect_root(&gc_root)?;
        info!(root = %gc_root.display(), %path, "added permanent root");
        Ok(gc_root)
    }
}

fn read_link_absolute(link: &Path) -> Result<PathBuf> {
    let target =
        fs::read_link(link).with_context(|| format!("failed to read link {}", link.display()))?;
    let joined = match link.parent() {
        Some(parent) if target.is_relative() => parent.join(&target),
        _ => target,
    };
    Ok(normalize_lexically(&joined))
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn is_unreadable(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause.downcast_ref::<io::Error>().is_some_and(|io_err| {
            matches!(
                io_err.kind(),
                ErrorKind::PermissionDenied | ErrorKind::NotFound
            ) || io_err.raw_os_error() == Some(ENOTDIR)
        })
    })
}
