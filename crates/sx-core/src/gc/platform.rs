//! Runtime roots held by live processes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use anyhow::Result;

use crate::store_path::StoreDir;

/// Candidate filesystem paths mapped to where they were seen. Entries are not
/// yet checked against the store.
pub type UncheckedRoots = BTreeMap<String, BTreeSet<String>>;

/// Platform hook that reports paths in use by running processes.
pub trait PlatformRoots: Send + Sync + fmt::Debug {
    fn find_platform_roots(&self, store_dir: &StoreDir) -> Result<UncheckedRoots>;
}

/// Reports nothing; used where process inspection is unavailable.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPlatformRoots;

impl PlatformRoots for NoPlatformRoots {
    fn find_platform_roots(&self, _store_dir: &StoreDir) -> Result<UncheckedRoots> {
        Ok(UncheckedRoots::new())
    }
}

#[cfg(target_os = "linux")]
pub use linux::ProcRoots;

/// The process inspector for the current platform.
#[must_use]
pub fn default_platform_roots() -> std::sync::Arc<dyn PlatformRoots> {
    #[cfg(target_os = "linux")]
    {
        std::sync::Arc::new(ProcRoots::new())
    }
    #[cfg(not(target_os = "linux"))]
    {
        std::sync::Arc::new(NoPlatformRoots)
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::fs;
    use std::io::{self, ErrorKind};
    use std::path::{Path, PathBuf};

    use anyhow::{Context, Result};
    use regex::Regex;
    use tracing::trace;

    use super::{PlatformRoots, UncheckedRoots};
    use crate::store_path::StoreDir;

    const KERNEL_FILES: &[&str] = &[
        "sys/kernel/modprobe",
        "sys/kernel/fbsplash",
        "sys/kernel/poweroff_cmd",
    ];
    const ESRCH: i32 = 3;

    /// Scans `/proc` for executables, working directories, open files,
    /// memory maps, and environments that mention store paths.
    #[derive(Debug, Clone)]
    pub struct ProcRoots {
        proc_dir: PathBuf,
    }

    impl Default for ProcRoots {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ProcRoots {
        #[must_use]
        pub fn new() -> Self {
            Self::with_proc_dir("/proc")
        }

        #[must_use]
        pub fn with_proc_dir(proc_dir: impl Into<PathBuf>) -> Self {
            Self {
                proc_dir: proc_dir.into(),
            }
        }

        fn scan_process(
            &self,
            pid: &str,
            patterns: &Patterns,
            unchecked: &mut UncheckedRoots,
        ) -> io::Result<()> {
            let dir = self.proc_dir.join(pid);
            read_proc_link(&dir.join("exe"), unchecked)?;
            read_proc_link(&dir.join("cwd"), unchecked)?;
            read_proc_link(&dir.join("root"), unchecked)?;

            let fd_dir = dir.join("fd");
            for entry in fs::read_dir(&fd_dir)? {
                let entry = entry?;
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                read_proc_link(&entry.path(), unchecked)?;
            }

            let maps = dir.join("maps");
            let source = maps.display().to_string();
            for line in fs::read_to_string(&maps)?.lines() {
                if let Some(found) = patterns.map_line.captures(line) {
                    unchecked
                        .entry(found[1].to_string())
                        .or_default()
                        .insert(source.clone());
                }
            }

            let environ = dir.join("environ");
            let source = environ.display().to_string();
            let contents = fs::read(&environ)?;
            let contents = String::from_utf8_lossy(&contents);
            for found in patterns.store_path.find_iter(&contents) {
                unchecked
                    .entry(found.as_str().to_string())
                    .or_default()
                    .insert(source.clone());
            }
            Ok(())
        }
    }

    struct Patterns {
        map_line: Regex,
        store_path: Regex,
    }

    impl PlatformRoots for ProcRoots {
        fn find_platform_roots(&self, store_dir: &StoreDir) -> Result<UncheckedRoots> {
            let patterns = Patterns {
                map_line: Regex::new(r"^\s*\S+\s+\S+\s+\S+\s+\S+\s+\S+\s+(/\S+)\s*$")
                    .context("invalid memory map pattern")?,
                store_path: Regex::new(&format!(
                    r"{}/[0-9a-z]+[0-9a-zA-Z\+\-\._\?=]*",
                    regex::escape(&store_dir.as_path().display().to_string())
                ))
                .context("invalid store path pattern")?,
            };

            let mut unchecked = UncheckedRoots::new();
            let entries = match fs::read_dir(&self.proc_dir) {
                Ok(entries) => entries,
                Err(err) if err.kind() == ErrorKind::NotFound => return Ok(unchecked),
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to read {}", self.proc_dir.display()))
                }
            };
            for entry in entries {
                let entry = entry
                    .with_context(|| format!("failed to read {}", self.proc_dir.display()))?;
                let name = entry.file_name().to_string_lossy().into_owned();
                if name.is_empty() || !name.bytes().all(|b| b.is_ascii_digit()) {
                    continue;
                }
                match self.scan_process(&name, &patterns, &mut unchecked) {
                    Ok(()) => {}
                    Err(err) if is_vanished(&err) => {
                        trace!(pid = %name, %err, "skipping process");
                    }
                    Err(err) => {
                        return Err(err).with_context(|| format!("failed to inspect process {name}"))
                    }
                }
            }

            for file in KERNEL_FILES {
                let path = self.proc_dir.join(file);
                match fs::read_to_string(&path) {
                    Ok(contents) => {
                        let target = contents.trim_end_matches('\n');
                        if !target.is_empty() {
                            unchecked
                                .entry(target.to_string())
                                .or_default()
                                .insert(path.display().to_string());
                        }
                    }
                    Err(err) if is_vanished(&err) => {}
                    Err(err) => {
                        return Err(err).with_context(|| format!("failed to read {}", path.display()))
                    }
                }
            }
            Ok(unchecked)
        }
    }

    fn read_proc_link(link: &Path, unchecked: &mut UncheckedRoots) -> io::Result<()> {
        match fs::read_link(link) {
            Ok(target) => {
                let target = target.display().to_string();
                if target.starts_with('/') {
                    unchecked
                        .entry(target)
                        .or_default()
                        .insert(link.display().to_string());
                }
                Ok(())
            }
            Err(err) if is_vanished(&err) => Ok(()),
            Err(err) => Err(err),
        }
    }

    fn is_vanished(err: &io::Error) -> bool {
        matches!(
            err.kind(),
            ErrorKind::NotFound | ErrorKind::PermissionDenied
        ) || err.raw_os_error() == Some(ESRCH)
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::os::unix::fs::symlink;

        #[test]
        fn scans_fake_proc_tree() -> Result<()> {
            let temp = tempfile::tempdir()?;
            let proc_dir = temp.path().join("proc");
            let store = StoreDir::new("/sx/store");
            let tool = "/sx/store/7rjj86a15146cq1d3qy068lml7n8ykzm-tool";
            let lib = "/sx/store/0a2b4c6d8f0h2j4l6n8q0s2v4x6z8a1b-lib.so";

            let pid = proc_dir.join("42");
            fs::create_dir_all(pid.join("fd"))?;
            symlink(format!("{tool}/bin/tool"), pid.join("exe"))?;
            symlink("/home/user", pid.join("cwd"))?;
            symlink("pipe:[1234]", pid.join("fd").join("0"))?;
            fs::write(
                pid.join("maps"),
                format!("7f00-7f01 r-xp 00000000 08:01 1234 {lib}\n7f02-7f03 rw-p 00000000 00:00 0\n"),
            )?;
            fs::write(
                pid.join("environ"),
                format!("PATH={tool}/bin:/usr/bin\0HOME=/home/user\0"),
            )?;
            fs::create_dir_all(proc_dir.join("self"))?;
            fs::create_dir_all(proc_dir.join("sys/kernel"))?;
            fs::write(proc_dir.join("sys/kernel/modprobe"), format!("{tool}/bin/modprobe\n"))?;

            let roots = ProcRoots::with_proc_dir(&proc_dir).find_platform_roots(&store)?;
            assert!(roots.contains_key(&format!("{tool}/bin/tool")));
            assert!(roots.contains_key("/home/user"));
            assert!(roots.contains_key(lib));
            assert!(roots.contains_key(tool), "environment match: {roots:?}");
            assert!(roots.contains_key(&format!("{tool}/bin/modprobe")));
            assert!(!roots.keys().any(|key| key.starts_with("pipe:")));
            Ok(())
        }

        #[test]
        fn vanished_processes_are_skipped() -> Result<()> {
            let temp = tempfile::tempdir()?;
            let proc_dir = temp.path().join("proc");
            fs::create_dir_all(proc_dir.join("7"))?;
            let roots = ProcRoots::with_proc_dir(&proc_dir)
                .find_platform_roots(&StoreDir::new("/sx/store"))?;
            assert!(roots.is_empty());
            Ok(())
        }
    }
}
