use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::MetadataExt;

use anyhow::{Context, Result};
use tracing::{debug, info};

use super::GcCoordinator;

/// Outcome of a pass over the hard-link pool.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LinksReport {
    pub removed: u64,
    pub saved_bytes: u64,
}

impl GcCoordinator {
    /// Unlink pooled files no store object shares any more.
    ///
    /// A concurrent deduplication may link a file right after we read its
    /// link count; such a file is lost from the pool and re-added later.
    pub(crate) fn remove_unused_links(&self) -> Result<LinksReport> {
        let dir = self.config.links_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(LinksReport::default()),
            Err(err) => return Err(err).with_context(|| format!("failed to read {}", dir.display())),
        };

        info!("deleting unused links...");
        let mut report = LinksReport::default();
        let mut actual_size = 0u64;
        let mut unshared_size = 0u64;
        for entry in entries {
            self.interrupt.check()?;
            let entry = entry.with_context(|| format!("failed to read {}", dir.display()))?;
            let path = entry.path();
            let meta = match fs::symlink_metadata(&path) {
                Ok(meta) => meta,
                Err(err) if err.kind() == ErrorKind::NotFound => continue,
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to stat {}", path.display()))
                }
            };
            if meta.nlink() != 1 {
                actual_size += meta.len();
                unshared_size += (meta.nlink() - 1) * meta.len();
                continue;
            }
            debug!(path = %path.display(), "deleting unused link");
            match fs::remove_file(&path) {
                Ok(()) => report.removed += 1,
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to remove {}", path.display()))
                }
            }
        }

        let overhead = fs::symlink_metadata(&dir).map_or(0, |meta| meta.blocks() * 512);
        report.saved_bytes = unshared_size
            .saturating_sub(actual_size)
            .saturating_sub(overhead);
        info!(
            saved_bytes = report.saved_bytes,
            removed = report.removed,
            "note: hard linking is currently saving space"
        );
        Ok(report)
    }
}
