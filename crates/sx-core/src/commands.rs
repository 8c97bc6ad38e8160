//! Command handlers behind the `sx` binary. Each returns an
//! [`ExecutionOutcome`]; only unexpected failures surface as `Err`.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use serde_json::{json, Value};

use crate::gc::{AutoGcOutcome, GcAction, GcCoordinator, GcError, GcOptions, GcResults};
use crate::outcome::ExecutionOutcome;
use crate::store::StoreError;
use crate::store_path::{StoreDir, StorePath};

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GcMode {
    PrintRoots,
    PrintLive,
    PrintDead,
    CollectDead,
    /// Delete the listed paths, given as store paths or links into the store.
    Delete(Vec<String>),
}

#[derive(Clone, Debug)]
pub struct GcRequest {
    pub mode: GcMode,
    pub max_freed: Option<u64>,
    pub ignore_liveness: bool,
    /// With [`GcMode::Delete`], report survivors instead of failing.
    pub skip_alive: bool,
}

impl GcRequest {
    #[must_use]
    pub fn new(mode: GcMode) -> Self {
        Self {
            mode,
            max_freed: None,
            ignore_liveness: false,
            skip_alive: false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct AddRootRequest {
    pub path: String,
    pub link: PathBuf,
}

pub fn gc(coordinator: &GcCoordinator, request: &GcRequest) -> Result<ExecutionOutcome> {
    let action = match &request.mode {
        GcMode::PrintRoots => return print_roots(coordinator),
        GcMode::PrintLive => GcAction::ReturnLive,
        GcMode::PrintDead => GcAction::ReturnDead,
        GcMode::CollectDead => GcAction::DeleteDead,
        GcMode::Delete(_) if request.skip_alive => GcAction::TryDeleteSpecific,
        GcMode::Delete(_) => GcAction::DeleteSpecific,
    };

    let mut options = GcOptions::new(action);
    options.ignore_liveness = request.ignore_liveness;
    if let Some(max_freed) = request.max_freed {
        options.max_freed = max_freed;
    }
    if let GcMode::Delete(targets) = &request.mode {
        match resolve_targets(coordinator, targets) {
            Ok(paths) => options.paths_to_delete = paths,
            Err(err) => {
                return Ok(ExecutionOutcome::user_error(
                    err.to_string(),
                    json!({ "code": err.code() }),
                ))
            }
        }
    }

    match coordinator.collect_garbage(&options) {
        Ok(results) => Ok(render_results(coordinator.store().store_dir(), action, &results)),
        Err(err) => {
            if let Some(GcError::Interrupted) = err.downcast_ref::<GcError>() {
                return Ok(ExecutionOutcome::failure(
                    err.to_string(),
                    json!({ "code": "SX900" }),
                ));
            }
            let Some(GcError::StillAlive { paths, results }) = err.downcast_ref::<GcError>() else {
                return Err(err);
            };
            Ok(ExecutionOutcome::user_error(
                err.to_string(),
                json!({
                    "code": "SX901",
                    "alive": paths,
                    "deleted": results.paths,
                    "bytes_freed": results.bytes_freed,
                    "hint": "remove the roots that keep these paths alive, or pass --skip-alive",
                }),
            ))
        }
    }
}

fn print_roots(coordinator: &GcCoordinator) -> Result<ExecutionOutcome> {
    let roots = coordinator.find_roots(false)?;
    let store_dir = coordinator.store().store_dir();
    let mut lines = Vec::new();
    let mut entries = Vec::new();
    for (path, links) in &roots {
        let printed = store_dir.print(path);
        for link in links {
            lines.push(format!("{link} -> {printed}"));
        }
        entries.push(json!({ "path": printed, "links": links }));
    }
    Ok(ExecutionOutcome::success(
        lines.join("\n"),
        json!({ "roots": entries, "passthrough": true }),
    ))
}

fn resolve_targets(
    coordinator: &GcCoordinator,
    targets: &[String],
) -> Result<BTreeSet<StorePath>, StoreError> {
    let store_dir = coordinator.store().store_dir();
    let mut paths = BTreeSet::new();
    for target in targets {
        let path = match store_dir.parse_store_path(target) {
            Ok(path) => path,
            Err(_) => {
                let resolved = std::fs::canonicalize(target)
                    .map_err(|_| StoreError::NotInStore(target.clone()))?;
                store_dir.to_store_path(&resolved)?.0
            }
        };
        paths.insert(path);
    }
    Ok(paths)
}

fn render_results(store_dir: &StoreDir, action: GcAction, results: &GcResults) -> ExecutionOutcome {
    match action {
        GcAction::ReturnLive | GcAction::ReturnDead => {
            let message = results.paths.iter().cloned().collect::<Vec<_>>().join("\n");
            ExecutionOutcome::success(
                message,
                json!({ "paths": results.paths, "passthrough": true }),
            )
        }
        _ => {
            let mut details = json!({
                "deleted": results.paths,
                "bytes_freed": results.bytes_freed,
            });
            if !results.kept.is_empty() {
                details["kept"] = Value::from(
                    results
                        .kept
                        .iter()
                        .map(|path| store_dir.print(path))
                        .collect::<Vec<_>>(),
                );
            }
            ExecutionOutcome::success(
                format!(
                    "{} store paths deleted, {} freed",
                    results.paths.len(),
                    show_bytes(results.bytes_freed)
                ),
                details,
            )
        }
    }
}

pub fn add_root(coordinator: &GcCoordinator, request: &AddRootRequest) -> Result<ExecutionOutcome> {
    let store_dir = coordinator.store().store_dir();
    let path = match store_dir.parse_store_path(&request.path) {
        Ok(path) => path,
        Err(err) => {
            return Ok(ExecutionOutcome::user_error(
                err.to_string(),
                json!({ "code": err.code() }),
            ))
        }
    };
    if !coordinator.store().is_valid_path(&path)? {
        let err = StoreError::InvalidPath(store_dir.print(&path));
        return Ok(ExecutionOutcome::user_error(
            err.to_string(),
            json!({ "code": err.code() }),
        ));
    }

    let root = coordinator.add_perm_root(&path, &request.link)?;
    Ok(ExecutionOutcome::success(
        format!("{} -> {}", root.display(), store_dir.print(&path)),
        json!({ "root": root.display().to_string(), "path": store_dir.print(&path) }),
    ))
}

pub fn auto_gc(coordinator: &Arc<GcCoordinator>, wait: bool) -> Result<ExecutionOutcome> {
    if !coordinator.settings().auto_gc_enabled() {
        return Ok(ExecutionOutcome::success(
            "automatic garbage collection is disabled",
            json!({ "outcome": "disabled" }),
        ));
    }
    let available = coordinator.available_space()?;
    let outcome = coordinator.auto_gc(wait)?;
    let message = match outcome {
        AutoGcOutcome::Skipped => {
            format!("{} available, nothing to do", show_bytes(available))
        }
        AutoGcOutcome::Started => {
            format!("started collection with {} available", show_bytes(available))
        }
        AutoGcOutcome::Joined => "joined the running collection".to_string(),
    };
    Ok(ExecutionOutcome::success(
        message,
        json!({ "outcome": outcome, "available": available, "waited": wait }),
    ))
}

#[allow(clippy::cast_precision_loss)]
fn show_bytes(bytes: u64) -> String {
    format!("{:.2} MiB", bytes as f64 / (1024.0 * 1024.0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{GcSettings, StoreConfig};
    use crate::outcome::CommandStatus;
    use crate::store::LocalStore;

    #[test]
    fn bytes_render_in_mebibytes() {
        assert_eq!(show_bytes(0), "0.00 MiB");
        assert_eq!(show_bytes(3 * 1024 * 1024 / 2), "1.50 MiB");
    }

    #[test]
    fn interrupted_sweeps_report_a_failure() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let config = StoreConfig::new(temp.path().join("store"), temp.path().join("var"));
        let settings = GcSettings {
            reserved_size: 0,
            ..GcSettings::default()
        };
        let store = Arc::new(LocalStore::open(&config, &settings)?);
        let coordinator = GcCoordinator::new(store, config, settings);
        coordinator.interrupt().trigger();

        let outcome = gc(&coordinator, &GcRequest::new(GcMode::CollectDead))?;
        assert_eq!(outcome.status, CommandStatus::Failure);
        assert_eq!(outcome.exit_code(), 2);
        assert_eq!(outcome.details["code"], "SX900");
        Ok(())
    }
}
