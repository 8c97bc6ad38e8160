use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fs::{self, File};
use std::io::ErrorKind;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use super::server::{PendingGuard, RootsServer};
use super::{GcAction, GcCoordinator, GcError, GcOptions, GcResults, Interrupt, Roots};
use crate::config::LINKS_DIR_NAME;
use crate::fs::delete_path;
use crate::lock::{open_lock_file, try_lock_file, FdLock, LockType};
use crate::store::{Store, StoreError};
use crate::store_path::{StoreDir, StorePath};

const TMP_PREFIX: &str = "tmp-";

/// Whether the deletion loop may keep going after a step.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeletionOutcome {
    Continue,
    /// More than `max_freed` bytes were released; the sweep ends early but
    /// still succeeds.
    BudgetExceeded,
}

impl GcCoordinator {
    /// Run one sweep.
    ///
    /// # Errors
    /// Fails on interrupts, unexpected filesystem or database errors, and,
    /// for [`GcAction::DeleteSpecific`], with [`GcError::StillAlive`] when a
    /// requested path survived.
    pub fn collect_garbage(&self, options: &GcOptions) -> Result<GcResults> {
        self.interrupt.check()?;
        let action = options.action;
        let unchecked_specific = action.is_specific() && options.ignore_liveness;

        if action.deletes() {
            self.remove_reserved_space()?;
        }

        let lock_path = self.config.gc_lock_path();
        let lock_file = open_lock_file(&lock_path, true)
            .map_err(|err| GcError::LockFailed(format!("{err:#}")))?
            .ok_or_else(|| GcError::LockFailed(format!("{} is missing", lock_path.display())))?;
        let _gc_lock = FdLock::new(
            &lock_file,
            LockType::Write,
            true,
            "waiting for the big garbage collector lock...",
        )
        .map_err(|err| GcError::LockFailed(format!("{err:#}")))?;

        let store_dir = self.store.store_dir().clone();
        let server = RootsServer::start(&self.config.gc_socket_path(), store_dir.clone())?;

        info!("finding garbage collector roots...");
        let mut permanent = Roots::new();
        if !options.ignore_liveness {
            self.find_roots_no_temp(&mut permanent, true)?;
        }
        let mut temporary = Roots::new();
        self.find_temp_roots(&mut temporary, true)?;
        for path in temporary.keys() {
            server.insert_temp_root(path.hash_part());
        }
        let roots: BTreeSet<StorePath> = permanent
            .into_keys()
            .chain(temporary.into_keys())
            .collect();
        debug!(roots = roots.len(), "collected roots");

        let mut results = {
            let mut sweep = Sweep {
                store: self.store.as_ref(),
                store_dir: &store_dir,
                server: &server,
                interrupt: &self.interrupt,
                options,
                keep_outputs: self.settings.keep_outputs && !unchecked_specific,
                keep_derivations: self.settings.keep_derivations && !unchecked_specific,
                roots,
                alive: BTreeSet::new(),
                dead: BTreeSet::new(),
                referrers_cache: HashMap::new(),
                results: GcResults::default(),
            };
            sweep.run()?;

            match action {
                GcAction::ReturnLive => {
                    sweep.results.paths = sweep.alive.iter().map(|p| store_dir.print(p)).collect();
                }
                GcAction::ReturnDead => {
                    sweep.results.paths = sweep.dead.iter().map(|p| store_dir.print(p)).collect();
                }
                GcAction::DeleteSpecific | GcAction::TryDeleteSpecific => {
                    sweep.results.kept = options
                        .paths_to_delete
                        .iter()
                        .filter(|path| !sweep.dead.contains(*path))
                        .cloned()
                        .collect();
                }
                GcAction::DeleteDead => {}
            }
            sweep.results
        };

        if matches!(action, GcAction::DeleteDead | GcAction::DeleteSpecific) {
            self.remove_unused_links()?;
        }
        server.shutdown();

        if action == GcAction::DeleteSpecific && !results.kept.is_empty() {
            let paths = results.kept.iter().map(|p| store_dir.print(p)).collect();
            let results = std::mem::take(&mut results);
            return Err(GcError::StillAlive {
                paths,
                results: Box::new(results),
            }
            .into());
        }
        Ok(results)
    }

    fn remove_reserved_space(&self) -> Result<()> {
        let path = self.config.reserved_path();
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(path = %path.display(), "released reserved space");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

/// Mutable state of one sweep.
struct Sweep<'a> {
    store: &'a dyn Store,
    store_dir: &'a StoreDir,
    server: &'a RootsServer,
    interrupt: &'a Interrupt,
    options: &'a GcOptions,
    keep_outputs: bool,
    keep_derivations: bool,
    roots: BTreeSet<StorePath>,
    alive: BTreeSet<StorePath>,
    dead: BTreeSet<StorePath>,
    referrers_cache: HashMap<StorePath, BTreeSet<StorePath>>,
    results: GcResults,
}

impl Sweep<'_> {
    fn run(&mut self) -> Result<DeletionOutcome> {
        let options = self.options;
        if options.action.is_specific() {
            for path in &options.paths_to_delete {
                if self.delete_referrers_closure(path)? == DeletionOutcome::BudgetExceeded {
                    return Ok(DeletionOutcome::BudgetExceeded);
                }
            }
            return Ok(DeletionOutcome::Continue);
        }
        if options.max_freed == 0 {
            return Ok(DeletionOutcome::Continue);
        }

        if options.action.deletes() {
            info!("deleting garbage...");
        } else {
            info!("determining live/dead paths...");
        }
        let dir = self.store_dir.as_path();
        let entries =
            fs::read_dir(dir).with_context(|| format!("failed to read store {}", dir.display()))?;
        for entry in entries {
            self.interrupt.check()?;
            let entry = entry.with_context(|| format!("failed to read store {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == LINKS_DIR_NAME {
                continue;
            }
            let outcome = match StorePath::parse_base_name(&name) {
                Ok(path) => self.delete_referrers_closure(&path)?,
                Err(_) if options.action.deletes() => self.delete_from_store(&name)?,
                Err(_) => DeletionOutcome::Continue,
            };
            if outcome == DeletionOutcome::BudgetExceeded {
                return Ok(outcome);
            }
        }
        Ok(DeletionOutcome::Continue)
    }

    /// Walk the referrers of `start`. If no root is reachable, every visited
    /// path is dead and, when the action deletes, removed referrers first.
    fn delete_referrers_closure(&mut self, start: &StorePath) -> Result<DeletionOutcome> {
        let _release = PendingGuard::new(self.server);
        let mut visited = BTreeSet::from([start.clone()]);
        let mut queue = VecDeque::from([start.clone()]);

        while let Some(path) = queue.pop_front() {
            self.interrupt.check()?;
            if self.alive.contains(&path) {
                self.alive.insert(start.clone());
                return Ok(DeletionOutcome::Continue);
            }
            if self.dead.contains(&path) {
                continue;
            }
            if self.roots.contains(&path) {
                debug!(%path, "cannot delete because it's a root");
                self.mark_alive(&path, start)?;
                return Ok(DeletionOutcome::Continue);
            }
            if self.options.action.is_specific() && !self.options.paths_to_delete.contains(&path) {
                return Ok(DeletionOutcome::Continue);
            }
            if !self.server.mark_pending_if_present(path.hash_part())? {
                debug!(%path, "cannot delete because it's a temporary root");
                self.mark_alive(&path, start)?;
                return Ok(DeletionOutcome::Continue);
            }

            if !self.store.is_valid_path(&path)? {
                continue;
            }
            let mut next = self.referrers(&path)?;
            if self.keep_derivations && path.is_derivation() {
                for output in self.store.query_derivation_output_map(&path)?.into_values() {
                    if self.store.is_valid_path(&output)?
                        && self.store.query_path_info(&output)?.deriver.as_ref() == Some(&path)
                    {
                        next.insert(output);
                    }
                }
            }
            if self.keep_outputs {
                next.extend(self.store.query_valid_derivers(&path)?);
            }
            for candidate in next {
                if visited.insert(candidate.clone()) {
                    queue.push_back(candidate);
                }
            }
        }

        for path in self.store.topo_sort_paths(&visited)? {
            self.interrupt.check()?;
            if self.alive.contains(&path) || !self.dead.insert(path.clone()) {
                continue;
            }
            if !self.options.action.deletes() {
                continue;
            }
            if !self.server.mark_pending_if_present(path.hash_part())? {
                debug!(%path, "registered as a temporary root during the sweep");
                self.dead.remove(&path);
                self.mark_alive(&path, &path)?;
                continue;
            }
            match self.store.invalidate_path_checked(&path) {
                Ok(()) => {}
                Err(err) if is_path_in_use(&err) => {
                    warn!(%path, %err, "skipping path that is still in use");
                    self.dead.remove(&path);
                    continue;
                }
                Err(err) => return Err(err),
            }
            self.referrers_cache.remove(&path);
            if self.delete_from_store(path.base_name())? == DeletionOutcome::BudgetExceeded {
                return Ok(DeletionOutcome::BudgetExceeded);
            }
        }
        Ok(DeletionOutcome::Continue)
    }

    fn mark_alive(&mut self, path: &StorePath, start: &StorePath) -> Result<()> {
        self.alive.insert(path.clone());
        self.alive.insert(start.clone());
        let mut closure = BTreeSet::new();
        match self.store.compute_fs_closure(
            &BTreeSet::from([path.clone()]),
            &mut closure,
            false,
            self.keep_outputs,
            self.keep_derivations,
        ) {
            Ok(()) => {}
            Err(err)
                if matches!(
                    err.downcast_ref::<StoreError>(),
                    Some(StoreError::InvalidPath(_))
                ) => {}
            Err(err) => return Err(err),
        }
        self.alive.extend(closure);
        Ok(())
    }

    fn referrers(&mut self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        if let Some(cached) = self.referrers_cache.get(path) {
            return Ok(cached.clone());
        }
        let referrers = self.store.query_referrers(path)?;
        self.referrers_cache
            .insert(path.clone(), referrers.clone());
        Ok(referrers)
    }

    /// Delete one store entry and charge it against the budget.
    fn delete_from_store(&mut self, base_name: &str) -> Result<DeletionOutcome> {
        let real = self.store_dir.as_path().join(base_name);
        let tmp_guard = if base_name.starts_with(TMP_PREFIX) {
            match File::open(&real) {
                Ok(handle) if try_lock_file(&handle, LockType::Write)? => Some(handle),
                _ => {
                    debug!(path = %real.display(), "skipping locked tempdir");
                    return Ok(DeletionOutcome::Continue);
                }
            }
        } else {
            None
        };

        info!(path = %real.display(), "deleting");
        let freed = delete_path(&real)?;
        drop(tmp_guard);
        self.results.paths.insert(real.display().to_string());
        self.results.bytes_freed += freed;

        if self.results.bytes_freed > self.options.max_freed {
            info!(
                max_freed = self.options.max_freed,
                bytes_freed = self.results.bytes_freed,
                "deleted more than the byte budget; stopping"
            );
            return Ok(DeletionOutcome::BudgetExceeded);
        }
        Ok(DeletionOutcome::Continue)
    }
}

fn is_path_in_use(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<StoreError>(),
        Some(StoreError::PathInUse { .. })
    )
}
