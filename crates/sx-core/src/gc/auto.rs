use std::fs;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, PoisonError};
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{GcAction, GcCoordinator, GcOptions};

const THRASH_RATIO: f64 = 0.97;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum AutoGcPhase {
    Idle,
    Checking,
    Running,
}

#[derive(Debug)]
pub(crate) struct AutoGcState {
    phase: AutoGcPhase,
    last_check: Option<Instant>,
    avail_after_gc: u64,
    waiters: Vec<Sender<()>>,
}

impl Default for AutoGcState {
    fn default() -> Self {
        Self {
            phase: AutoGcPhase::Idle,
            last_check: None,
            avail_after_gc: u64::MAX,
            waiters: Vec::new(),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum AutoGcOutcome {
    /// Nothing to do: checked too recently, enough free space, or no
    /// progress expected since the last run.
    Skipped,
    /// A new background sweep was started.
    Started,
    /// A sweep was already running; the caller joined it.
    Joined,
}

impl GcCoordinator {
    /// Start a bounded background sweep if free space dropped below
    /// `min_free`. With `sync` the call returns once that sweep (or the one
    /// already in flight) has finished.
    ///
    /// # Errors
    /// Fails when free space cannot be measured or the sweep thread cannot
    /// be spawned. Failures of the sweep itself are only logged.
    pub fn auto_gc(self: &Arc<Self>, sync: bool) -> Result<AutoGcOutcome> {
        let (outcome, waiter) = self.trigger_auto_gc(sync)?;
        if let Some(waiter) = waiter {
            let _ = waiter.recv();
        }
        Ok(outcome)
    }

    fn trigger_auto_gc(
        self: &Arc<Self>,
        sync: bool,
    ) -> Result<(AutoGcOutcome, Option<Receiver<()>>)> {
        let mut state = self.auto.lock().expect("auto-gc lock");
        match state.phase {
            AutoGcPhase::Running => {
                debug!("waiting for auto-GC to finish");
                return Ok((AutoGcOutcome::Joined, add_waiter(&mut state, sync)));
            }
            AutoGcPhase::Checking => return Ok((AutoGcOutcome::Skipped, None)),
            AutoGcPhase::Idle => {}
        }

        let now = Instant::now();
        if let Some(last) = state.last_check {
            if now < last + self.settings.min_free_check_interval {
                return Ok((AutoGcOutcome::Skipped, None));
            }
        }
        state.phase = AutoGcPhase::Checking;
        state.last_check = Some(now);
        drop(state);

        let measured = self.available_space();
        let mut state = self.auto.lock().expect("auto-gc lock");
        let avail = match measured {
            Ok(avail) => avail,
            Err(err) => {
                state.phase = AutoGcPhase::Idle;
                return Err(err);
            }
        };
        #[allow(clippy::cast_precision_loss)]
        let thrashing = avail as f64 > state.avail_after_gc as f64 * THRASH_RATIO;
        if avail >= self.settings.min_free || avail >= self.settings.max_free || thrashing {
            state.phase = AutoGcPhase::Idle;
            return Ok((AutoGcOutcome::Skipped, None));
        }

        state.phase = AutoGcPhase::Running;
        let waiter = add_waiter(&mut state, sync);
        drop(state);

        let coordinator = Arc::clone(self);
        let spawned = thread::Builder::new()
            .name("sx-auto-gc".into())
            .spawn(move || coordinator.run_auto_gc(avail));
        if let Err(err) = spawned {
            finish(&mut self.auto.lock().expect("auto-gc lock"));
            return Err(err).context("failed to spawn the auto-GC thread");
        }
        Ok((AutoGcOutcome::Started, waiter))
    }

    fn run_auto_gc(&self, avail: u64) {
        let _done = Completion { coordinator: self };
        let options = GcOptions::new(GcAction::DeleteDead)
            .with_max_freed(self.settings.max_free.saturating_sub(avail));
        info!(bytes = options.max_freed, "running auto-GC");
        match self.collect_garbage(&options) {
            Ok(results) => {
                info!(
                    paths = results.paths.len(),
                    bytes_freed = results.bytes_freed,
                    "auto-GC finished"
                );
                match self.available_space() {
                    Ok(after) => {
                        self.auto.lock().expect("auto-gc lock").avail_after_gc = after;
                    }
                    Err(err) => warn!(%err, "failed to measure free space after auto-GC"),
                }
            }
            Err(err) => warn!("auto-GC failed: {err:#}"),
        }
    }

    /// Whether a background sweep is in flight.
    #[must_use]
    pub fn auto_gc_running(&self) -> bool {
        self.auto.lock().expect("auto-gc lock").phase == AutoGcPhase::Running
    }

    /// Free bytes on the store's filesystem.
    pub fn available_space(&self) -> Result<u64> {
        if let Some(file) = &self.settings.free_space_file {
            let contents = fs::read_to_string(file)
                .with_context(|| format!("failed to read {}", file.display()))?;
            return contents.trim().parse::<u64>().with_context(|| {
                format!("{} must hold a byte count, found '{}'", file.display(), contents.trim())
            });
        }
        let dir = &self.config.store_dir;
        fs4::available_space(dir)
            .with_context(|| format!("failed to measure free space of {}", dir.display()))
    }
}

fn add_waiter(state: &mut AutoGcState, sync: bool) -> Option<Receiver<()>> {
    if !sync {
        return None;
    }
    let (notify, waiter) = mpsc::channel();
    state.waiters.push(notify);
    Some(waiter)
}

fn finish(state: &mut AutoGcState) {
    state.phase = AutoGcPhase::Idle;
    state.last_check = Some(Instant::now());
    for waiter in state.waiters.drain(..) {
        let _ = waiter.send(());
    }
}

/// Returns the controller to idle and wakes waiters, also when the sweep
/// panics.
struct Completion<'a> {
    coordinator: &'a GcCoordinator,
}

impl Drop for Completion<'_> {
    fn drop(&mut self) {
        let mut state = self
            .coordinator
            .auto
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        finish(&mut state);
    }
}
