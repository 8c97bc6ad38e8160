//! Garbage collection of unreachable store paths.
//!
//! A sweep holds `gc.lock` exclusively, serves late root registrations on a
//! Unix socket for its whole duration, walks the referrer graph from every
//! store entry, and deletes what no root can reach. Processes that are not
//! collecting protect their paths through [`TempRoots`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;
use std::sync::{Arc, Mutex};

use serde::Serialize;

use crate::config::{GcSettings, StoreConfig};
use crate::store::Store;
use crate::store_path::StorePath;

mod auto;
mod collect;
mod interrupt;
mod links;
pub mod platform;
mod roots;
mod server;
mod temp_roots;

#[cfg(test)]
mod tests;

pub use auto::AutoGcOutcome;
pub use collect::DeletionOutcome;
pub use interrupt::Interrupt;
pub use platform::{default_platform_roots, NoPlatformRoots, PlatformRoots, UncheckedRoots};
pub use temp_roots::TempRoots;

use auto::AutoGcState;

/// Description used for runtime and temporary roots when callers ask for
/// censored output.
pub const CENSORED: &str = "{censored}";

/// Store paths mapped to why they are roots.
pub type Roots = BTreeMap<StorePath, BTreeSet<String>>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum GcAction {
    /// Report the paths that are reachable from a root.
    ReturnLive,
    /// Report the paths that could be collected.
    ReturnDead,
    /// Delete everything unreachable.
    DeleteDead,
    /// Delete the given paths; fail if any of them is still alive.
    DeleteSpecific,
    /// Delete the given paths that are dead and report the rest.
    TryDeleteSpecific,
}

impl GcAction {
    #[must_use]
    pub fn deletes(self) -> bool {
        matches!(
            self,
            Self::DeleteDead | Self::DeleteSpecific | Self::TryDeleteSpecific
        )
    }

    #[must_use]
    pub fn is_specific(self) -> bool {
        matches!(self, Self::DeleteSpecific | Self::TryDeleteSpecific)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GcOptions {
    pub action: GcAction,
    /// Only consulted by the `*Specific` actions.
    pub paths_to_delete: BTreeSet<StorePath>,
    /// Skip permanent and runtime root discovery. Temp roots still count.
    pub ignore_liveness: bool,
    /// Stop deleting once more than this many bytes were freed.
    pub max_freed: u64,
}

impl Default for GcOptions {
    fn default() -> Self {
        Self {
            action: GcAction::DeleteDead,
            paths_to_delete: BTreeSet::new(),
            ignore_liveness: false,
            max_freed: u64::MAX,
        }
    }
}

impl GcOptions {
    #[must_use]
    pub fn new(action: GcAction) -> Self {
        Self {
            action,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn delete_specific(paths: impl IntoIterator<Item = StorePath>) -> Self {
        Self {
            action: GcAction::DeleteSpecific,
            paths_to_delete: paths.into_iter().collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_max_freed(mut self, max_freed: u64) -> Self {
        self.max_freed = max_freed;
        self
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct GcResults {
    /// Printed store paths returned or deleted; deleted non-store entries
    /// appear as their full filesystem path.
    pub paths: BTreeSet<String>,
    pub bytes_freed: u64,
    /// Requested paths that were still alive.
    pub kept: BTreeSet<StorePath>,
}

#[derive(Debug, thiserror::Error)]
pub enum GcError {
    #[error("[SX900] garbage collection interrupted")]
    Interrupted,
    #[error("[SX901] {}", describe_survivors(.paths))]
    StillAlive {
        paths: Vec<String>,
        results: Box<GcResults>,
    },
    #[error("[SX902] temporary roots are corrupt: {0}")]
    TempRootsCorrupt(String),
    #[error("[SX903] root registration server failed: {0}")]
    Server(String),
    #[error("[SX904] failed to acquire the garbage collector lock: {0}")]
    LockFailed(String),
}

impl GcError {
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Interrupted => "SX900",
            Self::StillAlive { .. } => "SX901",
            Self::TempRootsCorrupt(_) => "SX902",
            Self::Server(_) => "SX903",
            Self::LockFailed(_) => "SX904",
        }
    }
}

const SURVIVORS_SHOWN: usize = 5;

fn describe_survivors(paths: &[String]) -> String {
    let mut message =
        String::from("cannot delete some of the given paths because they are still alive:");
    for path in paths.iter().take(SURVIVORS_SHOWN) {
        let _ = write!(message, " {path}");
    }
    if paths.len() > SURVIVORS_SHOWN {
        let _ = write!(message, " ... ({} more)", paths.len() - SURVIVORS_SHOWN);
    }
    message
}

/// Owns everything a store needs to collect garbage: policies, the root
/// sources, the interrupt flag, this process's temp roots, and the auto-GC
/// state. One per store instance.
pub struct GcCoordinator {
    store: Arc<dyn Store>,
    config: StoreConfig,
    settings: GcSettings,
    platform: Arc<dyn PlatformRoots>,
    interrupt: Interrupt,
    temp_roots: TempRoots,
    auto: Mutex<AutoGcState>,
}

impl GcCoordinator {
    pub fn new(store: Arc<dyn Store>, config: StoreConfig, settings: GcSettings) -> Self {
        Self {
            temp_roots: TempRoots::new(&config),
            store,
            config,
            settings,
            platform: default_platform_roots(),
            interrupt: Interrupt::new(),
            auto: Mutex::new(AutoGcState::default()),
        }
    }

    #[must_use]
    pub fn with_platform_roots(mut self, platform: Arc<dyn PlatformRoots>) -> Self {
        self.platform = platform;
        self
    }

    #[must_use]
    pub fn with_interrupt(mut self, interrupt: Interrupt) -> Self {
        self.interrupt = interrupt;
        self
    }

    #[must_use]
    pub fn with_temp_roots(mut self, temp_roots: TempRoots) -> Self {
        self.temp_roots = temp_roots;
        self
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    #[must_use]
    pub fn settings(&self) -> &GcSettings {
        &self.settings
    }

    #[must_use]
    pub fn interrupt(&self) -> &Interrupt {
        &self.interrupt
    }

    /// This process's temp roots.
    #[must_use]
    pub fn temp_roots(&self) -> &TempRoots {
        &self.temp_roots
    }
}
