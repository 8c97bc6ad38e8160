use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tempfile::TempDir;

use super::{GcCoordinator, NoPlatformRoots, TempRoots};
use crate::config::{GcSettings, StoreConfig};
use crate::store::{LocalStore, PathInfo, Store};
use crate::store_path::{StoreDir, StorePath};

mod auto;
mod links;
mod roots;

/// A throwaway store with a collector that sees no runtime roots.
pub(super) struct Fixture {
    pub temp: TempDir,
    pub config: StoreConfig,
    pub store: Arc<LocalStore>,
    pub coordinator: GcCoordinator,
}

pub(super) fn settings() -> GcSettings {
    GcSettings {
        reserved_size: 0,
        ..GcSettings::default()
    }
}

pub(super) fn fixture() -> Result<Fixture> {
    fixture_with(settings())
}

pub(super) fn fixture_with(settings: GcSettings) -> Result<Fixture> {
    let temp = tempfile::tempdir()?;
    let config = StoreConfig::new(temp.path().join("store"), temp.path().join("var"));
    let store = Arc::new(LocalStore::open(&config, &settings)?);
    let coordinator = coordinator_for(Arc::clone(&store) as Arc<dyn Store>, &config, settings);
    Ok(Fixture {
        temp,
        config,
        store,
        coordinator,
    })
}

pub(super) fn coordinator_for(
    store: Arc<dyn Store>,
    config: &StoreConfig,
    settings: GcSettings,
) -> GcCoordinator {
    GcCoordinator::new(store, config.clone(), settings)
        .with_platform_roots(Arc::new(NoPlatformRoots))
        .with_temp_roots(TempRoots::with_id(config, 1))
}

impl Fixture {
    pub fn add(&self, name: &str, contents: &str, references: &[&StorePath]) -> Result<StorePath> {
        let references: BTreeSet<StorePath> = references.iter().map(|p| (*p).clone()).collect();
        self.store
            .add_text_to_store(name, contents.as_bytes(), &references)
    }

    /// Register `name` as an output of `drv`, with `drv` as its deriver.
    pub fn add_output(&self, drv: &StorePath, name: &str, contents: &str) -> Result<StorePath> {
        let path = StorePath::from_digest(name, contents.as_bytes())?;
        fs::write(self.real(&path), contents)?;
        self.store.register_valid_path(
            &PathInfo::new(path.clone())
                .with_deriver(drv.clone())
                .with_nar_size(contents.len() as u64),
        )?;
        self.store
            .register_derivation_outputs(drv, &BTreeMap::from([("out".to_string(), path.clone())]))?;
        Ok(path)
    }

    /// Symlink `gcroots/<name>` to `path`.
    pub fn root(&self, path: &StorePath, name: &str) -> Result<PathBuf> {
        let link = self.config.gc_roots_dir().join(name);
        symlink(self.real(path), &link)?;
        Ok(link)
    }

    pub fn real(&self, path: &StorePath) -> PathBuf {
        self.config.store_dir().path_of(path)
    }

    pub fn exists(&self, path: &StorePath) -> bool {
        fs::symlink_metadata(self.real(path)).is_ok()
    }

    pub fn printed(&self, path: &StorePath) -> String {
        self.config.store_dir().print(path)
    }
}

/// Parks the first `query_referrers` call until the test lets it go.
#[derive(Debug)]
pub(super) struct GatedStore {
    inner: Arc<LocalStore>,
    gate: Mutex<Option<(Sender<StorePath>, Receiver<()>)>>,
}

impl Store for GatedStore {
    fn store_dir(&self) -> &StoreDir {
        self.inner.store_dir()
    }

    fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
        self.inner.is_valid_path(path)
    }

    fn query_path_info(&self, path: &StorePath) -> Result<PathInfo> {
        self.inner.query_path_info(path)
    }

    fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        let gate = self.gate.lock().expect("gate lock").take();
        if let Some((entered, resume)) = gate {
            entered.send(path.clone())?;
            resume.recv()?;
        }
        self.inner.query_referrers(path)
    }

    fn query_valid_derivers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        self.inner.query_valid_derivers(path)
    }

    fn query_derivation_output_map(&self, drv: &StorePath) -> Result<BTreeMap<String, StorePath>> {
        self.inner.query_derivation_output_map(drv)
    }

    fn invalidate_path_checked(&self, path: &StorePath) -> Result<()> {
        self.inner.invalidate_path_checked(path)
    }
}

/// Wrap `store` so a sweep stops inside its first `query_referrers` call.
/// The receiver yields the path being visited; sending on the sender lets
/// the sweep continue.
pub(super) fn gated(
    store: &Arc<LocalStore>,
) -> (Arc<GatedStore>, Receiver<StorePath>, Sender<()>) {
    let (entered_tx, entered) = mpsc::channel();
    let (resume, resume_rx) = mpsc::channel();
    let gated = Arc::new(GatedStore {
        inner: Arc::clone(store),
        gate: Mutex::new(Some((entered_tx, resume_rx))),
    });
    (gated, entered, resume)
}
