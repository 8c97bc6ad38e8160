use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};

use crate::store_path::StoreDir;

const GC_ROOTS_DIR: &str = "gcroots";
const AUTO_ROOTS_DIR: &str = "auto";
const PROFILES_DIR: &str = "profiles";
const TEMP_ROOTS_DIR: &str = "temproots";
const GC_LOCK_FILE: &str = "gc.lock";
const GC_SOCKET_PATH: &str = "gc-socket/socket";
const DB_DIR: &str = "db";
const RESERVED_FILE: &str = "reserved";
pub const LINKS_DIR_NAME: &str = ".links";

const DEFAULT_MIN_FREE_CHECK_INTERVAL_SECS: u64 = 5;
const DEFAULT_RESERVED_SIZE: u64 = 8 * 1024 * 1024;

#[derive(Debug, Clone)]
pub(crate) struct EnvSnapshot {
    vars: HashMap<String, String>,
}

impl EnvSnapshot {
    pub(crate) fn capture() -> Self {
        Self {
            vars: env::vars().collect(),
        }
    }

    pub(crate) fn var(&self, key: &str) -> Option<&str> {
        self.vars.get(key).map(String::as_str)
    }

    pub(crate) fn flag(&self, key: &str) -> Result<Option<bool>> {
        let Some(value) = self.var(key) else {
            return Ok(None);
        };
        match value.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" | "" => Ok(Some(false)),
            other => Err(anyhow!("{key} must be a boolean, found '{other}'")),
        }
    }

    pub(crate) fn bytes(&self, key: &str) -> Result<Option<u64>> {
        self.var(key)
            .map(|value| {
                parse_size(value)
                    .with_context(|| format!("{key} must be a byte count, found '{value}'"))
            })
            .transpose()
    }

    #[cfg(test)]
    pub(crate) fn testing(pairs: &[(&str, &str)]) -> Self {
        let vars = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        Self { vars }
    }
}

/// On-disk layout of a store: the object directory and the state directory
/// holding roots, locks, the registration socket, and the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    pub store_dir: PathBuf,
    pub state_dir: PathBuf,
}

impl StoreConfig {
    pub fn new(store_dir: impl Into<PathBuf>, state_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            state_dir: state_dir.into(),
        }
    }

    /// Resolve the layout from `SX_STORE_DIR`/`SX_STATE_DIR`, falling back
    /// to `~/.sx/store` and `~/.sx/var`.
    ///
    /// # Errors
    /// Returns an error if HOME cannot be resolved and no override is set.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let store_dir = match snapshot.var("SX_STORE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_sx_home()?.join("store"),
        };
        let state_dir = match snapshot.var("SX_STATE_DIR") {
            Some(dir) => PathBuf::from(dir),
            None => default_sx_home()?.join("var"),
        };
        Ok(Self {
            store_dir,
            state_dir,
        })
    }

    #[must_use]
    pub fn store_dir(&self) -> StoreDir {
        StoreDir::new(&self.store_dir)
    }

    #[must_use]
    pub fn gc_roots_dir(&self) -> PathBuf {
        self.state_dir.join(GC_ROOTS_DIR)
    }

    #[must_use]
    pub fn auto_roots_dir(&self) -> PathBuf {
        self.gc_roots_dir().join(AUTO_ROOTS_DIR)
    }

    #[must_use]
    pub fn profiles_dir(&self) -> PathBuf {
        self.state_dir.join(PROFILES_DIR)
    }

    #[must_use]
    pub fn temp_roots_dir(&self) -> PathBuf {
        self.state_dir.join(TEMP_ROOTS_DIR)
    }

    #[must_use]
    pub fn gc_lock_path(&self) -> PathBuf {
        self.state_dir.join(GC_LOCK_FILE)
    }

    #[must_use]
    pub fn gc_socket_path(&self) -> PathBuf {
        self.state_dir.join(GC_SOCKET_PATH)
    }

    #[must_use]
    pub fn db_dir(&self) -> PathBuf {
        self.state_dir.join(DB_DIR)
    }

    #[must_use]
    pub fn reserved_path(&self) -> PathBuf {
        self.db_dir().join(RESERVED_FILE)
    }

    #[must_use]
    pub fn links_dir(&self) -> PathBuf {
        self.store_dir.join(LINKS_DIR_NAME)
    }
}

/// Collector policies and auto-GC thresholds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GcSettings {
    pub keep_outputs: bool,
    pub keep_derivations: bool,
    pub min_free: u64,
    pub max_free: u64,
    pub min_free_check_interval: Duration,
    pub reserved_size: u64,
    pub free_space_file: Option<PathBuf>,
}

impl Default for GcSettings {
    fn default() -> Self {
        Self {
            keep_outputs: false,
            keep_derivations: true,
            min_free: 0,
            max_free: u64::MAX,
            min_free_check_interval: Duration::from_secs(DEFAULT_MIN_FREE_CHECK_INTERVAL_SECS),
            reserved_size: DEFAULT_RESERVED_SIZE,
            free_space_file: None,
        }
    }
}

impl GcSettings {
    /// Builds settings from the `SX_*` environment variables.
    ///
    /// # Errors
    /// Returns an error when a variable is set to a malformed value.
    pub fn from_env() -> Result<Self> {
        Self::from_snapshot(&EnvSnapshot::capture())
    }

    pub(crate) fn from_snapshot(snapshot: &EnvSnapshot) -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            keep_outputs: snapshot
                .flag("SX_KEEP_OUTPUTS")?
                .unwrap_or(defaults.keep_outputs),
            keep_derivations: snapshot
                .flag("SX_KEEP_DERIVATIONS")?
                .unwrap_or(defaults.keep_derivations),
            min_free: snapshot.bytes("SX_MIN_FREE")?.unwrap_or(defaults.min_free),
            max_free: snapshot.bytes("SX_MAX_FREE")?.unwrap_or(defaults.max_free),
            min_free_check_interval: snapshot
                .bytes("SX_MIN_FREE_CHECK_INTERVAL")?
                .map_or(defaults.min_free_check_interval, Duration::from_secs),
            reserved_size: snapshot
                .bytes("SX_RESERVED_SIZE")?
                .unwrap_or(defaults.reserved_size),
            free_space_file: snapshot.var("SX_FREE_SPACE_FILE").map(PathBuf::from),
        })
    }

    #[must_use]
    pub fn auto_gc_enabled(&self) -> bool {
        self.min_free > 0
    }
}

fn default_sx_home() -> Result<PathBuf> {
    let home = dirs_next::home_dir().context("failed to resolve HOME for the sx store")?;
    Ok(home.join(".sx"))
}

/// Parse a byte count with an optional `K`, `M`, `G` or `T` suffix.
pub fn parse_size(text: &str) -> Result<u64> {
    let text = text.trim();
    let (digits, shift) = match text.chars().last() {
        Some('K' | 'k') => (&text[..text.len() - 1], 10),
        Some('M' | 'm') => (&text[..text.len() - 1], 20),
        Some('G' | 'g') => (&text[..text.len() - 1], 30),
        Some('T' | 't') => (&text[..text.len() - 1], 40),
        _ => (text, 0),
    };
    let value: u64 = digits
        .parse()
        .with_context(|| format!("'{text}' is not a size"))?;
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| anyhow!("size '{text}' is too large"))
}

pub(crate) fn absolutize(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = env::current_dir().context("failed to resolve current directory")?;
    Ok(cwd.join(path))
}
