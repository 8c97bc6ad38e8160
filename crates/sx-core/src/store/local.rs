use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fs4::FileExt;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use tracing::debug;

use super::{PathInfo, Store, StoreError};
use crate::config::{GcSettings, StoreConfig};
use crate::fs::make_read_only_recursive;
use crate::store_path::{StoreDir, StorePath};

const DB_FILE: &str = "db.sqlite";

/// A store on the local filesystem with its bookkeeping in SQLite.
#[derive(Debug)]
pub struct LocalStore {
    store_dir: StoreDir,
    config: StoreConfig,
    db_path: PathBuf,
}

impl LocalStore {
    /// Open (creating if needed) the store described by `config`.
    ///
    /// # Errors
    /// Returns an error when the layout cannot be created or the database
    /// cannot be initialized.
    pub fn open(config: &StoreConfig, settings: &GcSettings) -> Result<Self> {
        for dir in [
            config.store_dir.clone(),
            config.gc_roots_dir(),
            config.profiles_dir(),
            config.temp_roots_dir(),
            config.db_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to ensure store directory {}", dir.display()))?;
        }
        let store = Self {
            store_dir: config.store_dir(),
            config: config.clone(),
            db_path: config.db_dir().join(DB_FILE),
        };
        let conn = store.connection()?;
        init_schema(&conn)?;
        store.ensure_reserved_space(settings.reserved_size)?;
        Ok(store)
    }

    #[must_use]
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn ensure_reserved_space(&self, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let path = self.config.reserved_path();
        let current = fs::metadata(&path).map(|meta| meta.len()).ok();
        if current == Some(size) {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .with_context(|| format!("failed to create {}", path.display()))?;
        if file.allocate(size).is_err() {
            file.set_len(size)
                .with_context(|| format!("failed to reserve space in {}", path.display()))?;
        }
        debug!(path = %path.display(), size, "reserved space file ready");
        Ok(())
    }

    fn connection(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("failed to open store database {}", self.db_path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL")
            .context("failed to enable WAL for store database")?;
        conn.busy_timeout(Duration::from_secs(10))
            .context("failed to set busy timeout for store database")?;
        Ok(conn)
    }

    fn with_immediate_tx<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&rusqlite::Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .context("failed to start store database transaction")?;
        let result = f(&tx)?;
        tx.commit()?;
        Ok(result)
    }

    /// Record `info` as a valid path. Every reference must already be valid
    /// (or be the path itself).
    ///
    /// # Errors
    /// Fails with [`StoreError::InvalidPath`] for an unknown reference.
    pub fn register_valid_path(&self, info: &PathInfo) -> Result<()> {
        self.with_immediate_tx(|tx| {
            for reference in &info.references {
                if *reference != info.path && !is_valid(tx, reference)? {
                    return Err(StoreError::InvalidPath(self.store_dir.print(reference)).into());
                }
            }
            let registered = if info.registration_time == 0 {
                unix_now()
            } else {
                info.registration_time
            };
            tx.execute(
                "INSERT OR REPLACE INTO valid_paths(path, deriver, nar_size, registration_time)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    info.path.base_name(),
                    info.deriver.as_ref().map(StorePath::base_name),
                    i64::try_from(info.nar_size).unwrap_or(i64::MAX),
                    registered
                ],
            )?;
            tx.execute(
                "DELETE FROM refs WHERE referrer = ?1",
                params![info.path.base_name()],
            )?;
            for reference in &info.references {
                tx.execute(
                    "INSERT OR IGNORE INTO refs(referrer, reference) VALUES (?1, ?2)",
                    params![info.path.base_name(), reference.base_name()],
                )?;
            }
            Ok(())
        })
        .with_context(|| format!("failed to register {}", self.store_dir.print(&info.path)))
    }

    /// Record the outputs a valid derivation produces.
    pub fn register_derivation_outputs(
        &self,
        drv: &StorePath,
        outputs: &BTreeMap<String, StorePath>,
    ) -> Result<()> {
        self.with_immediate_tx(|tx| {
            if !is_valid(tx, drv)? {
                return Err(StoreError::InvalidPath(self.store_dir.print(drv)).into());
            }
            for (name, output) in outputs {
                tx.execute(
                    "INSERT OR REPLACE INTO derivation_outputs(drv, output, path) VALUES (?1, ?2, ?3)",
                    params![drv.base_name(), name, output.base_name()],
                )?;
            }
            Ok(())
        })
    }

    /// Write a single-file store object named after its contents and
    /// references, register it, and return its path.
    pub fn add_text_to_store(
        &self,
        name: &str,
        contents: &[u8],
        references: &BTreeSet<StorePath>,
    ) -> Result<StorePath> {
        let mut fingerprint = contents.to_vec();
        for reference in references {
            fingerprint.push(0);
            fingerprint.extend_from_slice(reference.base_name().as_bytes());
        }
        let path = StorePath::from_digest(name, &fingerprint)?;
        let real = self.store_dir.path_of(&path);
        if !self.is_valid_path(&path)? {
            if fs::symlink_metadata(&real).is_err() {
                fs::write(&real, contents)
                    .with_context(|| format!("failed to write {}", real.display()))?;
                make_read_only_recursive(&real)?;
            }
            let info = PathInfo::new(path.clone())
                .with_references(references.iter().cloned())
                .with_nar_size(contents.len() as u64);
            self.register_valid_path(&info)?;
        }
        Ok(path)
    }

    /// Every currently valid path.
    pub fn query_all_valid_paths(&self) -> Result<BTreeSet<StorePath>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT path FROM valid_paths")?;
        let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
        let mut paths = BTreeSet::new();
        for row in rows {
            paths.insert(parse_row(&row?)?);
        }
        Ok(paths)
    }

    fn query_column(&self, sql: &str, key: &StorePath) -> Result<BTreeSet<StorePath>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![key.base_name()], |row| row.get::<_, String>(0))?;
        let mut paths = BTreeSet::new();
        for row in rows {
            paths.insert(parse_row(&row?)?);
        }
        Ok(paths)
    }
}

impl Store for LocalStore {
    fn store_dir(&self) -> &StoreDir {
        &self.store_dir
    }

    fn is_valid_path(&self, path: &StorePath) -> Result<bool> {
        let conn = self.connection()?;
        is_valid(&conn, path)
    }

    fn query_path_info(&self, path: &StorePath) -> Result<PathInfo> {
        let conn = self.connection()?;
        let row = conn
            .query_row(
                "SELECT deriver, nar_size, registration_time FROM valid_paths WHERE path = ?1",
                params![path.base_name()],
                |row| {
                    Ok((
                        row.get::<_, Option<String>>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?;
        let Some((deriver, nar_size, registration_time)) = row else {
            return Err(StoreError::InvalidPath(self.store_dir.print(path)).into());
        };
        let references = self.query_column(
            "SELECT reference FROM refs WHERE referrer = ?1",
            path,
        )?;
        Ok(PathInfo {
            path: path.clone(),
            deriver: deriver.as_deref().map(parse_row).transpose()?,
            references,
            nar_size: u64::try_from(nar_size).unwrap_or_default(),
            registration_time,
        })
    }

    fn query_referrers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        self.query_column(
            "SELECT referrer FROM refs WHERE reference = ?1 AND referrer != reference",
            path,
        )
    }

    fn query_valid_derivers(&self, path: &StorePath) -> Result<BTreeSet<StorePath>> {
        self.query_column(
            "SELECT d.drv FROM derivation_outputs d
             JOIN valid_paths v ON v.path = d.drv
             WHERE d.path = ?1",
            path,
        )
    }

    fn query_derivation_output_map(&self, drv: &StorePath) -> Result<BTreeMap<String, StorePath>> {
        let conn = self.connection()?;
        let mut stmt = conn.prepare("SELECT output, path FROM derivation_outputs WHERE drv = ?1")?;
        let rows = stmt.query_map(params![drv.base_name()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        let mut outputs = BTreeMap::new();
        for row in rows {
            let (name, path) = row?;
            outputs.insert(name, parse_row(&path)?);
        }
        Ok(outputs)
    }

    fn invalidate_path_checked(&self, path: &StorePath) -> Result<()> {
        self.with_immediate_tx(|tx| {
            if !is_valid(tx, path)? {
                return Ok(());
            }
            let mut stmt = tx.prepare(
                "SELECT referrer FROM refs WHERE reference = ?1 AND referrer != reference",
            )?;
            let referrers = stmt
                .query_map(params![path.base_name()], |row| row.get::<_, String>(0))?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            drop(stmt);
            if !referrers.is_empty() {
                return Err(StoreError::PathInUse {
                    path: self.store_dir.print(path),
                    referrers,
                }
                .into());
            }
            tx.execute(
                "DELETE FROM refs WHERE referrer = ?1",
                params![path.base_name()],
            )?;
            tx.execute(
                "DELETE FROM derivation_outputs WHERE drv = ?1",
                params![path.base_name()],
            )?;
            tx.execute(
                "DELETE FROM valid_paths WHERE path = ?1",
                params![path.base_name()],
            )?;
            debug!(path = %path, "invalidated");
            Ok(())
        })
    }
}

fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS valid_paths (
            path TEXT PRIMARY KEY,
            deriver TEXT,
            nar_size INTEGER NOT NULL,
            registration_time INTEGER NOT NULL
        );
        CREATE TABLE IF NOT EXISTS refs (
            referrer TEXT NOT NULL,
            reference TEXT NOT NULL,
            PRIMARY KEY(referrer, reference)
        );
        CREATE INDEX IF NOT EXISTS refs_by_reference ON refs(reference);
        CREATE TABLE IF NOT EXISTS derivation_outputs (
            drv TEXT NOT NULL,
            output TEXT NOT NULL,
            path TEXT NOT NULL,
            PRIMARY KEY(drv, output)
        );
        CREATE INDEX IF NOT EXISTS derivation_outputs_by_path ON derivation_outputs(path);
        ",
    )
    .context("failed to initialize store database schema")?;
    Ok(())
}

fn is_valid(conn: &Connection, path: &StorePath) -> Result<bool> {
    let found = conn
        .query_row(
            "SELECT 1 FROM valid_paths WHERE path = ?1",
            params![path.base_name()],
            |_| Ok(()),
        )
        .optional()?;
    Ok(found.is_some())
}

fn parse_row(base_name: &str) -> Result<StorePath> {
    StorePath::parse_base_name(base_name)
        .map_err(|err| StoreError::Corrupt(err.to_string()).into())
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}
