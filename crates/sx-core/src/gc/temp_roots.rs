use std::fs::{self, File};
use std::io::{ErrorKind, Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::config::StoreConfig;
use crate::lock::{is_stale, lock_file, open_lock_file, FdLock, LockType};
use crate::store_path::{StoreDir, StorePath};

const RECONNECT_DELAY: Duration = Duration::from_millis(10);

/// Per-process temporary roots.
///
/// Paths added here survive any sweep for as long as this value lives: they
/// are appended to `<state>/temproots/<id>`, which stays write-locked, and
/// are reported to a running collector over its registration socket.
#[derive(Debug)]
pub struct TempRoots {
    config: StoreConfig,
    store_dir: StoreDir,
    id: u32,
    state: Mutex<ClientState>,
}

#[derive(Debug, Default)]
struct ClientState {
    file: Option<File>,
    socket: Option<UnixStream>,
}

impl TempRoots {
    #[must_use]
    pub fn new(config: &StoreConfig) -> Self {
        Self::with_id(config, std::process::id())
    }

    /// Use `id` instead of the process id as the temp-roots file name.
    #[must_use]
    pub fn with_id(config: &StoreConfig, id: u32) -> Self {
        Self {
            config: config.clone(),
            store_dir: config.store_dir(),
            id,
            state: Mutex::new(ClientState::default()),
        }
    }

    #[must_use]
    pub fn file_path(&self) -> PathBuf {
        self.config.temp_roots_dir().join(self.id.to_string())
    }

    /// Protect `path` from collection until this value is dropped.
    ///
    /// # Errors
    /// Returns an error on unexpected filesystem or socket failures.
    pub fn add_temp_root(&self, path: &StorePath) -> Result<()> {
        let mut state = self.state.lock().expect("temp roots lock");
        if state.file.is_none() {
            state.file = Some(self.create_file()?);
        }

        let gc_lock_path = self.config.gc_lock_path();
        let gc_lock = open_lock_file(&gc_lock_path, true)?
            .with_context(|| format!("failed to open {}", gc_lock_path.display()))?;
        let printed = self.store_dir.print(path);
        loop {
            let shared = FdLock::new(&gc_lock, LockType::Read, false, "")?;
            if !shared.acquired() {
                match register(&mut state.socket, &self.config.gc_socket_path(), &printed) {
                    Ok(()) => {}
                    Err(err) if is_disconnect(&err) => {
                        debug!(%err, "root registration socket unavailable; retrying");
                        state.socket = None;
                        drop(shared);
                        thread::sleep(RECONNECT_DELAY);
                        continue;
                    }
                    Err(err) => {
                        return Err(err).context("failed to register temp root with the collector")
                    }
                }
            }

            let Some(file) = state.file.as_mut() else {
                bail!("temp roots file {} is not open", self.file_path().display());
            };
            let mut record = printed.into_bytes();
            record.push(0);
            file.write_all(&record)
                .with_context(|| format!("failed to write {}", self.file_path().display()))?;
            debug!(path = %path, "added temp root");
            return Ok(());
        }
    }

    fn create_file(&self) -> Result<File> {
        let path = self.file_path();
        loop {
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed leftover temp roots file"),
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => {
                    return Err(err).with_context(|| format!("failed to remove {}", path.display()))
                }
            }
            let file = open_lock_file(&path, true)?
                .with_context(|| format!("failed to create {}", path.display()))?;
            debug!(path = %path.display(), "acquiring write lock on temp roots");
            lock_file(&file, LockType::Write, true)?;
            if !is_stale(&file)? {
                return Ok(file);
            }
        }
    }
}

impl Drop for TempRoots {
    fn drop(&mut self) {
        let state = self
            .state
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        state.socket = None;
        if state.file.take().is_some() {
            let _ = fs::remove_file(self.file_path());
        }
    }
}

fn register(
    socket: &mut Option<UnixStream>,
    socket_path: &std::path::Path,
    printed: &str,
) -> std::io::Result<()> {
    if socket.is_none() {
        debug!(socket = %socket_path.display(), "connecting to the collector");
        *socket = Some(UnixStream::connect(socket_path)?);
    }
    let Some(stream) = socket.as_mut() else {
        return Err(ErrorKind::NotConnected.into());
    };
    debug!(path = %printed, "sending temp root");
    stream.write_all(format!("{printed}\n").as_bytes())?;
    let mut ack = [0u8; 1];
    stream.read_exact(&mut ack)?;
    if ack[0] != b'1' {
        return Err(std::io::Error::new(
            ErrorKind::InvalidData,
            format!("unexpected acknowledgement byte {:#x}", ack[0]),
        ));
    }
    debug!(path = %printed, "temp root acknowledged");
    Ok(())
}

fn is_disconnect(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::NotFound
            | ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::UnexpectedEof
            | ErrorKind::NotConnected
    )
}
