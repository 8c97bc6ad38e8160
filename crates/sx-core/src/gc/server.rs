//! Sweep-scoped root registration service on a Unix domain socket.
//!
//! Clients send one store path per line and wait for a `1` byte. The
//! registered hash parts and the single pending deletion live in a registry
//! thread that owns them outright; connections and the collector talk to it
//! through a mailbox.

use std::collections::HashSet;
use std::fs;
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::net::Shutdown;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{debug, warn};

use super::GcError;
use crate::store_path::StoreDir;

const ACCEPT_TICK: Duration = Duration::from_millis(10);

enum Request {
    Register { hash_part: String, reply: Sender<()> },
    MarkPending { hash_part: String, reply: Sender<bool> },
    ReleasePending,
    Insert { hash_part: String },
    Shutdown,
}

#[derive(Default)]
struct Registry {
    temp_roots: HashSet<String>,
    pending: Option<String>,
    waiting: Vec<(String, Sender<()>)>,
}

impl Registry {
    fn run(mut self, mailbox: &Receiver<Request>) {
        while let Ok(request) = mailbox.recv() {
            match request {
                Request::Register { hash_part, reply } => {
                    self.temp_roots.insert(hash_part.clone());
                    if self.pending.as_ref() == Some(&hash_part) {
                        debug!(hash = %hash_part, "registration waits for pending deletion");
                        self.waiting.push((hash_part, reply));
                    } else {
                        let _ = reply.send(());
                    }
                }
                Request::MarkPending { hash_part, reply } => {
                    let absent = !self.temp_roots.contains(&hash_part);
                    if absent {
                        self.pending = Some(hash_part);
                        self.wake();
                    }
                    let _ = reply.send(absent);
                }
                Request::ReleasePending => {
                    self.pending = None;
                    self.wake();
                }
                Request::Insert { hash_part } => {
                    self.temp_roots.insert(hash_part);
                }
                Request::Shutdown => break,
            }
        }
    }

    fn wake(&mut self) {
        let pending = self.pending.as_ref();
        self.waiting.retain(|(hash_part, reply)| {
            if pending == Some(hash_part) {
                true
            } else {
                let _ = reply.send(());
                false
            }
        });
    }
}

pub(crate) struct RootsServer {
    socket_path: PathBuf,
    mailbox: Sender<Request>,
    stop: Arc<AtomicBool>,
    listener: Option<JoinHandle<()>>,
    registry: Option<JoinHandle<()>>,
}

impl RootsServer {
    /// Bind the registration socket and start serving.
    pub(crate) fn start(socket_path: &Path, store_dir: StoreDir) -> Result<Self> {
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        match fs::remove_file(socket_path) {
            Ok(()) => debug!(socket = %socket_path.display(), "removed stale socket"),
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to remove {}", socket_path.display()))
            }
        }
        let listener = UnixListener::bind(socket_path)
            .with_context(|| format!("failed to bind {}", socket_path.display()))?;
        fs::set_permissions(socket_path, fs::Permissions::from_mode(0o666))
            .with_context(|| format!("failed to set permissions on {}", socket_path.display()))?;
        listener
            .set_nonblocking(true)
            .context("failed to make the root registration socket non-blocking")?;

        let (mailbox, inbox) = mpsc::channel();
        let registry = thread::Builder::new()
            .name("sx-gc-registry".into())
            .spawn(move || Registry::default().run(&inbox))
            .context("failed to spawn the root registry")?;

        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let thread_mailbox = mailbox.clone();
        let listener = thread::Builder::new()
            .name("sx-gc-server".into())
            .spawn(move || listen(&listener, &store_dir, &thread_mailbox, &thread_stop))
            .context("failed to spawn the root registration server")?;

        Ok(Self {
            socket_path: socket_path.to_path_buf(),
            mailbox,
            stop,
            listener: Some(listener),
            registry: Some(registry),
        })
    }

    /// Atomically check whether `hash_part` was registered; if not, make it
    /// the pending deletion and return `true`.
    pub(crate) fn mark_pending_if_present(&self, hash_part: &str) -> Result<bool, GcError> {
        let (reply, answer) = mpsc::channel();
        self.mailbox
            .send(Request::MarkPending {
                hash_part: hash_part.to_string(),
                reply,
            })
            .map_err(|_| GcError::Server("root registry stopped".into()))?;
        answer
            .recv()
            .map_err(|_| GcError::Server("root registry stopped".into()))
    }

    pub(crate) fn release_pending(&self) {
        let _ = self.mailbox.send(Request::ReleasePending);
    }

    pub(crate) fn insert_temp_root(&self, hash_part: &str) {
        let _ = self.mailbox.send(Request::Insert {
            hash_part: hash_part.to_string(),
        });
    }

    pub(crate) fn shutdown(mut self) {
        self.stop_all();
    }

    fn stop_all(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.mailbox.send(Request::Shutdown);
        if let Some(handle) = self.listener.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.registry.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.socket_path);
    }
}

impl Drop for RootsServer {
    fn drop(&mut self) {
        if self.listener.is_some() || self.registry.is_some() {
            self.stop_all();
        }
    }
}

/// Clears the pending deletion when a traversal ends, however it ends.
pub(crate) struct PendingGuard<'a> {
    server: &'a RootsServer,
}

impl<'a> PendingGuard<'a> {
    pub(crate) fn new(server: &'a RootsServer) -> Self {
        Self { server }
    }
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.server.release_pending();
    }
}

fn listen(
    listener: &UnixListener,
    store_dir: &StoreDir,
    mailbox: &Sender<Request>,
    stop: &AtomicBool,
) {
    let mut connections: Vec<(UnixStream, JoinHandle<()>)> = Vec::new();
    while !stop.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                debug!("accepted root registration connection");
                let control = match prepare(&stream) {
                    Ok(control) => control,
                    Err(err) => {
                        warn!(%err, "dropping root registration connection");
                        continue;
                    }
                };
                let store_dir = store_dir.clone();
                let mailbox = mailbox.clone();
                match thread::Builder::new()
                    .name("sx-gc-client".into())
                    .spawn(move || serve(stream, &store_dir, &mailbox))
                {
                    Ok(handle) => connections.push((control, handle)),
                    Err(err) => warn!(%err, "failed to spawn root registration handler"),
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_TICK),
            Err(err) if err.kind() == ErrorKind::Interrupted => {}
            Err(err) => {
                warn!(%err, "error accepting root registration connection");
                thread::sleep(ACCEPT_TICK);
            }
        }
        let (done, live): (Vec<_>, Vec<_>) = connections
            .into_iter()
            .partition(|(_, handle)| handle.is_finished());
        for (_, handle) in done {
            let _ = handle.join();
        }
        connections = live;
    }

    for (control, _) in &connections {
        let _ = control.shutdown(Shutdown::Both);
    }
    for (_, handle) in connections {
        let _ = handle.join();
    }
}

fn prepare(stream: &UnixStream) -> std::io::Result<UnixStream> {
    stream.set_nonblocking(false)?;
    stream.try_clone()
}

fn serve(stream: UnixStream, store_dir: &StoreDir, mailbox: &Sender<Request>) {
    let mut writer = match stream.try_clone() {
        Ok(writer) => writer,
        Err(err) => {
            debug!(%err, "failed to clone root registration stream");
            return;
        }
    };
    let mut reader = BufReader::new(stream);
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => return,
            Ok(_) if line.last() != Some(&b'\n') => return,
            Ok(_) => {}
            Err(err) => {
                debug!(%err, "root registration connection closed");
                return;
            }
        }
        let text = String::from_utf8_lossy(&line[..line.len() - 1]).into_owned();
        if let Some(path) = store_dir.maybe_parse_store_path(&text) {
            debug!(path = %text, "registering temp root");
            let (reply, acked) = mpsc::channel();
            let request = Request::Register {
                hash_part: path.hash_part().to_string(),
                reply,
            };
            if mailbox.send(request).is_err() || acked.recv().is_err() {
                return;
            }
        } else {
            warn!(line = %text, "received garbage instead of a root from client");
        }
        if writer.write_all(b"1").is_err() {
            return;
        }
    }
}
