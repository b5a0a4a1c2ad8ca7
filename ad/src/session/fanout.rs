//! Event fan-out: journal plus per-client bounded queues
//!
//! Every server event is appended to `events.jsonl` (one JSON line per
//! event) and pushed onto each attached client's bounded queue. A client
//! whose queue overflows is disconnected; a late attach replays the journal
//! suffix from a byte offset under the same lock the writer holds, so no
//! event is ever missed or duplicated across the replay/live boundary.

use std::fs::{self, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::protocol::ServerMessage;

/// Per-client queue depth; overflow disconnects the client
pub const CLIENT_QUEUE: usize = 256;

/// A client's live event feed
#[derive(Debug)]
struct ClientSlot {
    id: u64,
    tx: mpsc::Sender<String>,
}

#[derive(Debug)]
struct HubInner {
    file: fs::File,
    len: u64,
    clients: Vec<ClientSlot>,
    next_client: u64,
}

/// The journal + fan-out hub of one session daemon
#[derive(Debug)]
pub struct EventHub {
    path: PathBuf,
    inner: Mutex<HubInner>,
}

impl EventHub {
    /// Open (append mode) the journal at `path`
    pub fn open(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            path,
            inner: Mutex::new(HubInner {
                file,
                len,
                clients: Vec::new(),
                next_client: 1,
            }),
        })
    }

    /// Journal byte length (the next attach offset)
    pub fn journal_len(&self) -> u64 {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len
    }

    /// Append one event and fan it out to every attached client
    pub fn publish(&self, message: &ServerMessage) {
        let line = match serde_json::to_string(message) {
            Ok(line) => line,
            Err(e) => {
                warn!(error = %e, "publish: cannot serialize event");
                return;
            }
        };

        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = inner.file.write_all(line.as_bytes()).and_then(|_| inner.file.write_all(b"\n")) {
            warn!(error = %e, "publish: journal append failed");
        } else {
            inner.len += line.len() as u64 + 1;
        }

        // Slow consumers are dropped, not waited on
        let mut dropped = Vec::new();
        for slot in &inner.clients {
            if slot.tx.try_send(line.clone()).is_err() {
                dropped.push(slot.id);
            }
        }
        if !dropped.is_empty() {
            warn!(?dropped, "publish: disconnecting slow clients");
            inner.clients.retain(|slot| !dropped.contains(&slot.id));
        }
    }

    /// Flush the journal to disk
    pub fn flush(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let _ = inner.file.flush();
        let _ = inner.file.sync_all();
    }

    /// Attach a client: journal suffix from `replay_from` plus a live queue
    ///
    /// Runs under the writer's lock, so the replay/live boundary is exact.
    pub fn attach(&self, replay_from: u64) -> std::io::Result<(Vec<String>, mpsc::Receiver<String>)> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.file.flush()?;

        let replay = read_lines_from(&self.path, replay_from.min(inner.len))?;

        let (tx, rx) = mpsc::channel(CLIENT_QUEUE);
        let id = inner.next_client;
        inner.next_client += 1;
        inner.clients.push(ClientSlot { id, tx });
        debug!(client = id, replay_lines = replay.len(), "attach: client registered");
        Ok((replay, rx))
    }

    /// Drop a client registration (socket closed)
    pub fn detach_all(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.clients.clear();
    }
}

/// Read journal lines starting at a byte offset
fn read_lines_from(path: &Path, offset: u64) -> std::io::Result<Vec<String>> {
    let mut file = match fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    Ok(buf.lines().map(str::to_string).collect())
}
