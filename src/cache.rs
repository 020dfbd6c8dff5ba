//! Best-effort countdown cache, keyed by room.
//!
//! Values here are display hints for a freshly started session and are never
//! authoritative. Failures are logged and otherwise ignored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use crate::protocol::RoomId;

pub trait CountdownCache: Send + Sync {
    fn load(&self, room: &RoomId) -> Option<u64>;
    fn store(&self, room: &RoomId, seconds: u64);
    fn clear(&self, room: &RoomId);
}

/// Cache that forgets everything when the process exits.
#[derive(Debug, Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<RoomId, u64>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CountdownCache for MemoryCache {
    fn load(&self, room: &RoomId) -> Option<u64> {
        self.entries.lock().ok()?.get(room).copied()
    }

    fn store(&self, room: &RoomId, seconds: u64) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(room.clone(), seconds);
        }
    }

    fn clear(&self, room: &RoomId) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.remove(room);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
struct FileEntry {
    remaining: u64,
    /// Unix seconds when `remaining` was written.
    saved_at: i64,
}

type Entries = HashMap<String, FileEntry>;

enum Flush {
    Snapshot(Entries),
    Barrier(oneshot::Sender<()>),
}

/// JSON file cache. Entries live in memory and age by wall-clock time on
/// load; a background task writes the latest snapshot with `tokio::fs`, so
/// `store` and `clear` never touch the disk on the caller's task.
#[derive(Debug)]
pub struct FileCache {
    path: PathBuf,
    entries: Mutex<Entries>,
    flush_tx: mpsc::UnboundedSender<Flush>,
}

impl FileCache {
    /// Read `path` if it exists and start the writer. Must run inside a tokio runtime.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match tokio::fs::read_to_string(&path).await {
            Ok(text) => serde_json::from_str(&text).unwrap_or_else(|e| {
                warn!("[CACHE] Ignoring corrupt cache {}: {}", path.display(), e);
                Entries::new()
            }),
            Err(_) => Entries::new(),
        };
        let (flush_tx, flush_rx) = mpsc::unbounded_channel();
        tokio::spawn(writer(path.clone(), flush_rx));
        Self {
            path,
            entries: Mutex::new(entries),
            flush_tx,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolves once everything stored so far is on disk.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.flush_tx.send(Flush::Barrier(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }

    fn update(&self, f: impl FnOnce(&mut Entries)) {
        let Ok(mut entries) = self.entries.lock() else {
            return;
        };
        f(&mut entries);
        // Sent under the lock so snapshots reach the writer in order
        if self.flush_tx.send(Flush::Snapshot(entries.clone())).is_err() {
            debug!("[CACHE] Writer gone, {} not updated", self.path.display());
        }
    }
}

/// Write only the newest snapshot of each batch.
async fn writer(path: PathBuf, mut rx: mpsc::UnboundedReceiver<Flush>) {
    while let Some(first) = rx.recv().await {
        let mut latest = None;
        let mut barriers = Vec::new();
        let mut next = Some(first);
        while let Some(flush) = next {
            match flush {
                Flush::Snapshot(entries) => latest = Some(entries),
                Flush::Barrier(done) => barriers.push(done),
            }
            next = rx.try_recv().ok();
        }
        if let Some(entries) = latest {
            write_file(&path, &entries).await;
        }
        for done in barriers {
            let _ = done.send(());
        }
    }
}

async fn write_file(path: &Path, entries: &Entries) {
    let json = match serde_json::to_string(entries) {
        Ok(json) => json,
        Err(e) => {
            warn!("[CACHE] Failed to serialize cache: {}", e);
            return;
        }
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        let _ = tokio::fs::create_dir_all(parent).await;
    }
    if let Err(e) = tokio::fs::write(path, json).await {
        warn!("[CACHE] Failed to write {}: {}", path.display(), e);
    }
}

impl CountdownCache for FileCache {
    fn load(&self, room: &RoomId) -> Option<u64> {
        let entry = self.entries.lock().ok()?.get(room.as_str()).copied()?;
        let elapsed = OffsetDateTime::now_utc().unix_timestamp() - entry.saved_at;
        let remaining = entry.remaining.saturating_sub(u64::try_from(elapsed).unwrap_or(0));
        debug!("[CACHE] Room {} cached at {}s, now ~{}s", room, entry.remaining, remaining);
        Some(remaining)
    }

    fn store(&self, room: &RoomId, seconds: u64) {
        let entry = FileEntry {
            remaining: seconds,
            saved_at: OffsetDateTime::now_utc().unix_timestamp(),
        };
        self.update(|entries| {
            entries.insert(room.to_string(), entry);
        });
    }

    fn clear(&self, room: &RoomId) {
        self.update(|entries| {
            entries.remove(room.as_str());
        });
    }
}
