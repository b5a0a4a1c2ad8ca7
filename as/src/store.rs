//! The per-project record store rooted at `<repo>/.adaf/`
//!
//! One `Store` value is shared (cheaply cloned) by every component of a
//! process. All record mutations are atomic-replace; composite updates hold
//! an in-process per-entity mutex. Across processes the file layout itself
//! is the coordination medium.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tracing::{debug, info};

use crate::error::Result;
use crate::fsutil::{self, EntityLocks};
use crate::signal::SignalKind;

/// Directory name of a project store inside its repository
pub const STORE_DIR: &str = ".adaf";

/// Subdirectories expected under the store root
const EXPECTED_DIRS: &[&str] = &[
    "plans",
    "issues",
    "docs",
    "wiki",
    "turns",
    "records",
    "spawns",
    "loops/runs",
    "local",
    "local/stats",
    "local/counters",
];

/// Filesystem-backed record store for one project
#[derive(Debug, Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    root: PathBuf,
    locks: EntityLocks,
}

impl Store {
    /// Open (or create) a store rooted at `root`
    ///
    /// Absent directories are created; counters are reconciled against the
    /// maximum on-disk id so a crash never produces duplicate ids.
    pub fn open(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        debug!(root = %root.display(), "Store::open: called");

        let store = Self {
            inner: Arc::new(StoreInner {
                root,
                locks: EntityLocks::new(),
            }),
        };
        store.repair()?;
        Ok(store)
    }

    /// Open the store belonging to the repository at `repo_root`
    pub fn open_project(repo_root: impl AsRef<Path>) -> Result<Self> {
        Self::open(repo_root.as_ref().join(STORE_DIR))
    }

    /// Store root directory
    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// Recreate any missing expected directory and reconcile id counters
    pub fn repair(&self) -> Result<()> {
        debug!(root = %self.root().display(), "Store::repair: called");
        for dir in EXPECTED_DIRS {
            fsutil::ensure_dir(&self.root().join(dir))?;
        }
        for kind in SignalKind::ALL {
            fsutil::ensure_dir(&self.signal_dir(*kind))?;
        }

        for (kind, dir) in [
            ("issue", "issues"),
            ("turn", "turns"),
            ("spawn", "spawns"),
            ("loop-run", "loops/runs"),
        ] {
            fsutil::reconcile_counter(&self.counter_path(kind), &self.root().join(dir))?;
        }

        info!(root = %self.root().display(), "store ready");
        Ok(())
    }

    // === path helpers shared by the entity modules ===

    pub(crate) fn project_path(&self) -> PathBuf {
        self.root().join("project.json")
    }

    pub(crate) fn plans_dir(&self) -> PathBuf {
        self.root().join("plans")
    }

    pub(crate) fn issues_dir(&self) -> PathBuf {
        self.root().join("issues")
    }

    pub(crate) fn docs_dir(&self) -> PathBuf {
        self.root().join("docs")
    }

    pub(crate) fn wiki_dir(&self) -> PathBuf {
        self.root().join("wiki")
    }

    pub(crate) fn turns_dir(&self) -> PathBuf {
        self.root().join("turns")
    }

    pub(crate) fn records_dir(&self, turn_id: u64) -> PathBuf {
        self.root().join("records").join(turn_id.to_string())
    }

    pub(crate) fn spawns_dir(&self) -> PathBuf {
        self.root().join("spawns")
    }

    pub(crate) fn spawn_messages_dir(&self, spawn_id: u64) -> PathBuf {
        self.spawns_dir().join(spawn_id.to_string()).join("messages")
    }

    pub(crate) fn loop_runs_dir(&self) -> PathBuf {
        self.root().join("loops").join("runs")
    }

    pub(crate) fn loop_messages_dir(&self, run_id: u64) -> PathBuf {
        self.loop_runs_dir().join(run_id.to_string()).join("messages")
    }

    pub(crate) fn signal_dir(&self, kind: SignalKind) -> PathBuf {
        self.root().join("signals").join(kind.dir_name())
    }

    fn counter_path(&self, kind: &str) -> PathBuf {
        self.root().join("local").join("counters").join(kind)
    }

    // === shared primitives ===

    /// Take the in-process lock for one entity
    pub(crate) fn entity_lock(&self, kind: &str, id: &str) -> Arc<Mutex<()>> {
        self.inner.locks.entry(kind, id)
    }

    /// Allocate the next monotonic id for a record kind
    pub(crate) fn alloc_id(&self, kind: &str) -> Result<u64> {
        let lock = self.entity_lock("counter", kind);
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        fsutil::next_counter(&self.counter_path(kind), kind)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_layout() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join(".adaf")).unwrap();

        for dir in EXPECTED_DIRS {
            assert!(store.root().join(dir).is_dir(), "missing {}", dir);
        }
        assert!(store.root().join("signals/stop").is_dir());
        assert!(store.root().join("signals/wait").is_dir());
        assert!(store.root().join("signals/interrupt").is_dir());
        assert!(store.root().join("signals/call-supervisor").is_dir());
    }

    #[test]
    fn test_repair_recreates_removed_dir() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join(".adaf")).unwrap();

        std::fs::remove_dir_all(store.root().join("issues")).unwrap();
        store.repair().unwrap();
        assert!(store.root().join("issues").is_dir());
    }

    #[test]
    fn test_open_reconciles_counters_from_disk() {
        let temp = TempDir::new().unwrap();
        let root = temp.path().join(".adaf");
        std::fs::create_dir_all(root.join("issues")).unwrap();
        std::fs::write(root.join("issues/41.json"), "{}").unwrap();

        let store = Store::open(&root).unwrap();
        assert_eq!(store.alloc_id("issue").unwrap(), 42);
    }

    #[test]
    fn test_alloc_id_per_kind() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join(".adaf")).unwrap();

        assert_eq!(store.alloc_id("issue").unwrap(), 1);
        assert_eq!(store.alloc_id("issue").unwrap(), 2);
        assert_eq!(store.alloc_id("turn").unwrap(), 1);
    }

    #[test]
    fn test_alloc_id_threads_never_collide() {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join(".adaf")).unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let store = store.clone();
            handles.push(std::thread::spawn(move || {
                (0..10).map(|_| store.alloc_id("turn").unwrap()).collect::<Vec<_>>()
            }));
        }

        let mut all: Vec<u64> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 80);
    }
}
