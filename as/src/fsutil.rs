//! Atomic file primitives: write-then-rename records, monotonic counters,
//! and the per-entity lock registry
//!
//! Every record mutation goes through [`write_json_atomic`] so readers see
//! either the pre-image or the post-image, never a torn write.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{Result, StoreError};

/// Current time as unix milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Lowercase 8-hex alias from a random 64-bit value
pub fn hex_alias() -> String {
    format!("{:016x}", rand::random::<u64>())[..8].to_string()
}

/// Create a directory (and parents) if absent
pub fn ensure_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).map_err(|e| StoreError::io(format!("creating {}", path.display()), e))
}

/// Serialize `value` as pretty JSON and atomically replace `path`
///
/// Write temp -> fsync -> rename, per the store concurrency contract.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)
        .map_err(|e| StoreError::Internal(format!("serializing {}: {}", path.display(), e)))?;
    write_bytes_atomic(path, json.as_bytes())
}

/// Atomically replace `path` with `bytes`
pub fn write_bytes_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StoreError::Internal(format!("no parent dir for {}", path.display())))?;
    ensure_dir(parent)?;

    let tmp = parent.join(format!(
        ".{}.tmp.{}",
        path.file_name().and_then(|n| n.to_str()).unwrap_or("record"),
        std::process::id()
    ));

    let mut file = fs::File::create(&tmp).map_err(|e| StoreError::io(format!("creating {}", tmp.display()), e))?;
    file.write_all(bytes)
        .and_then(|_| file.write_all(b"\n"))
        .and_then(|_| file.sync_all())
        .map_err(|e| StoreError::io(format!("writing {}", tmp.display()), e))?;
    drop(file);

    fs::rename(&tmp, path).map_err(|e| StoreError::io(format!("replacing {}", path.display()), e))?;
    Ok(())
}

/// Read and deserialize a JSON record
///
/// Maps a missing file to `NotFound` carrying `what`.
pub fn read_json<T: DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(StoreError::NotFound(what.to_string()));
        }
        Err(e) => return Err(StoreError::io(format!("reading {}", path.display()), e)),
    };
    serde_json::from_str(&content).map_err(|e| StoreError::Internal(format!("parsing {}: {}", path.display(), e)))
}

/// Registry of in-process mutexes keyed by entity kind + id
///
/// Composite read-modify-write operations hold the entity lock for the
/// duration of the update; plain reads go lock-free (atomic replace makes
/// them safe).
#[derive(Debug, Default)]
pub struct EntityLocks {
    inner: Mutex<HashMap<(String, String), Arc<Mutex<()>>>>,
}

impl EntityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch (or create) the lock for `kind`/`id`
    pub fn entry(&self, kind: &str, id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        map.entry((kind.to_string(), id.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

/// Allocate the next monotonic id for `kind`
///
/// The counter file holds the last allocated decimal id; allocation is
/// serialised by the caller holding the counter entity lock.
pub fn next_counter(counter_path: &Path, kind: &str) -> Result<u64> {
    let current = read_counter(counter_path);
    let next = current + 1;
    write_bytes_atomic(counter_path, next.to_string().as_bytes())?;
    debug!(kind, next, "next_counter: allocated id");
    Ok(next)
}

/// Read a counter file, treating absence or garbage as zero
pub fn read_counter(counter_path: &Path) -> u64 {
    fs::read_to_string(counter_path)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}

/// Clamp a counter up to the maximum id found on disk
///
/// Called from `repair` and on open so a crash between record write and
/// counter write never hands out a duplicate id.
pub fn reconcile_counter(counter_path: &Path, records_dir: &Path) -> Result<u64> {
    let max_on_disk = max_numeric_stem(records_dir);
    let current = read_counter(counter_path);
    if max_on_disk > current {
        debug!(
            current,
            max_on_disk,
            dir = %records_dir.display(),
            "reconcile_counter: clamping counter up to on-disk max"
        );
        write_bytes_atomic(counter_path, max_on_disk.to_string().as_bytes())?;
        return Ok(max_on_disk);
    }
    Ok(current)
}

/// Largest numeric file stem (`<n>.json` or bare `<n>` directory) in a dir
pub fn max_numeric_stem(dir: &Path) -> u64 {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };
    entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            e.path()
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<u64>().ok())
        })
        .max()
        .unwrap_or(0)
}

/// Numeric ids present in a directory of `<n>.json` records, ascending
pub fn numeric_ids(dir: &Path) -> Vec<u64> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut ids: Vec<u64> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension().and_then(|x| x.to_str()) != Some("json") {
                return None;
            }
            path.file_stem().and_then(|s| s.to_str()).and_then(|s| s.parse().ok())
        })
        .collect();
    ids.sort_unstable();
    ids
}

/// Slug-style ids (`<slug>.json`) present in a directory, ascending
pub fn slug_ids(dir: &Path) -> Vec<String> {
    let Ok(entries) = fs::read_dir(dir) else {
        return Vec::new();
    };
    let mut ids: Vec<String> = entries
        .filter_map(|e| e.ok())
        .filter_map(|e| {
            let path = e.path();
            if path.extension().and_then(|x| x.to_str()) != Some("json") {
                return None;
            }
            path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
        })
        .collect();
    ids.sort();
    ids
}

/// Path helper: `<dir>/<id>.json`
pub fn record_path(dir: &Path, id: impl std::fmt::Display) -> PathBuf {
    dir.join(format!("{}.json", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn test_write_then_read_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sample.json");

        let value = Sample {
            name: "alpha".to_string(),
            count: 3,
        };
        write_json_atomic(&path, &value).unwrap();

        let back: Sample = read_json(&path, "sample").unwrap();
        assert_eq!(back, value);

        // Pretty two-space indentation on disk
        let raw = fs::read_to_string(&path).unwrap();
        assert!(raw.contains("\n  \"name\""));
    }

    #[test]
    fn test_read_missing_is_not_found() {
        let temp = TempDir::new().unwrap();
        let err = read_json::<Sample>(&temp.path().join("gone.json"), "sample 9").unwrap_err();
        assert!(err.is_not_found());
        assert_eq!(err.to_string(), "sample 9 not found");
    }

    #[test]
    fn test_atomic_write_leaves_no_temp_files() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("sample.json");
        write_json_atomic(&path, &Sample {
            name: "a".to_string(),
            count: 1,
        })
        .unwrap();
        write_json_atomic(&path, &Sample {
            name: "b".to_string(),
            count: 2,
        })
        .unwrap();

        let names: Vec<String> = fs::read_dir(temp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["sample.json".to_string()]);
    }

    #[test]
    fn test_counter_allocation_is_monotonic() {
        let temp = TempDir::new().unwrap();
        let counter = temp.path().join("turn");

        assert_eq!(next_counter(&counter, "turn").unwrap(), 1);
        assert_eq!(next_counter(&counter, "turn").unwrap(), 2);
        assert_eq!(next_counter(&counter, "turn").unwrap(), 3);
    }

    #[test]
    fn test_counter_reconcile_clamps_up() {
        let temp = TempDir::new().unwrap();
        let records = temp.path().join("turns");
        fs::create_dir_all(&records).unwrap();
        fs::write(records.join("7.json"), "{}").unwrap();
        fs::write(records.join("12.json"), "{}").unwrap();

        let counter = temp.path().join("turn");
        write_bytes_atomic(&counter, b"3").unwrap();

        assert_eq!(reconcile_counter(&counter, &records).unwrap(), 12);
        assert_eq!(next_counter(&counter, "turn").unwrap(), 13);
    }

    #[test]
    fn test_counter_reconcile_never_clamps_down() {
        let temp = TempDir::new().unwrap();
        let records = temp.path().join("turns");
        fs::create_dir_all(&records).unwrap();
        fs::write(records.join("2.json"), "{}").unwrap();

        let counter = temp.path().join("turn");
        write_bytes_atomic(&counter, b"9").unwrap();

        assert_eq!(reconcile_counter(&counter, &records).unwrap(), 9);
    }

    #[test]
    fn test_numeric_ids_sorted_and_filtered() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("3.json"), "{}").unwrap();
        fs::write(temp.path().join("1.json"), "{}").unwrap();
        fs::write(temp.path().join("10.json"), "{}").unwrap();
        fs::write(temp.path().join("notes.txt"), "x").unwrap();

        assert_eq!(numeric_ids(temp.path()), vec![1, 3, 10]);
    }

    #[test]
    fn test_hex_alias_shape() {
        let alias = hex_alias();
        assert_eq!(alias.len(), 8);
        assert!(alias.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(alias, alias.to_lowercase());
    }

    #[test]
    fn test_entity_locks_shared_per_key() {
        let locks = EntityLocks::new();
        let a = locks.entry("plan", "auth");
        let b = locks.entry("plan", "auth");
        let c = locks.entry("issue", "auth");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
