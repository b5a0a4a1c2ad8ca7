//! Profile-score ledger: cross-project spawn feedback
//!
//! Append-only JSONL at `<global root>/feedback.jsonl`. Writers upsert per
//! spawn id by appending; the latest record for a spawn wins at read time.
//! Malformed lines are skipped with a warning, never fatal.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::fsutil::now_ms;

/// One feedback record for a spawn
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedbackRecord {
    pub spawn_id: u64,
    pub child_profile: String,
    #[serde(default)]
    pub parent_role: Option<String>,
    #[serde(default)]
    pub parent_position: Option<String>,
    /// Outcome quality, 0.0 (useless) to 1.0 (merged as-is)
    pub quality: f64,
    /// Task difficulty as judged by the parent, 0.0 to 1.0
    #[serde(default)]
    pub difficulty: f64,
    #[serde(default)]
    pub duration_secs: f64,
    #[serde(default)]
    pub note: Option<String>,
    pub at: i64,
}

/// Aggregated feedback for one (profile, role, position) group
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackSummary {
    pub child_profile: String,
    pub parent_role: Option<String>,
    pub parent_position: Option<String>,
    pub count: usize,
    pub avg_quality: f64,
    pub avg_difficulty: f64,
    pub avg_duration_secs: f64,
}

/// Handle on the ledger file
#[derive(Debug, Clone)]
pub struct FeedbackLedger {
    path: PathBuf,
}

impl FeedbackLedger {
    /// Ledger inside a global root (`<root>/feedback.jsonl`)
    pub fn in_root(root: impl AsRef<Path>) -> Self {
        Self {
            path: root.as_ref().join("feedback.jsonl"),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record; later appends for the same spawn id supersede
    pub fn append(&self, record: &FeedbackRecord) -> Result<()> {
        debug!(spawn_id = record.spawn_id, profile = %record.child_profile, "feedback append");
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| StoreError::io("creating feedback dir", e))?;
        }
        let line = serde_json::to_string(record)
            .map_err(|e| StoreError::Internal(format!("serializing feedback: {}", e)))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| StoreError::io("opening feedback ledger", e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| StoreError::io("appending feedback", e))?;
        Ok(())
    }

    /// Effective records: the last line per spawn id, in spawn-id order
    pub fn records(&self) -> Result<Vec<FeedbackRecord>> {
        let file = match fs::File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io("reading feedback ledger", e)),
        };

        let mut latest: BTreeMap<u64, FeedbackRecord> = BTreeMap::new();
        let mut skipped = 0usize;
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::io("reading feedback ledger", e))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<FeedbackRecord>(&line) {
                Ok(record) => {
                    latest.insert(record.spawn_id, record);
                }
                Err(e) => {
                    skipped += 1;
                    warn!(error = %e, "skipping malformed feedback line");
                }
            }
        }
        if skipped > 0 {
            warn!(skipped, "feedback ledger contained malformed lines");
        }
        Ok(latest.into_values().collect())
    }

    /// Aggregate by (child profile, parent role, parent position)
    pub fn summaries(&self) -> Result<Vec<FeedbackSummary>> {
        let mut groups: BTreeMap<(String, Option<String>, Option<String>), Vec<FeedbackRecord>> = BTreeMap::new();
        for record in self.records()? {
            groups
                .entry((
                    record.child_profile.clone(),
                    record.parent_role.clone(),
                    record.parent_position.clone(),
                ))
                .or_default()
                .push(record);
        }

        Ok(groups
            .into_iter()
            .map(|((profile, role, position), records)| {
                let n = records.len() as f64;
                FeedbackSummary {
                    child_profile: profile,
                    parent_role: role,
                    parent_position: position,
                    count: records.len(),
                    avg_quality: records.iter().map(|r| r.quality).sum::<f64>() / n,
                    avg_difficulty: records.iter().map(|r| r.difficulty).sum::<f64>() / n,
                    avg_duration_secs: records.iter().map(|r| r.duration_secs).sum::<f64>() / n,
                }
            })
            .collect())
    }

    /// Summaries restricted to one child profile
    pub fn summaries_for_profile(&self, profile: &str) -> Result<Vec<FeedbackSummary>> {
        Ok(self
            .summaries()?
            .into_iter()
            .filter(|s| s.child_profile == profile)
            .collect())
    }
}

/// Convenience constructor for a record
impl FeedbackRecord {
    pub fn new(spawn_id: u64, child_profile: impl Into<String>, quality: f64) -> Self {
        Self {
            spawn_id,
            child_profile: child_profile.into(),
            parent_role: None,
            parent_position: None,
            quality,
            difficulty: 0.0,
            duration_secs: 0.0,
            note: None,
            at: now_ms(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn ledger() -> (TempDir, FeedbackLedger) {
        let temp = TempDir::new().unwrap();
        let ledger = FeedbackLedger::in_root(temp.path());
        (temp, ledger)
    }

    #[test]
    fn test_append_and_read() {
        let (_t, ledger) = ledger();
        ledger.append(&FeedbackRecord::new(1, "dev", 0.8)).unwrap();
        ledger.append(&FeedbackRecord::new(2, "dev", 0.4)).unwrap();

        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_last_record_per_spawn_wins() {
        let (_t, ledger) = ledger();
        ledger.append(&FeedbackRecord::new(1, "dev", 0.2)).unwrap();
        ledger.append(&FeedbackRecord::new(1, "dev", 0.9)).unwrap();

        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].quality, 0.9);
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let (_t, ledger) = ledger();
        ledger.append(&FeedbackRecord::new(1, "dev", 1.0)).unwrap();
        std::fs::write(
            ledger.path(),
            format!(
                "{}\nnot json at all\n{{\"half\": true\n",
                std::fs::read_to_string(ledger.path()).unwrap().trim_end()
            ),
        )
        .unwrap();
        ledger.append(&FeedbackRecord::new(2, "reviewer", 0.5)).unwrap();

        let records = ledger.records().unwrap();
        assert_eq!(records.len(), 2);
    }

    #[test]
    fn test_summaries_group_and_average() {
        let (_t, ledger) = ledger();
        let mut a = FeedbackRecord::new(1, "dev", 0.6);
        a.parent_role = Some("lead".to_string());
        a.duration_secs = 10.0;
        let mut b = FeedbackRecord::new(2, "dev", 1.0);
        b.parent_role = Some("lead".to_string());
        b.duration_secs = 30.0;
        let c = FeedbackRecord::new(3, "reviewer", 0.5);
        ledger.append(&a).unwrap();
        ledger.append(&b).unwrap();
        ledger.append(&c).unwrap();

        let summaries = ledger.summaries().unwrap();
        assert_eq!(summaries.len(), 2);

        let dev = summaries.iter().find(|s| s.child_profile == "dev").unwrap();
        assert_eq!(dev.count, 2);
        assert!((dev.avg_quality - 0.8).abs() < 1e-9);
        assert!((dev.avg_duration_secs - 20.0).abs() < 1e-9);

        let only_dev = ledger.summaries_for_profile("dev").unwrap();
        assert_eq!(only_dev.len(), 1);
    }

    #[test]
    fn test_missing_ledger_reads_empty() {
        let (_t, ledger) = ledger();
        assert!(ledger.records().unwrap().is_empty());
        assert!(ledger.summaries().unwrap().is_empty());
    }
}
