//! Per-turn recordings: an append-only event log plus a summary file
//!
//! One newline-delimited JSON record per event; concurrent writers are
//! serialised per turn. Timestamps are kept monotone non-decreasing within
//! a recording even if the wall clock steps back.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::fsutil::{self, now_ms};
use crate::store::Store;

/// Recorded event channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordedEventKind {
    Stdout,
    Stderr,
    Stdin,
    Meta,
    AgentStream,
}

/// One recorded event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordedEvent {
    pub ts: i64,
    pub kind: RecordedEventKind,
    pub data: String,
}

/// Aggregate view of a recording, rewritten after each append
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RecordingSummary {
    pub events: u64,
    pub first_ts: Option<i64>,
    pub last_ts: Option<i64>,
    pub bytes: u64,
}

impl Store {
    /// Append one event to a turn's recording
    pub fn append_event(&self, turn_id: u64, kind: RecordedEventKind, data: &str) -> Result<RecordedEvent> {
        let lock = self.entity_lock("record", &turn_id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.records_dir(turn_id);
        fsutil::ensure_dir(&dir)?;
        let summary_path = dir.join("summary.json");
        let events_path = dir.join("events.jsonl");

        let mut summary: RecordingSummary = match fsutil::read_json(&summary_path, "recording summary") {
            Ok(s) => s,
            Err(e) if e.is_not_found() => RecordingSummary::default(),
            Err(e) => return Err(e),
        };

        // Clamp so successive event timestamps never decrease
        let ts = now_ms().max(summary.last_ts.unwrap_or(i64::MIN));
        let event = RecordedEvent {
            ts,
            kind,
            data: data.to_string(),
        };
        let line = serde_json::to_string(&event)
            .map_err(|e| StoreError::Internal(format!("serializing recording event: {}", e)))?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&events_path)
            .map_err(|e| StoreError::io(format!("opening {}", events_path.display()), e))?;
        file.write_all(line.as_bytes())
            .and_then(|_| file.write_all(b"\n"))
            .map_err(|e| StoreError::io(format!("appending to {}", events_path.display()), e))?;

        summary.events += 1;
        summary.first_ts.get_or_insert(ts);
        summary.last_ts = Some(ts);
        summary.bytes += line.len() as u64 + 1;
        fsutil::write_json_atomic(&summary_path, &summary)?;

        debug!(turn_id, ?kind, bytes = data.len(), "append_event: recorded");
        Ok(event)
    }

    /// Read back a recording in append order
    pub fn read_events(&self, turn_id: u64) -> Result<Vec<RecordedEvent>> {
        let path = self.records_dir(turn_id).join("events.jsonl");
        let file = match fs::File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StoreError::io(format!("reading recording for turn {}", turn_id), e)),
        };

        let mut events = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line.map_err(|e| StoreError::io(format!("reading recording for turn {}", turn_id), e))?;
            if line.trim().is_empty() {
                continue;
            }
            let event: RecordedEvent = serde_json::from_str(&line)
                .map_err(|e| StoreError::Internal(format!("parsing recording for turn {}: {}", turn_id, e)))?;
            events.push(event);
        }
        Ok(events)
    }

    /// Read a recording's summary; zero-valued if nothing was recorded
    pub fn recording_summary(&self, turn_id: u64) -> Result<RecordingSummary> {
        match fsutil::read_json(&self.records_dir(turn_id).join("summary.json"), "recording summary") {
            Ok(s) => Ok(s),
            Err(e) if e.is_not_found() => Ok(RecordingSummary::default()),
            Err(e) => Err(e),
        }
    }
}
