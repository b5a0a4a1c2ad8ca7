//! Loop run records and loop messages
//!
//! A loop run tracks the live cursor (cycle, step) of a loop definition,
//! the turns it produced, and the inter-step message stream with per-step
//! delivery cursors.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::fsutil::{self, hex_alias, now_ms, record_path};
use crate::store::Store;

/// Loop run status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoopRunStatus {
    #[default]
    Running,
    Stopped,
    Cancelled,
    Done,
}

impl std::fmt::Display for LoopRunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Stopped => write!(f, "stopped"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Done => write!(f, "done"),
        }
    }
}

/// Static per-step descriptor captured at run start
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepMeta {
    pub profile: String,
    pub position: String,
}

/// A loop run record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopRunRecord {
    pub id: u64,
    /// Short random alias; also the id of the run's stop/call-supervisor signals
    pub hex: String,
    pub loop_name: String,
    #[serde(default)]
    pub cycle: u64,
    #[serde(default)]
    pub step_index: usize,
    pub steps: Vec<StepMeta>,
    /// Turns produced, strictly increasing
    #[serde(default)]
    pub turn_ids: Vec<u64>,
    /// `cycle:step` -> step hex for each executed step instance
    #[serde(default)]
    pub step_keys: BTreeMap<String, String>,
    /// Per-step message delivery cursor (last consumed message id)
    #[serde(default)]
    pub cursors: BTreeMap<String, u64>,
    #[serde(default)]
    pub status: LoopRunStatus,
    #[serde(default)]
    pub error: Option<String>,
    pub started_at: i64,
    #[serde(default)]
    pub ended_at: Option<i64>,
}

impl LoopRunRecord {
    /// Key of the step instance at (cycle, step)
    pub fn step_key(cycle: u64, step: usize) -> String {
        format!("{}:{}", cycle, step)
    }
}

/// One inter-step loop message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopMessage {
    pub id: u64,
    pub run_id: u64,
    /// Index of the authoring step; delivered only to higher step indexes
    pub author_step: usize,
    pub content: String,
    pub created_at: i64,
}

impl Store {
    /// Create a loop run with its initial step list
    pub fn create_loop_run(&self, loop_name: &str, steps: Vec<StepMeta>) -> Result<LoopRunRecord> {
        debug!(loop_name, steps = steps.len(), "create_loop_run: called");
        let id = self.alloc_id("loop-run")?;
        let run = LoopRunRecord {
            id,
            hex: hex_alias(),
            loop_name: loop_name.to_string(),
            cycle: 0,
            step_index: 0,
            steps,
            turn_ids: Vec::new(),
            step_keys: BTreeMap::new(),
            cursors: BTreeMap::new(),
            status: LoopRunStatus::Running,
            error: None,
            started_at: now_ms(),
            ended_at: None,
        };
        fsutil::write_json_atomic(&record_path(&self.loop_runs_dir(), id), &run)?;
        Ok(run)
    }

    pub fn loop_run(&self, id: u64) -> Result<LoopRunRecord> {
        fsutil::read_json(&record_path(&self.loop_runs_dir(), id), &format!("loop run {}", id))
    }

    /// Resolve a run by its hex alias
    pub fn loop_run_by_hex(&self, hex: &str) -> Result<LoopRunRecord> {
        for id in fsutil::numeric_ids(&self.loop_runs_dir()) {
            let run = self.loop_run(id)?;
            if run.hex == hex {
                return Ok(run);
            }
        }
        Err(StoreError::NotFound(format!("loop run {}", hex)))
    }

    pub fn list_loop_runs(&self) -> Result<Vec<LoopRunRecord>> {
        fsutil::numeric_ids(&self.loop_runs_dir())
            .into_iter()
            .map(|id| self.loop_run(id))
            .collect()
    }

    /// Apply a mutation under the run entity lock
    ///
    /// Enforces that `step_index` stays inside the step list and that
    /// `turn_ids` remains strictly increasing.
    pub fn update_loop_run(&self, id: u64, mutate: impl FnOnce(&mut LoopRunRecord)) -> Result<LoopRunRecord> {
        let lock = self.entity_lock("loop-run", &id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut run = self.loop_run(id)?;
        mutate(&mut run);
        run.id = id;

        if !run.steps.is_empty() && run.step_index >= run.steps.len() {
            return Err(StoreError::Internal(format!(
                "loop run {}: step index {} out of range ({} steps)",
                id,
                run.step_index,
                run.steps.len()
            )));
        }
        if run.turn_ids.windows(2).any(|w| w[0] >= w[1]) {
            return Err(StoreError::Internal(format!(
                "loop run {}: turn ids must be strictly increasing",
                id
            )));
        }
        if run.status != LoopRunStatus::Running && run.ended_at.is_none() {
            run.ended_at = Some(now_ms());
        }

        fsutil::write_json_atomic(&record_path(&self.loop_runs_dir(), id), &run)?;
        Ok(run)
    }

    /// Post a loop message from a step
    pub fn post_loop_message(&self, run_id: u64, author_step: usize, content: &str) -> Result<LoopMessage> {
        debug!(run_id, author_step, "post_loop_message: called");
        let lock = self.entity_lock("loop-run", &run_id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        // Existence check; also validates author_step against the step list
        let run = self.loop_run(run_id)?;
        if author_step >= run.steps.len() {
            return Err(StoreError::Invalid(format!(
                "step {} out of range for loop run {}",
                author_step, run_id
            )));
        }

        let dir = self.loop_messages_dir(run_id);
        fsutil::ensure_dir(&dir)?;
        let id = fsutil::numeric_ids(&dir).last().copied().unwrap_or(0) + 1;
        let message = LoopMessage {
            id,
            run_id,
            author_step,
            content: content.to_string(),
            created_at: now_ms(),
        };
        fsutil::write_json_atomic(&record_path(&dir, id), &message)?;
        Ok(message)
    }

    /// All messages of a run in id order
    pub fn loop_messages(&self, run_id: u64) -> Result<Vec<LoopMessage>> {
        let dir = self.loop_messages_dir(run_id);
        fsutil::numeric_ids(&dir)
            .into_iter()
            .map(|id| fsutil::read_json(&record_path(&dir, id), &format!("loop message {}", id)))
            .collect()
    }

    /// Undelivered messages for a step: authored by a lower step index,
    /// with ids strictly greater than the step's cursor
    pub fn loop_messages_for_step(&self, run_id: u64, step_index: usize) -> Result<Vec<LoopMessage>> {
        let run = self.loop_run(run_id)?;
        let cursor = run.cursors.get(&step_index.to_string()).copied().unwrap_or(0);
        Ok(self
            .loop_messages(run_id)?
            .into_iter()
            .filter(|m| m.id > cursor && m.author_step < step_index)
            .collect())
    }

    /// Advance a step's delivery cursor after a turn consumed messages
    pub fn advance_loop_cursor(&self, run_id: u64, step_index: usize, last_id: u64) -> Result<LoopRunRecord> {
        self.update_loop_run(run_id, |run| {
            let entry = run.cursors.entry(step_index.to_string()).or_insert(0);
            if last_id > *entry {
                *entry = last_id;
            }
        })
    }
}
