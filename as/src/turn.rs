//! Turn records: one agent subprocess invocation each
//!
//! A turn is created when the runner launches the agent and finished once,
//! with the agent's narrative report. A finished turn (or one whose build
//! state is terminal) is frozen against further mutation.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::fsutil::{self, hex_alias, now_ms, record_path};
use crate::store::Store;

/// Build state that freezes a turn even without `finalized_at`
const TERMINAL_BUILD_STATE: &str = "success";

/// A turn record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub id: u64,
    /// Short random alias used in prompts and filenames
    pub hex: String,
    pub agent: String,
    pub profile: String,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub plan: Option<String>,
    /// Owning loop run, when run inside a loop
    #[serde(default)]
    pub loop_run_hex: Option<String>,
    /// Step instance inside the owning run
    #[serde(default)]
    pub step_hex: Option<String>,

    // narrative report, filled by finish
    #[serde(default)]
    pub objective: Option<String>,
    #[serde(default)]
    pub what_was_built: Option<String>,
    #[serde(default)]
    pub key_decisions: Option<String>,
    #[serde(default)]
    pub challenges: Option<String>,
    #[serde(default)]
    pub current_state: Option<String>,
    #[serde(default)]
    pub known_issues: Option<String>,
    #[serde(default)]
    pub next_steps: Option<String>,

    #[serde(default)]
    pub build_state: String,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub duration_ms: u64,
    pub started_at: i64,
    #[serde(default)]
    pub finalized_at: Option<i64>,
}

impl Turn {
    /// A frozen turn rejects `finish_turn`
    pub fn is_frozen(&self) -> bool {
        self.finalized_at.is_some() || self.build_state == TERMINAL_BUILD_STATE
    }
}

/// Input for turn creation
#[derive(Debug, Clone, Default)]
pub struct NewTurn {
    pub agent: String,
    pub profile: String,
    pub model: String,
    pub plan: Option<String>,
    pub loop_run_hex: Option<String>,
    pub step_hex: Option<String>,
}

/// Narrative fields accepted by `finish_turn`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnReport {
    pub objective: Option<String>,
    pub what_was_built: Option<String>,
    pub key_decisions: Option<String>,
    pub challenges: Option<String>,
    pub current_state: Option<String>,
    pub known_issues: Option<String>,
    pub next_steps: Option<String>,
    pub build_state: Option<String>,
}

impl Store {
    /// Create a turn with a fresh id and hex alias
    pub fn create_turn(&self, new: NewTurn) -> Result<Turn> {
        debug!(agent = %new.agent, profile = %new.profile, "create_turn: called");
        let id = self.alloc_id("turn")?;
        let turn = Turn {
            id,
            hex: hex_alias(),
            agent: new.agent,
            profile: new.profile,
            model: new.model,
            plan: new.plan,
            loop_run_hex: new.loop_run_hex,
            step_hex: new.step_hex,
            objective: None,
            what_was_built: None,
            key_decisions: None,
            challenges: None,
            current_state: None,
            known_issues: None,
            next_steps: None,
            build_state: String::new(),
            exit_code: None,
            duration_ms: 0,
            started_at: now_ms(),
            finalized_at: None,
        };
        fsutil::write_json_atomic(&record_path(&self.turns_dir(), id), &turn)?;
        Ok(turn)
    }

    pub fn turn(&self, id: u64) -> Result<Turn> {
        fsutil::read_json(&record_path(&self.turns_dir(), id), &format!("turn {}", id))
    }

    /// Resolve a turn by its hex alias
    pub fn turn_by_hex(&self, hex: &str) -> Result<Turn> {
        for id in fsutil::numeric_ids(&self.turns_dir()) {
            let turn = self.turn(id)?;
            if turn.hex == hex {
                return Ok(turn);
            }
        }
        Err(StoreError::NotFound(format!("turn {}", hex)))
    }

    pub fn list_turns(&self) -> Result<Vec<Turn>> {
        fsutil::numeric_ids(&self.turns_dir())
            .into_iter()
            .map(|id| self.turn(id))
            .collect()
    }

    /// Record the runner outcome (exit code + duration) without freezing
    pub fn record_turn_outcome(&self, id: u64, exit_code: i32, duration_ms: u64) -> Result<Turn> {
        let lock = self.entity_lock("turn", &id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut turn = self.turn(id)?;
        turn.exit_code = Some(exit_code);
        turn.duration_ms = duration_ms;
        fsutil::write_json_atomic(&record_path(&self.turns_dir(), id), &turn)?;
        Ok(turn)
    }

    /// Merge the agent's report and freeze the turn
    ///
    /// `Invalid` if the turn is already frozen.
    pub fn finish_turn(&self, id: u64, report: TurnReport) -> Result<Turn> {
        debug!(id, "finish_turn: called");
        let lock = self.entity_lock("turn", &id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut turn = self.turn(id)?;
        if turn.is_frozen() {
            return Err(StoreError::Invalid(format!("turn {} is frozen", id)));
        }

        if report.objective.is_some() {
            turn.objective = report.objective;
        }
        if report.what_was_built.is_some() {
            turn.what_was_built = report.what_was_built;
        }
        if report.key_decisions.is_some() {
            turn.key_decisions = report.key_decisions;
        }
        if report.challenges.is_some() {
            turn.challenges = report.challenges;
        }
        if report.current_state.is_some() {
            turn.current_state = report.current_state;
        }
        if report.known_issues.is_some() {
            turn.known_issues = report.known_issues;
        }
        if report.next_steps.is_some() {
            turn.next_steps = report.next_steps;
        }
        if let Some(build_state) = report.build_state {
            turn.build_state = build_state;
        }
        turn.finalized_at = Some(now_ms());
        fsutil::write_json_atomic(&record_path(&self.turns_dir(), id), &turn)?;
        Ok(turn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join(".adaf")).unwrap();
        (temp, store)
    }

    fn new_turn() -> NewTurn {
        NewTurn {
            agent: "generic".to_string(),
            profile: "ask:generic".to_string(),
            model: "default".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_assigns_id_and_hex() {
        let (_t, store) = store();
        let a = store.create_turn(new_turn()).unwrap();
        let b = store.create_turn(new_turn()).unwrap();

        assert_eq!(a.id, 1);
        assert_eq!(b.id, 2);
        assert_eq!(a.hex.len(), 8);
        assert_ne!(a.hex, b.hex);
    }

    #[test]
    fn test_lookup_by_hex() {
        let (_t, store) = store();
        let turn = store.create_turn(new_turn()).unwrap();
        assert_eq!(store.turn_by_hex(&turn.hex).unwrap().id, turn.id);
        assert!(store.turn_by_hex("ffffffff").unwrap_err().is_not_found());
    }

    #[test]
    fn test_finish_freezes() {
        let (_t, store) = store();
        let turn = store.create_turn(new_turn()).unwrap();

        let finished = store
            .finish_turn(turn.id, TurnReport {
                objective: Some("build the parser".to_string()),
                build_state: Some("tests passing".to_string()),
                ..Default::default()
            })
            .unwrap();
        assert!(finished.finalized_at.is_some());
        assert!(finished.is_frozen());

        let err = store.finish_turn(turn.id, TurnReport::default()).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn test_terminal_build_state_freezes_without_finalize() {
        let (_t, store) = store();
        let turn = store.create_turn(new_turn()).unwrap();

        // Simulate a record written by an older process that never finalized
        let mut raw = store.turn(turn.id).unwrap();
        raw.build_state = "success".to_string();
        crate::fsutil::write_json_atomic(&record_path(&store.turns_dir(), turn.id), &raw).unwrap();

        let err = store.finish_turn(turn.id, TurnReport::default()).unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn test_record_outcome_does_not_freeze() {
        let (_t, store) = store();
        let turn = store.create_turn(new_turn()).unwrap();
        let updated = store.record_turn_outcome(turn.id, 0, 1234).unwrap();
        assert_eq!(updated.exit_code, Some(0));
        assert_eq!(updated.duration_ms, 1234);
        assert!(!updated.is_frozen());

        store.finish_turn(turn.id, TurnReport::default()).unwrap();
    }
}
