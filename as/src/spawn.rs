//! Spawn records: child agent workflows launched from inside a turn
//!
//! A spawn owns its worktree and its child turn id. The parent/child
//! message channel lives alongside the record; at most one unanswered ask
//! exists per spawn.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::fsutil::{self, now_ms, record_path};
use crate::store::Store;

/// Spawn lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SpawnStatus {
    #[default]
    Running,
    /// Child posted an ask and is blocked on the parent's reply
    AwaitingInput,
    Completed,
    Failed,
    #[serde(alias = "canceled")]
    Cancelled,
    Merged,
    Rejected,
}

impl SpawnStatus {
    /// Terminal states: the child daemon is gone and the record settled
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Running | Self::AwaitingInput)
    }
}

impl std::fmt::Display for SpawnStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::AwaitingInput => write!(f, "awaiting_input"),
            Self::Completed => write!(f, "completed"),
            Self::Failed => write!(f, "failed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Merged => write!(f, "merged"),
            Self::Rejected => write!(f, "rejected"),
        }
    }
}

/// A spawn record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnRecord {
    pub id: u64,
    pub parent_turn: u64,
    pub parent_profile: String,
    pub child_profile: String,
    #[serde(default)]
    pub child_role: Option<String>,
    #[serde(default)]
    pub child_position: Option<String>,
    pub task: String,
    #[serde(default)]
    pub issues: Vec<u64>,
    #[serde(default)]
    pub read_only: bool,
    /// Worktree path; absent for read-only spawns
    #[serde(default)]
    pub worktree: Option<String>,
    /// Branch name; absent for read-only spawns
    #[serde(default)]
    pub branch: Option<String>,
    /// First turn id the child daemon produced
    #[serde(default)]
    pub child_turn: Option<u64>,
    /// Child session id, once the child daemon started
    #[serde(default)]
    pub child_session: Option<u64>,
    #[serde(default)]
    pub status: SpawnStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub merge_commit: Option<String>,
    #[serde(default)]
    pub result: Option<String>,
    pub started_at: i64,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

/// Message direction between parent and child
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnDirection {
    ChildToParent,
    ParentToChild,
}

/// Message semantics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpawnMessageKind {
    Ask,
    Reply,
    Message,
    Notify,
}

/// One parent/child message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpawnMessage {
    pub id: u64,
    pub spawn_id: u64,
    pub direction: SpawnDirection,
    pub kind: SpawnMessageKind,
    pub content: String,
    #[serde(default)]
    pub reply_to: Option<u64>,
    #[serde(default)]
    pub interrupt: bool,
    #[serde(default)]
    pub read: bool,
    pub created_at: i64,
}

/// Input for spawn creation
#[derive(Debug, Clone, Default)]
pub struct NewSpawn {
    pub parent_turn: u64,
    pub parent_profile: String,
    pub child_profile: String,
    pub child_role: Option<String>,
    pub child_position: Option<String>,
    pub task: String,
    pub issues: Vec<u64>,
    pub read_only: bool,
}

impl Store {
    /// Create a spawn record in `running` status
    pub fn create_spawn(&self, new: NewSpawn) -> Result<SpawnRecord> {
        debug!(parent_turn = new.parent_turn, child_profile = %new.child_profile, "create_spawn: called");
        let id = self.alloc_id("spawn")?;
        let spawn = SpawnRecord {
            id,
            parent_turn: new.parent_turn,
            parent_profile: new.parent_profile,
            child_profile: new.child_profile,
            child_role: new.child_role,
            child_position: new.child_position,
            task: new.task,
            issues: new.issues,
            read_only: new.read_only,
            worktree: None,
            branch: None,
            child_turn: None,
            child_session: None,
            status: SpawnStatus::Running,
            exit_code: None,
            merge_commit: None,
            result: None,
            started_at: now_ms(),
            completed_at: None,
        };
        fsutil::write_json_atomic(&record_path(&self.spawns_dir(), id), &spawn)?;
        Ok(spawn)
    }

    pub fn spawn_record(&self, id: u64) -> Result<SpawnRecord> {
        fsutil::read_json(&record_path(&self.spawns_dir(), id), &format!("spawn {}", id))
    }

    pub fn list_spawns(&self) -> Result<Vec<SpawnRecord>> {
        fsutil::numeric_ids(&self.spawns_dir())
            .into_iter()
            .map(|id| self.spawn_record(id))
            .collect()
    }

    /// Spawns owned by one parent turn
    pub fn spawns_for_turn(&self, parent_turn: u64) -> Result<Vec<SpawnRecord>> {
        Ok(self
            .list_spawns()?
            .into_iter()
            .filter(|s| s.parent_turn == parent_turn)
            .collect())
    }

    /// Apply a mutation under the spawn entity lock
    pub fn update_spawn(&self, id: u64, mutate: impl FnOnce(&mut SpawnRecord)) -> Result<SpawnRecord> {
        let lock = self.entity_lock("spawn", &id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut spawn = self.spawn_record(id)?;
        mutate(&mut spawn);
        spawn.id = id;
        if spawn.status.is_terminal() && spawn.completed_at.is_none() {
            spawn.completed_at = Some(now_ms());
        }
        fsutil::write_json_atomic(&record_path(&self.spawns_dir(), id), &spawn)?;
        Ok(spawn)
    }

    /// Post a message on a spawn's channel
    ///
    /// A `child_to_parent` ask transitions the spawn to `awaiting_input`
    /// and is rejected with `Conflict` while an earlier ask is unanswered.
    /// A reply to the pending ask transitions the spawn back to `running`.
    pub fn post_spawn_message(
        &self,
        spawn_id: u64,
        direction: SpawnDirection,
        kind: SpawnMessageKind,
        content: &str,
        reply_to: Option<u64>,
        interrupt: bool,
    ) -> Result<SpawnMessage> {
        debug!(spawn_id, ?direction, ?kind, "post_spawn_message: called");
        let lock = self.entity_lock("spawn", &spawn_id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let mut spawn = self.spawn_record(spawn_id)?;
        let messages = self.spawn_messages_unlocked(spawn_id)?;

        if kind == SpawnMessageKind::Ask && direction == SpawnDirection::ChildToParent {
            if Self::pending_ask(&messages).is_some() {
                return Err(StoreError::Conflict(format!(
                    "spawn {} already has an unanswered ask",
                    spawn_id
                )));
            }
            spawn.status = SpawnStatus::AwaitingInput;
        }

        if kind == SpawnMessageKind::Reply {
            let pending = Self::pending_ask(&messages);
            match (pending, reply_to) {
                (Some(ask), Some(to)) if ask.id != to => {
                    return Err(StoreError::Invalid(format!(
                        "reply targets message {} but the pending ask is {}",
                        to, ask.id
                    )));
                }
                (None, _) => {
                    return Err(StoreError::Invalid(format!("spawn {} has no pending ask", spawn_id)));
                }
                _ => {}
            }
            if spawn.status == SpawnStatus::AwaitingInput {
                spawn.status = SpawnStatus::Running;
            }
        }

        let id = messages.iter().map(|m| m.id).max().unwrap_or(0) + 1;
        let message = SpawnMessage {
            id,
            spawn_id,
            direction,
            kind,
            content: content.to_string(),
            reply_to: reply_to.or_else(|| {
                if kind == SpawnMessageKind::Reply {
                    Self::pending_ask(&messages).map(|m| m.id)
                } else {
                    None
                }
            }),
            interrupt,
            read: false,
            created_at: now_ms(),
        };

        let dir = self.spawn_messages_dir(spawn_id);
        fsutil::ensure_dir(&dir)?;
        fsutil::write_json_atomic(&record_path(&dir, id), &message)?;
        fsutil::write_json_atomic(&record_path(&self.spawns_dir(), spawn_id), &spawn)?;
        Ok(message)
    }

    /// All messages of a spawn, in id order
    pub fn spawn_messages(&self, spawn_id: u64) -> Result<Vec<SpawnMessage>> {
        let lock = self.entity_lock("spawn", &spawn_id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        self.spawn_messages_unlocked(spawn_id)
    }

    fn spawn_messages_unlocked(&self, spawn_id: u64) -> Result<Vec<SpawnMessage>> {
        let dir = self.spawn_messages_dir(spawn_id);
        fsutil::numeric_ids(&dir)
            .into_iter()
            .map(|id| fsutil::read_json(&record_path(&dir, id), &format!("spawn message {}", id)))
            .collect()
    }

    /// Mark a message consumed by its receiver
    pub fn mark_spawn_message_read(&self, spawn_id: u64, message_id: u64) -> Result<SpawnMessage> {
        let lock = self.entity_lock("spawn", &spawn_id.to_string());
        let _guard = lock.lock().unwrap_or_else(|e| e.into_inner());

        let dir = self.spawn_messages_dir(spawn_id);
        let path = record_path(&dir, message_id);
        let mut message: SpawnMessage = fsutil::read_json(&path, &format!("spawn message {}", message_id))?;
        message.read = true;
        fsutil::write_json_atomic(&path, &message)?;
        Ok(message)
    }

    /// The unanswered ask, if any, in a message list
    fn pending_ask(messages: &[SpawnMessage]) -> Option<&SpawnMessage> {
        messages
            .iter()
            .filter(|m| m.kind == SpawnMessageKind::Ask && m.direction == SpawnDirection::ChildToParent)
            .find(|ask| {
                !messages
                    .iter()
                    .any(|m| m.kind == SpawnMessageKind::Reply && m.reply_to == Some(ask.id))
            })
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

    fn new_spawn() -> NewSpawn {
        NewSpawn {
            parent_turn: 1,
            parent_profile: "lead".to_string(),
            child_profile: "dev".to_string(),
            task: "add file X".to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_create_starts_running() {
        let (_t, store) = store();
        let spawn = store.create_spawn(new_spawn()).unwrap();
        assert_eq!(spawn.id, 1);
        assert_eq!(spawn.status, SpawnStatus::Running);
        assert!(spawn.completed_at.is_none());
    }

    #[test]
    fn test_terminal_update_stamps_completed_at() {
        let (_t, store) = store();
        let spawn = store.create_spawn(new_spawn()).unwrap();
        let updated = store
            .update_spawn(spawn.id, |s| {
                s.status = SpawnStatus::Completed;
                s.exit_code = Some(0);
            })
            .unwrap();
        assert!(updated.completed_at.is_some());
    }

    #[test]
    fn test_single_unanswered_ask_invariant() {
        let (_t, store) = store();
        let spawn = store.create_spawn(new_spawn()).unwrap();

        let ask = store
            .post_spawn_message(
                spawn.id,
                SpawnDirection::ChildToParent,
                SpawnMessageKind::Ask,
                "which db?",
                None,
                false,
            )
            .unwrap();
        assert_eq!(store.spawn_record(spawn.id).unwrap().status, SpawnStatus::AwaitingInput);

        // Second ask while the first is unanswered
        let err = store
            .post_spawn_message(
                spawn.id,
                SpawnDirection::ChildToParent,
                SpawnMessageKind::Ask,
                "and the port?",
                None,
                false,
            )
            .unwrap_err();
        assert!(err.is_conflict());

        // Reply resolves it and resumes the spawn
        let reply = store
            .post_spawn_message(
                spawn.id,
                SpawnDirection::ParentToChild,
                SpawnMessageKind::Reply,
                "postgres",
                None,
                false,
            )
            .unwrap();
        assert_eq!(reply.reply_to, Some(ask.id));
        assert_eq!(store.spawn_record(spawn.id).unwrap().status, SpawnStatus::Running);

        // A new ask is allowed now
        store
            .post_spawn_message(
                spawn.id,
                SpawnDirection::ChildToParent,
                SpawnMessageKind::Ask,
                "and the port?",
                None,
                false,
            )
            .unwrap();
    }

    #[test]
    fn test_reply_without_ask_is_invalid() {
        let (_t, store) = store();
        let spawn = store.create_spawn(new_spawn()).unwrap();
        let err = store
            .post_spawn_message(
                spawn.id,
                SpawnDirection::ParentToChild,
                SpawnMessageKind::Reply,
                "nothing asked",
                None,
                false,
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::Invalid(_)));
    }

    #[test]
    fn test_notify_messages_do_not_gate() {
        let (_t, store) = store();
        let spawn = store.create_spawn(new_spawn()).unwrap();
        for n in 0..3 {
            store
                .post_spawn_message(
                    spawn.id,
                    SpawnDirection::ChildToParent,
                    SpawnMessageKind::Notify,
                    &format!("progress {}", n),
                    None,
                    false,
                )
                .unwrap();
        }
        let messages = store.spawn_messages(spawn.id).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(messages.iter().map(|m| m.id).collect::<Vec<_>>(), vec![1, 2, 3]);
        assert_eq!(store.spawn_record(spawn.id).unwrap().status, SpawnStatus::Running);
    }

    #[test]
    fn test_canceled_spelling_accepted_on_read() {
        let json = r#"{"id":1,"parent_turn":1,"parent_profile":"lead","child_profile":"dev",
            "task":"x","status":"canceled","started_at":0}"#;
        let spawn: SpawnRecord = serde_json::from_str(json).unwrap();
        assert_eq!(spawn.status, SpawnStatus::Cancelled);
    }

    #[test]
    fn test_spawns_for_turn_filters() {
        let (_t, store) = store();
        store.create_spawn(new_spawn()).unwrap();
        let mut other = new_spawn();
        other.parent_turn = 2;
        store.create_spawn(other).unwrap();

        assert_eq!(store.spawns_for_turn(1).unwrap().len(), 1);
        assert_eq!(store.spawns_for_turn(2).unwrap().len(), 1);
        assert_eq!(store.spawns_for_turn(3).unwrap().len(), 0);
    }
}
