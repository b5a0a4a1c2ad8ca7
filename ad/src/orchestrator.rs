//! Orchestrator: turns a spawn request into a child daemon in a worktree
//!
//! Process-wide; bounded by the step's delegation rules. Each spawn gets a
//! monitor task that propagates the child session's status into the spawn
//! record, and merge/reject/diff settle the worktree afterwards.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use adafstore::{
    FeedbackLedger, FeedbackRecord, NewSpawn, SessionStatus, SessionStore, SpawnDirection, SpawnMessage,
    SpawnMessageKind, SpawnRecord, SpawnStatus, Store, StoreError,
};

use crate::config::Config;
use crate::r#loop::{DelegationTree, LoopDefinition};
use crate::session::daemon::{self, DaemonConfig};
use crate::session::protocol::SpawnRequest;
use crate::worktree::{WorktreeError, WorktreeManager};

/// Child session monitor poll tick
const MONITOR_TICK: Duration = Duration::from_millis(500);

/// Reply poll tick for parent asks
const ASK_TICK: Duration = Duration::from_secs(2);

/// Cap on the result text lifted from the child's final output
const RESULT_CAP: usize = 2000;

type Result<T> = std::result::Result<T, StoreError>;

/// How child sessions are hosted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchMode {
    /// Fork a detached daemon process (production)
    Detached,
    /// Run the child session on this runtime (tests, foreground tooling)
    Inline,
}

/// The spawn orchestrator of one daemon process
pub struct Orchestrator {
    store: Store,
    config: Arc<Config>,
    sessions: SessionStore,
    project_dir: PathBuf,
    worktrees: Arc<WorktreeManager>,
    ledger: FeedbackLedger,
    launch: LaunchMode,
}

impl Orchestrator {
    pub fn new(
        store: Store,
        config: Arc<Config>,
        sessions: SessionStore,
        project_dir: PathBuf,
        launch: LaunchMode,
    ) -> Self {
        let worktrees = Arc::new(WorktreeManager::new(project_dir.clone()));
        let ledger = FeedbackLedger::in_root(sessions.root());
        Self {
            store,
            config,
            sessions,
            project_dir,
            worktrees,
            ledger,
            launch,
        }
    }

    pub fn worktrees(&self) -> Arc<WorktreeManager> {
        self.worktrees.clone()
    }

    /// Validate a request against the step's delegation policy
    fn validate(&self, request: &SpawnRequest, delegation: Option<&DelegationTree>) -> Result<()> {
        let delegation =
            delegation.ok_or_else(|| StoreError::Invalid("this step may not spawn child agents".to_string()))?;
        let rule = delegation.rule_for(&request.child_profile).ok_or_else(|| {
            StoreError::Invalid(format!(
                "profile {} is not delegable from this step",
                request.child_profile
            ))
        })?;
        if self.config.profile(&request.child_profile).is_none() {
            return Err(StoreError::Invalid(format!(
                "unknown child profile {}",
                request.child_profile
            )));
        }

        let live: Vec<SpawnRecord> = self
            .store
            .spawns_for_turn(request.parent_turn)?
            .into_iter()
            .filter(|s| !s.status.is_terminal())
            .collect();
        let parallel = delegation.parallel.min(self.config.limits.max_parallel_spawns).max(1);
        if live.len() >= parallel {
            return Err(StoreError::Conflict(format!(
                "parallel spawn limit reached ({} live, limit {})",
                live.len(),
                parallel
            )));
        }
        let same_profile = live.iter().filter(|s| s.child_profile == request.child_profile).count();
        if same_profile >= rule.max_instances.max(1) {
            return Err(StoreError::Conflict(format!(
                "max instances of profile {} reached ({})",
                request.child_profile,
                rule.max_instances.max(1)
            )));
        }
        Ok(())
    }

    /// Execute the spawn flow: record, worktree, child daemon, monitor
    pub fn spawn<'a>(
        &'a self,
        request: SpawnRequest,
        delegation: Option<&'a DelegationTree>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<SpawnRecord>> + Send + 'a>> {
        Box::pin(self.spawn_inner(request, delegation))
    }

    async fn spawn_inner(&self, request: SpawnRequest, delegation: Option<&DelegationTree>) -> Result<SpawnRecord> {
        debug!(parent_turn = request.parent_turn, child = %request.child_profile, "spawn: requested");
        self.validate(&request, delegation)?;

        let profile = self
            .config
            .profile(&request.child_profile)
            .cloned()
            .ok_or_else(|| StoreError::Invalid(format!("unknown child profile {}", request.child_profile)))?;

        let spawn = self.store.create_spawn(NewSpawn {
            parent_turn: request.parent_turn,
            parent_profile: request.parent_profile.clone(),
            child_profile: request.child_profile.clone(),
            child_role: request.role.clone().or(Some(profile.role.clone())),
            child_position: request.position.clone(),
            task: request.task.clone(),
            issues: request.issues.clone(),
            read_only: request.read_only,
        })?;

        let work_dir = if request.read_only {
            self.project_dir.clone()
        } else {
            let (path, branch) = self.worktrees.spawn_paths(spawn.id);
            if let Err(e) = self.worktrees.create(&path, &branch, "HEAD").await {
                self.store.update_spawn(spawn.id, |s| {
                    s.status = SpawnStatus::Failed;
                    s.result = Some(format!("worktree setup failed: {}", e));
                })?;
                return Err(StoreError::Internal(format!("creating worktree: {}", e)));
            }
            self.store.update_spawn(spawn.id, |s| {
                s.worktree = Some(path.display().to_string());
                s.branch = Some(branch.clone());
            })?;
            path
        };

        let child_cfg = DaemonConfig {
            project_dir: self.project_dir.clone(),
            work_dir,
            definition: LoopDefinition::single_step(
                format!("spawn:{}", request.child_profile),
                request.child_profile.clone(),
                request.task.clone(),
            ),
            snapshot: (*self.config).clone(),
            plan: None,
            parent_turn: Some(request.parent_turn),
        };

        let session_id = daemon::create_session(&self.sessions, &child_cfg)
            .map_err(|e| StoreError::Internal(format!("creating child session: {:#}", e)))?;
        self.store
            .update_spawn(spawn.id, |s| s.child_session = Some(session_id))?;

        match self.launch {
            LaunchMode::Detached => {
                if let Err(e) = daemon::start_detached(&self.sessions, session_id).await {
                    self.store.update_spawn(spawn.id, |s| {
                        s.status = SpawnStatus::Failed;
                        s.result = Some(format!("child daemon failed to start: {:#}", e));
                    })?;
                    return Err(StoreError::DaemonUnavailable(format!("{:#}", e)));
                }
            }
            LaunchMode::Inline => {
                let sessions = self.sessions.clone();
                let fut: std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> = Box::pin(async move {
                    if let Err(e) =
                        daemon::run_session(sessions, session_id, CancellationToken::new(), LaunchMode::Inline, false)
                            .await
                    {
                        warn!(session_id, error = %e, "inline child session failed");
                    }
                });
                tokio::spawn(fut);
            }
        }

        self.start_monitor(spawn.id, session_id);
        info!(spawn_id = spawn.id, session_id, "spawn: child launched");
        self.store.spawn_record(spawn.id)
    }

    /// Track the child session and propagate its status into the spawn record
    fn start_monitor(&self, spawn_id: u64, session_id: u64) {
        let store = self.store.clone();
        let sessions = self.sessions.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(MONITOR_TICK).await;
                let meta = match sessions.meta(session_id) {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!(session_id, error = %e, "spawn monitor: cannot read child meta");
                        continue;
                    }
                };

                // Record the child's first turn id as soon as it exists
                if let Some(run_id) = meta.loop_run {
                    let first_turn = store.loop_run(run_id).ok().and_then(|r| r.turn_ids.first().copied());
                    if let Some(first_turn) = first_turn {
                        let needs_update = store
                            .spawn_record(spawn_id)
                            .map(|s| s.child_turn.is_none())
                            .unwrap_or(false);
                        if needs_update {
                            let _ = store.update_spawn(spawn_id, |s| s.child_turn = Some(first_turn));
                        }
                    }
                }

                if !meta.status.is_terminal() {
                    continue;
                }

                let status = match meta.status {
                    SessionStatus::Done => SpawnStatus::Completed,
                    SessionStatus::Cancelled => SpawnStatus::Cancelled,
                    // An error or a dead pid both count as failure
                    _ => SpawnStatus::Failed,
                };
                let (exit_code, result) = child_outcome(&store, &meta);
                // A dead or errored child with no recorded exit reports -1
                let exit_code = exit_code.or(if status == SpawnStatus::Failed { Some(-1) } else { None });
                let _ = store.update_spawn(spawn_id, |s| {
                    // merge/reject may have settled the record already
                    if !s.status.is_terminal() {
                        s.status = status;
                        s.exit_code = exit_code;
                        if s.result.is_none() {
                            s.result = result.clone();
                        }
                    }
                });
                debug!(spawn_id, session_id, %status, "spawn monitor: child settled");
                break;
            }
        });
    }

    /// Block until a spawn reaches a terminal status
    pub async fn wait_spawn(&self, spawn_id: u64, timeout: Duration) -> Result<SpawnRecord> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let spawn = self.store.spawn_record(spawn_id)?;
            if spawn.status.is_terminal() {
                return Ok(spawn);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::Timeout(format!("spawn {} still {}", spawn_id, spawn.status)));
            }
            tokio::time::sleep(MONITOR_TICK).await;
        }
    }

    /// Merge a spawn's branch into the parent HEAD
    ///
    /// On conflict the spawn stays `completed` and the git error surfaces.
    pub async fn merge(&self, spawn_id: u64, squash: bool) -> Result<SpawnRecord> {
        let spawn = self.store.spawn_record(spawn_id)?;
        let branch = spawn
            .branch
            .clone()
            .ok_or_else(|| StoreError::Invalid(format!("spawn {} has no branch to merge", spawn_id)))?;

        match self.worktrees.merge(&branch, squash).await {
            Ok(hash) => {
                if let Some(path) = &spawn.worktree {
                    let _ = self.worktrees.remove(std::path::Path::new(path), Some(&branch)).await;
                }
                let updated = self.store.update_spawn(spawn_id, |s| {
                    s.status = SpawnStatus::Merged;
                    s.merge_commit = Some(hash.clone());
                })?;
                info!(spawn_id, merge_commit = %hash, "spawn merged");
                Ok(updated)
            }
            Err(WorktreeError::MergeConflict(message)) => Err(StoreError::Conflict(format!(
                "merging spawn {}: {}",
                spawn_id, message
            ))),
            Err(e) => Err(StoreError::Internal(format!("merging spawn {}: {}", spawn_id, e))),
        }
    }

    /// Discard a spawn's worktree and branch; idempotent
    pub async fn reject(&self, spawn_id: u64) -> Result<SpawnRecord> {
        let spawn = self.store.spawn_record(spawn_id)?;
        if let Some(path) = &spawn.worktree {
            self.worktrees
                .remove(std::path::Path::new(path), spawn.branch.as_deref())
                .await
                .map_err(|e| StoreError::Internal(format!("rejecting spawn {}: {}", spawn_id, e)))?;
        }
        let updated = self.store.update_spawn(spawn_id, |s| s.status = SpawnStatus::Rejected)?;
        info!(spawn_id, "spawn rejected");
        Ok(updated)
    }

    /// Raw diff of the spawn branch against its merge base with HEAD
    pub async fn diff(&self, spawn_id: u64) -> Result<String> {
        let spawn = self.store.spawn_record(spawn_id)?;
        let branch = spawn
            .branch
            .ok_or_else(|| StoreError::Invalid(format!("spawn {} has no branch to diff", spawn_id)))?;
        let base = self
            .worktrees
            .merge_base(&branch)
            .await
            .map_err(|e| StoreError::Internal(format!("diffing spawn {}: {}", spawn_id, e)))?;
        self.worktrees
            .diff(&branch, &base)
            .await
            .map_err(|e| StoreError::Internal(format!("diffing spawn {}: {}", spawn_id, e)))
    }

    /// Post a child ask and block until the parent replies
    pub async fn ask_parent(&self, spawn_id: u64, question: &str, timeout: Duration) -> Result<SpawnMessage> {
        let ask = self.store.post_spawn_message(
            spawn_id,
            SpawnDirection::ChildToParent,
            SpawnMessageKind::Ask,
            question,
            None,
            false,
        )?;

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let reply = self
                .store
                .spawn_messages(spawn_id)?
                .into_iter()
                .find(|m| m.kind == SpawnMessageKind::Reply && m.reply_to == Some(ask.id));
            if let Some(reply) = reply {
                self.store.mark_spawn_message_read(spawn_id, reply.id)?;
                return Ok(reply);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(StoreError::Timeout(format!(
                    "no reply to ask {} on spawn {}",
                    ask.id, spawn_id
                )));
            }
            tokio::time::sleep(ASK_TICK).await;
        }
    }

    /// Answer a pending ask
    pub fn reply(&self, spawn_id: u64, answer: &str) -> Result<SpawnMessage> {
        self.store.post_spawn_message(
            spawn_id,
            SpawnDirection::ParentToChild,
            SpawnMessageKind::Reply,
            answer,
            None,
            false,
        )
    }

    /// Record feedback for a settled spawn
    pub fn record_feedback(&self, record: &FeedbackRecord) -> Result<()> {
        self.ledger.append(record)
    }

    /// Feedback-ledger hints for candidate child profiles, as prompt text
    pub fn spawn_hints(&self, profiles: &[String]) -> Result<String> {
        let mut text = String::new();
        for profile in profiles {
            for summary in self.ledger.summaries_for_profile(profile)? {
                text.push_str(&format!(
                    "- {} ({}x): avg quality {:.2}, avg duration {:.0}s{}\n",
                    summary.child_profile,
                    summary.count,
                    summary.avg_quality,
                    summary.avg_duration_secs,
                    summary
                        .parent_role
                        .as_deref()
                        .map(|r| format!(" [under {}]", r))
                        .unwrap_or_default(),
                ));
            }
        }
        Ok(text)
    }
}

/// Exit code and result text of a finished child session
fn child_outcome(store: &Store, meta: &adafstore::SessionMeta) -> (Option<i32>, Option<String>) {
    let Some(run_id) = meta.loop_run else {
        return (None, meta.error.clone());
    };
    let Ok(run) = store.loop_run(run_id) else {
        return (None, meta.error.clone());
    };
    let Some(&last_turn) = run.turn_ids.last() else {
        return (None, meta.error.clone());
    };

    let exit_code = store.turn(last_turn).ok().and_then(|t| t.exit_code);
    let output: String = store
        .read_events(last_turn)
        .unwrap_or_default()
        .into_iter()
        .filter(|e| e.kind == adafstore::RecordedEventKind::Stdout)
        .map(|e| e.data)
        .collect();
    let mut result = output.trim().to_string();
    if result.len() > RESULT_CAP {
        let mut cut = result.len() - RESULT_CAP;
        while cut < result.len() && !result.is_char_boundary(cut) {
            cut += 1;
        }
        result.drain(..cut);
    }
    let result = if result.is_empty() { meta.error.clone() } else { Some(result) };
    (exit_code, result)
}
