//! The loop runtime: drives a run through cycles, steps, and turns
//!
//! One runtime instance per loop run, hosted by a session daemon. Signals
//! are polled from the store (100 ms tick while an agent runs); events flow
//! to the daemon as wire-shaped [`ServerMessage`]s, minus the terminal
//! `done` which the daemon emits itself.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use eyre::{Context, Result};
use serde_json::json;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use adafstore::{LoopRunRecord, LoopRunStatus, NewTurn, SignalKind, Store, hex_alias};

use super::definition::{LoopDefinition, StepDefinition};
use crate::agent::{AgentConfig, AgentRegistry, OutputEvent};
use crate::config::Config;
use crate::recorder::Recorder;
use crate::session::protocol::ServerMessage;

/// Signal poll tick while an agent runs
const SIGNAL_TICK: Duration = Duration::from_millis(100);

/// Spawn status poll tick inside a wait checkpoint
const WAIT_TICK: Duration = Duration::from_secs(2);

/// Terminal outcome of a run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopOutcome {
    pub status: LoopRunStatus,
    pub error: Option<String>,
}

impl LoopOutcome {
    fn done() -> Self {
        Self {
            status: LoopRunStatus::Done,
            error: None,
        }
    }
}

/// Why a step ended early
enum StepOutcome {
    Completed,
    Stopped,
    Cancelled,
    ProfileError(String),
}

/// Result of a wait checkpoint
enum WaitOutcome {
    Resume(String),
    Stopped,
    Cancelled,
}

/// A live loop runtime
pub struct LoopRuntime {
    store: Store,
    config: Arc<Config>,
    registry: Arc<AgentRegistry>,
    definition: LoopDefinition,
    repo_root: PathBuf,
    run_id: u64,
    run_hex: String,
    events: UnboundedSender<ServerMessage>,
    cancel: CancellationToken,
    session_id: u64,
    plan: Option<String>,
    parent_turn: Option<u64>,
    mirror: bool,
}

impl LoopRuntime {
    /// Create the runtime and its loop run record
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        store: Store,
        config: Arc<Config>,
        registry: Arc<AgentRegistry>,
        definition: LoopDefinition,
        repo_root: PathBuf,
        events: UnboundedSender<ServerMessage>,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let run = store
            .create_loop_run(&definition.name, definition.step_metas())
            .context("creating loop run record")?;
        debug!(run_id = run.id, run_hex = %run.hex, loop_name = %definition.name, "LoopRuntime::create");

        Ok(Self {
            store,
            config,
            registry,
            definition,
            repo_root,
            run_id: run.id,
            run_hex: run.hex,
            events,
            cancel,
            session_id: 0,
            plan: None,
            parent_turn: None,
            mirror: false,
        })
    }

    pub fn with_session(mut self, session_id: u64) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_plan(mut self, plan: Option<String>) -> Self {
        self.plan = plan;
        self
    }

    pub fn with_parent_turn(mut self, parent_turn: Option<u64>) -> Self {
        self.parent_turn = parent_turn;
        self
    }

    pub fn with_mirror(mut self, mirror: bool) -> Self {
        self.mirror = mirror;
        self
    }

    pub fn run_id(&self) -> u64 {
        self.run_id
    }

    pub fn run_hex(&self) -> &str {
        &self.run_hex
    }

    /// Drive the run to a terminal state
    ///
    /// `Err` is reserved for fatal store failures; every loop-level outcome
    /// (done, stopped, cancelled, profile error) is an `Ok` value.
    pub async fn run(self) -> Result<LoopOutcome> {
        info!(run_id = self.run_id, loop_name = %self.definition.name, "loop run starting");

        if self.definition.steps.is_empty() {
            debug!(run_id = self.run_id, "empty loop definition; finishing immediately");
            return self.finish(LoopOutcome::done());
        }

        let mut cycle: u64 = 0;
        let mut step_idx: usize = 0;

        loop {
            if self.cancel.is_cancelled() {
                return self.finish(LoopOutcome {
                    status: LoopRunStatus::Cancelled,
                    error: None,
                });
            }
            if self.store.take_signal(SignalKind::Stop, &self.run_hex)?.is_some() {
                info!(run_id = self.run_id, "stop signal; run stopping");
                return self.finish(LoopOutcome {
                    status: LoopRunStatus::Stopped,
                    error: None,
                });
            }

            match self.run_step(cycle, step_idx).await? {
                StepOutcome::Completed => {}
                StepOutcome::Stopped => {
                    return self.finish(LoopOutcome {
                        status: LoopRunStatus::Stopped,
                        error: None,
                    });
                }
                StepOutcome::Cancelled => {
                    return self.finish(LoopOutcome {
                        status: LoopRunStatus::Cancelled,
                        error: None,
                    });
                }
                StepOutcome::ProfileError(message) => {
                    return self.finish(LoopOutcome {
                        status: LoopRunStatus::Done,
                        error: Some(message),
                    });
                }
            }

            // Call-supervisor fast-forward, consumed atomically
            if self.store.take_signal(SignalKind::CallSupervisor, &self.run_hex)?.is_some() {
                match self.definition.supervisor_step() {
                    Some(sup) => {
                        info!(run_id = self.run_id, sup, "call-supervisor; fast-forwarding");
                        if sup <= step_idx {
                            cycle += 1;
                            if self.cycle_cap_reached(cycle) {
                                return self.finish(LoopOutcome::done());
                            }
                        }
                        step_idx = sup;
                        continue;
                    }
                    None => warn!(run_id = self.run_id, "call-supervisor signal but no supervisor step; ignoring"),
                }
            }

            step_idx += 1;
            if step_idx >= self.definition.steps.len() {
                step_idx = 0;
                cycle += 1;
                if self.cycle_cap_reached(cycle) {
                    return self.finish(LoopOutcome::done());
                }
            }
        }
    }

    fn cycle_cap_reached(&self, cycle: u64) -> bool {
        self.definition.max_cycles > 0 && cycle >= self.definition.max_cycles
    }

    /// Persist the terminal status and report the outcome
    fn finish(self, outcome: LoopOutcome) -> Result<LoopOutcome> {
        let error = outcome.error.clone();
        self.store
            .update_loop_run(self.run_id, |run| {
                run.status = outcome.status;
                run.error = error;
            })
            .context("persisting loop run outcome")?;
        info!(run_id = self.run_id, status = %outcome.status, "loop run finished");
        Ok(outcome)
    }

    /// Execute one step: `turns` sequential turns plus wait-checkpoint resumes
    async fn run_step(&self, cycle: u64, step_idx: usize) -> Result<StepOutcome> {
        let step = &self.definition.steps[step_idx];
        let step_hex = hex_alias();
        debug!(run_id = self.run_id, cycle, step_idx, profile = %step.profile, "run_step: starting");

        self.store
            .update_loop_run(self.run_id, |run| {
                run.cycle = cycle;
                run.step_index = step_idx;
                run.step_keys
                    .insert(LoopRunRecord::step_key(cycle, step_idx), step_hex.clone());
            })
            .context("persisting step cursor")?;

        self.emit_event(json!({
            "type": "step_start",
            "cycle": cycle,
            "step": step_idx,
            "profile": step.profile,
        }));

        let Some(profile) = self.config.profile(&step.profile).cloned() else {
            let message = format!("cannot resolve profile {}", step.profile);
            warn!(run_id = self.run_id, %message, "run_step: profile error");
            self.emit_event(json!({"type": "error", "message": message}));
            return Ok(StepOutcome::ProfileError(message));
        };
        let agent = self.registry.resolve(&profile.agent);

        let mut spawn_context: Option<String> = None;
        let mut executed: u32 = 0;
        let mut budget: u32 = step.turns.max(1);

        while executed < budget {
            if self.cancel.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }
            if self.store.signal_set(SignalKind::Stop, &self.run_hex) {
                return Ok(StepOutcome::Stopped);
            }

            let turn = self
                .store
                .create_turn(NewTurn {
                    agent: profile.agent.clone(),
                    profile: step.profile.clone(),
                    model: profile.model.clone(),
                    plan: self.plan.clone(),
                    loop_run_hex: Some(self.run_hex.clone()),
                    step_hex: Some(step_hex.clone()),
                })
                .context("creating turn record")?;
            self.store
                .update_loop_run(self.run_id, |run| run.turn_ids.push(turn.id))
                .context("linking turn to run")?;
            debug!(run_id = self.run_id, turn_id = turn.id, executed, budget, "run_step: turn starting");

            let messages = self.store.loop_messages_for_step(self.run_id, step_idx)?;
            let prompt = build_prompt(step, &messages, spawn_context.take());
            let cfg = self.agent_config(step, &profile, &turn.id, step_idx, prompt);
            let recorder = Recorder::new(self.store.clone(), turn.id);

            // Forward live stdout chunks to the daemon as raw events
            let (tap_tx, mut tap_rx) = tokio::sync::mpsc::unbounded_channel();
            let forward = {
                let events = self.events.clone();
                tokio::spawn(async move {
                    while let Some(event) = tap_rx.recv().await {
                        if let OutputEvent::Stdout(data) = event {
                            let _ = events.send(ServerMessage::Raw { data });
                        }
                    }
                })
            };

            // Poll the stop signal while the agent runs; stop cancels the turn
            let turn_cancel = self.cancel.child_token();
            let poller = {
                let store = self.store.clone();
                let run_hex = self.run_hex.clone();
                let token = turn_cancel.clone();
                tokio::spawn(async move {
                    while !token.is_cancelled() {
                        if store.signal_set(SignalKind::Stop, &run_hex) {
                            token.cancel();
                            break;
                        }
                        tokio::time::sleep(SIGNAL_TICK).await;
                    }
                })
            };

            let result = agent.run(turn_cancel.clone(), &cfg, &recorder, Some(tap_tx)).await;
            poller.abort();
            let _ = forward.await;

            match result {
                Ok(res) => {
                    self.store
                        .record_turn_outcome(turn.id, res.exit_code, res.duration.as_millis() as u64)
                        .context("recording turn outcome")?;
                    let _ = self.events.send(ServerMessage::Finished {
                        exit_code: res.exit_code,
                        duration_ns: res.duration.as_nanos() as u64,
                    });
                    if res.exit_code != 0 && !res.cancelled {
                        self.emit_event(json!({
                            "type": "agent_failed",
                            "turn": turn.id,
                            "exit_code": res.exit_code,
                        }));
                    }
                }
                Err(e) => {
                    // Runner errors end the turn but never the loop
                    warn!(turn_id = turn.id, error = %e, "run_step: agent runner error");
                    self.store
                        .record_turn_outcome(turn.id, -1, 0)
                        .context("recording turn outcome")?;
                    self.emit_event(json!({"type": "agent_error", "turn": turn.id, "message": e.to_string()}));
                    let _ = self.events.send(ServerMessage::Finished {
                        exit_code: -1,
                        duration_ns: 0,
                    });
                }
            }

            if let Some(last) = messages.iter().map(|m| m.id).max() {
                self.store.advance_loop_cursor(self.run_id, step_idx, last)?;
            }
            executed += 1;

            if self.cancel.is_cancelled() {
                return Ok(StepOutcome::Cancelled);
            }
            if self.store.signal_set(SignalKind::Stop, &self.run_hex) {
                return Ok(StepOutcome::Stopped);
            }

            // Interrupt truncates the step's remaining turns
            if self.store.take_signal(SignalKind::Interrupt, &turn.id.to_string())?.is_some() {
                info!(turn_id = turn.id, "interrupt signal; truncating step");
                self.emit_event(json!({"type": "interrupted", "turn": turn.id}));
                break;
            }

            // Wait checkpoint: suspend until owned spawns settle, then resume
            // this same step with the spawn context prepended
            if self.store.take_signal(SignalKind::Wait, &turn.id.to_string())?.is_some() {
                recorder.record_meta("waiting");
                self.emit_event(json!({"type": "waiting", "turn": turn.id}));
                match self.await_spawns(turn.id).await? {
                    WaitOutcome::Resume(context) => {
                        spawn_context = Some(context);
                        budget += 1;
                    }
                    WaitOutcome::Stopped => return Ok(StepOutcome::Stopped),
                    WaitOutcome::Cancelled => return Ok(StepOutcome::Cancelled),
                }
            }
        }

        self.emit_event(json!({"type": "step_end", "cycle": cycle, "step": step_idx}));
        Ok(StepOutcome::Completed)
    }

    /// Poll until every spawn owned by `turn_id` is terminal, or the review
    /// interval elapses
    async fn await_spawns(&self, turn_id: u64) -> Result<WaitOutcome> {
        let review_after = Duration::from_secs(self.config.limits.review_interval_secs.max(1));
        let started = tokio::time::Instant::now();
        loop {
            if self.cancel.is_cancelled() {
                return Ok(WaitOutcome::Cancelled);
            }
            if self.store.signal_set(SignalKind::Stop, &self.run_hex) {
                return Ok(WaitOutcome::Stopped);
            }

            let spawns = self.store.spawns_for_turn(turn_id)?;
            let all_settled = spawns.iter().all(|s| s.status.is_terminal());
            if all_settled || started.elapsed() >= review_after {
                debug!(turn_id, all_settled, "await_spawns: resuming step");
                return Ok(WaitOutcome::Resume(spawn_context_text(turn_id, &spawns)));
            }
            tokio::time::sleep(WAIT_TICK).await;
        }
    }

    fn emit_event(&self, json: serde_json::Value) {
        let _ = self.events.send(ServerMessage::Event { json });
    }

    /// Assemble the agent invocation, including the hierarchy environment
    fn agent_config(
        &self,
        step: &StepDefinition,
        profile: &crate::config::Profile,
        turn_id: &u64,
        step_idx: usize,
        prompt: String,
    ) -> AgentConfig {
        let agent_override = self.config.agents.get(&profile.agent);

        let mut args = Vec::new();
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        if let Some(o) = agent_override {
            args.extend(o.args.clone());
            env.extend(o.env.clone());
        }
        args.extend(profile.args.clone());
        env.extend(profile.env.clone());

        let project_dir = self
            .store
            .root()
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| self.repo_root.clone());

        env.insert("ADAF_AGENT".to_string(), "1".to_string());
        env.insert("ADAF_PROJECT_DIR".to_string(), project_dir.display().to_string());
        env.insert("ADAF_TURN_ID".to_string(), turn_id.to_string());
        env.insert("ADAF_PROFILE".to_string(), step.profile.clone());
        env.insert("ADAF_POSITION".to_string(), step.position.clone());
        env.insert("ADAF_ROLE".to_string(), step.role.clone());
        env.insert("ADAF_LOOP_RUN_ID".to_string(), self.run_hex.clone());
        env.insert("ADAF_LOOP_STEP_INDEX".to_string(), step_idx.to_string());
        env.insert("ADAF_SESSION_ID".to_string(), self.session_id.to_string());
        if let Some(plan) = &self.plan {
            env.insert("ADAF_PLAN_ID".to_string(), plan.clone());
        }
        if let Some(parent) = self.parent_turn {
            env.insert("ADAF_PARENT_TURN".to_string(), parent.to_string());
        }
        if let Some(delegation) = &step.delegation {
            if let Ok(json) = serde_json::to_string(delegation) {
                env.insert("ADAF_DELEGATION_JSON".to_string(), json);
            }
        }
        if let Ok(path) = std::env::var(crate::debug_log::DEBUG_LOG_ENV) {
            env.insert(crate::debug_log::DEBUG_LOG_ENV.to_string(), path);
        }

        AgentConfig {
            kind: profile.agent.clone(),
            command: agent_override.and_then(|o| o.command.clone()),
            args,
            env,
            cwd: self.repo_root.clone(),
            prompt,
            timeout: None,
            output_cap: self.config.limits.output_cap_bytes,
            mirror: self.mirror,
        }
    }
}

/// Effective prompt: spawn context, then instructions, then undelivered messages
fn build_prompt(step: &StepDefinition, messages: &[adafstore::LoopMessage], spawn_context: Option<String>) -> String {
    let mut prompt = String::new();
    if let Some(context) = spawn_context {
        prompt.push_str(&context);
        prompt.push_str("\n\n");
    }
    prompt.push_str(&step.instructions);
    if !step.skills.is_empty() {
        prompt.push_str("\n\nSkills available: ");
        prompt.push_str(&step.skills.join(", "));
    }
    if !messages.is_empty() {
        prompt.push_str("\n\nMessages from earlier steps:\n");
        for message in messages {
            prompt.push_str(&format!("- [step {} #{}] {}\n", message.author_step, message.id, message.content));
        }
    }
    prompt
}

/// Text block describing a turn's spawn results, prepended on wait resume
fn spawn_context_text(turn_id: u64, spawns: &[adafstore::SpawnRecord]) -> String {
    let mut text = format!("Results of the spawns launched from turn {}:\n", turn_id);
    if spawns.is_empty() {
        text.push_str("- none\n");
        return text;
    }
    for spawn in spawns {
        text.push_str(&format!(
            "- spawn {} ({}): {}{}{}\n",
            spawn.id,
            spawn.child_profile,
            spawn.status,
            spawn
                .exit_code
                .map(|c| format!(", exit {}", c))
                .unwrap_or_default(),
            spawn
                .result
                .as_deref()
                .map(|r| format!(": {}", r))
                .unwrap_or_default(),
        ));
    }
    text
}
