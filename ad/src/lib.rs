//! ADAF - agent development workflow orchestrator
//!
//! Coordinates external AI coding agents (subprocess CLIs) through cyclic
//! loops hosted in detached session daemons. Agents spawn child agents into
//! isolated git worktrees; every turn leaves a durable recording in the
//! project store.
//!
//! # Modules
//!
//! - [`agent`] - agent registry and the subprocess runner
//! - [`r#loop`] - loop definitions and the step/cycle runtime
//! - [`session`] - session daemons, control protocol, fan-out, client
//! - [`orchestrator`] - spawn lifecycle over git worktrees
//! - [`worktree`] - `git worktree` operations
//! - [`config`] - profiles, loop definitions, limits
//! - [`recorder`] - per-turn event persistence
//! - [`debug_log`] - process-labelled append-only debug log
//! - [`cli`] - command definitions and the agent-view gate

pub mod agent;
pub mod cli;
pub mod config;
pub mod debug_log;
pub mod orchestrator;
pub mod recorder;
pub mod session;
pub mod worktree;

// Note: 'loop' is a reserved keyword, so we use r#loop
#[path = "loop/mod.rs"]
pub mod r#loop;

// Re-export commonly used types
pub use agent::{Agent, AgentConfig, AgentRegistry, AgentResult, OutputEvent, RunnerError, run_process};
pub use cli::{AgentContext, Cli, Command, in_agent_context};
pub use config::{AgentOverride, Config, Limits, Profile};
pub use debug_log::{DEBUG_LOG_ENV, DebugLog};
pub use orchestrator::{LaunchMode, Orchestrator};
pub use r#loop::{
    DelegationRule, DelegationTree, LoopDefinition, LoopOutcome, LoopRuntime, SUPERVISOR_POSITION, StepDefinition,
};
pub use recorder::Recorder;
pub use session::{
    ClientMessage, DaemonConfig, EventHub, EventStream, ProtocolError, ServerMessage, SessionClient, SpawnRequest,
    create_session, read_daemon_config, run_session, start_detached,
};
pub use worktree::{WORKTREES_DIR, WorktreeError, WorktreeManager};
