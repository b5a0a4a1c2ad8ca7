//! CLI command definitions and the agent-view gate
//!
//! The same binary serves three callers: the user, the re-exec'd session
//! daemon child, and agents running inside a turn (`ADAF_AGENT=1`), which
//! see only the RPC command subset.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Env var marking an agent-context process
pub const AGENT_ENV: &str = "ADAF_AGENT";

/// ADAF - agent development workflow orchestrator
#[derive(Parser)]
#[command(
    name = "adaf",
    about = "Coordinates AI coding agents through loops, session daemons, and worktree spawns",
    version,
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(short = 'l', long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Initialise an ADAF store in the current repository
    Init,

    /// Start a loop run in a background session daemon
    Run {
        /// Loop name from config, or a profile name for a single-shot ask
        target: String,

        /// Task text for single-shot asks
        #[arg(short, long)]
        task: Option<String>,

        /// Override the loop's cycle cap
        #[arg(long)]
        max_cycles: Option<u64>,

        /// Plan scope for the run's turns
        #[arg(long)]
        plan: Option<String>,

        /// Run the daemon in this process instead of forking
        #[arg(short, long)]
        foreground: bool,
    },

    /// Attach to a running session and mirror its output
    Attach {
        /// Session id
        session: u64,

        /// Replay the journal from this byte offset
        #[arg(long)]
        replay_from: Option<u64>,
    },

    /// Stop a running session
    Stop {
        /// Session id
        session: u64,
    },

    /// List sessions
    Sessions,

    /// Internal: session daemon child entry (used by `run`)
    #[command(hide = true)]
    SessionDaemon {
        #[arg(long)]
        session: u64,
    },

    /// Merge a completed spawn's branch into the current HEAD
    Merge {
        /// Spawn id
        spawn: u64,

        /// Squash the spawn's commits into one
        #[arg(long)]
        squash: bool,
    },

    /// Reject a spawn: delete its worktree and branch
    Reject {
        /// Spawn id
        spawn: u64,
    },

    /// Show a spawn's diff against its merge base
    Diff {
        /// Spawn id
        spawn: u64,
    },

    /// Answer a spawn's pending ask
    SpawnReply {
        /// Spawn id
        spawn: u64,

        /// Reply text
        answer: String,
    },

    /// Agent view: launch a child agent in an isolated worktree
    Spawn {
        /// Child profile name
        profile: String,

        /// Task text handed to the child
        task: String,

        /// Skip worktree and branch creation
        #[arg(long)]
        read_only: bool,

        /// Issue ids attached to the task
        #[arg(long)]
        issue: Vec<u64>,

        /// Block until the child finishes and print its result
        #[arg(long)]
        wait: bool,
    },

    /// Agent view: suspend this step after the current turn until spawns settle
    WaitForSpawns,

    /// Agent view: post a message to later steps of this loop
    LoopMessage {
        /// Message text
        content: String,
    },

    /// Agent view: ask the parent turn a question and wait for the reply
    ParentAsk {
        /// Question text
        question: String,

        /// Reply timeout in seconds
        #[arg(long, default_value = "600")]
        timeout: u64,
    },

    /// Agent view (supervisor only): stop this loop run
    LoopStop,
}

impl Command {
    /// Commands an agent-context process may run
    pub fn allowed_in_agent_view(&self) -> bool {
        matches!(
            self,
            Self::Spawn { .. }
                | Self::WaitForSpawns
                | Self::LoopMessage { .. }
                | Self::ParentAsk { .. }
                | Self::LoopStop
        )
    }

    /// Commands that only make sense inside an agent context
    pub fn requires_agent_view(&self) -> bool {
        self.allowed_in_agent_view()
    }
}

/// True when this process runs inside an agent turn
pub fn in_agent_context() -> bool {
    std::env::var(AGENT_ENV).map(|v| v == "1").unwrap_or(false)
}

/// The hierarchy context handed to agent processes via the environment
#[derive(Debug, Clone)]
pub struct AgentContext {
    pub project_dir: PathBuf,
    pub turn_id: u64,
    pub session_id: u64,
    pub profile: String,
    pub position: String,
    pub role: String,
    pub plan: Option<String>,
    pub loop_run_hex: Option<String>,
    pub step_index: Option<usize>,
    pub parent_turn: Option<u64>,
}

impl AgentContext {
    /// Read the `ADAF_*` context; errors name the first missing variable
    pub fn from_env() -> eyre::Result<Self> {
        fn need(name: &str) -> eyre::Result<String> {
            std::env::var(name).map_err(|_| eyre::eyre!("missing {} in agent environment", name))
        }
        Ok(Self {
            project_dir: PathBuf::from(need("ADAF_PROJECT_DIR")?),
            turn_id: need("ADAF_TURN_ID")?.parse()?,
            session_id: need("ADAF_SESSION_ID")?.parse()?,
            profile: need("ADAF_PROFILE")?,
            position: need("ADAF_POSITION")?,
            role: need("ADAF_ROLE")?,
            plan: std::env::var("ADAF_PLAN_ID").ok(),
            loop_run_hex: std::env::var("ADAF_LOOP_RUN_ID").ok(),
            step_index: std::env::var("ADAF_LOOP_STEP_INDEX").ok().and_then(|v| v.parse().ok()),
            parent_turn: std::env::var("ADAF_PARENT_TURN").ok().and_then(|v| v.parse().ok()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use serial_test::serial;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_agent_view_partition() {
        let spawn = Command::Spawn {
            profile: "dev".to_string(),
            task: "x".to_string(),
            read_only: false,
            issue: vec![],
            wait: false,
        };
        assert!(spawn.allowed_in_agent_view());
        assert!(!Command::Init.allowed_in_agent_view());
        assert!(!Command::Sessions.allowed_in_agent_view());
        assert!(Command::LoopStop.allowed_in_agent_view());
    }

    #[test]
    #[serial]
    fn test_agent_context_detection() {
        unsafe { std::env::remove_var(AGENT_ENV) };
        assert!(!in_agent_context());
        unsafe { std::env::set_var(AGENT_ENV, "1") };
        assert!(in_agent_context());
        unsafe { std::env::remove_var(AGENT_ENV) };
    }

    #[test]
    #[serial]
    fn test_agent_context_from_env() {
        let vars = [
            ("ADAF_PROJECT_DIR", "/work/demo"),
            ("ADAF_TURN_ID", "4"),
            ("ADAF_SESSION_ID", "2"),
            ("ADAF_PROFILE", "dev"),
            ("ADAF_POSITION", "worker"),
            ("ADAF_ROLE", "builder"),
            ("ADAF_LOOP_RUN_ID", "ab12cd34"),
            ("ADAF_LOOP_STEP_INDEX", "1"),
        ];
        for (k, v) in vars {
            unsafe { std::env::set_var(k, v) };
        }
        unsafe { std::env::remove_var("ADAF_PARENT_TURN") };
        unsafe { std::env::remove_var("ADAF_PLAN_ID") };

        let ctx = AgentContext::from_env().unwrap();
        assert_eq!(ctx.turn_id, 4);
        assert_eq!(ctx.loop_run_hex.as_deref(), Some("ab12cd34"));
        assert_eq!(ctx.step_index, Some(1));
        assert!(ctx.parent_turn.is_none());

        unsafe { std::env::remove_var("ADAF_TURN_ID") };
        assert!(AgentContext::from_env().is_err());

        for (k, _) in vars {
            unsafe { std::env::remove_var(k) };
        }
    }
}
