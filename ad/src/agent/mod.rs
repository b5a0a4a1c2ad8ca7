//! Agent capability and registry
//!
//! Agents are external command-line binaries. The registry maps an agent
//! kind to the capability that knows how to synthesize its argv; unknown
//! kinds fall back to the generic passthrough (binary named after the
//! kind, prompt on stdin).

mod runner;

pub use runner::{AgentResult, OutputEvent, RunnerError, run_process};

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc::UnboundedSender;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::recorder::Recorder;

/// Everything one agent invocation needs
#[derive(Debug, Clone, Default)]
pub struct AgentConfig {
    /// Agent kind (registry key)
    pub kind: String,
    /// Command path override; defaults to the kind name on PATH
    pub command: Option<String>,
    /// Argv fragment after any registry-synthesized arguments
    pub args: Vec<String>,
    /// Environment additions
    pub env: BTreeMap<String, String>,
    /// Working directory of the child
    pub cwd: PathBuf,
    /// Prompt written to the child's stdin
    pub prompt: String,
    /// Optional wall-clock timeout
    pub timeout: Option<Duration>,
    /// Captured-stdout cap in bytes; 0 = unbounded
    pub output_cap: usize,
    /// Mirror the child's streams onto this process's stdout/stderr
    pub mirror: bool,
}

/// An agent capability: argv synthesis plus a run entry point
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry key
    fn kind(&self) -> &str;

    /// Synthesize `(program, argv)` for one invocation
    fn command(&self, cfg: &AgentConfig) -> (String, Vec<String>);

    /// Run one invocation as a subprocess
    async fn run(
        &self,
        cancel: CancellationToken,
        cfg: &AgentConfig,
        recorder: &Recorder,
        tap: Option<UnboundedSender<OutputEvent>>,
    ) -> Result<AgentResult, RunnerError> {
        let (program, args) = self.command(cfg);
        run_process(cancel, &program, &args, cfg, recorder, tap).await
    }
}

/// Passthrough agent: the binary is the kind (or the configured override),
/// argv comes straight from the profile
#[derive(Debug)]
struct GenericAgent {
    kind: String,
}

impl GenericAgent {
    fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }
}

#[async_trait]
impl Agent for GenericAgent {
    fn kind(&self) -> &str {
        &self.kind
    }

    fn command(&self, cfg: &AgentConfig) -> (String, Vec<String>) {
        let program = cfg.command.clone().unwrap_or_else(|| self.kind.clone());
        (program, cfg.args.clone())
    }
}

/// Shell agent: runs the prompt itself through `sh -c`
///
/// Used for stub profiles and loop steps whose instructions are literally a
/// command to execute.
#[derive(Debug)]
struct ScriptAgent;

#[async_trait]
impl Agent for ScriptAgent {
    fn kind(&self) -> &str {
        "script"
    }

    fn command(&self, cfg: &AgentConfig) -> (String, Vec<String>) {
        let program = cfg.command.clone().unwrap_or_else(|| "/bin/sh".to_string());
        let mut args = vec!["-c".to_string(), cfg.prompt.clone()];
        args.extend(cfg.args.clone());
        (program, args)
    }
}

/// Name-keyed agent registry, populated once at startup
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
}

impl AgentRegistry {
    /// Registry with the built-in agents
    pub fn standard() -> Self {
        let mut registry = Self {
            agents: HashMap::new(),
        };
        registry.register(Arc::new(ScriptAgent));
        registry
    }

    /// Register (or replace) an agent capability
    pub fn register(&mut self, agent: Arc<dyn Agent>) {
        debug!(kind = agent.kind(), "AgentRegistry::register");
        self.agents.insert(agent.kind().to_string(), agent);
    }

    /// Resolve a kind; unknown kinds get the generic passthrough
    pub fn resolve(&self, kind: &str) -> Arc<dyn Agent> {
        match self.agents.get(kind) {
            Some(agent) => agent.clone(),
            None => Arc::new(GenericAgent::new(kind)),
        }
    }
}

impl Default for AgentRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("kinds", &self.agents.keys().collect::<Vec<_>>())
            .finish()
    }
}
