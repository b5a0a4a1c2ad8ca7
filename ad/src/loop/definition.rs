//! Loop definitions: ordered steps binding profiles to instructions
//!
//! Definitions come from configuration and are immutable for the lifetime
//! of a run.

use serde::{Deserialize, Serialize};

use adafstore::StepMeta;

/// Position tag of the step that call-supervisor fast-forwards to
pub const SUPERVISOR_POSITION: &str = "supervisor";

/// Per-profile delegation rule
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationRule {
    /// Child profile this step may spawn
    pub profile: String,
    /// Ceiling on live spawns of this profile per parent turn
    pub max_instances: usize,
    /// Role handed to the child, defaults to the child profile's own role
    pub role: Option<String>,
    /// Position handed to the child
    pub position: Option<String>,
}

impl Default for DelegationRule {
    fn default() -> Self {
        Self {
            profile: String::new(),
            max_instances: 1,
            role: None,
            position: None,
        }
    }
}

/// A step's delegation policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DelegationTree {
    pub rules: Vec<DelegationRule>,
    /// Concurrent spawn ceiling for the whole step
    pub parallel: usize,
}

impl Default for DelegationTree {
    fn default() -> Self {
        Self {
            rules: Vec::new(),
            parallel: 1,
        }
    }
}

impl DelegationTree {
    /// The rule allowing `profile`, if any
    pub fn rule_for(&self, profile: &str) -> Option<&DelegationRule> {
        self.rules.iter().find(|r| r.profile == profile)
    }
}

/// One loop step
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StepDefinition {
    /// Profile name resolved against the config at run time
    pub profile: String,
    /// Position tag (e.g. `worker`, `supervisor`)
    pub position: String,
    /// Role tag handed to the agent
    pub role: String,
    /// Number of turns this step runs per cycle
    pub turns: u32,
    /// Opaque instruction text forming the prompt base
    pub instructions: String,
    /// Skill names surfaced to the agent
    pub skills: Vec<String>,
    /// Spawning policy; `None` forbids spawning entirely
    pub delegation: Option<DelegationTree>,
    /// May raise the run's stop signal
    pub can_stop: bool,
    /// May post loop messages to later steps
    pub can_message: bool,
    /// May send push notifications (surface flag, passed through)
    pub can_pushover: bool,
}

impl Default for StepDefinition {
    fn default() -> Self {
        Self {
            profile: String::new(),
            position: "worker".to_string(),
            role: "worker".to_string(),
            turns: 1,
            instructions: String::new(),
            skills: Vec::new(),
            delegation: None,
            can_stop: false,
            can_message: true,
            can_pushover: false,
        }
    }
}

/// A named loop definition
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopDefinition {
    pub name: String,
    pub steps: Vec<StepDefinition>,
    /// Cycle cap; 0 = unbounded, 1 = single-shot
    pub max_cycles: u64,
}

impl LoopDefinition {
    /// A one-step definition, used for single-shot asks and spawn children
    pub fn single_step(name: impl Into<String>, profile: impl Into<String>, instructions: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: vec![StepDefinition {
                profile: profile.into(),
                instructions: instructions.into(),
                ..Default::default()
            }],
            max_cycles: 1,
        }
    }

    /// Index of the supervisor step, if the loop has one
    pub fn supervisor_step(&self) -> Option<usize> {
        self.steps.iter().position(|s| s.position == SUPERVISOR_POSITION)
    }

    /// Step descriptors persisted on run and session records
    pub fn step_metas(&self) -> Vec<StepMeta> {
        self.steps
            .iter()
            .map(|s| StepMeta {
                profile: s.profile.clone(),
                position: s.position.clone(),
            })
            .collect()
    }
}
