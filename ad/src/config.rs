//! Global configuration: agent overrides, profiles, loop definitions, limits
//!
//! Loaded from `$HOME/.adaf/config.json` (or an explicit `--config` path).
//! A malformed explicit config is fatal; a malformed discovered config logs
//! a warning and falls back to defaults.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use eyre::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::r#loop::LoopDefinition;

/// Per-agent-kind command override
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentOverride {
    /// Replacement command path
    pub command: Option<String>,
    /// Extra argv prepended to the profile's args
    pub args: Vec<String>,
    /// Extra environment
    pub env: BTreeMap<String, String>,
}

/// A named agent profile selectable by loop steps
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    /// Agent kind resolved through the registry
    pub agent: String,
    /// Model identifier passed through to the agent
    pub model: String,
    /// Default role tag
    pub role: String,
    /// Opaque argv fragment appended at launch
    pub args: Vec<String>,
    /// Extra environment for the agent process
    pub env: BTreeMap<String, String>,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            agent: "generic".to_string(),
            model: "default".to_string(),
            role: "worker".to_string(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }
}

/// Operational limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Limits {
    /// Hard ceiling on concurrent spawns regardless of delegation rules
    pub max_parallel_spawns: usize,
    /// Captured-stdout cap in bytes; 0 = unbounded
    pub output_cap_bytes: usize,
    /// Wait-checkpoint periodic review interval
    pub review_interval_secs: u64,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_parallel_spawns: 4,
            output_cap_bytes: 0,
            review_interval_secs: 120,
        }
    }
}

/// The global config file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub agents: BTreeMap<String, AgentOverride>,
    pub profiles: BTreeMap<String, Profile>,
    pub loops: BTreeMap<String, LoopDefinition>,
    pub limits: Limits,
}

impl Config {
    /// Load with the fallback chain: explicit path > `<root>/config.json` > defaults
    ///
    /// Agent command overrides from `<root>/agents.json` are merged on top in
    /// every case.
    pub fn load(explicit: Option<&PathBuf>, global_root: &Path) -> Result<Self> {
        let mut config = if let Some(path) = explicit {
            Self::load_from_file(path).context(format!("loading config from {}", path.display()))?
        } else {
            let discovered = global_root.join("config.json");
            if discovered.exists() {
                match Self::load_from_file(&discovered) {
                    Ok(config) => config,
                    Err(e) => {
                        warn!(path = %discovered.display(), error = %e, "ignoring malformed config, using defaults");
                        Self::default()
                    }
                }
            } else {
                Self::default()
            }
        };

        let agents_path = global_root.join("agents.json");
        if agents_path.exists() {
            match fs::read_to_string(&agents_path)
                .context("reading agents file")
                .and_then(|s| serde_json::from_str::<BTreeMap<String, AgentOverride>>(&s).context("parsing agents file"))
            {
                Ok(overrides) => config.agents.extend(overrides),
                Err(e) => warn!(path = %agents_path.display(), error = %e, "ignoring malformed agents file"),
            }
        }

        Ok(config)
    }

    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).context("reading config file")?;
        let config: Self = serde_json::from_str(&content).context("parsing config file")?;
        info!(path = %path.display(), "loaded config");
        Ok(config)
    }

    /// Resolve a profile by name
    pub fn profile(&self, name: &str) -> Option<&Profile> {
        self.profiles.get(name)
    }

    /// Resolve a loop definition by name
    pub fn loop_def(&self, name: &str) -> Option<&LoopDefinition> {
        self.loops.get(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_nothing_found() {
        let temp = TempDir::new().unwrap();
        let config = Config::load(None, temp.path()).unwrap();
        assert!(config.profiles.is_empty());
        assert_eq!(config.limits.max_parallel_spawns, 4);
        assert_eq!(config.limits.output_cap_bytes, 0);
    }

    #[test]
    fn test_discovered_config_parsed() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("config.json"),
            r#"{
              "profiles": {
                "dev": {"agent": "generic", "model": "large", "role": "builder"}
              },
              "limits": {"max_parallel_spawns": 2}
            }"#,
        )
        .unwrap();

        let config = Config::load(None, temp.path()).unwrap();
        let dev = config.profile("dev").unwrap();
        assert_eq!(dev.model, "large");
        assert_eq!(dev.role, "builder");
        assert_eq!(config.limits.max_parallel_spawns, 2);
    }

    #[test]
    fn test_malformed_discovered_config_falls_back() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("config.json"), "{ not json").unwrap();
        let config = Config::load(None, temp.path()).unwrap();
        assert!(config.profiles.is_empty());
    }

    #[test]
    fn test_malformed_explicit_config_is_fatal() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mine.json");
        fs::write(&path, "{ not json").unwrap();
        assert!(Config::load(Some(&path), temp.path()).is_err());
    }

    #[test]
    fn test_agents_file_merges_overrides() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("config.json"),
            r#"{"agents": {"claude": {"args": ["--print"]}}}"#,
        )
        .unwrap();
        fs::write(
            temp.path().join("agents.json"),
            r#"{"claude": {"command": "/opt/claude"}, "codex": {"command": "/opt/codex"}}"#,
        )
        .unwrap();

        let config = Config::load(None, temp.path()).unwrap();
        // agents.json wins for kinds it names and adds new kinds
        assert_eq!(config.agents["claude"].command.as_deref(), Some("/opt/claude"));
        assert_eq!(config.agents["codex"].command.as_deref(), Some("/opt/codex"));
    }

    #[test]
    fn test_loop_definitions_load() {
        let temp = TempDir::new().unwrap();
        fs::write(
            temp.path().join("config.json"),
            r#"{
              "loops": {
                "build": {
                  "name": "build",
                  "steps": [
                    {"profile": "dev", "position": "worker", "role": "builder",
                     "turns": 2, "instructions": "implement the next phase"}
                  ]
                }
              }
            }"#,
        )
        .unwrap();

        let config = Config::load(None, temp.path()).unwrap();
        let def = config.loop_def("build").unwrap();
        assert_eq!(def.steps.len(), 1);
        assert_eq!(def.steps[0].turns, 2);
    }
}
