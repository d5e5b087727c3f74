//! Orchestrator configuration stored under `.orchestrator/config.toml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::io::atomic::write_atomic;

/// Smallest accepted budget for agent output shown in summary mode.
pub const MIN_OUTPUT_MAX_CHARS: usize = 200;

/// Orchestrator configuration (TOML).
///
/// Intended to be edited by humans. Missing fields take the defaults below;
/// CLI flags override individual values after loading.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Extra attempts per agent call after the first one.
    pub max_agent_retries: u32,
    pub phase1_max_cycles: u32,
    pub phase2_max_cycles: u32,

    /// Shell command run after every implementation step. Empty skips testing.
    pub test_command: String,
    pub test_timeout_secs: u64,

    /// Characters of transcript history injected into prompts.
    pub max_shared_chars: usize,
    /// Characters of `git diff` included in the review snapshot.
    pub max_diff_chars: usize,
    pub file_snapshot_max_lines: usize,
    pub file_snapshot_max_files: usize,

    /// Bytes of agent stdout/stderr kept in memory per call.
    pub agent_output_limit_bytes: usize,

    /// Simulate every agent call and the test command.
    pub dry_run: bool,

    pub output: OutputConfig,
    pub live_stream: LiveStreamConfig,
    pub roles: RoleConfig,
    pub fallback: FallbackConfig,

    /// Per-agent binary and timeout overrides, keyed by agent name.
    pub agents: BTreeMap<String, AgentOverride>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_agent_retries: 1,
            phase1_max_cycles: 4,
            phase2_max_cycles: 6,
            test_command: String::new(),
            test_timeout_secs: 300,
            max_shared_chars: 30_000,
            max_diff_chars: 14_000,
            file_snapshot_max_lines: 500,
            file_snapshot_max_files: 10,
            agent_output_limit_bytes: 16 * 1024 * 1024,
            dry_run: false,
            output: OutputConfig::default(),
            live_stream: LiveStreamConfig::default(),
            roles: RoleConfig::default(),
            fallback: FallbackConfig::default(),
            agents: BTreeMap::new(),
        }
    }
}

/// How accepted agent answers are echoed to the log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputMode {
    None,
    #[default]
    Summary,
    Full,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct OutputConfig {
    pub mode: OutputMode,
    /// Characters shown per answer in summary mode.
    pub max_chars: usize,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            mode: OutputMode::Summary,
            max_chars: 1800,
        }
    }
}

/// Which live lines are surfaced while an agent runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamMode {
    /// Apply the adapter's noise filter.
    #[default]
    Compact,
    Full,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamChannels {
    #[default]
    Both,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LiveStreamConfig {
    pub enabled: bool,
    pub mode: StreamMode,
    pub channels: StreamChannels,
}

/// Agent assigned to each role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoleConfig {
    pub phase1_planner: String,
    pub phase1_reviewer: String,
    pub phase2_implementer: String,
    pub phase2_reviewer: String,
}

impl Default for RoleConfig {
    fn default() -> Self {
        Self {
            phase1_planner: "claude".to_string(),
            phase1_reviewer: "codex".to_string(),
            phase2_implementer: "codex".to_string(),
            phase2_reviewer: "claude".to_string(),
        }
    }
}

impl RoleConfig {
    /// Distinct agents used by the configured roles.
    pub fn agents(&self) -> Vec<&str> {
        let mut agents = vec![
            self.phase1_planner.as_str(),
            self.phase1_reviewer.as_str(),
            self.phase2_implementer.as_str(),
            self.phase2_reviewer.as_str(),
        ];
        agents.sort_unstable();
        agents.dedup();
        agents
    }
}

/// Quota fallback routing.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FallbackConfig {
    pub enabled: bool,
    /// Blocked agent name -> agent that takes over its calls.
    pub agents: BTreeMap<String, String>,
}

impl Default for FallbackConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            agents: BTreeMap::from([("claude".to_string(), "gemini".to_string())]),
        }
    }
}

impl FallbackConfig {
    /// Fallback for `agent`, if routing is enabled and one is designated.
    pub fn target(&self, agent: &str) -> Option<&str> {
        if !self.enabled {
            return None;
        }
        self.agents
            .get(agent)
            .map(String::as_str)
            .filter(|target| *target != agent)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentOverride {
    pub binary: Option<String>,
    pub timeout_secs: Option<u64>,
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.phase1_max_cycles == 0 {
            return Err(anyhow!("phase1_max_cycles must be > 0"));
        }
        if self.phase2_max_cycles == 0 {
            return Err(anyhow!("phase2_max_cycles must be > 0"));
        }
        if self.test_timeout_secs == 0 {
            return Err(anyhow!("test_timeout_secs must be > 0"));
        }
        if self.agent_output_limit_bytes == 0 {
            return Err(anyhow!("agent_output_limit_bytes must be > 0"));
        }
        if self.output.max_chars < MIN_OUTPUT_MAX_CHARS {
            return Err(anyhow!(
                "output.max_chars must be >= {MIN_OUTPUT_MAX_CHARS}"
            ));
        }
        for (role, agent) in [
            ("roles.phase1_planner", &self.roles.phase1_planner),
            ("roles.phase1_reviewer", &self.roles.phase1_reviewer),
            ("roles.phase2_implementer", &self.roles.phase2_implementer),
            ("roles.phase2_reviewer", &self.roles.phase2_reviewer),
        ] {
            if agent.trim().is_empty() {
                return Err(anyhow!("{role} must name an agent"));
            }
        }
        for (name, entry) in &self.agents {
            if entry.timeout_secs == Some(0) {
                return Err(anyhow!("agents.{name}.timeout_secs must be > 0"));
            }
        }
        Ok(())
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()`.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        let cfg = OrchestratorConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        let mut cfg = OrchestratorConfig::default();
        cfg.test_command = "cargo test".to_string();
        cfg.agents.insert(
            "gemini".to_string(),
            AgentOverride {
                binary: Some("gemini-cli".to_string()),
                timeout_secs: Some(60),
            },
        );
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    /// Partial files only override what they name.
    #[test]
    fn partial_file_keeps_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            "phase2_max_cycles = 2\n[fallback]\nenabled = true\n[live_stream]\nenabled = true\nchannels = \"stderr\"\n",
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");

        assert_eq!(cfg.phase2_max_cycles, 2);
        assert_eq!(cfg.phase1_max_cycles, 4);
        assert_eq!(cfg.fallback.target("claude"), Some("gemini"));
        assert_eq!(cfg.live_stream.channels, StreamChannels::Stderr);
        assert_eq!(cfg.live_stream.mode, StreamMode::Compact);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = OrchestratorConfig::default();
        cfg.phase1_max_cycles = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::default();
        cfg.output.max_chars = 10;
        assert!(cfg.validate().is_err());

        let mut cfg = OrchestratorConfig::default();
        cfg.roles.phase2_reviewer = " ".to_string();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn fallback_target_requires_enabled_routing() {
        let mut fallback = FallbackConfig::default();
        assert_eq!(fallback.target("claude"), None);
        fallback.enabled = true;
        assert_eq!(fallback.target("claude"), Some("gemini"));
        assert_eq!(fallback.target("codex"), None);
    }

    #[test]
    fn role_agents_are_distinct() {
        assert_eq!(RoleConfig::default().agents(), vec!["claude", "codex"]);
    }
}
