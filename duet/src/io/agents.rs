//! Agent CLI adapters and the registry that maps agent names to them.
//!
//! Each adapter knows how to turn a prompt into a command line, how to pull
//! the final answer out of the raw process output, and which live lines are
//! worth showing. Temporary side-channel files are owned by the returned
//! [`Invocation`] and removed when it is dropped, on every exit path.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tempfile::TempPath;
use tracing::{debug, warn};

use crate::io::config::AgentOverride;
use crate::io::process::Channel;

/// Default wall-clock budget for one agent call.
pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Static description of an agent CLI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentSpec {
    pub name: String,
    pub binary: String,
    pub timeout: Duration,
    /// Variables set on top of the inherited environment.
    pub env: Vec<(String, String)>,
    /// Hosts the CLI must reach; checked during preflight.
    pub required_hosts: Vec<String>,
}

impl AgentSpec {
    fn builtin(name: &str, required_hosts: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            binary: name.to_string(),
            timeout: DEFAULT_AGENT_TIMEOUT,
            env: vec![("NO_COLOR".to_string(), "1".to_string())],
            required_hosts: required_hosts.iter().map(|host| host.to_string()).collect(),
        }
    }

    fn with_override(mut self, entry: Option<&AgentOverride>) -> Self {
        if let Some(entry) = entry {
            if let Some(binary) = entry.binary.as_deref().filter(|b| !b.trim().is_empty()) {
                self.binary = binary.to_string();
            }
            if let Some(secs) = entry.timeout_secs {
                self.timeout = Duration::from_secs(secs);
            }
        }
        self
    }
}

/// A ready-to-run command line plus the resources it owns.
#[derive(Debug)]
pub struct Invocation {
    pub argv: Vec<String>,
    /// Whether the prompt is written to stdin.
    pub use_stdin: bool,
    sidecar: Option<TempPath>,
}

impl Invocation {
    pub fn new(argv: Vec<String>, use_stdin: bool) -> Self {
        Self {
            argv,
            use_stdin,
            sidecar: None,
        }
    }

    pub fn with_sidecar(mut self, sidecar: TempPath) -> Self {
        self.sidecar = Some(sidecar);
        self
    }

    pub fn sidecar_path(&self) -> Option<&Path> {
        self.sidecar.as_deref()
    }

    /// Remove side-channel files now; dropping the invocation does the same.
    pub fn cleanup(&mut self) {
        if let Some(path) = self.sidecar.take() {
            let path_display = path.display().to_string();
            if let Err(err) = path.close() {
                warn!(path = %path_display, err = %err, "failed to remove agent sidecar file");
            }
        }
    }
}

/// Per-call state owned by the stream consumer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StreamState {
    pub skip_prompt_echo: bool,
    pub last_emitted_line: String,
}

/// Capability interface of one agent CLI.
pub trait Agent: Send + Sync {
    fn spec(&self) -> &AgentSpec;

    fn name(&self) -> &str {
        &self.spec().name
    }

    fn build_command(&self, prompt: &str) -> Result<Invocation>;

    fn extract_output(&self, stdout: &str, _stderr: &str, _invocation: &Invocation) -> String {
        stdout.trim().to_string()
    }

    /// Whether a live line should be surfaced in compact mode.
    fn stream_filter(&self, _channel: Channel, line: &str, state: &mut StreamState) -> bool {
        emit_once(line, state)
    }
}

/// Drop blank lines and immediate repeats.
fn emit_once(line: &str, state: &mut StreamState) -> bool {
    let text = line.trim();
    if text.is_empty() || text == state.last_emitted_line {
        return false;
    }
    state.last_emitted_line = text.to_string();
    true
}

const CODEX_NOISY_PREFIXES: &[&str] = &[
    "Reading prompt from stdin...",
    "OpenAI Codex ",
    "workdir:",
    "model:",
    "provider:",
    "approval:",
    "sandbox:",
    "reasoning effort:",
    "reasoning summaries:",
    "session id:",
    "mcp startup:",
    "--------",
    "diff --git ",
    "index ",
    "--- a/",
    "+++ b/",
    "@@",
    "deleted file mode ",
    "new file mode ",
    "file update:",
    "apply_patch(",
    "/bin/bash -lc ",
    "succeeded in ",
    "tokens used",
];

/// `codex exec`, answering through a last-message sidecar file.
pub struct CodexAgent {
    spec: AgentSpec,
}

impl CodexAgent {
    pub fn new(entry: Option<&AgentOverride>) -> Self {
        Self {
            spec: AgentSpec::builtin("codex", &["chatgpt.com", "api.openai.com"])
                .with_override(entry),
        }
    }
}

impl Agent for CodexAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn build_command(&self, _prompt: &str) -> Result<Invocation> {
        let sidecar = tempfile::Builder::new()
            .prefix("codex-last-message-")
            .suffix(".txt")
            .tempfile()
            .context("create codex last-message file")?
            .into_temp_path();
        let argv = vec![
            self.spec.binary.clone(),
            "exec".to_string(),
            "--skip-git-repo-check".to_string(),
            "--sandbox".to_string(),
            "workspace-write".to_string(),
            "--color".to_string(),
            "never".to_string(),
            "--output-last-message".to_string(),
            sidecar.display().to_string(),
        ];
        Ok(Invocation::new(argv, true).with_sidecar(sidecar))
    }

    fn extract_output(&self, stdout: &str, _stderr: &str, invocation: &Invocation) -> String {
        let from_sidecar = invocation
            .sidecar_path()
            .and_then(|path| fs::read_to_string(path).ok())
            .map(|content| content.trim().to_string())
            .filter(|content| !content.is_empty());
        match from_sidecar {
            Some(content) => content,
            None => {
                debug!("codex last-message file empty, using stdout");
                stdout.trim().to_string()
            }
        }
    }

    fn stream_filter(&self, channel: Channel, line: &str, state: &mut StreamState) -> bool {
        let text = line.trim();
        if text.is_empty() {
            return false;
        }

        if channel == Channel::Stderr {
            if text == "user" {
                state.skip_prompt_echo = true;
                return false;
            }
            if state.skip_prompt_echo {
                let echo_ended =
                    text.starts_with("mcp startup:") || matches!(text, "thinking" | "codex" | "exec");
                if !echo_ended {
                    return false;
                }
                state.skip_prompt_echo = false;
            }
            if CODEX_NOISY_PREFIXES
                .iter()
                .any(|prefix| text.starts_with(prefix))
            {
                return false;
            }
            if text.starts_with("202") && text.contains("ERROR codex_core::rollout::list") {
                return false;
            }
            if (text.starts_with('+') || text.starts_with('-')) && text.chars().count() > 2 {
                return false;
            }
        }

        emit_once(text, state)
    }
}

/// `claude -p`, stateless plain-text answers.
pub struct ClaudeAgent {
    spec: AgentSpec,
}

impl ClaudeAgent {
    pub fn new(entry: Option<&AgentOverride>) -> Self {
        Self {
            spec: AgentSpec::builtin("claude", &["api.anthropic.com"]).with_override(entry),
        }
    }
}

impl Agent for ClaudeAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn build_command(&self, _prompt: &str) -> Result<Invocation> {
        let argv = [
            self.spec.binary.as_str(),
            "-p",
            "--output-format",
            "text",
            "--no-session-persistence",
            "--model",
            "opus",
        ]
        .map(str::to_string)
        .to_vec();
        Ok(Invocation::new(argv, true))
    }
}

/// `gemini`, prompt on stdin and plain stdout.
pub struct GeminiAgent {
    spec: AgentSpec,
}

impl GeminiAgent {
    pub fn new(entry: Option<&AgentOverride>) -> Self {
        Self {
            spec: AgentSpec::builtin("gemini", &["generativelanguage.googleapis.com"])
                .with_override(entry),
        }
    }
}

impl Agent for GeminiAgent {
    fn spec(&self) -> &AgentSpec {
        &self.spec
    }

    fn build_command(&self, _prompt: &str) -> Result<Invocation> {
        Ok(Invocation::new(vec![self.spec.binary.clone()], true))
    }
}

/// Agents by name, built once at startup and passed explicitly.
pub struct AgentRegistry {
    agents: BTreeMap<String, Box<dyn Agent>>,
}

impl AgentRegistry {
    /// The built-in `codex`, `claude` and `gemini` adapters.
    pub fn builtin(overrides: &BTreeMap<String, AgentOverride>) -> Self {
        let mut registry = Self {
            agents: BTreeMap::new(),
        };
        registry.insert(Box::new(CodexAgent::new(overrides.get("codex"))));
        registry.insert(Box::new(ClaudeAgent::new(overrides.get("claude"))));
        registry.insert(Box::new(GeminiAgent::new(overrides.get("gemini"))));
        registry
    }

    pub fn insert(&mut self, agent: Box<dyn Agent>) {
        self.agents.insert(agent.name().to_string(), agent);
    }

    pub fn get(&self, name: &str) -> Option<&dyn Agent> {
        self.agents.get(name).map(Box::as_ref)
    }

    /// Look up an agent or fail naming the known ones.
    pub fn require(&self, name: &str) -> Result<&dyn Agent> {
        self.get(name).ok_or_else(|| {
            anyhow!(
                "unknown agent '{name}' (known: {})",
                self.names().collect::<Vec<_>>().join(", ")
            )
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.agents.keys().map(String::as_str)
    }
}
