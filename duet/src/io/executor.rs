//! Executor abstraction for agent invocation.
//!
//! The [`Executor`] trait decouples the retry controller from the actual agent
//! backends. [`ProcessExecutor`] spawns the CLI described by the registry and
//! applies the single-attempt error policy; tests use scripted executors that
//! return predetermined answers without spawning processes.

use std::path::PathBuf;
use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;
use tracing::{debug, info, instrument, warn};

use crate::core::contract::{DONE_MARKER, IMPLEMENTATION_READY};
use crate::core::text::{ATTEMPT_ERROR_CHARS, shorten};
use crate::error::ExecError;
use crate::io::agents::{Agent, AgentRegistry, StreamState};
use crate::io::config::{LiveStreamConfig, StreamChannels, StreamMode};
use crate::io::process::{
    Channel, LineFilter, ProcessError, ProcessRequest, run_captured, run_streaming,
};

const UNKNOWN_CLI_ERROR: &str = "Unknown CLI error without output.";

static APPROVAL_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\b([A-Z][A-Z0-9_]*_APPROVAL)\s*:").expect("approval key regex should compile")
});

/// Abstraction over agent execution backends.
pub trait Executor {
    /// Run one attempt of `agent` on `prompt` and return its answer text.
    fn run(&self, agent: &str, prompt: &str) -> Result<String, ExecError>;
}

/// Executor that spawns the registered agent CLIs.
pub struct ProcessExecutor<'a> {
    registry: &'a AgentRegistry,
    live: LiveStreamConfig,
    output_limit_bytes: usize,
    workdir: Option<PathBuf>,
}

impl<'a> ProcessExecutor<'a> {
    pub fn new(registry: &'a AgentRegistry, live: LiveStreamConfig, output_limit_bytes: usize) -> Self {
        Self {
            registry,
            live,
            output_limit_bytes,
            workdir: None,
        }
    }

    /// Run agents in `workdir` instead of the current directory.
    pub fn with_workdir(mut self, workdir: PathBuf) -> Self {
        self.workdir = Some(workdir);
        self
    }
}

impl Executor for ProcessExecutor<'_> {
    fn run(&self, agent: &str, prompt: &str) -> Result<String, ExecError> {
        let adapter = self
            .registry
            .require(agent)
            .map_err(|err| execution_error(agent, &err.to_string()))?;
        execute_agent(
            adapter,
            prompt,
            &self.live,
            self.output_limit_bytes,
            self.workdir.as_deref(),
        )
    }
}

/// Launch one agent attempt and apply the error policy.
///
/// - non-zero exit: stderr, else the extracted answer, else a fixed notice
/// - zero exit with an empty answer: [`ExecError::EmptyOutput`]
/// - wall-clock budget exceeded: [`ExecError::Timeout`]
///
/// The invocation's side-channel files are released on every path.
#[instrument(skip_all, fields(agent = agent.name(), live = live.enabled))]
pub fn execute_agent(
    agent: &dyn Agent,
    prompt: &str,
    live: &LiveStreamConfig,
    output_limit_bytes: usize,
    workdir: Option<&std::path::Path>,
) -> Result<String, ExecError> {
    let name = agent.name();
    let spec = agent.spec();
    let mut invocation = agent
        .build_command(prompt)
        .map_err(|err| execution_error(name, &format!("{err:#}")))?;

    let request = ProcessRequest {
        argv: &invocation.argv,
        env: &spec.env,
        stdin: invocation.use_stdin.then_some(prompt.as_bytes()),
        workdir,
        timeout: spec.timeout,
        output_limit_bytes,
    };
    info!(timeout_secs = spec.timeout.as_secs(), "starting agent");

    let result = if live.enabled {
        let mut filter = AgentLineFilter::new(agent, live);
        run_streaming(&request, name, &mut filter)
    } else {
        run_captured(&request)
    };
    let output = match result {
        Ok(output) => output,
        Err(ProcessError::Timeout { .. }) => {
            return Err(ExecError::Timeout {
                agent: name.to_string(),
                timeout_secs: whole_secs(spec.timeout),
            });
        }
        Err(ProcessError::Failed(err)) => {
            return Err(execution_error(name, &format!("{err:#}")));
        }
    };

    let text = agent.extract_output(&output.stdout, &output.stderr, &invocation);
    invocation.cleanup();

    if output.exit_code != 0 {
        let detail = [output.stderr.trim(), text.as_str()]
            .into_iter()
            .find(|candidate| !candidate.is_empty())
            .unwrap_or(UNKNOWN_CLI_ERROR);
        warn!(exit_code = output.exit_code, "agent exited with failure");
        return Err(execution_error(name, detail));
    }
    if text.is_empty() {
        return Err(ExecError::EmptyOutput {
            agent: name.to_string(),
        });
    }
    debug!(chars = text.len(), "agent answered");
    Ok(text)
}

/// Whole seconds, rounded up.
fn whole_secs(timeout: Duration) -> u64 {
    timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0)
}

fn execution_error(agent: &str, detail: &str) -> ExecError {
    ExecError::Execution {
        agent: agent.to_string(),
        detail: shorten(detail, ATTEMPT_ERROR_CHARS),
    }
}

/// Live display policy for one agent call.
struct AgentLineFilter<'a> {
    agent: &'a dyn Agent,
    mode: StreamMode,
    channels: StreamChannels,
    state: StreamState,
}

impl<'a> AgentLineFilter<'a> {
    fn new(agent: &'a dyn Agent, live: &LiveStreamConfig) -> Self {
        Self {
            agent,
            mode: live.mode,
            channels: live.channels,
            state: StreamState::default(),
        }
    }
}

impl LineFilter for AgentLineFilter<'_> {
    fn accept(&mut self, channel: Channel, line: &str) -> bool {
        let wanted = match self.channels {
            StreamChannels::Both => true,
            StreamChannels::Stdout => channel == Channel::Stdout,
            StreamChannels::Stderr => channel == Channel::Stderr,
        };
        if !wanted {
            return false;
        }
        match self.mode {
            StreamMode::Full => true,
            StreamMode::Compact => self.agent.stream_filter(channel, line, &mut self.state),
        }
    }
}

/// Executor that answers every call with the markers the prompt asks for.
pub struct DryRunExecutor;

impl Executor for DryRunExecutor {
    fn run(&self, agent: &str, prompt: &str) -> Result<String, ExecError> {
        Ok(dry_run_answer(agent, prompt))
    }
}

/// Simulated answer approving everything the prompt mentions.
pub fn dry_run_answer(agent: &str, prompt: &str) -> String {
    let mut lines = vec![
        format!("# Dry Run Output ({agent})"),
        String::new(),
        "This response was simulated by the orchestrator.".to_string(),
    ];
    let mut keys: Vec<&str> = Vec::new();
    for caps in APPROVAL_KEY_RE.captures_iter(prompt) {
        if let Some(key) = caps.get(1).map(|m| m.as_str())
            && !keys.contains(&key)
        {
            keys.push(key);
        }
    }
    lines.extend(keys.iter().map(|key| format!("{key}: YES")));
    if prompt.contains("OPEN_FINDINGS:") {
        lines.push("OPEN_FINDINGS: NONE".to_string());
    }
    if prompt.contains(&format!("{IMPLEMENTATION_READY}:")) {
        lines.push(format!("{IMPLEMENTATION_READY}: YES"));
    }
    lines.push(DONE_MARKER.to_string());
    lines.join("\n")
}
