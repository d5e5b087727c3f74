//! Bounded retries, backoff and sticky quota fallback around one agent call.
//!
//! Each call runs at most `max_retries + 1` attempts, one process at a time.
//! Rejected answers and failed attempts feed the next prompt with the latest
//! rejection reasons. A quota or rate-limit failure ends local retrying: the
//! call either moves to the configured fallback agent or fails with
//! [`QuotaError`].

use std::collections::BTreeSet;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::classify::backoff;
use crate::core::contract::OutputContract;
use crate::core::text::{ATTEMPT_ERROR_CHARS, shorten, tail};
use crate::error::{CallError, ErrorClass, QuotaError};
use crate::io::config::{FallbackConfig, OutputConfig, OutputMode};
use crate::io::executor::Executor;
use crate::io::transcript::AttemptLog;

/// Rejection reasons replayed to the agent on a retry.
const FEEDBACK_ERRORS: usize = 2;

/// Waits between attempts; replaced in tests.
pub trait Sleeper {
    fn sleep(&self, duration: Duration);
}

pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        thread::sleep(duration);
    }
}

/// One logical agent call.
#[derive(Debug, Clone)]
pub struct CallRequest<'a> {
    /// Primary agent for the role.
    pub agent: &'a str,
    pub prompt: &'a str,
    /// File name prefix for attempt logs, e.g. `phase1-cycle2-claude-plan`.
    pub log_prefix: &'a str,
    pub max_retries: u32,
    pub contract: &'a OutputContract,
}

/// Retry/quota controller shared by every step of a run.
pub struct Controller<'a> {
    executor: &'a dyn Executor,
    sleeper: &'a dyn Sleeper,
    log: AttemptLog,
    output: OutputConfig,
    live_enabled: bool,
    fallback: FallbackConfig,
    /// Primary agents whose calls go straight to their fallback.
    rerouted: BTreeSet<String>,
}

impl<'a> Controller<'a> {
    pub fn new(executor: &'a dyn Executor, sleeper: &'a dyn Sleeper, log: AttemptLog) -> Self {
        Self {
            executor,
            sleeper,
            log,
            output: OutputConfig::default(),
            live_enabled: false,
            fallback: FallbackConfig::default(),
            rerouted: BTreeSet::new(),
        }
    }

    /// How accepted answers are echoed; `live_enabled` suppresses the echo
    /// because the lines were already shown while the agent ran.
    pub fn with_output(mut self, output: OutputConfig, live_enabled: bool) -> Self {
        self.output = output;
        self.live_enabled = live_enabled;
        self
    }

    pub fn with_fallback(mut self, fallback: FallbackConfig) -> Self {
        self.fallback = fallback;
        self
    }

    /// Whether calls for `agent` are currently routed to its fallback.
    pub fn is_rerouted(&self, agent: &str) -> bool {
        self.rerouted.contains(agent)
    }

    /// Agent that will actually serve calls for `agent`.
    pub fn effective_agent<'s>(&'s self, agent: &'s str) -> &'s str {
        match self.fallback.target(agent) {
            Some(target) if self.rerouted.contains(agent) => target,
            _ => agent,
        }
    }

    /// Run `request` until an answer satisfies its contract.
    #[instrument(skip_all, fields(agent = request.agent, log_prefix = request.log_prefix))]
    pub fn call(&mut self, request: &CallRequest<'_>) -> Result<String, CallError> {
        let effective = self.effective_agent(request.agent).to_string();
        if effective != request.agent {
            info!(from = request.agent, to = %effective, "agent quota reached earlier; using fallback directly");
        }
        let fallback = if effective == request.agent {
            self.fallback.target(request.agent).map(str::to_string)
        } else {
            None
        };

        let attempts = request.max_retries.saturating_add(1);
        let mut errors: Vec<String> = Vec::new();
        for attempt in 1..=attempts {
            let prompt = if attempt == 1 {
                request.prompt.to_string()
            } else {
                with_feedback(request.prompt, tail(&errors, FEEDBACK_ERRORS))
            };

            match self.executor.run(&effective, &prompt) {
                Ok(answer) => {
                    let path = self.log.primary_path(request.log_prefix, attempt);
                    self.log.write(&path, &answer)?;
                    self.show(&effective, attempt, &path, &answer);
                    match request.contract.check(&answer) {
                        Ok(()) => return Ok(answer),
                        Err(rejected) => {
                            warn!(agent = %effective, attempt, reason = %rejected, "answer rejected");
                            errors.push(rejected.reason);
                        }
                    }
                }
                Err(err) => {
                    let detail = shorten(&err.to_string(), ATTEMPT_ERROR_CHARS);
                    errors.push(detail.clone());
                    if err.class() == ErrorClass::TerminalQuota {
                        if let Some(target) = fallback.as_deref() {
                            return self.call_fallback(request, &prompt, attempt, target, &mut errors);
                        }
                        return Err(QuotaError {
                            agent: effective,
                            detail,
                        }
                        .into());
                    }
                    warn!(agent = %effective, attempt, err = %detail, "agent attempt failed");
                }
            }

            if attempt < attempts
                && let Some(last) = errors.last()
            {
                let delay = backoff(last, attempt);
                info!(
                    agent = %effective,
                    attempt,
                    reason = %shorten(last, 400),
                    delay_secs = delay.as_secs(),
                    "retrying after backoff"
                );
                self.sleeper.sleep(delay);
            }
        }

        Err(CallError::Exhausted {
            agent: effective,
            attempts,
            errors: shorten(&errors.join("\n"), ATTEMPT_ERROR_CHARS),
        })
    }

    /// Re-issue the same prompt to `target` once. A valid answer makes the
    /// reroute sticky; anything else ends the call with a quota error.
    fn call_fallback(
        &mut self,
        request: &CallRequest<'_>,
        prompt: &str,
        attempt: u32,
        target: &str,
        errors: &mut Vec<String>,
    ) -> Result<String, CallError> {
        warn!(from = request.agent, to = target, "quota or rate limit detected; attempting fallback");
        let primary_detail = errors.last().cloned().unwrap_or_default();

        match self.executor.run(target, prompt) {
            Ok(answer) => {
                let path = self.log.fallback_path(request.log_prefix, attempt, target);
                self.log.write(&path, &answer)?;
                info!(from = request.agent, to = target, attempt, log = %path.display(), "fallback answered");
                self.show(target, attempt, &path, &answer);
                match request.contract.check(&answer) {
                    Ok(()) => {
                        self.rerouted.insert(request.agent.to_string());
                        Ok(answer)
                    }
                    Err(rejected) => {
                        errors.push(format!("{target} fallback invalid output: {rejected}"));
                        Err(QuotaError {
                            agent: request.agent.to_string(),
                            detail: primary_detail,
                        }
                        .into())
                    }
                }
            }
            Err(err) => {
                let detail = shorten(&err.to_string(), ATTEMPT_ERROR_CHARS);
                errors.push(format!("{target} fallback failed: {detail}"));
                if err.class() == ErrorClass::TerminalQuota {
                    return Err(QuotaError {
                        agent: target.to_string(),
                        detail,
                    }
                    .into());
                }
                Err(QuotaError {
                    agent: request.agent.to_string(),
                    detail: format!("{primary_detail}\n{target} fallback failed: {detail}"),
                }
                .into())
            }
        }
    }

    fn show(&self, agent: &str, attempt: u32, path: &Path, answer: &str) {
        if self.output.mode == OutputMode::None {
            return;
        }
        info!(agent, attempt, log = %path.display(), "agent answered");
        if self.live_enabled {
            info!("live stream was enabled; final response saved to log");
            return;
        }
        match self.output.mode {
            OutputMode::Full => info!("{}", answer.trim()),
            _ => info!("{}", shorten(answer, self.output.max_chars)),
        }
    }
}

fn with_feedback(prompt: &str, errors: &[String]) -> String {
    format!(
        "{prompt}\n\nYour last response was formally unacceptable. Fix only the issues listed below.\nError context:\n{}\n",
        errors.join("\n")
    )
}
