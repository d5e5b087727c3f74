//! Typed errors for agent calls and phase execution.
//!
//! Callers branch on [`ErrorClass`] rather than on message text. Plumbing
//! failures (filesystem, serialization) stay `anyhow::Error` and are always
//! fatal.

use thiserror::Error;

use crate::core::classify::is_quota_or_rate_limit;
use crate::core::types::Phase;

/// How a caller reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried locally with corrective feedback.
    Recoverable,
    /// Stops local retrying; freezes the run or triggers a fallback.
    TerminalQuota,
    /// Aborts the run.
    Fatal,
}

/// Failure of a single agent attempt.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExecError {
    #[error("{agent} failed: {detail}")]
    Execution { agent: String, detail: String },
    #[error("{agent} returned empty output.")]
    EmptyOutput { agent: String },
    #[error("{agent} timed out after {timeout_secs}s.")]
    Timeout { agent: String, timeout_secs: u64 },
}

impl ExecError {
    pub fn agent(&self) -> &str {
        match self {
            ExecError::Execution { agent, .. }
            | ExecError::EmptyOutput { agent }
            | ExecError::Timeout { agent, .. } => agent,
        }
    }

    /// Quota markers are only looked for in CLI failure text; a timeout or an
    /// empty answer is always retried.
    pub fn class(&self) -> ErrorClass {
        match self {
            ExecError::Execution { detail, .. } if is_quota_or_rate_limit(detail) => {
                ErrorClass::TerminalQuota
            }
            _ => ErrorClass::Recoverable,
        }
    }
}

/// An answer that violated the output contract.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{reason}")]
pub struct ValidationError {
    pub reason: String,
}

impl ValidationError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// An agent (or its fallback) is out of quota or rate limited.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{agent} quota/rate limit reached: {detail}")]
pub struct QuotaError {
    pub agent: String,
    pub detail: String,
}

/// Terminal outcome of a retried agent call.
#[derive(Debug, Error)]
pub enum CallError {
    #[error(transparent)]
    Quota(#[from] QuotaError),
    #[error("{agent} did not produce valid output after {attempts} attempts: {errors}")]
    Exhausted {
        agent: String,
        attempts: u32,
        errors: String,
    },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl CallError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CallError::Quota(_) => ErrorClass::TerminalQuota,
            CallError::Exhausted { .. } | CallError::Io(_) => ErrorClass::Fatal,
        }
    }
}

/// Why a phase stopped without completing.
#[derive(Debug, Error)]
pub enum PhaseError {
    #[error(transparent)]
    Frozen(#[from] QuotaError),
    #[error("{phase} failed: {message}")]
    Failed { phase: Phase, message: String },
    #[error(transparent)]
    Io(#[from] anyhow::Error),
}

impl PhaseError {
    pub fn class(&self) -> ErrorClass {
        match self {
            PhaseError::Frozen(_) => ErrorClass::TerminalQuota,
            PhaseError::Failed { .. } | PhaseError::Io(_) => ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_match_the_operator_facing_format() {
        let timeout = ExecError::Timeout {
            agent: "codex".to_string(),
            timeout_secs: 1800,
        };
        assert_eq!(timeout.to_string(), "codex timed out after 1800s.");

        let empty = ExecError::EmptyOutput {
            agent: "claude".to_string(),
        };
        assert_eq!(empty.to_string(), "claude returned empty output.");

        let quota = QuotaError {
            agent: "gemini".to_string(),
            detail: "429".to_string(),
        };
        assert_eq!(quota.to_string(), "gemini quota/rate limit reached: 429");
    }

    #[test]
    fn classes_drive_caller_behavior() {
        let exec = ExecError::Execution {
            agent: "codex".to_string(),
            detail: "boom".to_string(),
        };
        assert_eq!(exec.class(), ErrorClass::Recoverable);
        assert_eq!(exec.agent(), "codex");

        let limited = ExecError::Execution {
            agent: "claude".to_string(),
            detail: "HTTP 429 too many requests".to_string(),
        };
        assert_eq!(limited.class(), ErrorClass::TerminalQuota);

        // A 429-second budget is not a rate limit.
        let timeout = ExecError::Timeout {
            agent: "codex".to_string(),
            timeout_secs: 429,
        };
        assert_eq!(timeout.class(), ErrorClass::Recoverable);

        let quota: CallError = QuotaError {
            agent: "claude".to_string(),
            detail: "quota".to_string(),
        }
        .into();
        assert_eq!(quota.class(), ErrorClass::TerminalQuota);

        let exhausted = CallError::Exhausted {
            agent: "codex".to_string(),
            attempts: 2,
            errors: "x".to_string(),
        };
        assert_eq!(exhausted.class(), ErrorClass::Fatal);
        assert_eq!(
            exhausted.to_string(),
            "codex did not produce valid output after 2 attempts: x"
        );
    }
}
