//! Shared deterministic types for the orchestrator core.
//!
//! These types define stable contracts between the phase machine, the contract
//! validator and the persisted run state. Their serde representations are part
//! of the on-disk format and must not change casually.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

static FINDING_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^F-[0-9]{3}$").expect("finding id regex should compile"));

/// Top-level position of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    /// Alignment: planner and reviewer converge on a plan.
    Phase1,
    /// Execution: implementer changes the workspace until tests and review pass.
    Phase2,
    Done,
}

impl Phase {
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Phase1 => "phase1",
            Phase::Phase2 => "phase2",
            Phase::Done => "done",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle of a single phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    Frozen,
}

impl PhaseStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            PhaseStatus::Pending => "pending",
            PhaseStatus::Running => "running",
            PhaseStatus::Completed => "completed",
            PhaseStatus::Failed => "failed",
            PhaseStatus::Frozen => "frozen",
        }
    }
}

impl fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A YES/NO marker value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Approval {
    Yes,
    #[default]
    No,
}

impl Approval {
    /// Parse a marker value case-insensitively; anything but YES/NO is rejected.
    pub fn parse(raw: &str) -> Option<Self> {
        let value = raw.trim();
        if value.eq_ignore_ascii_case("YES") {
            Some(Approval::Yes)
        } else if value.eq_ignore_ascii_case("NO") {
            Some(Approval::No)
        } else {
            None
        }
    }

    pub fn is_yes(self) -> bool {
        matches!(self, Approval::Yes)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Approval::Yes => "YES",
            Approval::No => "NO",
        }
    }
}

impl fmt::Display for Approval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The part an agent plays inside a phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Planner,
    Reviewer,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Planner => "planner",
            Role::Reviewer => "reviewer",
        }
    }
}

/// Identifier of a reviewer-raised defect, always in the `F-001` shape.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct FindingId(String);

impl FindingId {
    /// Upper-case `raw` and accept it only if it matches `F-NNN`.
    pub fn parse(raw: &str) -> Option<Self> {
        let candidate = raw.trim().to_ascii_uppercase();
        FINDING_ID_RE
            .is_match(&candidate)
            .then_some(FindingId(candidate))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for FindingId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        FindingId::parse(&value)
            .ok_or_else(|| format!("invalid finding id '{value}' (expected format F-001)"))
    }
}

impl From<FindingId> for String {
    fn from(value: FindingId) -> Self {
        value.0
    }
}

impl fmt::Display for FindingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle state of a finding in the history map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FindingStatus {
    Open,
    Closed,
}

impl FindingStatus {
    pub fn parse(raw: &str) -> Option<Self> {
        let value = raw.trim();
        if value.eq_ignore_ascii_case("OPEN") {
            Some(FindingStatus::Open)
        } else if value.eq_ignore_ascii_case("CLOSED") {
            Some(FindingStatus::Closed)
        } else {
            None
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FindingStatus::Open => "OPEN",
            FindingStatus::Closed => "CLOSED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_id_is_upper_cased_before_matching() {
        let id = FindingId::parse(" f-007 ").expect("valid id");
        assert_eq!(id.as_str(), "F-007");
    }

    #[test]
    fn finding_id_rejects_other_shapes() {
        for raw in ["F-1", "F-0001", "G-001", "F001", "F-00a", "", "F-١٢٣"] {
            assert!(FindingId::parse(raw).is_none(), "{raw} should be rejected");
        }
    }

    /// Deserialization goes through the same validation as `parse`.
    #[test]
    fn finding_id_deserialization_validates() {
        let ok: FindingId = serde_json::from_str("\"f-010\"").expect("valid");
        assert_eq!(ok.as_str(), "F-010");
        assert!(serde_json::from_str::<FindingId>("\"X-1\"").is_err());
    }

    #[test]
    fn approval_parse_is_case_insensitive_and_strict() {
        assert_eq!(Approval::parse("yes"), Some(Approval::Yes));
        assert_eq!(Approval::parse(" No "), Some(Approval::No));
        assert_eq!(Approval::parse("maybe"), None);
    }

    #[test]
    fn phase_serializes_lowercase() {
        let json = serde_json::to_string(&Phase::Phase2).expect("serialize");
        assert_eq!(json, "\"phase2\"");
    }
}
