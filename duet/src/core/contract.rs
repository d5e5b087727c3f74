//! Structural validation of untrusted agent output.
//!
//! Agents answer in free text. The orchestrator only trusts a handful of
//! line-level markers (`STATUS: DONE`, `<AGENT>_APPROVAL: YES|NO`,
//! `OPEN_FINDINGS`, `FINDING_STATUS`, `NEW_FINDING`) and only when they appear
//! outside of `<<<LABEL_BEGIN>>> ... <<<LABEL_END>>>` blocks, which carry
//! echoed prompt context and must never be interpreted.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;

use crate::core::types::{Approval, FindingId, FindingStatus};
use crate::error::ValidationError;

/// Required final line of every agent answer.
pub const DONE_MARKER: &str = "STATUS: DONE";
/// Readiness flag reported by the implementer in phase 2.
pub const IMPLEMENTATION_READY: &str = "IMPLEMENTATION_READY";

static OPEN_DELIMITER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<<<\s*([A-Z_]+)_BEGIN\s*>>>").expect("open delimiter regex should compile")
});
static CLOSE_DELIMITER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)<<<\s*([A-Z_]+)_END\s*>>>").expect("close delimiter regex should compile")
});
static FINDING_STATUS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*FINDING_STATUS[ \t]*:[ \t]*([A-Za-z0-9_-]+)[ \t]*\|[ \t]*(OPEN|CLOSED)[ \t]*\|.+$")
        .expect("finding status regex should compile")
});
static NEW_FINDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^[ \t]*NEW_FINDING[ \t]*:[ \t]*([A-Za-z0-9_-]+)[ \t]*\|[ \t]*(.+?)[ \t]*\|[ \t]*(.+?)\s*$")
        .expect("new finding regex should compile")
});

/// Approval key derived from an agent name, e.g. `codex` -> `CODEX_APPROVAL`.
pub fn approval_key(agent: &str) -> String {
    format!("{}_APPROVAL", agent.trim().to_ascii_uppercase())
}

/// Remove every `<<<LABEL_BEGIN>>> ... <<<LABEL_END>>>` block.
///
/// Blocks are matched non-greedily with the same label on both ends. Removal
/// repeats until no block survives, so the result is a fixed point.
pub fn strip_delimited_sections(text: &str) -> String {
    let mut current = strip_once(text);
    loop {
        let next = strip_once(&current);
        if next.len() == current.len() {
            return next;
        }
        current = next;
    }
}

fn strip_once(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut copied_until = 0;
    let mut search_from = 0;

    while let Some(open) = OPEN_DELIMITER_RE.captures_at(text, search_from) {
        let (Some(whole), Some(label)) = (open.get(0), open.get(1)) else {
            break;
        };
        match find_closing(text, whole.end(), label.as_str()) {
            Some(block_end) => {
                out.push_str(&text[copied_until..whole.start()]);
                copied_until = block_end;
                search_from = block_end;
            }
            // `<` is ASCII, so one byte past the match start is a char boundary.
            None => search_from = whole.start() + 1,
        }
    }
    out.push_str(&text[copied_until..]);
    out
}

fn find_closing(text: &str, from: usize, label: &str) -> Option<usize> {
    CLOSE_DELIMITER_RE
        .captures_iter(&text[from..])
        .find(|caps| {
            caps.get(1)
                .is_some_and(|found| found.as_str().eq_ignore_ascii_case(label))
        })
        .and_then(|caps| caps.get(0))
        .map(|whole| from + whole.end())
}

/// True when the last non-blank line outside delimited blocks is `STATUS: DONE`.
pub fn has_done_marker(text: &str) -> bool {
    let stripped = strip_delimited_sections(text);
    stripped
        .lines()
        .map(str::trim)
        .rfind(|line| !line.is_empty())
        .is_some_and(|line| line == DONE_MARKER)
}

/// Value of the last non-empty `KEY: VALUE` line whose key matches case-insensitively.
fn last_marker_value<'a>(text: &'a str, key: &str) -> Option<&'a str> {
    text.lines().rev().find_map(|line| {
        let (found, value) = line.split_once(':')?;
        let value = value.trim();
        (found.trim().eq_ignore_ascii_case(key) && !value.is_empty()).then_some(value)
    })
}

/// Resolve a YES/NO marker; the last well-formed line wins.
///
/// Lines carrying any other value are not markers and are skipped.
pub fn parse_flag(text: &str, key: &str) -> Option<Approval> {
    let stripped = strip_delimited_sections(text);
    stripped.lines().rev().find_map(|line| {
        let (found, value) = line.split_once(':')?;
        if found.trim().eq_ignore_ascii_case(key) {
            Approval::parse(value)
        } else {
            None
        }
    })
}

/// Raw ids listed by the last `OPEN_FINDINGS:` line, upper-cased.
///
/// `None` when the marker is absent; an empty list for `NONE`.
pub fn parse_open_findings(text: &str) -> Option<Vec<String>> {
    let stripped = strip_delimited_sections(text);
    let raw = last_marker_value(&stripped, "OPEN_FINDINGS")?;
    if raw.eq_ignore_ascii_case("NONE") {
        return Some(Vec::new());
    }
    Some(
        raw.split(',')
            .map(|item| item.trim().to_ascii_uppercase())
            .filter(|item| !item.is_empty())
            .collect(),
    )
}

/// `FINDING_STATUS: <id> | OPEN|CLOSED | <rationale>` lines, last line per id wins.
pub fn parse_finding_statuses(text: &str) -> BTreeMap<String, FindingStatus> {
    let stripped = strip_delimited_sections(text);
    let mut statuses = BTreeMap::new();
    for caps in FINDING_STATUS_RE.captures_iter(&stripped) {
        let (Some(id), Some(status)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        if let Some(status) = FindingStatus::parse(status.as_str()) {
            statuses.insert(id.as_str().to_ascii_uppercase(), status);
        }
    }
    statuses
}

/// A reviewer-declared new finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewFinding {
    pub summary: String,
    pub acceptance: String,
}

/// `NEW_FINDING: <id> | <summary> | <acceptance>` lines, last line per id wins.
pub fn parse_new_findings(text: &str) -> BTreeMap<String, NewFinding> {
    let stripped = strip_delimited_sections(text);
    let mut findings = BTreeMap::new();
    for caps in NEW_FINDING_RE.captures_iter(&stripped) {
        let (Some(id), Some(summary), Some(acceptance)) = (caps.get(1), caps.get(2), caps.get(3))
        else {
            continue;
        };
        findings.insert(
            id.as_str().to_ascii_uppercase(),
            NewFinding {
                summary: summary.as_str().trim().to_string(),
                acceptance: acceptance.as_str().trim().to_string(),
            },
        );
    }
    findings
}

/// Validate the approval/findings protocol of a reviewer answer.
///
/// Returns the normalized open findings on success, or one rejection reason.
/// Checks run in a fixed order and stop at the first violation.
pub fn validate_findings(
    text: &str,
    previous_open: &[FindingId],
    approval_key: &str,
) -> Result<Vec<FindingId>, String> {
    let Some(approval) = parse_flag(text, approval_key) else {
        return Err(format!("missing or invalid {approval_key} marker"));
    };
    let Some(raw_open) = parse_open_findings(text) else {
        return Err("missing OPEN_FINDINGS marker".to_string());
    };

    let mut open = Vec::with_capacity(raw_open.len());
    for raw in &raw_open {
        match FindingId::parse(raw) {
            Some(id) => open.push(id),
            None => return Err(format!("invalid finding id '{raw}' (expected format F-001)")),
        }
    }
    let unique: BTreeSet<&FindingId> = open.iter().collect();
    if unique.len() != open.len() {
        return Err("OPEN_FINDINGS contains duplicate finding ids".to_string());
    }

    match approval {
        Approval::Yes if !open.is_empty() => {
            return Err(format!(
                "{approval_key}: YES is only allowed when OPEN_FINDINGS: NONE"
            ));
        }
        Approval::No if open.is_empty() => {
            return Err(format!(
                "{approval_key}: NO requires at least one open finding"
            ));
        }
        _ => {}
    }

    let statuses = parse_finding_statuses(text);
    for raw in statuses.keys() {
        if FindingId::parse(raw).is_none() {
            return Err(format!(
                "invalid finding id '{raw}' in FINDING_STATUS (expected format F-001)"
            ));
        }
    }
    for id in previous_open {
        if !statuses.contains_key(id.as_str()) {
            return Err(format!(
                "missing FINDING_STATUS line for previous open finding {id}"
            ));
        }
    }

    let new_findings = parse_new_findings(text);
    for raw in new_findings.keys() {
        if FindingId::parse(raw).is_none() {
            return Err(format!(
                "invalid finding id '{raw}' in NEW_FINDING (expected format F-001)"
            ));
        }
    }
    let previous: BTreeSet<&FindingId> = previous_open.iter().collect();
    for id in &open {
        if !previous.contains(id) && !new_findings.contains_key(id.as_str()) {
            return Err(format!(
                "new open finding {id} requires NEW_FINDING: {id} | <summary> | <acceptance>"
            ));
        }
    }

    Ok(open)
}

/// Completion check followed by the findings protocol.
pub fn validate(
    text: &str,
    previous_open: &[FindingId],
    approval_key: &str,
) -> Result<Vec<FindingId>, String> {
    if !has_done_marker(text) {
        return Err(format!(
            "missing required final completion marker '{DONE_MARKER}'"
        ));
    }
    validate_findings(text, previous_open, approval_key)
}

/// Findings contract attached to a reviewer call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FindingsContract {
    pub approval_key: String,
    pub previous_open: Vec<FindingId>,
}

/// Everything an answer must satisfy before the controller accepts it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OutputContract {
    /// Flags that must resolve to YES/NO; `A|B` accepts either key.
    pub required_flags: Vec<String>,
    pub findings: Option<FindingsContract>,
}

impl OutputContract {
    /// Contract requiring the given flags only.
    pub fn flags<I, S>(flags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required_flags: flags.into_iter().map(Into::into).collect(),
            findings: None,
        }
    }

    /// Contract for a reviewer answer: approval flag plus the findings protocol.
    pub fn review(approval_key: &str, previous_open: &[FindingId]) -> Self {
        Self {
            required_flags: vec![approval_key.to_string()],
            findings: Some(FindingsContract {
                approval_key: approval_key.to_string(),
                previous_open: previous_open.to_vec(),
            }),
        }
    }

    /// Accept the answer or report its first violation.
    pub fn check(&self, text: &str) -> Result<(), ValidationError> {
        if !has_done_marker(text) {
            return Err(ValidationError::new(format!(
                "missing required final completion marker '{DONE_MARKER}'"
            )));
        }

        let missing: Vec<&str> = self
            .required_flags
            .iter()
            .map(String::as_str)
            .filter(|flag| {
                !flag
                    .split('|')
                    .any(|alternative| parse_flag(text, alternative.trim()).is_some())
            })
            .collect();
        if !missing.is_empty() {
            return Err(ValidationError::new(format!(
                "missing required flags: {}",
                missing.join(", ")
            )));
        }

        let Some(findings) = self.findings.as_ref() else {
            return Ok(());
        };
        validate_findings(text, &findings.previous_open, &findings.approval_key)
            .map(|_| ())
            .map_err(ValidationError::new)
    }
}
