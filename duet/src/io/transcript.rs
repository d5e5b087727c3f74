//! Shared phase transcripts and per-attempt agent logs.

use std::path::{Path, PathBuf};

use anyhow::Result;

use crate::io::atomic::{read_text, write_atomic, write_text};
use crate::io::run_state::now_rfc3339;

const SECTION_SEPARATOR: &str = "\n\n---\n\n";

/// Render one transcript section.
pub fn format_section(title: &str, timestamp: &str, body: &str) -> String {
    format!("## {title}\n\n_Time: {timestamp}_\n\n{}\n", body.trim())
}

/// Append a titled section to the transcript at `path`.
///
/// The whole file is rewritten atomically so a crash never leaves a partial
/// section behind.
pub fn append_section(path: &Path, title: &str, body: &str) -> Result<()> {
    let existing = read_text(path)?;
    let section = format_section(title, &now_rfc3339(), body);
    let contents = if existing.is_empty() {
        section
    } else {
        format!("{}{SECTION_SEPARATOR}{section}", existing.trim_end())
    };
    write_atomic(path, &contents)
}

/// Transcript title for one agent step, e.g. `Phase 1 / Cycle 2 / Codex Review`.
pub fn section_title(phase_number: u8, cycle: u32, agent: &str, step: &str) -> String {
    format!("Phase {phase_number} / Cycle {cycle} / {} {step}", display_name(agent))
}

/// `codex` -> `Codex`.
pub fn display_name(agent: &str) -> String {
    let mut chars = agent.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

/// Location of raw attempt output under the log directory.
#[derive(Debug, Clone)]
pub struct AttemptLog {
    dir: PathBuf,
}

impl AttemptLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<prefix>.attempt-<n>.log`
    pub fn primary_path(&self, prefix: &str, attempt: u32) -> PathBuf {
        self.dir.join(format!("{prefix}.attempt-{attempt}.log"))
    }

    /// `<prefix>.attempt-<n>.<fallback>-fallback.log`
    pub fn fallback_path(&self, prefix: &str, attempt: u32, fallback: &str) -> PathBuf {
        self.dir
            .join(format!("{prefix}.attempt-{attempt}.{fallback}-fallback.log"))
    }

    pub fn write(&self, path: &Path, output: &str) -> Result<()> {
        write_text(path, output)
    }
}
