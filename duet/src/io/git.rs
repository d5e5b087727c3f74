//! Git adapter for review context.
//!
//! Reviewers see the repository through bounded snapshots only, so this is a
//! small, explicit wrapper around read-only `git` subprocess calls.

use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::path::{is_within_any, normalize_lexically};
use crate::core::report::is_plausible_path;

const EMPTY: &str = "(empty)";

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    /// Status, diffstat and (bounded) diff of the working tree.
    ///
    /// Git failures are shown inline instead of failing the review step.
    #[instrument(skip_all, fields(max_diff_chars))]
    pub fn repo_snapshot(&self, max_diff_chars: usize) -> String {
        let status = match self.run(&["status", "--short"]) {
            Ok(output) => output,
            Err(err) if is_not_found(&err) => return "Git is not available in PATH.".to_string(),
            Err(err) => return format!("git status failed: {err:#}"),
        };
        let diffstat = self.run(&["diff", "--stat"]);
        let diff = self.run(&["diff"]);

        let mut sections = vec![
            "=== git status --short ===".to_string(),
            section_text(Ok(status)),
            "\n=== git diff --stat ===".to_string(),
            section_text(diffstat),
            "\n=== git diff (possibly truncated) ===".to_string(),
        ];
        let raw_diff = section_text(diff);
        let total = raw_diff.chars().count();
        if total > max_diff_chars {
            sections.push(raw_diff.chars().take(max_diff_chars).collect());
            sections.push("\n...[truncated]".to_string());
            debug!(total, "diff truncated");
        } else {
            sections.push(raw_diff);
        }
        sections.join("\n").trim().to_string()
    }

    /// Paths reported by `git diff --name-only`.
    pub fn changed_files(&self) -> Result<Vec<String>> {
        let out = self.run_capture(&["diff", "--name-only"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// stdout on success, stderr otherwise, `(empty)` when blank.
fn section_text(result: Result<Output>) -> String {
    let text = match result {
        Ok(output) if output.status.success() => {
            String::from_utf8_lossy(&output.stdout).trim().to_string()
        }
        Ok(output) => String::from_utf8_lossy(&output.stderr).trim().to_string(),
        Err(err) => format!("{err:#}"),
    };
    if text.is_empty() {
        EMPTY.to_string()
    } else {
        text
    }
}

fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<std::io::Error>()
        .is_some_and(|io| io.kind() == ErrorKind::NotFound)
}

/// Limits for [`collect_file_snapshots`].
#[derive(Debug, Clone, Copy)]
pub struct SnapshotLimits {
    pub max_lines: usize,
    pub max_files: usize,
}

/// Bounded plaintext snapshots of changed files, wrapped in a FILES block.
///
/// Entries that do not look like paths are ignored; paths outside `root` are
/// listed but not read.
pub fn collect_file_snapshots(root: &Path, files: &[String], limits: SnapshotLimits) -> String {
    let mut parts: Vec<String> = Vec::new();
    let mut seen: BTreeSet<&str> = BTreeSet::new();
    let roots = [root.to_path_buf()];

    for raw in files {
        let path_text = raw.trim();
        if !is_plausible_path(path_text) || !seen.insert(path_text) {
            continue;
        }
        if seen.len() > limits.max_files {
            break;
        }

        parts.push(format!("### {path_text}"));
        let path = normalize_lexically(Path::new(path_text), root);
        if !is_within_any(&path, &roots) {
            parts.push("[skip] Path is outside the workspace.".to_string());
        } else if !path.exists() {
            parts.push("[missing] File does not exist.".to_string());
        } else if path.is_dir() {
            parts.push("[skip] Path is a directory.".to_string());
        } else {
            match fs::read_to_string(&path) {
                Ok(contents) => push_bounded_lines(&mut parts, &contents, limits.max_lines),
                Err(err) => {
                    warn!(path = %path.display(), err = %err, "could not read changed file");
                    parts.push(format!("[error] Could not read file: {err}"));
                }
            }
        }
        parts.push(String::new());
    }

    let body = parts.join("\n");
    let body = match body.trim() {
        "" => EMPTY,
        trimmed => trimmed,
    };
    format!("<<<FILES_BEGIN>>>\n{body}\n<<<FILES_END>>>")
}

fn push_bounded_lines(parts: &mut Vec<String>, contents: &str, max_lines: usize) {
    let lines: Vec<&str> = contents.lines().collect();
    if lines.is_empty() {
        parts.push(EMPTY.to_string());
        return;
    }
    parts.push(lines.iter().take(max_lines).copied().collect::<Vec<_>>().join("\n"));
    if lines.len() > max_lines {
        parts.push(format!("...[truncated to {max_lines} lines]"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: SnapshotLimits = SnapshotLimits {
        max_lines: 2,
        max_files: 3,
    };

    #[test]
    fn snapshots_are_bounded_and_deduplicated() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("a.rs"), "one\ntwo\nthree\n").expect("write");
        fs::create_dir(temp.path().join("dir")).expect("mkdir");
        let files = vec![
            "a.rs".to_string(),
            "a.rs".to_string(),
            "## heading".to_string(),
            "dir".to_string(),
            "gone.rs".to_string(),
            "extra.rs".to_string(),
        ];

        let snapshot = collect_file_snapshots(temp.path(), &files, LIMITS);

        assert_eq!(
            snapshot,
            "<<<FILES_BEGIN>>>\n### a.rs\none\ntwo\n...[truncated to 2 lines]\n\n### dir\n[skip] Path is a directory.\n\n### gone.rs\n[missing] File does not exist.\n<<<FILES_END>>>"
        );
    }

    #[test]
    fn paths_outside_the_root_are_not_read() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = vec!["../../etc/passwd".to_string()];
        let snapshot = collect_file_snapshots(temp.path(), &files, LIMITS);
        assert!(snapshot.contains("[skip] Path is outside the workspace."));
    }

    #[test]
    fn empty_input_yields_empty_block() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(
            collect_file_snapshots(temp.path(), &[], LIMITS),
            "<<<FILES_BEGIN>>>\n(empty)\n<<<FILES_END>>>"
        );
    }

    #[test]
    fn empty_files_are_marked() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("blank.txt"), "").expect("write");
        let snapshot = collect_file_snapshots(temp.path(), &["blank.txt".to_string()], LIMITS);
        assert!(snapshot.contains("### blank.txt\n(empty)"));
    }

    #[test]
    fn repo_snapshot_reports_git_errors_inline() {
        let temp = tempfile::tempdir().expect("tempdir");
        let snapshot = Git::new(temp.path()).repo_snapshot(100);
        // Outside a repository git either is missing or fails; neither panics.
        assert!(!snapshot.is_empty());
    }
}
