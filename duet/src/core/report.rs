//! Parsing of the implementer's free-text report.

use std::sync::LazyLock;

use regex::Regex;

static CHANGED_FILES_HEADING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^#+\s*Changed Files\s*$").expect("changed files heading regex should compile")
});
static HEADING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^#+\s+").expect("heading regex should compile"));
static BULLET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[-*]\s+(`?)([^`]+?)`?\s*$").expect("bullet regex should compile")
});

/// Paths listed under a `## Changed Files` heading, in report order.
///
/// The section ends at the next heading, at a protocol marker line, or at the
/// first blank line after at least one entry.
pub fn parse_changed_files(report: &str) -> Vec<String> {
    let mut changed = Vec::new();
    let mut in_section = false;

    for raw_line in report.lines() {
        let line = raw_line.trim();
        if !in_section {
            in_section = CHANGED_FILES_HEADING_RE.is_match(line);
            continue;
        }
        if line.is_empty() {
            if changed.is_empty() {
                continue;
            }
            break;
        }
        if HEADING_RE.is_match(line)
            || line.starts_with("IMPLEMENTATION_READY:")
            || line.starts_with("STATUS:")
        {
            break;
        }
        let Some(caps) = BULLET_RE.captures(line) else {
            continue;
        };
        let opened_with_tick = caps.get(1).is_some_and(|tick| !tick.as_str().is_empty());
        let closed_with_tick = line.ends_with('`');
        if opened_with_tick != closed_with_tick {
            continue;
        }
        if let Some(candidate) = caps.get(2).map(|c| c.as_str().trim())
            && is_plausible_path(candidate)
        {
            changed.push(candidate.to_string());
        }
    }
    changed
}

/// Reject prose and markdown so only filename-like entries are considered.
pub fn is_plausible_path(value: &str) -> bool {
    !value.is_empty()
        && !value.starts_with('#')
        && !value.starts_with("...")
        && !value.chars().any(|c| c.is_whitespace() || c == '|' || c == ':')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_bullets_under_the_heading() {
        let report = "Did things.\n\n## Changed Files\n- `src/lib.rs`\n* tests/it.rs\n\nIMPLEMENTATION_READY: YES\nSTATUS: DONE";
        assert_eq!(
            parse_changed_files(report),
            vec!["src/lib.rs".to_string(), "tests/it.rs".to_string()]
        );
    }

    #[test]
    fn stops_at_next_heading_or_marker() {
        let report = "### changed files\n- a.rs\n## Notes\n- b.rs";
        assert_eq!(parse_changed_files(report), vec!["a.rs".to_string()]);
        let report = "## Changed Files\n- a.rs\nSTATUS: DONE\n- b.rs";
        assert_eq!(parse_changed_files(report), vec!["a.rs".to_string()]);
    }

    #[test]
    fn skips_prose_entries() {
        let report = "## Changed Files\n- updated the parser\n- note: none\n- `src/ok.rs`";
        assert_eq!(parse_changed_files(report), vec!["src/ok.rs".to_string()]);
    }

    #[test]
    fn missing_heading_yields_nothing() {
        assert!(parse_changed_files("- src/lib.rs\nSTATUS: DONE").is_empty());
    }

    #[test]
    fn plausible_paths_exclude_markdown_and_ellipsis() {
        assert!(is_plausible_path("src/main.rs"));
        assert!(!is_plausible_path("# heading"));
        assert!(!is_plausible_path("...more"));
        assert!(!is_plausible_path("a|b"));
    }
}
