//! Atomic file writes shared by every persisted artifact.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};

/// Write `contents` to a temp file in the target directory, then rename it
/// over `path`. Readers observe either the old or the new file, never a mix.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;

    let prefix = format!(
        ".{}.",
        path.file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    );
    let mut tmp = tempfile::Builder::new()
        .prefix(&prefix)
        .suffix(".tmp")
        .tempfile_in(parent)
        .with_context(|| format!("create temp file in {}", parent.display()))?;
    tmp.write_all(contents.as_bytes())
        .with_context(|| format!("write temp file for {}", path.display()))?;
    tmp.as_file()
        .sync_all()
        .with_context(|| format!("sync temp file for {}", path.display()))?;
    tmp.persist(path)
        .map_err(|err| err.error)
        .with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Write trimmed text with exactly one trailing newline.
pub fn write_text(path: &Path, contents: &str) -> Result<()> {
    let mut buf = contents.trim().to_string();
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Read a text artifact, treating a missing file as empty.
pub fn read_text(path: &Path) -> Result<String> {
    if !path.exists() {
        return Ok(String::new());
    }
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    Ok(contents.trim().to_string())
}

/// Pretty JSON with a trailing newline, written atomically.
pub fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_atomic_replaces_existing_content() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("nested/dir/file.txt");

        write_atomic(&path, "first").expect("write first");
        write_atomic(&path, "second").expect("write second");

        assert_eq!(fs::read_to_string(&path).expect("read"), "second");
    }

    /// No temp files are left next to the target after a successful write.
    #[test]
    fn write_atomic_leaves_no_temp_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("state.json");

        write_atomic(&path, "{}").expect("write");

        let names: Vec<_> = fs::read_dir(temp.path())
            .expect("read dir")
            .map(|entry| entry.expect("entry").file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json")]);
    }

    #[test]
    fn text_helpers_trim_and_tolerate_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("note.md");

        assert_eq!(read_text(&path).expect("missing"), "");
        write_text(&path, "\n  body  \n\n").expect("write");
        assert_eq!(fs::read_to_string(&path).expect("read"), "body\n");
        assert_eq!(read_text(&path).expect("read"), "body");
    }
}
