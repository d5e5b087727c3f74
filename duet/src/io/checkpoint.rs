//! Per-cycle run-state snapshots under `.orchestrator/checkpoints/`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::types::Phase;
use crate::io::atomic::write_json;

/// `<dir>/<phase>-cycle-<n>.json`
pub fn checkpoint_path(dir: &Path, phase: Phase, cycle: u32) -> PathBuf {
    dir.join(format!("{phase}-cycle-{cycle}.json"))
}

/// Write a snapshot for `(phase, cycle)`, superseding any earlier one.
pub fn write_checkpoint<T: Serialize>(
    dir: &Path,
    phase: Phase,
    cycle: u32,
    state: &T,
) -> Result<PathBuf> {
    let path = checkpoint_path(dir, phase, cycle);
    debug!(path = %path.display(), "writing checkpoint");
    write_json(&path, state)?;
    Ok(path)
}

/// Read the snapshot for `(phase, cycle)` as raw JSON, if one exists.
pub fn read_checkpoint<T: DeserializeOwned>(
    dir: &Path,
    phase: Phase,
    cycle: u32,
) -> Result<Option<T>> {
    let path = checkpoint_path(dir, phase, cycle);
    if !path.is_file() {
        return Ok(None);
    }
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read checkpoint {}", path.display()))?;
    let value = serde_json::from_str(&contents)
        .with_context(|| format!("parse checkpoint {}", path.display()))?;
    Ok(Some(value))
}

#[cfg(test)]
mod tests {
    use serde_json::{Value, json};

    use super::*;

    #[test]
    fn checkpoint_names_are_stable() {
        let path = checkpoint_path(Path::new("/state/checkpoints"), Phase::Phase2, 3);
        assert_eq!(path, Path::new("/state/checkpoints/phase2-cycle-3.json"));
    }

    #[test]
    fn later_write_supersedes_earlier_snapshot() {
        let temp = tempfile::tempdir().expect("tempdir");
        write_checkpoint(temp.path(), Phase::Phase1, 1, &json!({"cycle": 0})).expect("first");
        write_checkpoint(temp.path(), Phase::Phase1, 1, &json!({"cycle": 7})).expect("second");

        let loaded: Option<Value> =
            read_checkpoint(temp.path(), Phase::Phase1, 1).expect("read");
        assert_eq!(loaded, Some(json!({"cycle": 7})));
    }

    #[test]
    fn missing_checkpoint_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let loaded: Option<Value> =
            read_checkpoint(temp.path(), Phase::Phase2, 9).expect("read");
        assert!(loaded.is_none());
    }
}
