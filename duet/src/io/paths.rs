//! Canonical `.orchestrator/` layout, scaffolding, and the single-writer lock.

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use fs2::FileExt;
use tracing::debug;

use crate::core::path::{is_within_any, normalize_lexically};
use crate::io::atomic::write_atomic;
use crate::io::config::{OrchestratorConfig, write_config};

/// Task file used when none is given on the command line.
pub const DEFAULT_TASK_FILE: &str = "task.md";

const ORCHESTRATOR_GITIGNORE: &str = "logs/\ncheckpoints/\nrun.lock\n";

/// All canonical paths within `.orchestrator/` for a workspace root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorPaths {
    pub root: PathBuf,
    /// Holds run state, logs, checkpoints and run artifacts.
    pub state_dir: PathBuf,
    pub state_file: PathBuf,
    pub config_path: PathBuf,
    pub lock_path: PathBuf,
    pub log_dir: PathBuf,
    pub checkpoint_dir: PathBuf,
    pub artifact_root: PathBuf,
    pub runs_dir: PathBuf,
    pub latest_run_file: PathBuf,
    pub gitignore_path: PathBuf,
}

impl OrchestratorPaths {
    /// Layout under `root`, which is made absolute so stored paths are too.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let root = std::path::absolute(&root).unwrap_or(root);
        let state_dir = root.join(".orchestrator");
        Self {
            root: root.clone(),
            state_dir: state_dir.clone(),
            state_file: state_dir.join("state.json"),
            config_path: state_dir.join("config.toml"),
            lock_path: state_dir.join("run.lock"),
            log_dir: state_dir.join("logs"),
            checkpoint_dir: state_dir.join("checkpoints"),
            artifact_root: state_dir.clone(),
            runs_dir: state_dir.join("runs"),
            latest_run_file: state_dir.join("LATEST_RUN.txt"),
            gitignore_path: state_dir.join(".gitignore"),
        }
    }

    /// Create the directories a run writes into.
    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [
            &self.state_dir,
            &self.log_dir,
            &self.checkpoint_dir,
            &self.runs_dir,
        ] {
            create_dir(dir)?;
        }
        Ok(())
    }

    /// Roots that persisted paths must stay under.
    pub fn trusted_roots(&self) -> Vec<PathBuf> {
        vec![canonical_or_self(&self.artifact_root), canonical_or_self(&self.root)]
    }

    /// Resolve a path read from state and accept it only inside a trusted root.
    pub fn resolve_trusted(&self, raw: &Path) -> Option<PathBuf> {
        if raw.as_os_str().is_empty() {
            return None;
        }
        let resolved = resolve_existing_prefix(&normalize_lexically(raw, &self.root));
        is_within_any(&resolved, &self.trusted_roots()).then_some(resolved)
    }
}

/// Options for [`init_orchestrator`].
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite an existing config file.
    pub force: bool,
}

/// Create `.orchestrator/` scaffolding and a default config in `root`.
pub fn init_orchestrator(root: &Path, options: &InitOptions) -> Result<OrchestratorPaths> {
    let paths = OrchestratorPaths::new(root);
    if paths.state_dir.exists() && !paths.state_dir.is_dir() {
        return Err(anyhow!(
            "duet init: .orchestrator exists but is not a directory"
        ));
    }
    if paths.config_path.exists() && !options.force {
        return Err(anyhow!(
            "duet init: {} already exists (use --force to overwrite)",
            paths.config_path.display()
        ));
    }

    paths.ensure_dirs()?;
    write_config(&paths.config_path, &OrchestratorConfig::default())?;
    write_atomic(&paths.gitignore_path, ORCHESTRATOR_GITIGNORE)?;
    Ok(paths)
}

/// Exclusive advisory lock on `run.lock`, released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without blocking; a second holder fails fast.
    pub fn acquire(paths: &OrchestratorPaths) -> Result<Self> {
        create_dir(&paths.state_dir)?;
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&paths.lock_path)
            .with_context(|| format!("open lock {}", paths.lock_path.display()))?;
        file.try_lock_exclusive().map_err(|err| {
            anyhow!(
                "another duet run holds {} ({err})",
                paths.lock_path.display()
            )
        })?;
        debug!(path = %paths.lock_path.display(), "run lock acquired");
        Ok(Self {
            file,
            path: paths.lock_path.clone(),
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if let Err(err) = FileExt::unlock(&self.file) {
            debug!(path = %self.path.display(), err = %err, "failed to release run lock");
        }
    }
}

fn create_dir(path: &Path) -> Result<()> {
    fs::create_dir_all(path).with_context(|| format!("create directory {}", path.display()))
}

fn canonical_or_self(path: &Path) -> PathBuf {
    resolve_existing_prefix(path)
}

/// Canonicalize the longest existing ancestor and re-append the rest, so
/// symlinks are followed for parts that exist and missing files still resolve.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    let mut existing = path;
    let mut rest = Vec::new();
    loop {
        if let Ok(canonical) = fs::canonicalize(existing) {
            let mut resolved = canonical;
            for part in rest.iter().rev() {
                resolved.push(part);
            }
            return resolved;
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                rest.push(name.to_os_string());
                existing = parent;
            }
            _ => return path.to_path_buf(),
        }
    }
}
