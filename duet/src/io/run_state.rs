//! Versioned run state (`.orchestrator/state.json`) and its checkpoints.
//!
//! Loaded state is untrusted: it is shape-checked at the JSON level, finding
//! ids are re-validated, and every embedded path must resolve under a trusted
//! root before it is reused.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::core::types::{Approval, FindingId, FindingStatus, Phase, PhaseStatus, Role};
use crate::io::atomic::write_json;
use crate::io::checkpoint::{read_checkpoint, write_checkpoint};
use crate::io::paths::OrchestratorPaths;

/// Current on-disk schema version.
pub const STATE_VERSION: u32 = 2;

/// UTC timestamp used throughout persisted artifacts.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Run id in the `YYYYMMDD-HHMMSSZ` shape.
pub fn new_run_id() -> String {
    Utc::now().format("%Y%m%d-%H%M%SZ").to_string()
}

/// Files produced by one run under `<artifact root>/runs/<run_id>/`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Artifacts {
    pub run_id: String,
    pub run_dir: PathBuf,
    /// Snapshot of the task file taken at run start.
    pub task: PathBuf,
    pub phase1_shared: PathBuf,
    pub phase2_shared: PathBuf,
}

impl Artifacts {
    pub fn build(run_id: &str, runs_dir: &Path) -> Self {
        let run_dir = runs_dir.join(run_id);
        Self {
            run_id: run_id.to_string(),
            task: run_dir.join("00_task.md"),
            phase1_shared: run_dir.join("10_phase1_plan.md"),
            phase2_shared: run_dir.join("20_phase2_implementation.md"),
            run_dir,
        }
    }

    /// Transcript file for `phase`; `Done` has none.
    pub fn shared_for(&self, phase: Phase) -> Option<&Path> {
        match phase {
            Phase::Phase1 => Some(&self.phase1_shared),
            Phase::Phase2 => Some(&self.phase2_shared),
            Phase::Done => None,
        }
    }
}

/// Progress of a single phase.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PhaseState {
    pub status: PhaseStatus,
    /// Number of the cycle in progress (or last finished); 0 before the first.
    pub cycle: u32,
    pub max_cycles: u32,
    pub approvals: BTreeMap<Role, Approval>,
    pub open_findings: Vec<FindingId>,
    pub finding_history: BTreeMap<FindingId, FindingStatus>,
    /// Implementer readiness from the latest phase 2 cycle.
    pub implementation_ready: Approval,
    pub last_test_exit: Option<i32>,
    pub last_test_snapshot: String,
    pub error: Option<String>,
    pub completed_at: Option<String>,
}

impl PhaseState {
    pub fn new(max_cycles: u32) -> Self {
        Self {
            max_cycles,
            ..Self::default()
        }
    }

    pub fn approval(&self, role: Role) -> Approval {
        self.approvals.get(&role).copied().unwrap_or_default()
    }

    /// Whether the previous cycle's tests failed with output worth replaying.
    pub fn has_test_failure(&self) -> bool {
        matches!(self.last_test_exit, Some(code) if code != 0)
            && !self.last_test_snapshot.trim().is_empty()
    }
}

/// Persisted bookkeeping for one orchestrator run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    pub version: u32,
    pub task_file: PathBuf,
    pub started_at: String,
    pub updated_at: String,
    pub phase: Phase,
    pub artifacts: Artifacts,
    pub phase1: PhaseState,
    pub phase2: PhaseState,
}

impl RunState {
    pub fn phase_state(&self, phase: Phase) -> Option<&PhaseState> {
        match phase {
            Phase::Phase1 => Some(&self.phase1),
            Phase::Phase2 => Some(&self.phase2),
            Phase::Done => None,
        }
    }

    pub fn phase_state_mut(&mut self, phase: Phase) -> Option<&mut PhaseState> {
        match phase {
            Phase::Phase1 => Some(&mut self.phase1),
            Phase::Phase2 => Some(&mut self.phase2),
            Phase::Done => None,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = now_rfc3339();
    }
}

/// Inputs needed to build or repair a run state.
#[derive(Debug, Clone)]
pub struct StateDefaults<'a> {
    pub task_file: &'a Path,
    pub phase1_max_cycles: u32,
    pub phase2_max_cycles: u32,
}

/// Fresh version-2 state with a new artifact bundle.
pub fn init_state(defaults: &StateDefaults<'_>, artifacts: Artifacts) -> RunState {
    let now = now_rfc3339();
    RunState {
        version: STATE_VERSION,
        task_file: absolute(defaults.task_file),
        started_at: now.clone(),
        updated_at: now,
        phase: Phase::Phase1,
        artifacts,
        phase1: PhaseState::new(defaults.phase1_max_cycles),
        phase2: PhaseState::new(defaults.phase2_max_cycles),
    }
}

/// Reads and writes `state.json` and the per-cycle checkpoints.
#[derive(Debug, Clone)]
pub struct StateStore {
    paths: OrchestratorPaths,
}

impl StateStore {
    pub fn new(paths: OrchestratorPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &OrchestratorPaths {
        &self.paths
    }

    pub fn exists(&self) -> bool {
        self.paths.state_file.is_file()
    }

    /// Load and normalize the persisted state.
    ///
    /// A missing file, an unreadable document or a foreign schema version
    /// yields a fresh state.
    pub fn load(&self, defaults: &StateDefaults<'_>) -> Result<RunState> {
        let path = &self.paths.state_file;
        if !path.is_file() {
            debug!(path = %path.display(), "no run state; starting fresh");
            return Ok(self.fresh(defaults));
        }
        let contents =
            fs::read_to_string(path).with_context(|| format!("read run state {}", path.display()))?;
        let raw = match serde_json::from_str::<Value>(&contents) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(path = %path.display(), err = %err, "run state is not valid JSON; starting fresh");
                return Ok(self.fresh(defaults));
            }
        };
        let state = self.normalize(raw, defaults);
        debug!(run_id = %state.artifacts.run_id, phase = %state.phase, "run state loaded");
        Ok(state)
    }

    /// Atomically write the state (temp file + rename).
    pub fn save(&self, state: &RunState) -> Result<()> {
        debug!(
            path = %self.paths.state_file.display(),
            phase = %state.phase,
            "writing run state"
        );
        write_json(&self.paths.state_file, state)
    }

    pub fn write_checkpoint(&self, phase: Phase, cycle: u32, state: &RunState) -> Result<PathBuf> {
        write_checkpoint(&self.paths.checkpoint_dir, phase, cycle, state)
    }

    /// Load the snapshot for `(phase, cycle)`; it goes through the same
    /// normalization as the main state file.
    pub fn load_checkpoint(
        &self,
        phase: Phase,
        cycle: u32,
        defaults: &StateDefaults<'_>,
    ) -> Result<Option<RunState>> {
        let raw: Option<Value> = read_checkpoint(&self.paths.checkpoint_dir, phase, cycle)?;
        Ok(raw.map(|raw| self.normalize(raw, defaults)))
    }

    /// Roll an interrupted or frozen phase back to the checkpoint of its
    /// current cycle. Without a checkpoint the state is kept as is.
    pub fn recover(&self, state: RunState, defaults: &StateDefaults<'_>) -> Result<RunState> {
        let phase = state.phase;
        let Some(current) = state.phase_state(phase) else {
            return Ok(state);
        };
        let interrupted = matches!(current.status, PhaseStatus::Running | PhaseStatus::Frozen);
        if !interrupted || current.cycle == 0 {
            return Ok(state);
        }
        let cycle = current.cycle;
        match self.load_checkpoint(phase, cycle, defaults) {
            Ok(Some(restored)) => {
                info!(%phase, cycle, "restored state from checkpoint");
                Ok(restored)
            }
            Ok(None) => {
                warn!(%phase, cycle, "no checkpoint for interrupted cycle; continuing with saved state");
                Ok(state)
            }
            Err(err) => {
                warn!(%phase, cycle, err = %format!("{err:#}"), "checkpoint unreadable; continuing with saved state");
                Ok(state)
            }
        }
    }

    fn fresh(&self, defaults: &StateDefaults<'_>) -> RunState {
        init_state(
            defaults,
            Artifacts::build(&new_run_id(), &self.paths.runs_dir),
        )
    }

    fn normalize(&self, mut raw: Value, defaults: &StateDefaults<'_>) -> RunState {
        let version = raw.get("version").and_then(Value::as_u64);
        let shaped = version == Some(u64::from(STATE_VERSION))
            && raw.get("phase1").is_some_and(Value::is_object)
            && raw.get("phase2").is_some_and(Value::is_object);
        if !shaped {
            warn!(?version, "run state has an unsupported schema; starting fresh");
            return self.fresh(defaults);
        }
        for key in ["phase1", "phase2"] {
            if let Some(Value::Object(phase)) = raw.get_mut(key) {
                sanitize_phase(phase);
            }
        }
        if let Value::Object(root) = &mut raw {
            root.entry("task_file")
                .or_insert_with(|| Value::String(defaults.task_file.display().to_string()));
            root.entry("started_at")
                .or_insert_with(|| Value::String(now_rfc3339()));
            root.entry("updated_at")
                .or_insert_with(|| Value::String(now_rfc3339()));
            root.entry("phase")
                .or_insert_with(|| Value::String(Phase::Phase1.as_str().to_string()));
            root.entry("artifacts")
                .or_insert_with(|| Value::Object(Map::new()));
        }

        let mut state: RunState = match serde_json::from_value(raw) {
            Ok(state) => state,
            Err(err) => {
                warn!(err = %err, "run state does not match the schema; starting fresh");
                return self.fresh(defaults);
            }
        };
        self.harden_paths(&mut state, defaults);
        state
    }

    fn harden_paths(&self, state: &mut RunState, defaults: &StateDefaults<'_>) {
        match self.paths.resolve_trusted(&state.task_file) {
            Some(resolved) => state.task_file = resolved,
            None => {
                warn!(
                    task_file = %state.task_file.display(),
                    "invalid task_file in state; using the provided task file"
                );
                state.task_file = absolute(defaults.task_file);
            }
        }

        let artifacts = &state.artifacts;
        let resolved = if artifacts.run_id.trim().is_empty() {
            None
        } else {
            self.resolve_artifacts(artifacts)
        };
        match resolved {
            Some(resolved) => state.artifacts = resolved,
            None => {
                warn!(
                    run_id = %artifacts.run_id,
                    "invalid or incomplete artifact paths in state; regenerating"
                );
                state.artifacts = Artifacts::build(&new_run_id(), &self.paths.runs_dir);
            }
        }
    }

    fn resolve_artifacts(&self, artifacts: &Artifacts) -> Option<Artifacts> {
        Some(Artifacts {
            run_id: artifacts.run_id.clone(),
            run_dir: self.paths.resolve_trusted(&artifacts.run_dir)?,
            task: self.paths.resolve_trusted(&artifacts.task)?,
            phase1_shared: self.paths.resolve_trusted(&artifacts.phase1_shared)?,
            phase2_shared: self.paths.resolve_trusted(&artifacts.phase2_shared)?,
        })
    }
}

/// Upper-case finding ids and drop the malformed ones; keep only approvals
/// for known roles with a YES/NO value.
fn sanitize_phase(phase: &mut Map<String, Value>) {
    let open: Vec<Value> = phase
        .get("open_findings")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(value_text)
                .filter_map(|raw| FindingId::parse(&raw))
                .map(|id| Value::String(id.into()))
                .collect()
        })
        .unwrap_or_default();
    phase.insert("open_findings".to_string(), Value::Array(open));

    let history: Map<String, Value> = phase
        .get("finding_history")
        .and_then(Value::as_object)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|(raw, status)| {
                    let id = FindingId::parse(raw)?;
                    let status = FindingStatus::parse(&value_text(status)?)?;
                    Some((id.into(), Value::String(status.as_str().to_string())))
                })
                .collect()
        })
        .unwrap_or_default();
    phase.insert("finding_history".to_string(), Value::Object(history));

    let approvals: Map<String, Value> = phase
        .get("approvals")
        .and_then(Value::as_object)
        .map(|entries| {
            entries
                .iter()
                .filter(|(role, _)| {
                    serde_json::from_value::<Role>(Value::String((*role).clone())).is_ok()
                })
                .filter_map(|(role, value)| {
                    let approval = Approval::parse(&value_text(value)?)?;
                    Some((role.clone(), Value::String(approval.as_str().to_string())))
                })
                .collect()
        })
        .unwrap_or_default();
    phase.insert("approvals".to_string(), Value::Object(approvals));

    if let Some(ready) = phase.get("implementation_ready").and_then(value_text) {
        let ready = Approval::parse(&ready).unwrap_or_default();
        phase.insert(
            "implementation_ready".to_string(),
            Value::String(ready.as_str().to_string()),
        );
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::String(text) => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn absolute(path: &Path) -> PathBuf {
    std::path::absolute(path).unwrap_or_else(|_| path.to_path_buf())
}
