//! Run orchestration for `duet run`.
//!
//! A run is identified by a UTC `run_id` and owns one directory of artifacts
//! under `.orchestrator/runs/`. A fresh start snapshots the task and creates a
//! new state; `--resume` loads the persisted state, optionally rolls it back to
//! the checkpoint of the interrupted cycle, and continues with the phase it
//! names.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use crate::controller::{Controller, Sleeper};
use crate::core::findings::tally;
use crate::core::text::format_duration;
use crate::core::types::{Phase, PhaseStatus};
use crate::error::PhaseError;
use crate::exit_codes;
use crate::io::atomic::{read_text, write_text};
use crate::io::config::OrchestratorConfig;
use crate::io::executor::Executor;
use crate::io::paths::{OrchestratorPaths, RunLock};
use crate::io::run_state::{Artifacts, RunState, StateDefaults, StateStore, init_state, new_run_id};
use crate::io::test_runner::TestRunner;
use crate::io::transcript::AttemptLog;
use crate::phase::PhaseRunner;

/// Inputs for one `duet run` invocation.
#[derive(Debug, Clone)]
pub struct PipelineOptions {
    /// Workspace the agents operate in; `.orchestrator/` lives here.
    pub root: PathBuf,
    /// Task description, relative to `root` unless absolute.
    pub task_file: PathBuf,
    pub resume: bool,
    /// Start over even if a run state exists.
    pub force: bool,
    /// Force the starting phase; that phase starts from cycle 1.
    pub from_phase: Option<Phase>,
    /// Roll an interrupted phase back to its checkpoint on resume.
    pub recover: bool,
}

/// The agent, test and timing collaborators a run uses.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub executor: &'a dyn Executor,
    pub tests: &'a dyn TestRunner,
    pub sleeper: &'a dyn Sleeper,
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    /// A quota or rate limit stopped the run; it can be resumed.
    Frozen { agent: String, detail: String },
    Failed { phase: Phase, message: String },
}

impl PipelineOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineOutcome::Completed => exit_codes::OK,
            PipelineOutcome::Frozen { .. } => exit_codes::FROZEN,
            PipelineOutcome::Failed { .. } => exit_codes::FAILED,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            PipelineOutcome::Completed => "completed",
            PipelineOutcome::Frozen { .. } => "frozen",
            PipelineOutcome::Failed { .. } => "failed",
        }
    }
}

/// Run (or resume) both phases in `options.root`.
///
/// Holds the run lock for the whole invocation. Plumbing failures are errors;
/// a frozen or failed phase is reported through [`PipelineOutcome`].
#[instrument(skip_all, fields(root = %options.root.display(), resume = options.resume))]
pub fn run_pipeline(
    options: &PipelineOptions,
    config: &OrchestratorConfig,
    collaborators: Collaborators<'_>,
) -> Result<PipelineOutcome> {
    config.validate()?;
    let paths = OrchestratorPaths::new(&options.root);
    paths.ensure_dirs()?;
    let _lock = RunLock::acquire(&paths)?;

    let task_file = paths.root.join(&options.task_file);
    let defaults = StateDefaults {
        task_file: &task_file,
        phase1_max_cycles: config.phase1_max_cycles,
        phase2_max_cycles: config.phase2_max_cycles,
    };
    let store = StateStore::new(paths.clone());

    let (mut state, task) = if options.resume {
        resume_state(&store, &defaults, options.recover)?
    } else {
        fresh_state(&store, &defaults, options.force)?
    };
    if let Some(phase) = options.from_phase {
        force_phase(&mut state, phase);
    }
    write_run_artifacts(&paths, &state, &task)?;
    state.touch();
    store.save(&state)?;
    info!(
        run_id = %state.artifacts.run_id,
        run_dir = %state.artifacts.run_dir.display(),
        phase = %state.phase,
        dry_run = config.dry_run,
        "run started"
    );

    let controller = Controller::new(
        collaborators.executor,
        collaborators.sleeper,
        AttemptLog::new(paths.log_dir.clone()),
    )
    .with_output(config.output.clone(), config.live_stream.enabled)
    .with_fallback(config.fallback.clone());
    let mut runner = PhaseRunner::new(
        controller,
        collaborators.tests,
        &store,
        config,
        paths.root.clone(),
        task,
    );

    let outcome = loop {
        settle_phase(&mut state);
        let result = match state.phase {
            Phase::Phase1 => runner.run_phase1(&mut state),
            Phase::Phase2 => runner.run_phase2(&mut state),
            Phase::Done => break PipelineOutcome::Completed,
        };
        match result {
            Ok(()) => {}
            Err(PhaseError::Frozen(quota)) => {
                warn!(
                    agent = %quota.agent,
                    "run frozen on quota or rate limit; resume later with --resume"
                );
                break PipelineOutcome::Frozen {
                    agent: quota.agent,
                    detail: quota.detail,
                };
            }
            Err(PhaseError::Failed { phase, message }) => {
                break PipelineOutcome::Failed { phase, message };
            }
            Err(PhaseError::Io(err)) => return Err(err),
        }
    };

    log_summary(&state, &outcome);
    Ok(outcome)
}

fn fresh_state(
    store: &StateStore,
    defaults: &StateDefaults<'_>,
    force: bool,
) -> Result<(RunState, String)> {
    if store.exists() && !force {
        return Err(anyhow!(
            "run state already exists at {} (use --resume to continue or --force to start over)",
            store.paths().state_file.display()
        ));
    }
    let task = read_task(defaults.task_file)?;
    let artifacts = Artifacts::build(&new_run_id(), &store.paths().runs_dir);
    Ok((init_state(defaults, artifacts), task))
}

fn resume_state(
    store: &StateStore,
    defaults: &StateDefaults<'_>,
    recover: bool,
) -> Result<(RunState, String)> {
    if !store.exists() {
        return Err(anyhow!(
            "no run state at {} to resume",
            store.paths().state_file.display()
        ));
    }
    let mut state = store.load(defaults)?;
    if recover {
        state = store.recover(state, defaults)?;
    } else {
        info!("checkpoint recovery disabled");
    }

    // The snapshot taken at run start wins over later edits of the task file.
    let snapshot = read_text(&state.artifacts.task)?;
    let task = if snapshot.is_empty() {
        read_task(&state.task_file)?
    } else {
        snapshot
    };
    info!(run_id = %state.artifacts.run_id, phase = %state.phase, "resuming run");
    Ok((state, task))
}

fn read_task(path: &Path) -> Result<String> {
    let task = fs::read_to_string(path)
        .with_context(|| format!("read task file {}", path.display()))?;
    if task.trim().is_empty() {
        return Err(anyhow!("task file {} is empty", path.display()));
    }
    Ok(task.trim().to_string())
}

/// Point the run at `phase`; the persisted phase states are kept.
fn force_phase(state: &mut RunState, phase: Phase) {
    info!(%phase, "starting phase forced");
    state.phase = phase;
}

/// Phase 2 never starts before phase 1 is completed, and completed phases are
/// not run again.
fn settle_phase(state: &mut RunState) {
    let settled = match state.phase {
        Phase::Phase1 | Phase::Phase2 if state.phase1.status != PhaseStatus::Completed => {
            Phase::Phase1
        }
        Phase::Phase1 | Phase::Phase2 if state.phase2.status != PhaseStatus::Completed => {
            Phase::Phase2
        }
        _ => Phase::Done,
    };
    if settled != state.phase {
        warn!(
            requested = %state.phase,
            phase1 = %state.phase1.status,
            phase2 = %state.phase2.status,
            starting = %settled,
            "starting phase adjusted to the phase states"
        );
        state.phase = settled;
    }
}

/// Task snapshot and the `LATEST_RUN.txt` pointer.
fn write_run_artifacts(paths: &OrchestratorPaths, state: &RunState, task: &str) -> Result<()> {
    let artifacts = &state.artifacts;
    fs::create_dir_all(&artifacts.run_dir)
        .with_context(|| format!("create run directory {}", artifacts.run_dir.display()))?;
    if !artifacts.task.is_file() {
        write_text(&artifacts.task, task)?;
    }
    write_text(
        &paths.latest_run_file,
        &artifacts.run_dir.display().to_string(),
    )
}

fn log_summary(state: &RunState, outcome: &PipelineOutcome) {
    let elapsed = DateTime::parse_from_rfc3339(&state.started_at)
        .ok()
        .and_then(|started| Utc::now().signed_duration_since(started).to_std().ok())
        .unwrap_or_default();
    let findings = tally([
        (&state.phase1.finding_history, state.phase1.open_findings.as_slice()),
        (&state.phase2.finding_history, state.phase2.open_findings.as_slice()),
    ]);
    info!(
        run_id = %state.artifacts.run_id,
        outcome = outcome.label(),
        duration = %format_duration(elapsed),
        phase1_cycles = state.phase1.cycle,
        phase2_cycles = state.phase2.cycle,
        findings_closed = findings.closed,
        findings_open = findings.open,
        "run summary"
    );
    match outcome {
        PipelineOutcome::Completed => {}
        PipelineOutcome::Frozen { agent, detail } => {
            warn!(agent = %agent, detail = %detail, "run frozen");
        }
        PipelineOutcome::Failed { phase, message } => {
            warn!(%phase, error = %message, "run failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::executor::dry_run_answer;
    use crate::test_support::{
        RecordingSleeper, ScriptedExecutor, ScriptedTestRunner, TestWorkspace,
    };

    fn options(workspace: &TestWorkspace) -> PipelineOptions {
        PipelineOptions {
            root: workspace.path().to_path_buf(),
            task_file: PathBuf::from("task.md"),
            resume: false,
            force: false,
            from_phase: None,
            recover: true,
        }
    }

    #[test]
    fn outcomes_map_to_exit_codes() {
        assert_eq!(PipelineOutcome::Completed.exit_code(), 0);
        let frozen = PipelineOutcome::Frozen {
            agent: "claude".to_string(),
            detail: "429".to_string(),
        };
        assert_eq!(frozen.exit_code(), 2);
        let failed = PipelineOutcome::Failed {
            phase: Phase::Phase1,
            message: "x".to_string(),
        };
        assert_eq!(failed.exit_code(), 1);
    }

    #[test]
    fn fresh_run_refuses_existing_state_without_force() {
        let workspace = TestWorkspace::new("Add a flag").expect("workspace");
        let executor = ScriptedExecutor::with_responder(dry_run_answer);
        let tests = ScriptedTestRunner::new();
        let sleeper = RecordingSleeper::default();
        let collaborators = Collaborators {
            executor: &executor,
            tests: &tests,
            sleeper: &sleeper,
        };
        let config = OrchestratorConfig::default();

        let first = run_pipeline(&options(&workspace), &config, collaborators).expect("run");
        assert_eq!(first, PipelineOutcome::Completed);

        let err = run_pipeline(&options(&workspace), &config, collaborators)
            .expect_err("existing state");
        assert!(err.to_string().contains("use --resume to continue or --force"));

        let forced = PipelineOptions {
            force: true,
            ..options(&workspace)
        };
        assert_eq!(
            run_pipeline(&forced, &config, collaborators).expect("forced run"),
            PipelineOutcome::Completed
        );
    }

    #[test]
    fn empty_task_is_rejected() {
        let workspace = TestWorkspace::new("   \n").expect("workspace");
        let executor = ScriptedExecutor::new();
        let tests = ScriptedTestRunner::new();
        let sleeper = RecordingSleeper::default();
        let err = run_pipeline(
            &options(&workspace),
            &OrchestratorConfig::default(),
            Collaborators {
                executor: &executor,
                tests: &tests,
                sleeper: &sleeper,
            },
        )
        .expect_err("empty task");
        assert!(err.to_string().contains("is empty"));
        assert!(executor.calls().is_empty());
    }

    #[test]
    fn resume_without_state_is_an_error() {
        let workspace = TestWorkspace::new("Add a flag").expect("workspace");
        let executor = ScriptedExecutor::new();
        let tests = ScriptedTestRunner::new();
        let sleeper = RecordingSleeper::default();
        let resume = PipelineOptions {
            resume: true,
            ..options(&workspace)
        };
        let err = run_pipeline(
            &resume,
            &OrchestratorConfig::default(),
            Collaborators {
                executor: &executor,
                tests: &tests,
                sleeper: &sleeper,
            },
        )
        .expect_err("nothing to resume");
        assert!(err.to_string().starts_with("no run state at"));
    }

    /// Alignment still runs first when phase 1 is not completed.
    #[test]
    fn from_phase_two_waits_for_alignment() {
        let workspace = TestWorkspace::new("Add a flag").expect("workspace");
        let executor = ScriptedExecutor::with_responder(dry_run_answer);
        let tests = ScriptedTestRunner::new();
        let sleeper = RecordingSleeper::default();
        let from_phase = PipelineOptions {
            from_phase: Some(Phase::Phase2),
            ..options(&workspace)
        };

        let outcome = run_pipeline(
            &from_phase,
            &OrchestratorConfig::default(),
            Collaborators {
                executor: &executor,
                tests: &tests,
                sleeper: &sleeper,
            },
        )
        .expect("run");

        assert_eq!(outcome, PipelineOutcome::Completed);
        assert_eq!(
            executor.agents_called(),
            vec!["claude", "codex", "claude", "codex", "claude"]
        );
    }

    #[test]
    fn from_phase_two_keeps_the_phase_state() {
        let workspace = TestWorkspace::new("Add a flag").expect("workspace");
        let executor = ScriptedExecutor::with_responder(dry_run_answer);
        executor.push_ok("claude", "plan\nCLAUDE_APPROVAL: YES\nSTATUS: DONE");
        executor.push_ok("claude", "agreed\nCLAUDE_APPROVAL: YES\nSTATUS: DONE");
        executor.push_ok(
            "claude",
            "NEW_FINDING: F-001 | flag undocumented | README mentions it\nCLAUDE_APPROVAL: NO\nOPEN_FINDINGS: F-001\nSTATUS: DONE",
        );
        let tests = ScriptedTestRunner::new();
        let sleeper = RecordingSleeper::default();
        let collaborators = Collaborators {
            executor: &executor,
            tests: &tests,
            sleeper: &sleeper,
        };
        let mut config = OrchestratorConfig {
            phase2_max_cycles: 1,
            ..OrchestratorConfig::default()
        };

        let first = run_pipeline(&options(&workspace), &config, collaborators).expect("run");
        assert!(matches!(
            first,
            PipelineOutcome::Failed {
                phase: Phase::Phase2,
                ..
            }
        ));

        executor.push_ok(
            "claude",
            "FINDING_STATUS: F-001 | CLOSED | README updated\nCLAUDE_APPROVAL: YES\nOPEN_FINDINGS: NONE\nSTATUS: DONE",
        );
        config.phase2_max_cycles = 2;
        let resume = PipelineOptions {
            resume: true,
            from_phase: Some(Phase::Phase2),
            ..options(&workspace)
        };
        let second = run_pipeline(&resume, &config, collaborators).expect("resume");
        assert_eq!(second, PipelineOutcome::Completed);

        let calls = executor.agents_called();
        assert_eq!(calls[calls.len() - 2..], ["codex", "claude"]);
        let paths = OrchestratorPaths::new(workspace.path());
        let state: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.state_file).expect("state"))
                .expect("json");
        assert_eq!(state["phase2"]["cycle"], 2);
        assert_eq!(state["phase2"]["finding_history"]["F-001"], "CLOSED");
        assert_eq!(state["phase1"]["status"], "completed");
    }

    #[test]
    fn latest_run_pointer_and_task_snapshot_are_written() {
        let workspace = TestWorkspace::new("Add a flag").expect("workspace");
        let executor = ScriptedExecutor::with_responder(dry_run_answer);
        let tests = ScriptedTestRunner::new();
        let sleeper = RecordingSleeper::default();

        run_pipeline(
            &options(&workspace),
            &OrchestratorConfig::default(),
            Collaborators {
                executor: &executor,
                tests: &tests,
                sleeper: &sleeper,
            },
        )
        .expect("run");

        let paths = OrchestratorPaths::new(workspace.path());
        let latest = fs::read_to_string(&paths.latest_run_file).expect("latest");
        let run_dir = PathBuf::from(latest.trim());
        assert!(run_dir.starts_with(&paths.runs_dir));
        assert_eq!(
            fs::read_to_string(run_dir.join("00_task.md")).expect("task"),
            "Add a flag\n"
        );
        assert!(run_dir.join("10_phase1_plan.md").is_file());
        assert!(run_dir.join("20_phase2_implementation.md").is_file());
    }
}
