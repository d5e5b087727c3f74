//! The alignment (phase 1) and execution (phase 2) cycle loops.
//!
//! Every cycle starts with a checkpoint of the full run state, then advances
//! the cycle counter and saves. Each accepted agent answer is appended to the
//! phase transcript; the run state is saved after every mutation.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::anyhow;
use tracing::{info, instrument, warn};

use crate::controller::{CallRequest, Controller};
use crate::core::contract::{
    IMPLEMENTATION_READY, OutputContract, approval_key, parse_finding_statuses, parse_flag,
    parse_new_findings, validate_findings,
};
use crate::core::findings::{format_open_findings, merge_history};
use crate::core::report::parse_changed_files;
use crate::core::text::{MAX_ERROR_CHARS, shorten, truncate_shared};
use crate::core::types::{Approval, FindingId, Phase, PhaseStatus, Role};
use crate::error::{CallError, PhaseError, QuotaError};
use crate::io::atomic::read_text;
use crate::io::config::OrchestratorConfig;
use crate::io::git::{Git, SnapshotLimits, collect_file_snapshots};
use crate::io::prompt::{ConfirmContext, PromptEngine, ReviewContext, StepContext};
use crate::io::run_state::{PhaseState, RunState, StateStore, now_rfc3339};
use crate::io::test_runner::{DEFAULT_OUTPUT_LIMIT_BYTES, TestRequest, TestRunner};
use crate::io::transcript::{append_section, display_name, section_title};

pub const PHASE1_MAX_CYCLES_ERROR: &str = "Phase 1 reached max cycles without dual approval.";
pub const PHASE2_MAX_CYCLES_ERROR: &str =
    "Phase 2 reached max cycles without approval/pass condition.";

/// One agent step inside a cycle.
struct Step<'s> {
    agent: &'s str,
    prompt: String,
    log_prefix: String,
    title: String,
    contract: OutputContract,
}

/// Outcome of a reviewer step after its findings were merged.
struct Review {
    approval: Approval,
    open: Vec<FindingId>,
}

/// Drives both phases for one run.
pub struct PhaseRunner<'a> {
    controller: Controller<'a>,
    tests: &'a dyn TestRunner,
    store: &'a StateStore,
    config: &'a OrchestratorConfig,
    prompts: PromptEngine,
    workdir: PathBuf,
    task: String,
}

impl<'a> PhaseRunner<'a> {
    pub fn new(
        controller: Controller<'a>,
        tests: &'a dyn TestRunner,
        store: &'a StateStore,
        config: &'a OrchestratorConfig,
        workdir: PathBuf,
        task: String,
    ) -> Self {
        Self {
            controller,
            tests,
            store,
            config,
            prompts: PromptEngine::new(),
            workdir,
            task,
        }
    }

    /// Plan / review / confirm until both agents approve with no open findings.
    #[instrument(skip_all, fields(run_id = %state.artifacts.run_id))]
    pub fn run_phase1(&mut self, state: &mut RunState) -> Result<(), PhaseError> {
        let config = self.config;
        let planner = config.roles.phase1_planner.as_str();
        let reviewer = config.roles.phase1_reviewer.as_str();
        let planner_key = approval_key(planner);
        let reviewer_key = approval_key(reviewer);

        state.phase1.max_cycles = config.phase1_max_cycles;
        state.phase1.status = PhaseStatus::Running;
        let first = state.phase1.cycle + 1;
        info!(planner, reviewer, first, max_cycles = config.phase1_max_cycles, "phase 1 started");

        for cycle in first..=config.phase1_max_cycles {
            self.begin_cycle(state, Phase::Phase1, cycle)?;
            let previous_open = state.phase1.open_findings.clone();
            let previous_text = format_open_findings(&previous_open);

            let shared = self.shared(state, Phase::Phase1)?;
            let prompt = self.prompts.phase1_plan(&StepContext {
                cycle,
                agent: &display_name(planner),
                counterpart: &display_name(reviewer),
                approval_key: &planner_key,
                task: &self.task,
                shared: &shared,
                open_findings: &previous_text,
            })?;
            self.step(
                state,
                Phase::Phase1,
                Step {
                    agent: planner,
                    prompt,
                    log_prefix: format!("phase1-cycle{cycle}-{planner}-plan"),
                    title: section_title(1, cycle, planner, "Plan"),
                    contract: OutputContract::flags([planner_key.as_str()]),
                },
            )?;

            let shared = self.shared(state, Phase::Phase1)?;
            let prompt = self.prompts.phase1_review(&StepContext {
                cycle,
                agent: &display_name(reviewer),
                counterpart: &display_name(planner),
                approval_key: &reviewer_key,
                task: &self.task,
                shared: &shared,
                open_findings: &previous_text,
            })?;
            let review = self.review_step(
                state,
                Phase::Phase1,
                Step {
                    agent: reviewer,
                    prompt,
                    log_prefix: format!("phase1-cycle{cycle}-{reviewer}-review"),
                    title: section_title(1, cycle, reviewer, "Review"),
                    contract: OutputContract::review(&reviewer_key, &previous_open),
                },
                &reviewer_key,
                &previous_open,
            )?;

            let shared = self.shared(state, Phase::Phase1)?;
            let open_text = format_open_findings(&review.open);
            let prompt = self.prompts.phase1_confirm(
                &StepContext {
                    cycle,
                    agent: &display_name(planner),
                    counterpart: &display_name(reviewer),
                    approval_key: &planner_key,
                    task: &self.task,
                    shared: &shared,
                    open_findings: &open_text,
                },
                &ConfirmContext {
                    reviewer_key: &reviewer_key,
                    reviewer_approval: review.approval.as_str(),
                },
            )?;
            let confirm = self.step(
                state,
                Phase::Phase1,
                Step {
                    agent: planner,
                    prompt,
                    log_prefix: format!("phase1-cycle{cycle}-{planner}-confirm"),
                    title: section_title(1, cycle, planner, "Confirm"),
                    contract: OutputContract::flags([planner_key.as_str()]),
                },
            )?;

            let mut planner_approval = parse_flag(&confirm, &planner_key).unwrap_or_default();
            if planner_approval.is_yes() && (!review.approval.is_yes() || !review.open.is_empty()) {
                warn!(
                    cycle,
                    key = %planner_key,
                    "planner approved while reviewer objections remain; recording NO"
                );
                planner_approval = Approval::No;
            }
            state.phase1.approvals.insert(Role::Planner, planner_approval);
            self.save(state)?;

            info!(
                cycle,
                planner = planner_approval.as_str(),
                reviewer = review.approval.as_str(),
                open_findings = %open_text,
                "phase 1 cycle finished"
            );
            if planner_approval.is_yes() && review.approval.is_yes() && review.open.is_empty() {
                complete(&mut state.phase1);
                state.phase = Phase::Phase2;
                self.save(state)?;
                info!(cycle, "phase 1 completed with dual approval");
                return Ok(());
            }
        }

        Err(self.fail(state, Phase::Phase1, PHASE1_MAX_CYCLES_ERROR.to_string()))
    }

    /// Implement / test / review until the change is ready, tests pass and the
    /// reviewer approves with no open findings.
    #[instrument(skip_all, fields(run_id = %state.artifacts.run_id))]
    pub fn run_phase2(&mut self, state: &mut RunState) -> Result<(), PhaseError> {
        let config = self.config;
        let implementer = config.roles.phase2_implementer.as_str();
        let reviewer = config.roles.phase2_reviewer.as_str();
        let reviewer_key = approval_key(reviewer);
        let git = Git::new(&self.workdir);
        let limits = SnapshotLimits {
            max_lines: config.file_snapshot_max_lines,
            max_files: config.file_snapshot_max_files,
        };

        state.phase2.max_cycles = config.phase2_max_cycles;
        state.phase2.status = PhaseStatus::Running;
        let first = state.phase2.cycle + 1;
        info!(implementer, reviewer, first, max_cycles = config.phase2_max_cycles, "phase 2 started");

        for cycle in first..=config.phase2_max_cycles {
            self.begin_cycle(state, Phase::Phase2, cycle)?;
            let previous_open = state.phase2.open_findings.clone();
            let previous_text = format_open_findings(&previous_open);
            let plan = self.plan(state)?;

            let test_failure = if state.phase2.has_test_failure() {
                Some(
                    self.prompts
                        .test_failure(&state.phase2.last_test_snapshot, &config.test_command)?,
                )
            } else {
                None
            };
            let shared = self.shared(state, Phase::Phase2)?;
            let prompt = self.prompts.phase2_implement(
                &StepContext {
                    cycle,
                    agent: &display_name(implementer),
                    counterpart: &display_name(reviewer),
                    approval_key: IMPLEMENTATION_READY,
                    task: &self.task,
                    shared: &shared,
                    open_findings: &previous_text,
                },
                &plan,
                test_failure.as_deref(),
            )?;
            let report = self.step(
                state,
                Phase::Phase2,
                Step {
                    agent: implementer,
                    prompt,
                    log_prefix: format!("phase2-cycle{cycle}-{implementer}-implement"),
                    title: section_title(2, cycle, implementer, "Implement"),
                    contract: OutputContract::flags([IMPLEMENTATION_READY]),
                },
            )?;
            let ready = parse_flag(&report, IMPLEMENTATION_READY).unwrap_or_default();
            state.phase2.implementation_ready = ready;
            self.save(state)?;

            let tests = self.tests.run(&TestRequest {
                command: config.test_command.clone(),
                workdir: self.workdir.clone(),
                timeout: Duration::from_secs(config.test_timeout_secs),
                output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            });
            state.phase2.last_test_exit = Some(tests.exit_code);
            state.phase2.last_test_snapshot = tests.snapshot.clone();
            append_section(
                &state.artifacts.phase2_shared,
                &section_title(2, cycle, "orchestrator", "Tests"),
                &tests.snapshot,
            )?;
            self.save(state)?;
            info!(cycle, exit_code = tests.exit_code, "test command finished");

            let mut changed = parse_changed_files(&report);
            if changed.is_empty() {
                changed = git.changed_files().unwrap_or_else(|err| {
                    warn!(err = %format!("{err:#}"), "could not list changed files from git");
                    Vec::new()
                });
            }
            let files = collect_file_snapshots(&self.workdir, &changed, limits);
            let repo_snapshot = git.repo_snapshot(config.max_diff_chars);

            let shared = self.shared(state, Phase::Phase2)?;
            let prompt = self.prompts.phase2_review(
                &StepContext {
                    cycle,
                    agent: &display_name(reviewer),
                    counterpart: &display_name(implementer),
                    approval_key: &reviewer_key,
                    task: &self.task,
                    shared: &shared,
                    open_findings: &previous_text,
                },
                &ReviewContext {
                    plan: &plan,
                    files: &files,
                    test_snapshot: &tests.snapshot,
                    repo_snapshot: &repo_snapshot,
                },
            )?;
            let review = self.review_step(
                state,
                Phase::Phase2,
                Step {
                    agent: reviewer,
                    prompt,
                    log_prefix: format!("phase2-cycle{cycle}-{reviewer}-review"),
                    title: section_title(2, cycle, reviewer, "Review"),
                    contract: OutputContract::review(&reviewer_key, &previous_open),
                },
                &reviewer_key,
                &previous_open,
            )?;

            info!(
                cycle,
                ready = ready.as_str(),
                test_exit = tests.exit_code,
                reviewer = review.approval.as_str(),
                open_findings = %format_open_findings(&review.open),
                "phase 2 cycle finished"
            );
            if ready.is_yes() && tests.passed() && review.approval.is_yes() && review.open.is_empty()
            {
                complete(&mut state.phase2);
                state.phase = Phase::Done;
                self.save(state)?;
                info!(cycle, "phase 2 completed");
                return Ok(());
            }
        }

        Err(self.fail(state, Phase::Phase2, PHASE2_MAX_CYCLES_ERROR.to_string()))
    }

    /// Checkpoint the state as it was before `cycle`, then advance to it.
    fn begin_cycle(&self, state: &mut RunState, phase: Phase, cycle: u32) -> Result<(), PhaseError> {
        let path = self.store.write_checkpoint(phase, cycle, state)?;
        let current = phase_state_mut(state, phase)?;
        current.cycle = cycle;
        current.status = PhaseStatus::Running;
        current.error = None;
        self.save(state)?;
        info!(%phase, cycle, checkpoint = %path.display(), "cycle started");
        Ok(())
    }

    /// Run one agent call and append the accepted answer to the transcript.
    fn step(&mut self, state: &mut RunState, phase: Phase, step: Step<'_>) -> Result<String, PhaseError> {
        let result = self.controller.call(&CallRequest {
            agent: step.agent,
            prompt: &step.prompt,
            log_prefix: &step.log_prefix,
            max_retries: self.config.max_agent_retries,
            contract: &step.contract,
        });
        match result {
            Ok(answer) => {
                let shared = state
                    .artifacts
                    .shared_for(phase)
                    .ok_or_else(|| anyhow!("phase {phase} has no transcript"))?;
                append_section(shared, &step.title, &answer)?;
                Ok(answer)
            }
            Err(CallError::Quota(quota)) => Err(self.freeze(state, phase, quota)),
            Err(err @ CallError::Exhausted { .. }) => Err(self.fail(state, phase, err.to_string())),
            Err(CallError::Io(err)) => Err(PhaseError::Io(err)),
        }
    }

    /// A reviewer step: the accepted answer's findings are merged into the
    /// phase history and its approval recorded.
    fn review_step(
        &mut self,
        state: &mut RunState,
        phase: Phase,
        step: Step<'_>,
        key: &str,
        previous_open: &[FindingId],
    ) -> Result<Review, PhaseError> {
        let answer = self.step(state, phase, step)?;
        let open = validate_findings(&answer, previous_open, key)
            .map_err(|reason| anyhow!("accepted review failed revalidation: {reason}"))?;
        let approval = parse_flag(&answer, key).unwrap_or_default();

        let current = phase_state_mut(state, phase)?;
        merge_history(
            &mut current.finding_history,
            &parse_finding_statuses(&answer),
            &parse_new_findings(&answer),
            &open,
        );
        current.open_findings = open.clone();
        current.approvals.insert(Role::Reviewer, approval);
        self.save(state)?;
        Ok(Review { approval, open })
    }

    /// Shared transcript of `phase`, trimmed to the prompt budget.
    fn shared(&self, state: &RunState, phase: Phase) -> Result<String, PhaseError> {
        let Some(path) = state.artifacts.shared_for(phase) else {
            return Ok(String::new());
        };
        Ok(truncate_shared(&read_text(path)?, self.config.max_shared_chars))
    }

    /// The aligned plan handed to phase 2 is the phase 1 transcript.
    fn plan(&self, state: &RunState) -> Result<String, PhaseError> {
        self.shared(state, Phase::Phase1)
    }

    fn save(&self, state: &mut RunState) -> Result<(), PhaseError> {
        state.touch();
        self.store.save(state)?;
        Ok(())
    }

    /// Roll back the in-progress cycle and mark the phase frozen.
    fn freeze(&self, state: &mut RunState, phase: Phase, quota: QuotaError) -> PhaseError {
        warn!(%phase, agent = %quota.agent, "quota reached; freezing phase");
        let marked = phase_state_mut(state, phase).map(|current| {
            current.cycle = current.cycle.saturating_sub(1);
            current.status = PhaseStatus::Frozen;
            current.error = Some(shorten(&quota.to_string(), MAX_ERROR_CHARS));
        });
        if let Err(err) = marked.and_then(|()| self.save(state)) {
            return err;
        }
        PhaseError::Frozen(quota)
    }

    fn fail(&self, state: &mut RunState, phase: Phase, message: String) -> PhaseError {
        warn!(%phase, error = %message, "phase failed");
        let marked = phase_state_mut(state, phase).map(|current| {
            current.status = PhaseStatus::Failed;
            current.error = Some(shorten(&message, MAX_ERROR_CHARS));
        });
        if let Err(err) = marked.and_then(|()| self.save(state)) {
            return err;
        }
        PhaseError::Failed { phase, message }
    }
}

fn phase_state_mut(state: &mut RunState, phase: Phase) -> Result<&mut PhaseState, PhaseError> {
    state
        .phase_state_mut(phase)
        .ok_or_else(|| PhaseError::Io(anyhow!("phase {phase} has no state")))
}

fn complete(current: &mut PhaseState) {
    current.status = PhaseStatus::Completed;
    current.error = None;
    current.completed_at = Some(now_rfc3339());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::controller::Sleeper;
    use crate::core::types::FindingStatus;
    use crate::io::paths::OrchestratorPaths;
    use crate::io::run_state::{Artifacts, StateDefaults, init_state};
    use crate::io::transcript::AttemptLog;
    use crate::test_support::{RecordingSleeper, ScriptedExecutor, ScriptedTestRunner};

    struct Harness {
        temp: tempfile::TempDir,
        store: StateStore,
        config: OrchestratorConfig,
        executor: ScriptedExecutor,
        tests: ScriptedTestRunner,
        sleeper: RecordingSleeper,
    }

    impl Harness {
        fn new() -> Self {
            let temp = tempfile::tempdir().expect("tempdir");
            let paths = OrchestratorPaths::new(temp.path());
            paths.ensure_dirs().expect("dirs");
            let config = OrchestratorConfig {
                max_agent_retries: 0,
                phase1_max_cycles: 2,
                phase2_max_cycles: 2,
                test_command: "make test".to_string(),
                ..OrchestratorConfig::default()
            };
            Self {
                store: StateStore::new(paths),
                temp,
                config,
                executor: ScriptedExecutor::new(),
                tests: ScriptedTestRunner::new(),
                sleeper: RecordingSleeper::default(),
            }
        }

        fn state(&self) -> RunState {
            let paths = self.store.paths();
            let task = self.temp.path().join("task.md");
            let defaults = StateDefaults {
                task_file: &task,
                phase1_max_cycles: self.config.phase1_max_cycles,
                phase2_max_cycles: self.config.phase2_max_cycles,
            };
            init_state(&defaults, Artifacts::build("20260101-000000Z", &paths.runs_dir))
        }

        fn runner(&self) -> PhaseRunner<'_> {
            let sleeper: &dyn Sleeper = &self.sleeper;
            let controller = Controller::new(
                &self.executor,
                sleeper,
                AttemptLog::new(self.store.paths().log_dir.clone()),
            );
            PhaseRunner::new(
                controller,
                &self.tests,
                &self.store,
                &self.config,
                self.temp.path().to_path_buf(),
                "Add a --verbose flag".to_string(),
            )
        }
    }

    const PLAN_YES: &str = "plan\nCLAUDE_APPROVAL: YES\nSTATUS: DONE";
    const REVIEW_OBJECTS: &str = "NEW_FINDING: F-001 | missing tests | add a test\nCODEX_APPROVAL: NO\nOPEN_FINDINGS: F-001\nSTATUS: DONE";
    const REVIEW_CLOSES: &str = "FINDING_STATUS: F-001 | CLOSED | tests added\nCODEX_APPROVAL: YES\nOPEN_FINDINGS: NONE\nSTATUS: DONE";

    #[test]
    fn phase1_completes_after_findings_close() {
        let h = Harness::new();
        for answer in [PLAN_YES, PLAN_YES, PLAN_YES, PLAN_YES] {
            h.executor.push_ok("claude", answer);
        }
        h.executor.push_ok("codex", REVIEW_OBJECTS);
        h.executor.push_ok("codex", REVIEW_CLOSES);
        let mut state = h.state();

        h.runner().run_phase1(&mut state).expect("phase 1");

        assert_eq!(state.phase, Phase::Phase2);
        assert_eq!(state.phase1.status, PhaseStatus::Completed);
        assert_eq!(state.phase1.cycle, 2);
        assert!(state.phase1.completed_at.is_some());
        assert!(state.phase1.open_findings.is_empty());
        let id = FindingId::parse("F-001").expect("id");
        assert_eq!(state.phase1.finding_history.get(&id), Some(&FindingStatus::Closed));
        let transcript = std::fs::read_to_string(&state.artifacts.phase1_shared).expect("transcript");
        assert!(transcript.contains("## Phase 1 / Cycle 1 / Claude Plan"));
        assert!(transcript.contains("## Phase 1 / Cycle 2 / Codex Review"));

        let defaults = StateDefaults {
            task_file: &state.task_file,
            phase1_max_cycles: 2,
            phase2_max_cycles: 2,
        };
        let saved = h.store.load(&defaults).expect("load");
        assert_eq!(saved.phase, Phase::Phase2);
        assert_eq!(saved.phase1.approval(Role::Planner), Approval::Yes);
    }

    /// The planner cannot approve over an objecting reviewer.
    #[test]
    fn confirm_is_forced_to_no_while_findings_are_open() {
        let h = Harness::new();
        for _ in 0..4 {
            h.executor.push_ok("claude", PLAN_YES);
        }
        h.executor.push_ok("codex", REVIEW_OBJECTS);
        h.executor.push_ok(
            "codex",
            "FINDING_STATUS: F-001 | OPEN | still missing\nCODEX_APPROVAL: NO\nOPEN_FINDINGS: F-001\nSTATUS: DONE",
        );
        let mut state = h.state();

        let err = h.runner().run_phase1(&mut state).expect_err("max cycles");

        assert_eq!(
            err.to_string(),
            format!("phase1 failed: {PHASE1_MAX_CYCLES_ERROR}")
        );
        assert_eq!(state.phase1.status, PhaseStatus::Failed);
        assert_eq!(state.phase1.approval(Role::Planner), Approval::No);
        assert_eq!(state.phase1.error.as_deref(), Some(PHASE1_MAX_CYCLES_ERROR));
    }

    #[test]
    fn checkpoints_record_the_previous_cycle() {
        let h = Harness::new();
        for _ in 0..4 {
            h.executor.push_ok("claude", PLAN_YES);
        }
        h.executor.push_ok("codex", REVIEW_OBJECTS);
        h.executor.push_ok("codex", REVIEW_CLOSES);
        let mut state = h.state();
        h.runner().run_phase1(&mut state).expect("phase 1");

        let defaults = StateDefaults {
            task_file: &state.task_file,
            phase1_max_cycles: 2,
            phase2_max_cycles: 2,
        };
        let first = h
            .store
            .load_checkpoint(Phase::Phase1, 1, &defaults)
            .expect("read")
            .expect("checkpoint");
        assert_eq!(first.phase1.cycle, 0);
        assert_eq!(first.phase1.status, PhaseStatus::Running);

        let checkpoint = h
            .store
            .load_checkpoint(Phase::Phase1, 2, &defaults)
            .expect("read")
            .expect("checkpoint");
        assert_eq!(checkpoint.phase1.cycle, 1);
        assert_eq!(checkpoint.phase1.status, PhaseStatus::Running);
        assert_eq!(checkpoint.phase1.open_findings, vec![FindingId::parse("F-001").expect("id")]);
    }

    #[test]
    fn quota_freezes_and_rolls_back_the_cycle() {
        let h = Harness::new();
        h.executor.push_ok("claude", PLAN_YES);
        h.executor.push_err("codex", "HTTP 429 too many requests");
        let mut state = h.state();

        let err = h.runner().run_phase1(&mut state).expect_err("frozen");

        assert!(matches!(err, PhaseError::Frozen(_)));
        assert_eq!(state.phase1.status, PhaseStatus::Frozen);
        assert_eq!(state.phase1.cycle, 0);
        assert!(
            state
                .phase1
                .error
                .as_deref()
                .is_some_and(|e| e.starts_with("codex quota/rate limit reached"))
        );
    }

    #[test]
    fn exhausted_retries_fail_the_phase_with_the_summary() {
        let h = Harness::new();
        h.executor.push_ok("claude", "no markers at all");
        let mut state = h.state();

        let err = h.runner().run_phase1(&mut state).expect_err("failed");

        let PhaseError::Failed { phase, message } = err else {
            panic!("expected failure");
        };
        assert_eq!(phase, Phase::Phase1);
        assert!(message.starts_with("claude did not produce valid output after 1 attempts"));
        assert_eq!(state.phase1.status, PhaseStatus::Failed);
    }

    fn phase2_state(h: &Harness) -> RunState {
        let mut state = h.state();
        state.phase = Phase::Phase2;
        state.phase1.status = PhaseStatus::Completed;
        state
    }

    const IMPLEMENTED: &str = "## Changed Files\n- src/main.rs\n\nIMPLEMENTATION_READY: YES\nSTATUS: DONE";
    const APPROVE: &str = "CLAUDE_APPROVAL: YES\nOPEN_FINDINGS: NONE\nSTATUS: DONE";

    #[test]
    fn resumed_frozen_phase_checkpoints_as_running() {
        let h = Harness::new();
        h.executor.push_ok("codex", IMPLEMENTED);
        h.executor.push_ok("claude", APPROVE);
        let mut state = h.state();
        state.phase = Phase::Phase2;
        state.phase2.status = PhaseStatus::Frozen;
        state.phase2.error = Some("codex quota/rate limit reached".to_string());

        h.runner().run_phase2(&mut state).expect("phase 2");

        let defaults = StateDefaults {
            task_file: &state.task_file,
            phase1_max_cycles: 2,
            phase2_max_cycles: 2,
        };
        let checkpoint = h
            .store
            .load_checkpoint(Phase::Phase2, 1, &defaults)
            .expect("read")
            .expect("checkpoint");
        assert_eq!(checkpoint.phase2.status, PhaseStatus::Running);
        assert_eq!(checkpoint.phase2.cycle, 0);
        assert_eq!(state.phase2.status, PhaseStatus::Completed);
    }

    /// Ready and approved is not enough while tests fail.
    #[test]
    fn failing_tests_block_completion() {
        let h = Harness::new();
        h.executor.push_ok("codex", IMPLEMENTED);
        h.executor.push_ok("codex", IMPLEMENTED);
        h.executor.push_ok("claude", APPROVE);
        h.executor.push_ok("claude", APPROVE);
        h.tests.push(1, "assertion failed: verbose");
        h.tests.push(0, "all green");
        let mut state = phase2_state(&h);

        h.runner().run_phase2(&mut state).expect("phase 2");

        assert_eq!(state.phase2.cycle, 2);
        assert_eq!(state.phase, Phase::Done);
        assert_eq!(state.phase2.last_test_exit, Some(0));
        let second_prompt = &h.executor.calls()[2].1;
        assert!(second_prompt.contains("<<<TEST_FAILURE_PRIORITY_BEGIN>>>"));
        assert!(second_prompt.contains("assertion failed: verbose"));
        assert_eq!(h.tests.commands(), vec!["make test", "make test"]);
    }

    #[test]
    fn phase2_review_sees_changed_file_snapshots() {
        let h = Harness::new();
        std::fs::create_dir_all(h.temp.path().join("src")).expect("mkdir");
        std::fs::write(h.temp.path().join("src/main.rs"), "fn main() {}\n").expect("write");
        h.executor.push_ok("codex", IMPLEMENTED);
        h.executor.push_ok("claude", APPROVE);
        let mut state = phase2_state(&h);

        h.runner().run_phase2(&mut state).expect("phase 2");

        let review_prompt = &h.executor.calls()[1].1;
        assert!(review_prompt.contains("### src/main.rs\nfn main() {}"));
        assert!(review_prompt.contains("Exit code: 0\nok"));
        let transcript =
            std::fs::read_to_string(&state.artifacts.phase2_shared).expect("transcript");
        assert!(transcript.contains("## Phase 2 / Cycle 1 / Orchestrator Tests"));
    }

    #[test]
    fn phase2_fails_when_never_ready() {
        let h = Harness::new();
        let not_ready = "IMPLEMENTATION_READY: NO\nSTATUS: DONE";
        h.executor.push_ok("codex", not_ready);
        h.executor.push_ok("codex", not_ready);
        h.executor.push_ok("claude", APPROVE);
        h.executor.push_ok("claude", APPROVE);
        let mut state = phase2_state(&h);

        let err = h.runner().run_phase2(&mut state).expect_err("fails");

        assert_eq!(err.to_string(), format!("phase2 failed: {PHASE2_MAX_CYCLES_ERROR}"));
        assert_eq!(state.phase2.status, PhaseStatus::Failed);
        assert_eq!(state.phase, Phase::Phase2);
    }
}
