//! Test command collaborator for the execution phase.

use std::path::PathBuf;
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::core::text::{TEST_OUTPUT_CHARS, shorten};
use crate::io::process::{ProcessError, ProcessRequest, run_captured};

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

#[derive(Debug, Clone)]
pub struct TestRequest {
    /// Shell command line; empty skips testing.
    pub command: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

/// Exit code plus the bounded `Exit code: <n>\n<output>` snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestSnapshot {
    pub exit_code: i32,
    pub snapshot: String,
}

impl TestSnapshot {
    pub fn new(exit_code: i32, output: &str) -> Self {
        Self {
            exit_code,
            snapshot: format!("Exit code: {exit_code}\n{output}"),
        }
    }

    /// Result for an empty test command.
    pub fn skipped() -> Self {
        Self::new(0, "[skip] No test command configured.")
    }

    pub fn passed(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs the configured test command. Failures to run are reported as a
/// failing snapshot, never as an error.
pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> TestSnapshot;
}

/// Runs the command through `sh -c`.
pub struct ShellTestRunner;

impl TestRunner for ShellTestRunner {
    #[instrument(skip_all, fields(command = %request.command))]
    fn run(&self, request: &TestRequest) -> TestSnapshot {
        if request.command.trim().is_empty() {
            return TestSnapshot::skipped();
        }
        let argv = [
            "sh".to_string(),
            "-c".to_string(),
            request.command.clone(),
        ];
        let process = ProcessRequest {
            argv: &argv,
            env: &[],
            stdin: None,
            workdir: Some(&request.workdir),
            timeout: request.timeout,
            output_limit_bytes: request.output_limit_bytes,
        };
        match run_captured(&process) {
            Ok(output) => {
                let combined = format!("{}\n{}", output.stdout, output.stderr);
                info!(exit_code = output.exit_code, "test command finished");
                TestSnapshot::new(
                    output.exit_code,
                    &shorten(combined.trim(), TEST_OUTPUT_CHARS),
                )
            }
            Err(ProcessError::Timeout { timeout }) => {
                warn!(timeout_secs = timeout.as_secs(), "test command timed out");
                TestSnapshot::new(
                    1,
                    &format!("Test command timed out after {}s.", timeout.as_secs()),
                )
            }
            Err(ProcessError::Failed(err)) => {
                warn!(err = %format!("{err:#}"), "test command could not run");
                TestSnapshot::new(1, &shorten(&format!("{err:#}"), TEST_OUTPUT_CHARS))
            }
        }
    }
}

/// Simulates a passing test command.
pub struct DryRunTestRunner;

impl TestRunner for DryRunTestRunner {
    fn run(&self, request: &TestRequest) -> TestSnapshot {
        if request.command.trim().is_empty() {
            return TestSnapshot::skipped();
        }
        TestSnapshot::new(0, &format!("[dry-run] '{}' simulated.", request.command))
    }
}
