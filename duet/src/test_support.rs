//! Test-only collaborators: scripted agents, scripted test commands and a
//! sleeper that records instead of waiting.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::controller::Sleeper;
use crate::error::ExecError;
use crate::io::executor::Executor;
use crate::io::test_runner::{TestRequest, TestRunner, TestSnapshot};

type Responder = fn(&str, &str) -> String;

/// Executor that replays queued answers per agent and records every call.
///
/// When an agent's queue is empty the optional responder answers instead;
/// without one the call fails.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: RefCell<BTreeMap<String, VecDeque<Result<String, ExecError>>>>,
    calls: RefCell<Vec<(String, String)>>,
    responder: Option<Responder>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer unscripted calls with `responder(agent, prompt)`.
    pub fn with_responder(responder: Responder) -> Self {
        Self {
            responder: Some(responder),
            ..Self::default()
        }
    }

    pub fn push(&self, agent: &str, answer: Result<String, ExecError>) {
        self.scripts
            .borrow_mut()
            .entry(agent.to_string())
            .or_default()
            .push_back(answer);
    }

    pub fn push_ok(&self, agent: &str, answer: &str) {
        self.push(agent, Ok(answer.to_string()));
    }

    /// Queue a CLI failure with `detail` as its error text.
    pub fn push_err(&self, agent: &str, detail: &str) {
        self.push(
            agent,
            Err(ExecError::Execution {
                agent: agent.to_string(),
                detail: detail.to_string(),
            }),
        );
    }

    /// `(agent, prompt)` for every call, in order.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.borrow().clone()
    }

    pub fn agents_called(&self) -> Vec<String> {
        self.calls
            .borrow()
            .iter()
            .map(|(agent, _)| agent.clone())
            .collect()
    }
}

impl Executor for ScriptedExecutor {
    fn run(&self, agent: &str, prompt: &str) -> Result<String, ExecError> {
        self.calls
            .borrow_mut()
            .push((agent.to_string(), prompt.to_string()));
        let queued = self
            .scripts
            .borrow_mut()
            .get_mut(agent)
            .and_then(VecDeque::pop_front);
        match (queued, self.responder) {
            (Some(answer), _) => answer,
            (None, Some(responder)) => Ok(responder(agent, prompt)),
            (None, None) => Err(ExecError::Execution {
                agent: agent.to_string(),
                detail: "no scripted answer left".to_string(),
            }),
        }
    }
}

/// Test runner replaying queued results; passes once the queue is empty.
#[derive(Default)]
pub struct ScriptedTestRunner {
    results: RefCell<VecDeque<TestSnapshot>>,
    commands: RefCell<Vec<String>>,
}

impl ScriptedTestRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, exit_code: i32, output: &str) {
        self.results
            .borrow_mut()
            .push_back(TestSnapshot::new(exit_code, output));
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.borrow().clone()
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, request: &TestRequest) -> TestSnapshot {
        self.commands.borrow_mut().push(request.command.clone());
        self.results
            .borrow_mut()
            .pop_front()
            .unwrap_or_else(|| TestSnapshot::new(0, "ok"))
    }
}

/// Sleeper that records requested delays.
#[derive(Default)]
pub struct RecordingSleeper {
    slept: RefCell<Vec<Duration>>,
}

impl RecordingSleeper {
    pub fn slept(&self) -> Vec<Duration> {
        self.slept.borrow().clone()
    }
}

impl Sleeper for RecordingSleeper {
    fn sleep(&self, duration: Duration) {
        self.slept.borrow_mut().push(duration);
    }
}

/// Temporary workspace with a task file.
pub struct TestWorkspace {
    temp: tempfile::TempDir,
}

impl TestWorkspace {
    pub fn new(task: &str) -> Result<Self> {
        let temp = tempfile::tempdir().context("create temp workspace")?;
        fs::write(temp.path().join("task.md"), task).context("write task file")?;
        Ok(Self { temp })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn task_file(&self) -> PathBuf {
        self.temp.path().join("task.md")
    }
}
