//! Helpers for running child processes with timeouts and bounded output.
//!
//! Two modes share one request type:
//!
//! - [`run_captured`] blocks until the child exits, draining stdout and stderr
//!   on reader threads so a full pipe never stalls the child.
//! - [`run_streaming`] additionally surfaces lines live. Two reader threads push
//!   [`StreamEvent`]s onto one channel; the calling thread is the only consumer
//!   and the only owner of the caller's [`LineFilter`] state.
//!
//! In both modes the timeout is measured from spawn and enforced regardless of
//! output activity.

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, anyhow};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};
use wait_timeout::ChildExt;

/// Consumer poll interval while waiting for stream events.
const POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Silence after which a heartbeat is logged.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// One of the two output channels of a child process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Stdout,
    Stderr,
}

impl Channel {
    pub fn as_str(self) -> &'static str {
        match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
        }
    }
}

/// A line read by a stream reader, or `None` once its channel hit EOF.
#[derive(Debug)]
pub struct StreamEvent {
    pub channel: Channel,
    pub line: Option<String>,
}

/// Everything needed to launch one child process.
#[derive(Debug, Clone)]
pub struct ProcessRequest<'a> {
    pub argv: &'a [String],
    /// Variables added on top of the inherited environment.
    pub env: &'a [(String, String)],
    pub stdin: Option<&'a [u8]>,
    pub workdir: Option<&'a Path>,
    pub timeout: Duration,
    /// Bytes kept per channel; the rest is drained and discarded.
    pub output_limit_bytes: usize,
}

/// Captured result of a child that exited on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code, or -1 when the child was terminated by a signal.
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("process timed out after {}s", .timeout.as_secs())]
    Timeout { timeout: Duration },
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

/// Decides which lines of a streaming call are surfaced live.
///
/// Implementations may keep per-call state; only the consumer loop calls them.
pub trait LineFilter {
    fn accept(&mut self, channel: Channel, line: &str) -> bool;
}

/// Run a child to completion and capture both channels.
#[instrument(skip_all, fields(program = ?request.argv.first(), timeout_secs = request.timeout.as_secs()))]
pub fn run_captured(request: &ProcessRequest<'_>) -> Result<ProcessOutput, ProcessError> {
    let mut child = spawn(request)?;
    let (stdout, stderr) = take_pipes(&mut child)?;

    let limit = request.output_limit_bytes;
    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, limit));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, limit));
    let writer = feed_stdin(&mut child, request.stdin)?;

    let status = match child
        .wait_timeout(request.timeout)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            kill_after_timeout(&mut child, request.timeout)?;
            return Err(ProcessError::Timeout {
                timeout: request.timeout,
            });
        }
    };

    let (stdout, stdout_truncated) = join_output(stdout_handle).context("join stdout")?;
    let (stderr, stderr_truncated) = join_output(stderr_handle).context("join stderr")?;
    if let Some(writer) = writer {
        let _ = writer.join();
    }
    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), "command finished");
    Ok(ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Run a child while surfacing accepted lines as `info` events.
///
/// `label` names the process in live output and heartbeats. The full text of
/// both channels is accumulated whether or not `filter` accepts a line.
#[instrument(skip_all, fields(agent = label, timeout_secs = request.timeout.as_secs()))]
pub fn run_streaming(
    request: &ProcessRequest<'_>,
    label: &str,
    filter: &mut dyn LineFilter,
) -> Result<ProcessOutput, ProcessError> {
    let started = Instant::now();
    let mut child = spawn(request)?;
    let (stdout, stderr) = take_pipes(&mut child)?;

    let (tx, rx) = mpsc::channel::<StreamEvent>();
    spawn_line_reader(stdout, Channel::Stdout, tx.clone());
    spawn_line_reader(stderr, Channel::Stderr, tx);
    let writer = feed_stdin(&mut child, request.stdin)?;

    let mut stdout_buf = LimitedText::new(request.output_limit_bytes);
    let mut stderr_buf = LimitedText::new(request.output_limit_bytes);
    let mut open_channels = 2;
    let mut last_activity = Instant::now();

    while open_channels > 0 {
        if started.elapsed() >= request.timeout {
            kill_after_timeout(&mut child, request.timeout)?;
            return Err(ProcessError::Timeout {
                timeout: request.timeout,
            });
        }
        if last_activity.elapsed() >= HEARTBEAT_INTERVAL {
            info!(
                agent = label,
                elapsed_secs = started.elapsed().as_secs(),
                "still running"
            );
            last_activity = Instant::now();
        }

        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(StreamEvent {
                channel,
                line: Some(line),
            }) => {
                last_activity = Instant::now();
                let shown = line.trim_end_matches(['\r', '\n']);
                if filter.accept(channel, shown) {
                    info!(target: "duet::live", agent = label, channel = channel.as_str(), "{shown}");
                }
                match channel {
                    Channel::Stdout => stdout_buf.push(&line),
                    Channel::Stderr => stderr_buf.push(&line),
                }
            }
            Ok(StreamEvent { line: None, .. }) => open_channels -= 1,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    let remaining = request.timeout.saturating_sub(started.elapsed());
    let status = match child
        .wait_timeout(remaining)
        .context("wait for command")?
    {
        Some(status) => status,
        None => {
            kill_after_timeout(&mut child, request.timeout)?;
            return Err(ProcessError::Timeout {
                timeout: request.timeout,
            });
        }
    };
    if let Some(writer) = writer {
        let _ = writer.join();
    }
    if stdout_buf.truncated > 0 || stderr_buf.truncated > 0 {
        warn!(
            stdout_truncated = stdout_buf.truncated,
            stderr_truncated = stderr_buf.truncated,
            "output truncated"
        );
    }

    debug!(exit_code = ?status.code(), elapsed_ms = started.elapsed().as_millis() as u64, "command finished");
    Ok(ProcessOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout_buf.text,
        stderr: stderr_buf.text,
    })
}

fn spawn(request: &ProcessRequest<'_>) -> anyhow::Result<Child> {
    let (program, args) = request
        .argv
        .split_first()
        .ok_or_else(|| anyhow!("empty command line"))?;

    let mut cmd = Command::new(program);
    cmd.args(args)
        .envs(request.env.iter().map(|(key, value)| (key, value)))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    if request.stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    if let Some(dir) = request.workdir {
        cmd.current_dir(dir);
    }

    debug!(program = %program, "spawning child process");
    match cmd.spawn() {
        Ok(child) => Ok(child),
        Err(err) => {
            error!(program = %program, err = %err, "failed to spawn command");
            Err(err).with_context(|| format!("spawn {program}"))
        }
    }
}

fn take_pipes(
    child: &mut Child,
) -> anyhow::Result<(std::process::ChildStdout, std::process::ChildStderr)> {
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;
    Ok((stdout, stderr))
}

/// Write the payload on its own thread and close stdin afterwards.
///
/// A child that exits without reading produces a broken pipe, which is not an
/// error: its exit status tells the story.
fn feed_stdin(
    child: &mut Child,
    payload: Option<&[u8]>,
) -> anyhow::Result<Option<thread::JoinHandle<()>>> {
    let Some(payload) = payload else {
        return Ok(None);
    };
    let mut stdin = child
        .stdin
        .take()
        .ok_or_else(|| anyhow!("stdin was not piped"))?;
    let payload = payload.to_vec();
    Ok(Some(thread::spawn(move || {
        match stdin.write_all(&payload) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::BrokenPipe => {
                debug!("child closed stdin before reading the full payload");
            }
            Err(err) => warn!(err = %err, "failed to write child stdin"),
        }
    })))
}

fn kill_after_timeout(child: &mut Child, timeout: Duration) -> anyhow::Result<()> {
    warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
    match child.kill() {
        Ok(()) => {}
        // Already exited between the wait and the kill.
        Err(err) if err.kind() == ErrorKind::InvalidInput => {}
        Err(err) => return Err(err).context("kill command"),
    }
    child.wait().context("wait command after kill")?;
    Ok(())
}

fn spawn_line_reader<R: Read + Send + 'static>(reader: R, channel: Channel, tx: Sender<StreamEvent>) {
    thread::spawn(move || {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) => break,
                Ok(_) => {
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if tx
                        .send(StreamEvent {
                            channel,
                            line: Some(line),
                        })
                        .is_err()
                    {
                        // Consumer is gone (timeout); keep nothing.
                        return;
                    }
                }
                Err(err) => {
                    warn!(channel = channel.as_str(), err = %err, "stream read failed");
                    break;
                }
            }
        }
        let _ = tx.send(StreamEvent {
            channel,
            line: None,
        });
    });
}

/// Accumulated channel text bounded to a byte budget.
struct LimitedText {
    text: String,
    limit: usize,
    truncated: usize,
}

impl LimitedText {
    fn new(limit: usize) -> Self {
        Self {
            text: String::new(),
            limit,
            truncated: 0,
        }
    }

    fn push(&mut self, line: &str) {
        let remaining = self.limit.saturating_sub(self.text.len());
        if line.len() <= remaining {
            self.text.push_str(line);
            return;
        }
        let mut keep = remaining;
        while !line.is_char_boundary(keep) {
            keep -= 1;
        }
        self.text.push_str(&line[..keep]);
        self.truncated += line.len() - keep;
    }
}

fn join_output(
    handle: thread::JoinHandle<anyhow::Result<(Vec<u8>, usize)>>,
) -> anyhow::Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> anyhow::Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}
