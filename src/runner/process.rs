//! Process spawning abstraction.
//!
//! The driver talks to subprocesses through `ProcessRunner` so the stdio
//! policy (`task_output`) is decided in one place and tests can exercise
//! execution without touching the terminal.

use std::io;
use std::process::{Command, Stdio};

use crate::core::types::TaskOutput;

/// Output from a finished process. Streams that were inherited arrive
/// empty here; buffered streams are captured.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

pub trait ProcessRunner {
    /// Configure stdio per policy, run to completion, return the outcome.
    fn run(&self, cmd: &mut Command) -> io::Result<ExecOutput>;
}

/// `all`: stream both stdout and stderr.
pub struct PassthroughRunner;

/// `out`: stream stdout, discard stderr.
pub struct StdoutOnlyRunner;

/// `err`: stream stderr, discard stdout.
pub struct StderrOnlyRunner;

/// `on-err`: discard stdout, buffer stderr for the caller to emit on
/// failure.
pub struct BufferedStderrRunner;

/// `none`: discard both.
pub struct SilentRunner;

fn finish(cmd: &mut Command) -> io::Result<ExecOutput> {
    let child = cmd.spawn()?;
    let output = child.wait_with_output()?;
    Ok(ExecOutput {
        // A signal death has no exit code; -1 marks it as failed.
        exit_code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

impl ProcessRunner for PassthroughRunner {
    fn run(&self, cmd: &mut Command) -> io::Result<ExecOutput> {
        finish(cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit()))
    }
}

impl ProcessRunner for StdoutOnlyRunner {
    fn run(&self, cmd: &mut Command) -> io::Result<ExecOutput> {
        finish(cmd.stdout(Stdio::inherit()).stderr(Stdio::null()))
    }
}

impl ProcessRunner for StderrOnlyRunner {
    fn run(&self, cmd: &mut Command) -> io::Result<ExecOutput> {
        finish(cmd.stdout(Stdio::null()).stderr(Stdio::inherit()))
    }
}

impl ProcessRunner for BufferedStderrRunner {
    fn run(&self, cmd: &mut Command) -> io::Result<ExecOutput> {
        finish(cmd.stdout(Stdio::null()).stderr(Stdio::piped()))
    }
}

impl ProcessRunner for SilentRunner {
    fn run(&self, cmd: &mut Command) -> io::Result<ExecOutput> {
        finish(cmd.stdout(Stdio::null()).stderr(Stdio::null()))
    }
}

/// Factory keyed on the effective `task_output` policy.
pub fn make_process_runner(output: TaskOutput) -> Box<dyn ProcessRunner> {
    match output {
        TaskOutput::All => Box::new(PassthroughRunner),
        TaskOutput::Out => Box::new(StdoutOnlyRunner),
        TaskOutput::Err => Box::new(StderrOnlyRunner),
        TaskOutput::OnErr => Box::new(BufferedStderrRunner),
        TaskOutput::None => Box::new(SilentRunner),
    }
}
