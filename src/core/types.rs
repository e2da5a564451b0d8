//! Core types shared by the supervisor, the session and the result parser: the error taxonomy,
//! RunRequest and RunOutcome.
use std::ffi::OsString;
use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// OS process id of a spawned profiler.
pub type Pid = u32;

/// How much of an offending payload `MalformedOutput` shows when displayed.
const MALFORMED_PREVIEW_CHARS: usize = 200;

#[derive(Error, Debug)]
pub enum SamplingError {
    #[error("Failed to launch {}: {}", .program.display(), .source)]
    Spawn {
        program: PathBuf,
        source: std::io::Error,
    },
    #[error("A profiler run is already in progress")]
    AlreadyRunning,
    #[error("No profiler process is running")]
    NoActiveProcess,
    #[error("Incomplete sampling settings: {}", .0)]
    InvalidSettings(String),
    #[error("The wperf driver is held by another process. Retry with force lock to take it over")]
    DriverLockContention { stderr: String },
    #[error("Couldn't parse profiler output ({}): {}", .reason, preview(.text))]
    MalformedOutput { text: String, reason: String },
    #[error("The profiler exited cleanly but produced no output")]
    EmptyOutput,
    #[error("Gave up after {} force-lock retries", .0)]
    RetryLimitExceeded(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl SamplingError {
    pub(crate) fn malformed(text: &str, reason: impl fmt::Display) -> Self {
        SamplingError::MalformedOutput {
            text: text.to_string(),
            reason: reason.to_string(),
        }
    }

    /// True for the one condition a caller may retry, with force lock.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SamplingError::DriverLockContention { .. })
    }
}

fn preview(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(MALFORMED_PREVIEW_CHARS).collect();
    if chars.next().is_some() {
        format!("{}...", head)
    } else {
        head
    }
}

/// Everything needed to launch one profiler process. Built once per run and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Bit mask of CPUs the profiler may run on. Applied after spawn, best-effort.
    pub cpu_affinity: Option<u64>,
    /// Ask the driver to take its lock away from whichever process holds it.
    pub force_lock: bool,
}

pub const FORCE_LOCK_FLAG: &str = "--force-lock";

impl RunRequest {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        RunRequest {
            program: program.into(),
            args,
            cpu_affinity: None,
            force_lock: false,
        }
    }

    /// Arguments as passed to the process, with the force-lock flag appended when requested.
    pub fn command_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = self.args.iter().map(OsString::from).collect();
        if self.force_lock && !self.args.iter().any(|a| a == FORCE_LOCK_FLAG) {
            args.push(FORCE_LOCK_FLAG.into());
        }
        args
    }
}

impl fmt::Display for RunRequest {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in self.command_args() {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// How a run ended. Produced exactly once per run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The profiler exited successfully; carries its complete stdout.
    Success(String),
    /// The profiler exited with an error; carries its complete stderr.
    Failure(String),
    Cancelled,
}

impl RunOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RunOutcome::Success(_))
    }
}
