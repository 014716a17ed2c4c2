//! Child invocation and run outcome types.
//!
//! A [`ChildInvocation`] describes exactly one launch of an external tool.
//! The supervisor (shared console) and the relay (captured stdio) both turn
//! one invocation into exactly one [`RunOutcome`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;

use crate::bypass::BypassReport;

/// Exit code reported when the child never produced one.
pub const NO_EXIT_CODE: i32 = -1;

/// One launch of an external tool. Immutable once built.
#[derive(Debug, Clone, PartialEq)]
pub struct ChildInvocation {
    program: PathBuf,
    args: Vec<String>,
    work_dir: PathBuf,
    timeout: Option<Duration>,
}

impl ChildInvocation {
    pub fn new(program: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            work_dir: work_dir.into(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Per-run timeout. Overrides the supervisor default when set.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn arguments(&self) -> &[String] {
        &self.args
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn timeout_override(&self) -> Option<Duration> {
        self.timeout
    }

    /// Effective hard deadline for this run.
    pub fn effective_timeout(&self, default: Duration) -> Duration {
        self.timeout.unwrap_or(default)
    }

    /// Command line as a single display string (for logs only).
    pub fn display_command(&self) -> String {
        let mut out = self.program.display().to_string();
        for arg in &self.args {
            out.push(' ');
            if arg.contains(' ') {
                out.push('"');
                out.push_str(arg);
                out.push('"');
            } else {
                out.push_str(arg);
            }
        }
        out
    }

    /// Check the environment preconditions for launching.
    ///
    /// Returns a human-readable reason when the executable or the working
    /// directory is missing.
    pub fn preflight(&self) -> Result<(), String> {
        if self.program.components().count() > 1 && !self.program.is_file() {
            return Err(format!(
                "executable not found: {}",
                self.program.display()
            ));
        }
        if !self.work_dir.is_dir() {
            return Err(format!(
                "working directory not found: {}",
                self.work_dir.display()
            ));
        }
        Ok(())
    }
}

/// How a child run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionState {
    /// The child exited on its own.
    Completed,
    /// The hard deadline fired first and the child tree was killed.
    TimedOut,
    /// The child could not be launched at all.
    FailedToStart,
}

impl fmt::Display for CompletionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            CompletionState::Completed => "completed",
            CompletionState::TimedOut => "timed out",
            CompletionState::FailedToStart => "failed to start",
        };
        f.write_str(label)
    }
}

/// Result of running one [`ChildInvocation`]. Produced exactly once.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub exit_code: i32,
    pub state: CompletionState,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    /// OS process id, when the child was launched.
    pub pid: Option<u32>,
    /// Why the run did not complete normally.
    pub detail: Option<String>,
    /// Prompt-bypass activity during the run.
    pub bypass: Option<BypassReport>,
}

impl RunOutcome {
    pub fn completed(exit_code: i32, elapsed: Duration, pid: u32) -> Self {
        Self {
            exit_code,
            state: CompletionState::Completed,
            elapsed,
            pid: Some(pid),
            detail: None,
            bypass: None,
        }
    }

    pub fn timed_out(elapsed: Duration, pid: u32, timeout: Duration) -> Self {
        Self {
            exit_code: NO_EXIT_CODE,
            state: CompletionState::TimedOut,
            elapsed,
            pid: Some(pid),
            detail: Some(format!("no exit after {}s", timeout.as_secs_f64())),
            bypass: None,
        }
    }

    pub fn failed_to_start(reason: impl Into<String>, elapsed: Duration) -> Self {
        Self {
            exit_code: NO_EXIT_CODE,
            state: CompletionState::FailedToStart,
            elapsed,
            pid: None,
            detail: Some(reason.into()),
            bypass: None,
        }
    }

    pub fn with_bypass(mut self, report: BypassReport) -> Self {
        self.bypass = Some(report);
        self
    }

    /// True only for a child that exited on its own with code 0.
    pub fn is_clean_exit(&self) -> bool {
        self.state == CompletionState::Completed && self.exit_code == 0
    }
}

pub(crate) fn serialize_millis<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
}
