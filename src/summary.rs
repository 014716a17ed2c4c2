//! Per-target verdicts and the aggregate run summary.
//!
//! ```text
//! exit code 0  every target passed
//! exit code 1  at least one target failed (nonzero exit, Error diagnostic,
//!              failed test, no results, unreadable results)
//! exit code 2  a target timed out or never started
//! ```

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::invocation::{CompletionState, RunOutcome, serialize_millis};
use crate::results::{CompilerLog, Severity, TestLog, TestOutcome};
use crate::tools::TargetKind;

pub const EXIT_CLEAN: i32 = 0;
pub const EXIT_FAILURES: i32 = 1;
/// Supervisor-level failure, or an environment error before any target ran.
pub const EXIT_SENTINEL: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetVerdict {
    Passed,
    Failed,
    NoResults,
    TimedOut,
    FailedToStart,
    Unreadable,
}

impl TargetVerdict {
    pub fn label(self) -> &'static str {
        match self {
            TargetVerdict::Passed => "passed",
            TargetVerdict::Failed => "failed",
            TargetVerdict::NoResults => "no results produced",
            TargetVerdict::TimedOut => "timed out",
            TargetVerdict::FailedToStart => "failed to start",
            TargetVerdict::Unreadable => "unreadable results",
        }
    }

    pub fn is_failure(self) -> bool {
        self != TargetVerdict::Passed
    }

    /// The tool never ran to completion under supervision.
    pub fn is_supervisor_failure(self) -> bool {
        matches!(self, TargetVerdict::TimedOut | TargetVerdict::FailedToStart)
    }
}

impl fmt::Display for TargetVerdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Parsed result document of either tool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "format", rename_all = "snake_case")]
pub enum TargetResults {
    Compiler(CompilerLog),
    Tests(TestLog),
}

impl TargetResults {
    pub fn has_failures(&self) -> bool {
        match self {
            TargetResults::Compiler(log) => log.has_errors(),
            TargetResults::Tests(log) => log.count(TestOutcome::Failed) > 0,
        }
    }
}

/// What parsing the result document produced, if it was attempted.
#[derive(Debug, Clone)]
pub enum ParsedResults {
    /// The run did not complete, so nothing was parsed.
    NotAttempted,
    Missing,
    Unreadable(String),
    Parsed(TargetResults),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub errors: usize,
    pub warnings: usize,
    pub informational: usize,
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl Totals {
    fn add(&mut self, results: &TargetResults) {
        match results {
            TargetResults::Compiler(log) => {
                self.errors += log.count(Severity::Error);
                self.warnings += log.count(Severity::Warning);
                self.informational += log.count(Severity::Informational);
            }
            TargetResults::Tests(log) => {
                self.passed += log.count(TestOutcome::Passed);
                self.failed += log.count(TestOutcome::Failed);
                self.skipped += log.count(TestOutcome::Skipped);
            }
        }
    }

    fn merge(&mut self, other: &Totals) {
        self.errors += other.errors;
        self.warnings += other.warnings;
        self.informational += other.informational;
        self.passed += other.passed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TargetReport {
    pub target: String,
    pub kind: TargetKind,
    pub verdict: TargetVerdict,
    pub outcome: RunOutcome,
    pub results: Option<TargetResults>,
    /// Why parsing failed, for `Unreadable`.
    pub parse_error: Option<String>,
    pub artifacts: PathBuf,
}

impl TargetReport {
    pub fn new(
        target: impl Into<String>,
        kind: TargetKind,
        artifacts: PathBuf,
        outcome: RunOutcome,
        parsed: ParsedResults,
    ) -> Self {
        let verdict = verdict_for(&outcome, &parsed);
        let (results, parse_error) = match parsed {
            ParsedResults::Parsed(results) => (Some(results), None),
            ParsedResults::Unreadable(reason) => (None, Some(reason)),
            ParsedResults::Missing | ParsedResults::NotAttempted => (None, None),
        };
        Self {
            target: target.into(),
            kind,
            verdict,
            outcome,
            results,
            parse_error,
            artifacts,
        }
    }

    pub fn totals(&self) -> Totals {
        let mut totals = Totals::default();
        if let Some(results) = &self.results {
            totals.add(results);
        }
        totals
    }
}

/// Verdict for one target. A timeout or failed start wins over anything
/// else; a completed run fails on nonzero exit or failures in its results,
/// and a missing or unreadable document fails it regardless of exit code.
pub fn verdict_for(outcome: &RunOutcome, parsed: &ParsedResults) -> TargetVerdict {
    match outcome.state {
        CompletionState::TimedOut => return TargetVerdict::TimedOut,
        CompletionState::FailedToStart => return TargetVerdict::FailedToStart,
        CompletionState::Completed => {}
    }
    match parsed {
        ParsedResults::Missing => TargetVerdict::NoResults,
        ParsedResults::Unreadable(_) => TargetVerdict::Unreadable,
        ParsedResults::Parsed(results) if results.has_failures() => TargetVerdict::Failed,
        ParsedResults::Parsed(_) | ParsedResults::NotAttempted => {
            if outcome.exit_code == 0 {
                TargetVerdict::Passed
            } else {
                TargetVerdict::Failed
            }
        }
    }
}

/// Aggregate exit code over all verdicts.
pub fn aggregate_exit_code<I>(verdicts: I) -> i32
where
    I: IntoIterator<Item = TargetVerdict>,
{
    let mut code = EXIT_CLEAN;
    for verdict in verdicts {
        if verdict.is_supervisor_failure() {
            return EXIT_SENTINEL;
        }
        if verdict.is_failure() {
            code = EXIT_FAILURES;
        }
    }
    code
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateSummary {
    pub kind: TargetKind,
    pub targets: Vec<TargetReport>,
    pub totals: Totals,
    #[serde(rename = "elapsed_ms", serialize_with = "serialize_millis")]
    pub elapsed: Duration,
    pub exit_code: i32,
}

impl AggregateSummary {
    pub fn new(kind: TargetKind, targets: Vec<TargetReport>, elapsed: Duration) -> Self {
        let mut totals = Totals::default();
        for report in &targets {
            totals.merge(&report.totals());
        }
        let exit_code = aggregate_exit_code(targets.iter().map(|t| t.verdict));
        Self {
            kind,
            targets,
            totals,
            elapsed,
            exit_code,
        }
    }

    pub fn failed_targets(&self) -> usize {
        self.targets.iter().filter(|t| t.verdict.is_failure()).count()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn render_human(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "{}: {} target(s), {} failed ({:.1}s)\n",
            self.kind,
            self.targets.len(),
            self.failed_targets(),
            self.elapsed.as_secs_f64()
        ));

        let width = self
            .targets
            .iter()
            .map(|t| t.target.len())
            .max()
            .unwrap_or(0);
        for report in &self.targets {
            render_target(&mut out, report, width);
        }

        let t = &self.totals;
        match self.kind {
            TargetKind::Compile => out.push_str(&format!(
                "Totals: errors {}, warnings {}, informational {}\n",
                t.errors, t.warnings, t.informational
            )),
            TargetKind::Test => out.push_str(&format!(
                "Totals: passed {}, failed {}, skipped {}\n",
                t.passed, t.failed, t.skipped
            )),
        }
        out.push_str(&format!("Exit code: {}\n", self.exit_code));
        out
    }
}

fn render_target(out: &mut String, report: &TargetReport, width: usize) {
    let mut line = format!(
        "  {:<width$}  {:<19}",
        report.target,
        report.verdict.label(),
        width = width
    );

    match &report.results {
        Some(TargetResults::Compiler(log)) => line.push_str(&format!(
            "  errors {}  warnings {}",
            log.count(Severity::Error),
            log.count(Severity::Warning)
        )),
        Some(TargetResults::Tests(log)) => line.push_str(&format!(
            "  passed {}  failed {}  skipped {}",
            log.count(TestOutcome::Passed),
            log.count(TestOutcome::Failed),
            log.count(TestOutcome::Skipped)
        )),
        None => {}
    }
    if report.outcome.state == CompletionState::Completed && report.outcome.exit_code != 0 {
        line.push_str(&format!("  exit {}", report.outcome.exit_code));
    }
    if let Some(detail) = report.outcome.detail.as_ref().or(report.parse_error.as_ref()) {
        line.push_str(&format!("  ({detail})"));
    }
    out.push_str(line.trim_end());
    out.push('\n');

    match &report.results {
        Some(TargetResults::Compiler(log)) => {
            for diagnostic in log.errors() {
                out.push_str(&format!("      {diagnostic}\n"));
            }
        }
        Some(TargetResults::Tests(log)) => {
            for case in log.failures() {
                out.push_str(&format!("      {}\n", case.name));
                for message in &case.messages {
                    out.push_str(&format!("        {}: {}\n", message.tag, message.text));
                }
            }
        }
        None => {}
    }
}
