//! Orchestrator: run every target in order and collect one report each.
//!
//! For each target it:
//! 1. Clears the previous run's artifacts for that target
//! 2. Builds the tool invocation and hands it to the [`TargetRunner`]
//! 3. Forwards supervision events to the run log as they happen
//! 4. Parses the result document when the run completed
//! 5. Records a [`TargetReport`] with its verdict
//!
//! A failing, timed-out or unlaunchable target never stops the run; the
//! aggregate summary is always produced.

use std::path::{Path, PathBuf};
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::console::ConsoleInput;
use crate::invocation::{ChildInvocation, CompletionState, RunOutcome};
use crate::log::{ExecutionLog, LogEvent};
use crate::paths::{self, TargetArtifacts};
use crate::relay::{self, RelaySettings};
use crate::results::{self, ResultsError};
use crate::summary::{AggregateSummary, ParsedResults, TargetReport, TargetResults};
use crate::supervisor::{self, SupervisorEvent, SupervisorSettings};
use crate::tools::{TargetKind, Toolchain};

/// Runs one invocation to completion. The seam between the orchestrator
/// and the process layer.
pub trait TargetRunner {
    fn mode(&self) -> &'static str;

    fn run(
        &mut self,
        invocation: &ChildInvocation,
        artifacts: &TargetArtifacts,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> RunOutcome;
}

/// Shared-console runs with keystroke injection.
pub struct ConsoleRunner {
    settings: SupervisorSettings,
    console: Box<dyn Fn() -> ConsoleInput>,
}

impl ConsoleRunner {
    /// Inject into this process's own console.
    pub fn new(settings: SupervisorSettings) -> Self {
        Self::with_console(settings, ConsoleInput::inherited)
    }

    /// `console` is called once per invocation for a fresh input handle.
    pub fn with_console(
        settings: SupervisorSettings,
        console: impl Fn() -> ConsoleInput + 'static,
    ) -> Self {
        Self {
            settings,
            console: Box::new(console),
        }
    }
}

impl TargetRunner for ConsoleRunner {
    fn mode(&self) -> &'static str {
        "console"
    }

    fn run(
        &mut self,
        invocation: &ChildInvocation,
        _artifacts: &TargetArtifacts,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> RunOutcome {
        supervisor::run_supervised(invocation, (self.console)(), &self.settings, Some(events))
    }
}

/// Captured-stdio runs with newline answers on stdin.
pub struct CapturedRunner {
    settings: RelaySettings,
}

impl CapturedRunner {
    pub fn new(settings: RelaySettings) -> Self {
        Self { settings }
    }
}

impl TargetRunner for CapturedRunner {
    fn mode(&self) -> &'static str {
        "captured"
    }

    fn run(
        &mut self,
        invocation: &ChildInvocation,
        artifacts: &TargetArtifacts,
        events: mpsc::Sender<SupervisorEvent>,
    ) -> RunOutcome {
        relay::run_captured(invocation, &self.settings, &artifacts.capture, Some(events))
    }
}

/// Configuration for the orchestrator.
pub struct OrchestratorConfig {
    pub toolchain: Toolchain,
    /// Root of all run output (`run.jsonl`, `summary.json`, per-target dirs).
    pub output_dir: PathBuf,
}

/// How long to wait, once the runner has returned, for the last
/// supervision events to reach the run log.
const EVENT_DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Writes supervision events to the run log on its own thread while the
/// child runs, so each entry is stamped when it happened.
struct EventForwarder {
    done: mpsc::Receiver<()>,
}

impl EventForwarder {
    fn start(log: Arc<ExecutionLog>, events: mpsc::Receiver<SupervisorEvent>) -> Self {
        let (done_tx, done) = mpsc::channel();
        let spawned = thread::Builder::new()
            .name("run-log".to_string())
            .spawn(move || {
                for event in events {
                    write_event(&log, LogEvent::from(&event));
                }
                let _ = done_tx.send(());
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to start run log forwarder; child events will not be logged");
        }
        Self { done }
    }

    /// Wait until every event sender is gone, at most `grace`.
    fn finish(self, grace: Duration) {
        if let Err(mpsc::RecvTimeoutError::Timeout) = self.done.recv_timeout(grace) {
            debug!("supervision events still open after the target finished");
        }
    }
}

fn write_event(log: &ExecutionLog, event: LogEvent) {
    if let Err(e) = log.log(event) {
        warn!(error = %format!("{e:#}"), "failed to write run log");
    }
}

pub struct Orchestrator {
    config: OrchestratorConfig,
    runner: Box<dyn TargetRunner>,
    log: Option<Arc<ExecutionLog>>,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, runner: Box<dyn TargetRunner>) -> Self {
        Self {
            config,
            runner,
            log: None,
        }
    }

    /// Record run events to `log`.
    pub fn with_log(mut self, log: ExecutionLog) -> Self {
        self.log = Some(Arc::new(log));
        self
    }

    /// Run every target sequentially, in order.
    pub fn run(&mut self, kind: TargetKind, targets: &[String]) -> AggregateSummary {
        let started = Instant::now();
        info!(%kind, targets = targets.len(), mode = self.runner.mode(), "starting run");
        self.record(LogEvent::RunStarted {
            kind: kind.to_string(),
            mode: self.runner.mode().to_string(),
            targets: targets.to_vec(),
        });

        let mut reports = Vec::with_capacity(targets.len());
        for (index, target) in targets.iter().enumerate() {
            let report = self.run_target(index, kind, target);
            info!(
                target_name = %report.target,
                verdict = %report.verdict,
                exit_code = report.outcome.exit_code,
                "target finished"
            );
            self.record(LogEvent::TargetFinished {
                target: report.target.clone(),
                verdict: report.verdict.label().to_string(),
                exit_code: report.outcome.exit_code,
                elapsed_ms: u64::try_from(report.outcome.elapsed.as_millis()).unwrap_or(u64::MAX),
            });
            reports.push(report);
        }

        let summary = AggregateSummary::new(kind, reports, started.elapsed());
        self.record(LogEvent::RunCompleted {
            exit_code: summary.exit_code,
            failed_targets: summary.failed_targets(),
            total_targets: summary.targets.len(),
        });
        summary
    }

    fn run_target(&mut self, index: usize, kind: TargetKind, target: &str) -> TargetReport {
        let artifacts = TargetArtifacts::new(&self.config.output_dir, kind, target);
        let invocation = self.config.toolchain.invocation(kind, target, &artifacts);

        info!(target_name = %target, command = %invocation.display_command(), "starting target");
        self.record(LogEvent::TargetStarted {
            index,
            target: target.to_string(),
            command: invocation.display_command(),
        });

        if let Err(e) = artifacts.reset() {
            warn!(target_name = %target, error = %format!("{e:#}"), "cannot prepare artifact directory");
            let outcome = RunOutcome::failed_to_start(format!("{e:#}"), Duration::ZERO);
            return TargetReport::new(
                target,
                kind,
                artifacts.dir,
                outcome,
                ParsedResults::NotAttempted,
            );
        }

        let (tx, rx) = mpsc::channel();
        let forwarder = self
            .log
            .as_ref()
            .map(|log| EventForwarder::start(Arc::clone(log), rx));
        let outcome = self.runner.run(&invocation, &artifacts, tx);
        if let Some(forwarder) = forwarder {
            forwarder.finish(EVENT_DRAIN_GRACE);
        }

        let parsed = if outcome.state == CompletionState::Completed {
            parse_results(kind, &artifacts.result_xml)
        } else {
            ParsedResults::NotAttempted
        };

        TargetReport::new(target, kind, artifacts.dir, outcome, parsed)
    }

    fn record(&self, event: LogEvent) {
        if let Some(log) = &self.log {
            write_event(log, event);
        }
    }
}

/// Parse the result document of one target, logging anything unusable.
pub fn parse_results(kind: TargetKind, path: &Path) -> ParsedResults {
    let parsed: Result<Option<TargetResults>, ResultsError> = match kind {
        TargetKind::Compile => {
            results::parse_compiler_log(path).map(|log| log.map(TargetResults::Compiler))
        }
        TargetKind::Test => results::parse_test_log(path).map(|log| log.map(TargetResults::Tests)),
    };
    match parsed {
        Ok(Some(results)) => ParsedResults::Parsed(results),
        Ok(None) => {
            warn!(path = %path.display(), "no results produced");
            ParsedResults::Missing
        }
        Err(e) => {
            warn!(error = %e, "result document is unusable");
            ParsedResults::Unreadable(e.to_string())
        }
    }
}

/// Re-parse the most recent run's documents for `targets` without
/// launching anything. Exit codes of the original runs are not known, so
/// verdicts rest on the documents alone.
pub fn report_existing(output_dir: &Path, kind: TargetKind, targets: &[String]) -> AggregateSummary {
    let started = Instant::now();
    let reports = targets
        .iter()
        .map(|target| {
            let artifacts = TargetArtifacts::new(output_dir, kind, target);
            let parsed = parse_results(kind, &artifacts.result_xml);
            let outcome = RunOutcome {
                exit_code: 0,
                state: CompletionState::Completed,
                elapsed: Duration::ZERO,
                pid: None,
                detail: None,
                bypass: None,
            };
            TargetReport::new(target.as_str(), kind, artifacts.dir, outcome, parsed)
        })
        .collect();
    AggregateSummary::new(kind, reports, started.elapsed())
}

/// Write `summary.json` under `output_dir`.
pub fn write_summary(output_dir: &Path, summary: &AggregateSummary) -> Result<PathBuf> {
    let path = paths::summary_path(output_dir);
    let json = summary.to_json().context("failed to serialize summary")?;
    std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(path)
}
