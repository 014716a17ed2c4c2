//! Debug-prompt bypass supervision on a shared console.
//!
//! The vendor tools sometimes block on a "press any key" prompt. Redirecting
//! their stdin does not help: the tool's read call fails outright when input
//! is not an interactive console. So the child inherits our console
//! unchanged, and a background thread pushes Enter keystrokes into that
//! console's input buffer during a bounded window after launch.
//!
//! ```text
//! Starting      → spawn child with inherited stdio, start injector thread
//! PromptWindow  → injector: warm-up, then ≤ max_attempts keystrokes
//! Running       → block on the exit channel with a hard deadline
//! Completed     → child exited; injector cancelled
//! TimedOut      → injector cancelled, process tree killed
//! ```
//!
//! The injector is cancelled the instant the child exits (from the waiter
//! thread) or the deadline fires, and the supervisor waits at most
//! `cancel_grace` for it to wind down.

use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bypass::{
    BypassOutcome, BypassReport, BypassSchedule, ConsoleInjection, cancellation,
    run_injection_loop,
};
use crate::console::ConsoleInput;
use crate::invocation::{ChildInvocation, NO_EXIT_CODE, RunOutcome};
use crate::process::{self, WaitResult, WatchedChild};

/// Events emitted during supervision for logging/audit.
#[derive(Debug, Clone)]
pub enum SupervisorEvent {
    /// The child process was launched.
    Launched { pid: u32, command: String },
    /// The child could not be launched.
    LaunchFailed { reason: String },
    /// A blocking prompt was seen in captured output.
    PromptDetected { matched_text: String },
    /// One bypass attempt was issued.
    BypassAttempt {
        mechanism: String,
        attempt: u32,
        outcome: String,
    },
    /// The bypass loop finished for this invocation.
    BypassStopped(BypassReport),
    /// The child exited on its own.
    Exited { exit_code: i32, elapsed: Duration },
    /// The deadline fired and the child tree was killed.
    TimedOut { timeout: Duration },
}

/// Timing knobs for one supervised run.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    /// Hard deadline when the invocation has no timeout of its own.
    pub timeout: Duration,
    pub schedule: BypassSchedule,
    /// How long to wait for the injector to stop after cancellation.
    pub cancel_grace: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20 * 60),
            schedule: BypassSchedule::default(),
            cancel_grace: Duration::from_secs(3),
        }
    }
}

pub(crate) fn emit(tx: &Option<mpsc::Sender<SupervisorEvent>>, event: SupervisorEvent) {
    if let Some(tx) = tx {
        let _ = tx.send(event);
    }
}

/// Run `invocation` on the shared console, bypassing debug-attach prompts by
/// keystroke injection into `console`.
///
/// Always returns exactly one outcome; nothing here panics or propagates an
/// error. `event_tx` receives supervision events for logging/audit.
pub fn run_supervised(
    invocation: &ChildInvocation,
    console: ConsoleInput,
    settings: &SupervisorSettings,
    event_tx: Option<mpsc::Sender<SupervisorEvent>>,
) -> RunOutcome {
    let started = Instant::now();

    if let Err(reason) = invocation.preflight() {
        warn!(program = %invocation.program().display(), %reason, "not launching child");
        emit(&event_tx, SupervisorEvent::LaunchFailed {
            reason: reason.clone(),
        });
        return RunOutcome::failed_to_start(reason, started.elapsed());
    }

    let mut cmd = Command::new(invocation.program());
    cmd.args(invocation.arguments())
        .current_dir(invocation.work_dir())
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit());

    let child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            let reason = format!("failed to launch {}: {e}", invocation.program().display());
            warn!(%reason, "child launch failed");
            emit(&event_tx, SupervisorEvent::LaunchFailed {
                reason: reason.clone(),
            });
            return RunOutcome::failed_to_start(reason, started.elapsed());
        }
    };

    let pid = child.id();
    info!(
        pid,
        command = %invocation.display_command(),
        work_dir = %invocation.work_dir().display(),
        "launched child on shared console"
    );
    emit(&event_tx, SupervisorEvent::Launched {
        pid,
        command: invocation.display_command(),
    });

    // Injector: independent thread, cancelled by whichever of exit/deadline
    // happens first.
    let (trigger, token) = cancellation();
    let trigger = Arc::new(Mutex::new(trigger));
    let (report_tx, report_rx) = mpsc::channel();
    let bypass = ConsoleInjection::new(console);
    let schedule = settings.schedule;
    let inject_events = event_tx.clone();
    let injector = thread::Builder::new()
        .name(format!("bypass-{pid}"))
        .spawn(move || {
            let report = run_injection_loop(&bypass, &schedule, &token, |attempt, outcome| {
                if let BypassOutcome::Failed { reason } = outcome {
                    debug!(attempt, %reason, "keystroke injection failed");
                }
                emit(&inject_events, SupervisorEvent::BypassAttempt {
                    mechanism: "console".to_string(),
                    attempt,
                    outcome: outcome.label().to_string(),
                });
            });
            let _ = report_tx.send(report);
        });
    let injector = match injector {
        Ok(handle) => Some(handle),
        Err(e) => {
            warn!(error = %e, "failed to start injector thread; running without bypass");
            None
        }
    };

    let exit_trigger = Arc::clone(&trigger);
    let watched = WatchedChild::watch(child, move || {
        if let Ok(mut t) = exit_trigger.lock() {
            t.cancel();
        }
    });

    let timeout = invocation.effective_timeout(settings.timeout);
    let deadline_trigger = Arc::clone(&trigger);
    let waited = watched.wait_with_deadline(timeout, move || {
        if let Ok(mut t) = deadline_trigger.lock() {
            t.cancel();
        }
    });
    let elapsed = started.elapsed();

    if let Ok(mut t) = trigger.lock() {
        t.cancel();
    }
    let report = match report_rx.recv_timeout(settings.cancel_grace) {
        Ok(report) => {
            if let Some(handle) = injector {
                let _ = handle.join();
            }
            report
        }
        Err(_) => {
            warn!(pid, "injector did not stop within grace period; detaching");
            BypassReport {
                mechanism: "console".to_string(),
                cancelled: true,
                ..BypassReport::default()
            }
        }
    };
    debug!(
        pid,
        attempts = report.attempts,
        delivered = report.delivered,
        unavailable = report.unavailable,
        "prompt bypass finished"
    );
    emit(&event_tx, SupervisorEvent::BypassStopped(report.clone()));

    let outcome = match waited {
        WaitResult::Exited(status) => {
            let exit_code = process::exit_code(&status);
            info!(pid, exit_code, elapsed_secs = elapsed.as_secs_f64(), "child exited");
            emit(&event_tx, SupervisorEvent::Exited { exit_code, elapsed });
            RunOutcome::completed(exit_code, elapsed, pid)
        }
        WaitResult::TimedOut => {
            emit(&event_tx, SupervisorEvent::TimedOut { timeout });
            RunOutcome::timed_out(elapsed, pid, timeout)
        }
        WaitResult::WaitFailed(reason) => {
            warn!(pid, %reason, "lost track of child");
            let mut outcome = RunOutcome::completed(NO_EXIT_CODE, elapsed, pid);
            outcome.detail = Some(reason);
            outcome
        }
    };
    outcome.with_bypass(report)
}
