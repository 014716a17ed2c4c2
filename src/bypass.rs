//! Prompt bypass: answering a blocking "press a key" prompt for the child.
//!
//! Two mechanisms share one capability trait:
//!
//! - [`ConsoleInjection`] pushes an Enter keystroke into the shared console
//!   input buffer. Used when the child inherits our console.
//! - [`StdinWrite`] writes a newline into the child's redirected stdin.
//!   Used when stdout/stderr are captured; weaker, since a child that checks
//!   for a real console rejects piped input.
//!
//! [`run_injection_loop`] applies the timing policy (warm-up, interval,
//! attempt cap) to either one, and stops the moment its [`CancelToken`] is
//! triggered. [`AttemptTally`] keeps the attempt count for both that loop
//! and the relay.

use std::io::Write;
use std::process::ChildStdin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info};

use crate::console::{ConsoleInput, VirtualKey};

/// Result of one bypass attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BypassOutcome {
    /// The keystroke or newline was fully delivered.
    Delivered,
    /// Only part of the keystroke reached the buffer.
    Partial { written: usize, requested: usize },
    /// The write was attempted and failed.
    Failed { reason: String },
    /// Injection is impossible for this invocation; stop trying.
    Unavailable,
}

impl BypassOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            BypassOutcome::Delivered => "delivered",
            BypassOutcome::Partial { .. } => "partial",
            BypassOutcome::Failed { .. } => "failed",
            BypassOutcome::Unavailable => "unavailable",
        }
    }
}

/// Something that can answer a blocking prompt on the child's behalf.
pub trait PromptBypass: Send + Sync {
    /// Short name for logs ("console", "stdin").
    fn name(&self) -> &'static str;

    /// Make one attempt. Must not panic or block for long.
    fn attempt(&self) -> BypassOutcome;
}

/// Keystroke injection into the shared console input buffer.
pub struct ConsoleInjection {
    console: ConsoleInput,
    key: VirtualKey,
    unavailable: AtomicBool,
}

impl ConsoleInjection {
    pub fn new(console: ConsoleInput) -> Self {
        Self {
            console,
            key: VirtualKey::Enter,
            unavailable: AtomicBool::new(false),
        }
    }
}

impl PromptBypass for ConsoleInjection {
    fn name(&self) -> &'static str {
        "console"
    }

    fn attempt(&self) -> BypassOutcome {
        // A failed mode query means stdin is redirected. That does not change
        // during a run, so it is never re-queried.
        if self.unavailable.load(Ordering::Relaxed) {
            return BypassOutcome::Unavailable;
        }
        if !self.console.is_available() {
            self.unavailable.store(true, Ordering::Relaxed);
            return BypassOutcome::Unavailable;
        }

        let count = self.console.send_key(self.key);
        if count.is_complete() {
            BypassOutcome::Delivered
        } else if count.written == 0 {
            BypassOutcome::Failed {
                reason: "console rejected key events".to_string(),
            }
        } else {
            BypassOutcome::Partial {
                written: count.written,
                requested: count.requested,
            }
        }
    }
}

/// Shared handle to a child's stdin. `None` once closed.
pub type SharedStdin = Arc<Mutex<Option<ChildStdin>>>;

#[cfg(windows)]
const NEWLINE: &[u8] = b"\r\n";
#[cfg(not(windows))]
const NEWLINE: &[u8] = b"\n";

/// Newline written into the child's redirected stdin.
pub struct StdinWrite<W: Write + Send = ChildStdin> {
    stdin: Arc<Mutex<Option<W>>>,
}

impl<W: Write + Send> StdinWrite<W> {
    pub fn new(stdin: Arc<Mutex<Option<W>>>) -> Self {
        Self { stdin }
    }
}

impl<W: Write + Send> PromptBypass for StdinWrite<W> {
    fn name(&self) -> &'static str {
        "stdin"
    }

    fn attempt(&self) -> BypassOutcome {
        let Ok(mut guard) = self.stdin.lock() else {
            return BypassOutcome::Unavailable;
        };
        let Some(stdin) = guard.as_mut() else {
            return BypassOutcome::Unavailable;
        };

        match stdin.write_all(NEWLINE).and_then(|()| stdin.flush()) {
            Ok(()) => BypassOutcome::Delivered,
            Err(e) => {
                // The child closed its end; drop ours so later attempts skip.
                debug!(error = %e, "child stdin closed; dropping handle");
                *guard = None;
                BypassOutcome::Failed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Timing policy shared by both bypass mechanisms.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BypassSchedule {
    /// Delay before the first attempt.
    pub warmup: Duration,
    /// Delay between attempts.
    pub interval: Duration,
    /// Hard cap on attempts per invocation.
    pub max_attempts: u32,
}

impl Default for BypassSchedule {
    fn default() -> Self {
        Self {
            warmup: Duration::from_secs(5),
            interval: Duration::from_secs(2),
            max_attempts: 15,
        }
    }
}

/// Bypass activity for one child invocation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BypassReport {
    pub mechanism: String,
    /// Attempts actually issued (the write was tried).
    pub attempts: u32,
    /// Attempts that fully delivered.
    pub delivered: u32,
    /// Injection was found to be impossible.
    pub unavailable: bool,
    /// The loop was stopped before exhausting its attempts.
    pub cancelled: bool,
}

/// Fires a [`CancelToken`]. Dropping the trigger also cancels.
#[derive(Debug)]
pub struct CancelTrigger {
    tx: Option<mpsc::Sender<()>>,
}

impl CancelTrigger {
    pub fn cancel(&mut self) {
        self.tx.take();
    }
}

/// Cooperative cancellation with a cancellable sleep.
#[derive(Debug)]
pub struct CancelToken {
    rx: mpsc::Receiver<()>,
}

impl CancelToken {
    /// Sleep for `duration` unless cancelled first.
    ///
    /// Returns `false` when cancelled.
    pub fn sleep(&self, duration: Duration) -> bool {
        match self.rx.recv_timeout(duration) {
            Err(RecvTimeoutError::Timeout) => true,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => false,
        }
    }
}

pub fn cancellation() -> (CancelTrigger, CancelToken) {
    let (tx, rx) = mpsc::channel();
    (CancelTrigger { tx: Some(tx) }, CancelToken { rx })
}

/// Attempt bookkeeping for one invocation: the attempt cap, the
/// unavailable latch and the resulting [`BypassReport`].
///
/// Shared by [`run_injection_loop`] and the captured-mode relay, which
/// attempts on prompt detection rather than on a timer.
#[derive(Debug)]
pub struct AttemptTally {
    max_attempts: u32,
    report: BypassReport,
}

impl AttemptTally {
    pub fn new(bypass: &dyn PromptBypass, max_attempts: u32) -> Self {
        Self {
            max_attempts,
            report: BypassReport {
                mechanism: bypass.name().to_string(),
                ..BypassReport::default()
            },
        }
    }

    /// No further attempts may be made.
    pub fn is_exhausted(&self) -> bool {
        self.report.unavailable || self.report.attempts >= self.max_attempts
    }

    /// Record one attempt. Returns its 1-based number, or `None` when the
    /// bypass turned out to be unavailable (not counted as an attempt).
    pub fn record(&mut self, outcome: &BypassOutcome) -> Option<u32> {
        if *outcome == BypassOutcome::Unavailable {
            info!(
                mechanism = %self.report.mechanism,
                "prompt bypass unavailable; no further attempts this run"
            );
            self.report.unavailable = true;
            return None;
        }
        self.report.attempts += 1;
        if *outcome == BypassOutcome::Delivered {
            self.report.delivered += 1;
        }
        debug!(
            mechanism = %self.report.mechanism,
            attempt = self.report.attempts,
            outcome = outcome.label(),
            "prompt bypass attempt"
        );
        Some(self.report.attempts)
    }

    pub fn mark_cancelled(&mut self) {
        self.report.cancelled = true;
    }

    pub fn report(&self) -> &BypassReport {
        &self.report
    }

    pub fn into_report(self) -> BypassReport {
        self.report
    }
}

/// Run the bypass on `schedule` until attempts run out, injection turns out
/// to be unavailable, or `cancel` fires.
///
/// `on_attempt` sees every issued attempt (1-based) and its outcome.
pub fn run_injection_loop<F>(
    bypass: &dyn PromptBypass,
    schedule: &BypassSchedule,
    cancel: &CancelToken,
    mut on_attempt: F,
) -> BypassReport
where
    F: FnMut(u32, &BypassOutcome),
{
    let mut tally = AttemptTally::new(bypass, schedule.max_attempts);

    while !tally.is_exhausted() {
        let delay = if tally.report().attempts == 0 {
            schedule.warmup
        } else {
            schedule.interval
        };
        if !cancel.sleep(delay) {
            tally.mark_cancelled();
            break;
        }

        let outcome = bypass.attempt();
        let Some(attempt) = tally.record(&outcome) else {
            break;
        };
        on_attempt(attempt, &outcome);
    }

    tally.into_report()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;
    use std::thread;
    use std::time::Instant;

    use proptest::prelude::*;

    use super::*;
    use crate::console::testing::FakeConsole;
    use crate::console::{KeyEvent, VirtualKey};

    struct CountingBypass {
        calls: AtomicU32,
        outcome: BypassOutcome,
    }

    impl CountingBypass {
        fn new(outcome: BypassOutcome) -> Self {
            Self {
                calls: AtomicU32::new(0),
                outcome,
            }
        }
    }

    impl PromptBypass for CountingBypass {
        fn name(&self) -> &'static str {
            "counting"
        }

        fn attempt(&self) -> BypassOutcome {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome.clone()
        }
    }

    fn fast(max_attempts: u32) -> BypassSchedule {
        BypassSchedule {
            warmup: Duration::from_millis(1),
            interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[test]
    fn default_schedule_matches_documented_values() {
        let s = BypassSchedule::default();
        assert_eq!(s.warmup, Duration::from_secs(5));
        assert_eq!(s.interval, Duration::from_secs(2));
        assert_eq!(s.max_attempts, 15);
    }

    #[test]
    fn loop_stops_at_attempt_cap() {
        let bypass = CountingBypass::new(BypassOutcome::Delivered);
        let (_trigger, token) = cancellation();
        let mut seen = Vec::new();

        let report = run_injection_loop(&bypass, &fast(4), &token, |n, _| seen.push(n));

        assert_eq!(report.attempts, 4);
        assert_eq!(report.delivered, 4);
        assert!(!report.cancelled);
        assert_eq!(seen, vec![1, 2, 3, 4]);
        assert_eq!(bypass.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn cancel_during_warmup_means_zero_attempts() {
        let bypass = CountingBypass::new(BypassOutcome::Delivered);
        let schedule = BypassSchedule {
            warmup: Duration::from_secs(30),
            interval: Duration::from_secs(1),
            max_attempts: 15,
        };
        let (mut trigger, token) = cancellation();

        let started = Instant::now();
        let handle = thread::spawn(move || run_injection_loop(&bypass, &schedule, &token, |_, _| {}));
        thread::sleep(Duration::from_millis(50));
        trigger.cancel();
        let report = handle.join().unwrap();

        assert_eq!(report.attempts, 0);
        assert!(report.cancelled);
        assert!(
            started.elapsed() < Duration::from_secs(5),
            "cancellation must wake the warm-up sleep promptly"
        );
    }

    #[test]
    fn dropping_trigger_cancels() {
        let bypass = CountingBypass::new(BypassOutcome::Delivered);
        let (trigger, token) = cancellation();
        drop(trigger);

        let report = run_injection_loop(&bypass, &fast(10), &token, |_, _| {});
        assert_eq!(report.attempts, 0);
        assert!(report.cancelled);
    }

    #[test]
    fn tally_caps_attempts_and_latches_unavailable() {
        let bypass = CountingBypass::new(BypassOutcome::Delivered);
        let mut tally = AttemptTally::new(&bypass, 2);

        assert_eq!(tally.record(&BypassOutcome::Delivered), Some(1));
        let failed = BypassOutcome::Failed {
            reason: "pipe closed".to_string(),
        };
        assert_eq!(tally.record(&failed), Some(2));
        assert!(tally.is_exhausted());

        let mut latched = AttemptTally::new(&bypass, 10);
        assert_eq!(latched.record(&BypassOutcome::Unavailable), None);
        assert!(latched.is_exhausted());

        let report = tally.into_report();
        assert_eq!(report.mechanism, "counting");
        assert_eq!((report.attempts, report.delivered), (2, 1));
        assert_eq!(latched.report().attempts, 0);
        assert!(latched.report().unavailable);
    }

    #[test]
    fn unavailable_stops_loop_without_counting() {
        let bypass = CountingBypass::new(BypassOutcome::Unavailable);
        let (_trigger, token) = cancellation();

        let report = run_injection_loop(&bypass, &fast(10), &token, |_, _| {
            panic!("unavailable attempts are not reported")
        });

        assert_eq!(report.attempts, 0);
        assert!(report.unavailable);
        assert_eq!(bypass.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_attempts_count_but_do_not_deliver() {
        let bypass = CountingBypass::new(BypassOutcome::Failed {
            reason: "nope".to_string(),
        });
        let (_trigger, token) = cancellation();

        let report = run_injection_loop(&bypass, &fast(3), &token, |_, _| {});
        assert_eq!(report.attempts, 3);
        assert_eq!(report.delivered, 0);
    }

    #[test]
    fn console_injection_on_redirected_input_never_writes() {
        let fake = FakeConsole::redirected();
        let bypass = ConsoleInjection::new(ConsoleInput::with_device(fake.clone()));
        let (_trigger, token) = cancellation();

        let report = run_injection_loop(&bypass, &fast(5), &token, |_, _| {});

        assert_eq!(report.attempts, 0);
        assert!(report.unavailable);
        assert!(fake.events().is_empty());
        assert_eq!(fake.mode_queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn console_injection_remembers_unavailability() {
        let fake = FakeConsole::redirected();
        let bypass = ConsoleInjection::new(ConsoleInput::with_device(fake.clone()));

        assert_eq!(bypass.attempt(), BypassOutcome::Unavailable);
        assert_eq!(bypass.attempt(), BypassOutcome::Unavailable);
        assert_eq!(fake.mode_queries.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn console_injection_delivers_enter() {
        let fake = FakeConsole::default();
        let bypass = ConsoleInjection::new(ConsoleInput::with_device(fake.clone()));

        assert_eq!(bypass.attempt(), BypassOutcome::Delivered);
        assert_eq!(fake.events(), KeyEvent::stroke(VirtualKey::Enter).to_vec());
    }

    #[test]
    fn console_injection_reports_rejected_writes() {
        let fake = FakeConsole {
            fail_writes: true,
            ..FakeConsole::default()
        };
        let bypass = ConsoleInjection::new(ConsoleInput::with_device(fake));
        assert!(matches!(bypass.attempt(), BypassOutcome::Failed { .. }));
    }

    #[test]
    fn stdin_write_sends_newline() {
        let sink: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(Some(Vec::new())));
        let bypass = StdinWrite::new(Arc::clone(&sink));

        assert_eq!(bypass.attempt(), BypassOutcome::Delivered);
        assert_eq!(sink.lock().unwrap().as_deref(), Some(NEWLINE));
    }

    #[test]
    fn stdin_write_on_closed_stdin_is_unavailable() {
        let sink: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let bypass = StdinWrite::new(sink);
        assert_eq!(bypass.attempt(), BypassOutcome::Unavailable);
    }

    struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
            Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn stdin_write_failure_is_swallowed_and_closes_handle() {
        let sink = Arc::new(Mutex::new(Some(BrokenPipe)));
        let bypass = StdinWrite::new(Arc::clone(&sink));

        assert!(matches!(bypass.attempt(), BypassOutcome::Failed { .. }));
        assert!(sink.lock().unwrap().is_none());
        assert_eq!(bypass.attempt(), BypassOutcome::Unavailable);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn never_more_than_max_attempts(max_attempts in 0u32..40) {
            let bypass = CountingBypass::new(BypassOutcome::Delivered);
            let schedule = BypassSchedule {
                warmup: Duration::ZERO,
                interval: Duration::ZERO,
                max_attempts,
            };
            let (_trigger, token) = cancellation();

            let report = run_injection_loop(&bypass, &schedule, &token, |_, _| {});
            prop_assert_eq!(report.attempts, max_attempts);
            prop_assert!(bypass.calls.load(Ordering::SeqCst) <= max_attempts);
        }
    }
}
