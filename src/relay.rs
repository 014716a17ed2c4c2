//! Stream relay for children launched with captured stdio.
//!
//! When a run's stdout/stderr must be kept as log text, the child cannot
//! share our console, so keystroke injection is off the table. Instead one
//! thread per stream echoes output to our own stdout/stderr as it arrives,
//! tees it into a capture file, and (stdout only) watches for the
//! debug-attach prompt. On a match it waits briefly for the prompt to
//! render and writes a newline into the child's stdin through the
//! [`StdinWrite`] bypass.
//!
//! Per-stream order is preserved; nothing orders stdout against stderr.
//! After the child exits each relay thread gets a bounded join so a pipe
//! held open by a stray grandchild cannot hang the run.

use std::fs::File;
use std::io::{self, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::bypass::{AttemptTally, BypassReport, PromptBypass, SharedStdin, StdinWrite};
use crate::invocation::{ChildInvocation, NO_EXIT_CODE, RunOutcome};
use crate::process::{self, WaitResult, WatchedChild};
use crate::prompt::{PromptPatterns, strip_ansi};
use crate::supervisor::{SupervisorEvent, emit};

/// Settings for one captured run.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Hard deadline when the invocation has no timeout of its own.
    pub timeout: Duration,
    pub patterns: PromptPatterns,
    /// Pause between seeing the prompt and answering it.
    pub detection_delay: Duration,
    /// Cap on newline writes per invocation.
    pub max_bypasses: u32,
    /// Bounded wait for each relay thread after the child exits.
    pub join_timeout: Duration,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20 * 60),
            patterns: PromptPatterns::debug_attach(),
            detection_delay: Duration::from_millis(500),
            max_bypasses: 15,
            join_timeout: Duration::from_secs(5),
        }
    }
}

/// Where captured output lands. Both files are truncated per run.
#[derive(Debug, Clone)]
pub struct CapturePaths {
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl CapturePaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            stdout: dir.join("stdout.log"),
            stderr: dir.join("stderr.log"),
        }
    }
}

/// Lines relayed from one stream, plus bypass activity for stdout.
#[derive(Debug, Default)]
struct StreamSummary {
    lines: u64,
    bypass: Option<BypassReport>,
}

/// Reacts to prompt markers on the stdout stream.
struct PromptWatch<'a> {
    patterns: PromptPatterns,
    delay: Duration,
    bypass: &'a dyn PromptBypass,
    tally: AttemptTally,
    events: Option<mpsc::Sender<SupervisorEvent>>,
}

impl<'a> PromptWatch<'a> {
    fn new(
        patterns: PromptPatterns,
        delay: Duration,
        max_bypasses: u32,
        bypass: &'a dyn PromptBypass,
        events: Option<mpsc::Sender<SupervisorEvent>>,
    ) -> Self {
        Self {
            patterns,
            delay,
            tally: AttemptTally::new(bypass, max_bypasses),
            bypass,
            events,
        }
    }

    /// Returns true when `text` contained a prompt.
    fn on_text(&mut self, text: &str) -> bool {
        let stripped = strip_ansi(text);
        let Some(detected) = self.patterns.detect(&stripped) else {
            return false;
        };

        info!(matched = %detected.matched_text, "blocking prompt detected in child output");
        emit(&self.events, SupervisorEvent::PromptDetected {
            matched_text: detected.matched_text,
        });

        if self.tally.is_exhausted() {
            debug!("prompt bypass exhausted; leaving prompt unanswered");
            return true;
        }

        thread::sleep(self.delay);
        let outcome = self.bypass.attempt();
        if let Some(attempt) = self.tally.record(&outcome) {
            emit(&self.events, SupervisorEvent::BypassAttempt {
                mechanism: self.bypass.name().to_string(),
                attempt,
                outcome: outcome.label().to_string(),
            });
        }
        true
    }
}

/// Longest unterminated tail kept for prompt matching. Older bytes of a
/// line that never ends are relayed and captured but no longer scanned.
const PARTIAL_WINDOW: usize = 8 * 1024;

/// Copy `reader` to `echo` and `capture` chunk by chunk, handing each
/// line (and each new partial line) to `on_line`.
///
/// Both `\n` and `\r` end a line for detection, so progress output that
/// redraws itself with bare carriage returns is scanned piece by piece.
/// Only `\n` counts towards the returned line total.
///
/// `on_line` returns true when the text was a prompt; a partial line that
/// matched is not re-checked once its terminator arrives.
fn pump<R, W, F>(mut reader: R, mut echo: W, mut capture: Option<BufWriter<File>>, mut on_line: F) -> u64
where
    R: Read,
    W: Write,
    F: FnMut(&str) -> bool,
{
    let mut buf = [0u8; 4096];
    let mut pending: Vec<u8> = Vec::new();
    let mut line_handled = false;
    let mut lines = 0u64;

    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("relay read error (child likely exited): {e}");
                break;
            }
        };
        let chunk = &buf[..n];

        let _ = echo.write_all(chunk);
        let _ = echo.flush();
        if let Some(file) = capture.as_mut() {
            if let Err(e) = file.write_all(chunk) {
                warn!(error = %e, "capture file write failed; capture stopped");
                capture = None;
            }
        }

        let mut start = 0;
        for (i, &byte) in chunk.iter().enumerate() {
            if byte != b'\n' && byte != b'\r' {
                continue;
            }
            pending.extend_from_slice(&chunk[start..i]);
            start = i + 1;
            if !pending.is_empty() && !line_handled {
                on_line(&String::from_utf8_lossy(&pending));
            }
            pending.clear();
            line_handled = false;
            if byte == b'\n' {
                lines += 1;
            }
        }

        let tail = &chunk[start..];
        if tail.is_empty() {
            continue;
        }
        pending.extend_from_slice(tail);
        if pending.len() > PARTIAL_WINDOW {
            pending.drain(..pending.len() - PARTIAL_WINDOW);
        }

        // Prompts usually end without a newline
        if !line_handled {
            line_handled = on_line(&String::from_utf8_lossy(&pending));
        }
    }

    if !pending.is_empty() {
        lines += 1;
    }
    if let Some(mut file) = capture {
        let _ = file.flush();
    }
    lines
}

fn open_capture(path: &Path) -> Option<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if let Err(e) = std::fs::create_dir_all(parent) {
            warn!(path = %parent.display(), error = %e, "cannot create capture directory");
            return None;
        }
    }
    match File::create(path) {
        Ok(file) => Some(BufWriter::new(file)),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open capture file; output will not be saved");
            None
        }
    }
}

/// Run `invocation` with captured stdio, relaying output live and answering
/// the debug-attach prompt through the child's stdin.
///
/// Always returns exactly one outcome.
pub fn run_captured(
    invocation: &ChildInvocation,
    settings: &RelaySettings,
    capture: &CapturePaths,
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

    let stdout_capture = open_capture(&capture.stdout);
    let stderr_capture = open_capture(&capture.stderr);

    let mut cmd = Command::new(invocation.program());
    cmd.args(invocation.arguments())
        .current_dir(invocation.work_dir())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
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
        stdout = %capture.stdout.display(),
        "launched child with captured output"
    );
    emit(&event_tx, SupervisorEvent::Launched {
        pid,
        command: invocation.display_command(),
    });

    let stdin: SharedStdin = Arc::new(Mutex::new(child.stdin.take()));
    let (done_tx, done_rx) = mpsc::channel::<(&'static str, StreamSummary)>();

    if let Some(out) = child.stdout.take() {
        let stdin = Arc::clone(&stdin);
        let patterns = settings.patterns.clone();
        let delay = settings.detection_delay;
        let max_bypasses = settings.max_bypasses;
        let events = event_tx.clone();
        let done = done_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("relay-out-{pid}"))
            .spawn(move || {
                let bypass = StdinWrite::new(stdin);
                let mut watch = PromptWatch::new(patterns, delay, max_bypasses, &bypass, events);
                let lines = pump(out, io::stdout(), stdout_capture, |text| watch.on_text(text));
                let _ = done.send((
                    "stdout",
                    StreamSummary {
                        lines,
                        bypass: Some(watch.tally.into_report()),
                    },
                ));
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to start stdout relay");
        }
    }

    if let Some(err) = child.stderr.take() {
        let done = done_tx.clone();
        let spawned = thread::Builder::new()
            .name(format!("relay-err-{pid}"))
            .spawn(move || {
                let lines = pump(err, io::stderr(), stderr_capture, |_| false);
                let _ = done.send(("stderr", StreamSummary { lines, bypass: None }));
            });
        if let Err(e) = spawned {
            warn!(error = %e, "failed to start stderr relay");
        }
    }
    drop(done_tx);

    let timeout = invocation.effective_timeout(settings.timeout);
    let waited = WatchedChild::watch(child, || {}).wait_with_deadline(timeout, || {});
    let elapsed = started.elapsed();

    // Close our end of stdin so nothing more is written to a dead child.
    if let Ok(mut guard) = stdin.lock() {
        guard.take();
    }

    let mut bypass = BypassReport {
        mechanism: "stdin".to_string(),
        ..BypassReport::default()
    };
    for _ in 0..2 {
        match done_rx.recv_timeout(settings.join_timeout) {
            Ok((stream, summary)) => {
                debug!(pid, stream, lines = summary.lines, "relay finished");
                if let Some(report) = summary.bypass {
                    bypass = report;
                }
            }
            Err(mpsc::RecvTimeoutError::Timeout) => {
                warn!(pid, "relay stream did not close in time; trailing output may be lost");
                break;
            }
            Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    emit(&event_tx, SupervisorEvent::BypassStopped(bypass.clone()));

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
    outcome.with_bypass(bypass)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pump_splits_lines_and_tees_capture() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("out.log");
        let capture = open_capture(&path);
        let mut echo = Vec::new();
        let mut seen = Vec::new();

        let lines = pump(&b"one\r\ntwo\nthree"[..], &mut echo, capture, |t| {
            seen.push(t.to_string());
            false
        });

        assert_eq!(lines, 3);
        assert_eq!(echo, b"one\r\ntwo\nthree");
        assert_eq!(std::fs::read(&path).unwrap(), b"one\r\ntwo\nthree");
        assert_eq!(seen.first().map(String::as_str), Some("one"));
        assert!(seen.contains(&"two".to_string()));
        assert!(seen.contains(&"three".to_string()));
    }

    /// Reader that yields its chunks one `read` call at a time.
    struct Chunked(Vec<&'static [u8]>);

    impl Read for Chunked {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.0.is_empty() {
                return Ok(0);
            }
            let chunk = self.0.remove(0);
            buf[..chunk.len()].copy_from_slice(chunk);
            Ok(chunk.len())
        }
    }

    #[test]
    fn partial_prompt_line_is_checked_once() {
        let reader = Chunked(vec![
            b"Press any key",
            b" to continue . . . ",
            b"\nCompiling...\n",
        ]);
        let patterns = PromptPatterns::debug_attach();
        let mut hits = 0;

        pump(reader, io::sink(), None, |text| {
            let matched = patterns.detect(text).is_some();
            if matched {
                hits += 1;
            }
            matched
        });

        assert_eq!(hits, 1);
    }

    #[test]
    fn carriage_return_progress_is_scanned_linearly() {
        let frame = "Compiling element ApplicationSuite 42%\r";
        let output = frame.repeat(4 * 1024 * 1024 / frame.len());
        let patterns = PromptPatterns::debug_attach();
        let mut scanned = 0usize;
        let mut longest = 0usize;

        let lines = pump(output.as_bytes(), io::sink(), None, |text| {
            scanned += text.len();
            longest = longest.max(text.len());
            patterns.detect(&strip_ansi(text)).is_some()
        });

        assert_eq!(lines, 0);
        assert!(scanned <= output.len(), "scanned {scanned} bytes of {}", output.len());
        assert!(longest < frame.len());
    }

    #[test]
    fn unterminated_output_keeps_a_bounded_tail() {
        let total = 4 * 1024 * 1024;
        let mut scanned = 0usize;
        let mut longest = 0usize;
        let mut echoed = Vec::new();

        pump(io::repeat(b'.').take(total as u64), &mut echoed, None, |text| {
            scanned += text.len();
            longest = longest.max(text.len());
            false
        });

        assert_eq!(echoed.len(), total);
        assert!(longest <= PARTIAL_WINDOW);
        assert!(scanned < 4 * total, "scanned {scanned} bytes");
    }

    #[test]
    fn prompt_after_carriage_return_is_detected() {
        let patterns = PromptPatterns::debug_attach();
        let mut hits = 0;

        pump(
            &b"Loading 10%\rLoading 99%\rPress any key to continue . . . "[..],
            io::sink(),
            None,
            |text| {
                let matched = patterns.detect(text).is_some();
                if matched {
                    hits += 1;
                }
                matched
            },
        );

        assert_eq!(hits, 1);
    }

    #[test]
    fn prompt_watch_writes_newline_and_caps_attempts() {
        let sink: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(Some(Vec::new())));
        let bypass = StdinWrite::new(Arc::clone(&sink));
        let (tx, rx) = mpsc::channel();
        let mut watch =
            PromptWatch::new(PromptPatterns::debug_attach(), Duration::ZERO, 2, &bypass, Some(tx));

        assert!(!watch.on_text("Compiling..."));
        for _ in 0..3 {
            assert!(watch.on_text("Press any key to continue"));
        }

        assert_eq!(watch.tally.report().attempts, 2);
        assert_eq!(watch.tally.report().delivered, 2);
        let written = sink.lock().unwrap().clone().unwrap();
        assert_eq!(written.iter().filter(|&&b| b == b'\n').count(), 2);

        let detections = rx
            .try_iter()
            .filter(|e| matches!(e, SupervisorEvent::PromptDetected { .. }))
            .count();
        assert_eq!(detections, 3);
    }

    #[test]
    fn prompt_watch_on_closed_stdin_is_quiet() {
        let sink: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
        let bypass = StdinWrite::new(sink);
        let mut watch =
            PromptWatch::new(PromptPatterns::debug_attach(), Duration::ZERO, 5, &bypass, None);

        assert!(watch.on_text("Press any key to continue"));
        assert_eq!(watch.tally.report().attempts, 0);
        assert!(watch.tally.report().unavailable);
    }

    #[cfg(unix)]
    mod unix {
        use super::*;
        use crate::invocation::CompletionState;

        fn sh(script: &str, dir: &Path) -> ChildInvocation {
            ChildInvocation::new("sh", dir).args(["-c", script])
        }

        fn fast() -> RelaySettings {
            RelaySettings {
                timeout: Duration::from_secs(30),
                detection_delay: Duration::from_millis(50),
                ..RelaySettings::default()
            }
        }

        #[test]
        fn captures_both_streams() {
            let tmp = tempfile::tempdir().unwrap();
            let capture = CapturePaths::in_dir(&tmp.path().join("logs"));
            let outcome = run_captured(
                &sh("echo out-1; echo err-1 >&2; echo out-2; exit 4", tmp.path()),
                &fast(),
                &capture,
                None,
            );

            assert_eq!(outcome.state, CompletionState::Completed);
            assert_eq!(outcome.exit_code, 4);
            let out = std::fs::read_to_string(&capture.stdout).unwrap();
            let err = std::fs::read_to_string(&capture.stderr).unwrap();
            assert_eq!(out, "out-1\nout-2\n");
            assert_eq!(err, "err-1\n");
        }

        #[test]
        fn answers_prompt_through_stdin() {
            let tmp = tempfile::tempdir().unwrap();
            let capture = CapturePaths::in_dir(tmp.path());
            let script = "printf 'Press any key to continue . . . '; read answer; echo resumed";
            let (tx, rx) = mpsc::channel();

            let outcome = run_captured(&sh(script, tmp.path()), &fast(), &capture, Some(tx));

            assert_eq!(outcome.state, CompletionState::Completed);
            assert_eq!(outcome.exit_code, 0);
            let report = outcome.bypass.unwrap();
            assert_eq!(report.mechanism, "stdin");
            assert_eq!(report.delivered, 1);
            let out = std::fs::read_to_string(&capture.stdout).unwrap();
            assert!(out.contains("resumed"), "child did not resume: {out:?}");
            assert!(
                rx.try_iter()
                    .any(|e| matches!(e, SupervisorEvent::PromptDetected { .. }))
            );
        }

        #[test]
        fn child_that_closed_stdin_does_not_break_relay() {
            let tmp = tempfile::tempdir().unwrap();
            let capture = CapturePaths::in_dir(tmp.path());
            let script = "exec 0<&-; echo 'Press any key to continue'; sleep 0.2; echo done";

            let outcome = run_captured(&sh(script, tmp.path()), &fast(), &capture, None);

            assert_eq!(outcome.state, CompletionState::Completed);
            assert_eq!(outcome.exit_code, 0);
            let out = std::fs::read_to_string(&capture.stdout).unwrap();
            assert!(out.ends_with("done\n"));
        }

        #[test]
        fn timeout_kills_captured_child() {
            let tmp = tempfile::tempdir().unwrap();
            let capture = CapturePaths::in_dir(tmp.path());
            let invocation = sh("echo started; sleep 30", tmp.path()).timeout(Duration::from_millis(300));

            let outcome = run_captured(&invocation, &fast(), &capture, None);

            assert_eq!(outcome.state, CompletionState::TimedOut);
            assert!(!process::is_alive(outcome.pid.unwrap()));
            let out = std::fs::read_to_string(&capture.stdout).unwrap();
            assert_eq!(out, "started\n");
        }

        #[test]
        fn missing_work_dir_fails_to_start() {
            let tmp = tempfile::tempdir().unwrap();
            let capture = CapturePaths::in_dir(tmp.path());
            let outcome = run_captured(
                &ChildInvocation::new("sh", tmp.path().join("gone")),
                &fast(),
                &capture,
                None,
            );
            assert_eq!(outcome.state, CompletionState::FailedToStart);
            assert!(!capture.stdout.exists());
        }
    }
}
