//! Child process plumbing shared by the supervisor and the relay.
//!
//! Waiting uses a dedicated waiter thread that owns the [`Child`] and
//! reports its exit status over a channel, so the caller can block with a
//! hard deadline (`recv_timeout`) instead of polling. On expiry the whole
//! process tree is killed by pid and the waiter reaps the child.

use std::process::{Child, ExitStatus};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use sysinfo::{Pid, ProcessStatus, System};
use tracing::{debug, warn};

/// How long to wait for the waiter thread to reap a killed child.
pub const REAP_GRACE: Duration = Duration::from_secs(5);

/// How a deadline-bounded wait ended.
#[derive(Debug)]
pub enum WaitResult {
    Exited(ExitStatus),
    TimedOut,
    /// `wait()` itself failed; the child state is unknown.
    WaitFailed(String),
}

/// Handle to a child whose exit is being watched by a waiter thread.
pub struct WatchedChild {
    pid: u32,
    exit_rx: mpsc::Receiver<std::io::Result<ExitStatus>>,
    waiter: Option<JoinHandle<()>>,
}

impl WatchedChild {
    /// Hand the child to a waiter thread.
    ///
    /// `on_exit` runs on the waiter thread the instant `wait()` returns,
    /// before the status is delivered; the supervisor uses it to cancel the
    /// injection loop without waiting for the caller to wake up.
    pub fn watch<F>(mut child: Child, on_exit: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let pid = child.id();
        let (tx, exit_rx) = mpsc::channel();
        let waiter = thread::Builder::new()
            .name(format!("wait-{pid}"))
            .spawn(move || {
                let status = child.wait();
                on_exit();
                let _ = tx.send(status);
            })
            .ok();
        if waiter.is_none() {
            warn!(pid, "failed to spawn waiter thread");
        }

        Self {
            pid,
            exit_rx,
            waiter,
        }
    }

    /// Block until the child exits or `timeout` elapses.
    ///
    /// On timeout `on_deadline` runs first, then the process tree is killed
    /// and reaped (bounded by [`REAP_GRACE`]) before returning.
    pub fn wait_with_deadline<F>(mut self, timeout: Duration, on_deadline: F) -> WaitResult
    where
        F: FnOnce(),
    {
        let result = match self.exit_rx.recv_timeout(timeout) {
            Ok(Ok(status)) => WaitResult::Exited(status),
            Ok(Err(e)) => WaitResult::WaitFailed(e.to_string()),
            Err(RecvTimeoutError::Timeout) => {
                on_deadline();
                warn!(
                    pid = self.pid,
                    timeout_secs = timeout.as_secs_f64(),
                    "child timed out; killing process tree"
                );
                let killed = kill_process_tree(self.pid);
                debug!(pid = self.pid, killed = killed.len(), "process tree killed");
                match self.exit_rx.recv_timeout(REAP_GRACE) {
                    Ok(_) => {}
                    Err(_) => warn!(pid = self.pid, "killed child was not reaped in time"),
                }
                WaitResult::TimedOut
            }
            Err(RecvTimeoutError::Disconnected) => {
                // Nobody owns the child any more; it must not outlive its target.
                let killed = kill_process_tree(self.pid);
                warn!(pid = self.pid, killed = killed.len(), "lost waiter thread; killed process tree");
                WaitResult::WaitFailed("waiter thread exited without a status".to_string())
            }
        };

        if let Some(waiter) = self.waiter.take() {
            if waiter.is_finished() {
                let _ = waiter.join();
            }
        }
        result
    }
}

/// Exit code as a signed integer; `-1` when the child died from a signal.
pub fn exit_code(status: &ExitStatus) -> i32 {
    status.code().unwrap_or(crate::invocation::NO_EXIT_CODE)
}

/// Kill `root` and every descendant. Returns the pids signalled.
///
/// Descendants are killed deepest first so nothing gets re-parented away
/// before we reach it.
pub fn kill_process_tree(root: u32) -> Vec<u32> {
    let mut system = System::new();
    system.refresh_processes();

    let root_pid = Pid::from_u32(root);
    let mut tree = vec![root_pid];
    let mut idx = 0;
    while idx < tree.len() {
        let current = tree[idx];
        for (pid, process) in system.processes() {
            if process.parent() == Some(current) && !tree.contains(pid) {
                tree.push(*pid);
            }
        }
        idx += 1;
    }

    let mut killed = Vec::with_capacity(tree.len());
    for pid in tree.into_iter().rev() {
        if system.process(pid).is_some_and(|p| p.kill()) {
            killed.push(pid.as_u32());
        }
    }
    killed
}

/// Whether `pid` refers to a live (non-zombie) process.
pub fn is_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes();
    system
        .process(Pid::from_u32(pid))
        .is_some_and(|p| !matches!(p.status(), ProcessStatus::Zombie | ProcessStatus::Dead))
}

#[cfg(all(test, unix))]
mod tests {
    use std::process::{Command, Stdio};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Instant;

    use super::*;

    fn spawn_sh(script: &str) -> Child {
        Command::new("sh")
            .arg("-c")
            .arg(script)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap()
    }

    #[test]
    fn exit_status_is_reported() {
        let watched = WatchedChild::watch(spawn_sh("exit 3"), || {});
        match watched.wait_with_deadline(Duration::from_secs(10), || {}) {
            WaitResult::Exited(status) => assert_eq!(exit_code(&status), 3),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn on_exit_runs_when_child_exits() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        let watched = WatchedChild::watch(spawn_sh("true"), move || {
            flag.store(true, Ordering::SeqCst);
        });
        let _ = watched.wait_with_deadline(Duration::from_secs(10), || {});
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn deadline_kills_child() {
        let child = spawn_sh("sleep 30");
        let pid = child.id();
        let watched = WatchedChild::watch(child, || {});

        let started = Instant::now();
        let result = watched.wait_with_deadline(Duration::from_millis(200), || {});
        assert!(matches!(result, WaitResult::TimedOut));
        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(!is_alive(pid), "timed-out child must be gone");
    }

    #[test]
    fn tree_kill_reaches_grandchildren() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_file = tmp.path().join("grandchild.pid");
        let script = format!("sleep 30 & echo $! > {}; wait", pid_file.display());
        let child = spawn_sh(&script);
        let watched = WatchedChild::watch(child, || {});

        let deadline = Instant::now() + Duration::from_secs(5);
        while !pid_file.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(20));
        }
        thread::sleep(Duration::from_millis(50));
        let grandchild: u32 = std::fs::read_to_string(&pid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();

        let result = watched.wait_with_deadline(Duration::from_millis(100), || {});
        assert!(matches!(result, WaitResult::TimedOut));

        let deadline = Instant::now() + Duration::from_secs(5);
        while is_alive(grandchild) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        assert!(!is_alive(grandchild), "grandchild {grandchild} survived tree kill");
    }

    #[test]
    fn lost_waiter_kills_child() {
        let mut child = spawn_sh("sleep 30");
        let (tx, exit_rx) = mpsc::channel();
        drop(tx);
        let watched = WatchedChild {
            pid: child.id(),
            exit_rx,
            waiter: None,
        };

        let started = Instant::now();
        let result = watched.wait_with_deadline(Duration::from_secs(30), || {});
        assert!(matches!(result, WaitResult::WaitFailed(_)));

        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }
}
