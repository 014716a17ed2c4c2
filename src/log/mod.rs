//! Structured run log: JSON lines for the most recent run.
//!
//! Each `tooldrive compile` / `tooldrive test` run truncates
//! `<output_dir>/run.jsonl` and writes one self-contained JSON object per
//! event: targets starting and finishing, child launches, prompt detections,
//! bypass attempts, exits and timeouts. No history is kept across runs.

use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tracing::debug;

use crate::supervisor::SupervisorEvent;

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A structured event in the run log.
#[derive(Debug, Clone, Serialize)]
pub struct LogEntry {
    pub timestamp: String,
    #[serde(flatten)]
    pub event: LogEvent,
}

/// All event types that can appear in the run log.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", content = "data")]
#[serde(rename_all = "snake_case")]
pub enum LogEvent {
    RunStarted {
        kind: String,
        mode: String,
        targets: Vec<String>,
    },
    TargetStarted {
        index: usize,
        target: String,
        command: String,
    },
    ChildLaunched {
        pid: u32,
        command: String,
    },
    LaunchFailed {
        reason: String,
    },
    PromptDetected {
        matched_text: String,
    },
    BypassAttempt {
        mechanism: String,
        attempt: u32,
        outcome: String,
    },
    BypassStopped {
        mechanism: String,
        attempts: u32,
        delivered: u32,
        unavailable: bool,
        cancelled: bool,
    },
    ChildExited {
        exit_code: i32,
        elapsed_ms: u64,
    },
    ChildTimedOut {
        timeout_secs: u64,
    },
    TargetFinished {
        target: String,
        verdict: String,
        exit_code: i32,
        elapsed_ms: u64,
    },
    RunCompleted {
        exit_code: i32,
        failed_targets: usize,
        total_targets: usize,
    },
}

/// Writer for the JSON lines run log.
pub struct ExecutionLog {
    writer: Mutex<BufWriter<File>>,
    path: PathBuf,
}

impl ExecutionLog {
    /// Create the run log at `path`, replacing any previous run's log.
    ///
    /// Creates parent directories as needed.
    pub fn new(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create log directory: {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .with_context(|| format!("failed to open log file: {}", path.display()))?;

        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
            path: path.to_path_buf(),
        })
    }

    /// Log an event.
    pub fn log(&self, event: LogEvent) -> Result<()> {
        let entry = LogEntry {
            timestamp: now_rfc3339(),
            event,
        };

        let json = serde_json::to_string(&entry).context("failed to serialize log entry")?;

        debug!(event = %json, "run log");

        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{json}").context("failed to write log entry")?;
        writer.flush().context("failed to flush log")?;

        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn millis(d: std::time::Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

impl From<&SupervisorEvent> for LogEvent {
    fn from(event: &SupervisorEvent) -> Self {
        match event {
            SupervisorEvent::Launched { pid, command } => LogEvent::ChildLaunched {
                pid: *pid,
                command: command.clone(),
            },
            SupervisorEvent::LaunchFailed { reason } => LogEvent::LaunchFailed {
                reason: reason.clone(),
            },
            SupervisorEvent::PromptDetected { matched_text } => LogEvent::PromptDetected {
                matched_text: matched_text.clone(),
            },
            SupervisorEvent::BypassAttempt {
                mechanism,
                attempt,
                outcome,
            } => LogEvent::BypassAttempt {
                mechanism: mechanism.clone(),
                attempt: *attempt,
                outcome: outcome.clone(),
            },
            SupervisorEvent::BypassStopped(report) => LogEvent::BypassStopped {
                mechanism: report.mechanism.clone(),
                attempts: report.attempts,
                delivered: report.delivered,
                unavailable: report.unavailable,
                cancelled: report.cancelled,
            },
            SupervisorEvent::Exited { exit_code, elapsed } => LogEvent::ChildExited {
                exit_code: *exit_code,
                elapsed_ms: millis(*elapsed),
            },
            SupervisorEvent::TimedOut { timeout } => LogEvent::ChildTimedOut {
                timeout_secs: timeout.as_secs(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bypass::BypassReport;
    use std::time::Duration;

    #[test]
    fn log_entry_serializes_to_json() {
        let entry = LogEntry {
            timestamp: "2026-10-15T09:00:00.000Z".to_string(),
            event: LogEvent::TargetStarted {
                index: 0,
                target: "ApplicationSuite".to_string(),
                command: "xppc -modelmodule=ApplicationSuite".to_string(),
            },
        };

        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"event\":\"target_started\""));
        assert!(json.contains("\"target\":\"ApplicationSuite\""));
        assert!(json.contains("\"timestamp\":\"2026-10-15T09:00:00.000Z\""));
    }

    #[test]
    fn write_and_read_log_file() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run.jsonl");

        let log = ExecutionLog::new(&log_path).unwrap();
        log.log(LogEvent::RunStarted {
            kind: "compile".to_string(),
            mode: "console".to_string(),
            targets: vec!["A".to_string()],
        })
        .unwrap();
        log.log(LogEvent::ChildExited {
            exit_code: 0,
            elapsed_ms: 12,
        })
        .unwrap();
        log.log(LogEvent::RunCompleted {
            exit_code: 0,
            failed_targets: 0,
            total_targets: 1,
        })
        .unwrap();

        let content = std::fs::read_to_string(&log_path).unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 3);

        for line in &lines {
            let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
            assert!(parsed.get("event").is_some());
            let ts = parsed["timestamp"].as_str().unwrap();
            assert!(chrono::DateTime::parse_from_rfc3339(ts).is_ok(), "{ts}");
        }

        assert!(lines[0].contains("\"event\":\"run_started\""));
        assert!(lines[1].contains("\"event\":\"child_exited\""));
        assert!(lines[2].contains("\"event\":\"run_completed\""));
        assert_eq!(log.path(), log_path);
    }

    #[test]
    fn creates_parent_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("deep").join("nested").join("run.jsonl");

        let log = ExecutionLog::new(&log_path).unwrap();
        log.log(LogEvent::ChildTimedOut { timeout_secs: 1 }).unwrap();

        assert!(log_path.exists());
    }

    #[test]
    fn new_run_replaces_previous_log() {
        let tmp = tempfile::tempdir().unwrap();
        let log_path = tmp.path().join("run.jsonl");

        {
            let log = ExecutionLog::new(&log_path).unwrap();
            log.log(LogEvent::LaunchFailed {
                reason: "first".to_string(),
            })
            .unwrap();
            log.log(LogEvent::LaunchFailed {
                reason: "first again".to_string(),
            })
            .unwrap();
        }
        {
            let log = ExecutionLog::new(&log_path).unwrap();
            log.log(LogEvent::LaunchFailed {
                reason: "second".to_string(),
            })
            .unwrap();
        }

        let content = std::fs::read_to_string(&log_path).unwrap();
        assert_eq!(content.lines().count(), 1);
        assert!(content.contains("second"));
    }

    #[test]
    fn supervisor_event_conversion() {
        let events = vec![
            SupervisorEvent::Launched {
                pid: 42,
                command: "xppc".to_string(),
            },
            SupervisorEvent::LaunchFailed {
                reason: "executable not found: xppc".to_string(),
            },
            SupervisorEvent::PromptDetected {
                matched_text: "Press any key to continue".to_string(),
            },
            SupervisorEvent::BypassAttempt {
                mechanism: "console".to_string(),
                attempt: 1,
                outcome: "delivered".to_string(),
            },
            SupervisorEvent::BypassStopped(BypassReport {
                mechanism: "console".to_string(),
                attempts: 3,
                delivered: 3,
                unavailable: false,
                cancelled: true,
            }),
            SupervisorEvent::Exited {
                exit_code: 1,
                elapsed: Duration::from_millis(2500),
            },
            SupervisorEvent::TimedOut {
                timeout: Duration::from_secs(1200),
            },
        ];

        let tags: Vec<String> = events
            .iter()
            .map(|e| {
                let value = serde_json::to_value(LogEvent::from(e)).unwrap();
                value["event"].as_str().unwrap().to_string()
            })
            .collect();
        assert_eq!(
            tags,
            vec![
                "child_launched",
                "launch_failed",
                "prompt_detected",
                "bypass_attempt",
                "bypass_stopped",
                "child_exited",
                "child_timed_out",
            ]
        );
    }

    #[test]
    fn exit_conversion_keeps_fields() {
        let event = SupervisorEvent::Exited {
            exit_code: 7,
            elapsed: Duration::from_millis(2500),
        };
        let value = serde_json::to_value(LogEvent::from(&event)).unwrap();
        assert_eq!(value["data"]["exit_code"], 7);
        assert_eq!(value["data"]["elapsed_ms"], 2500);
    }
}
