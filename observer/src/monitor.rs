//! LogMonitor - decides when a session reached its terminal page, timed out,
//! or was cancelled.
//!
//! The session's event log is produced by the remote environment as JSON
//! lines; the monitor only ever reads it. Each poll tick re-reads the whole
//! file, counts its lines as navigation steps and inspects the last line for
//! `"page": "done"`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use shared_types::{TerminationReason, TERMINAL_PAGE};
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::ledger::Finalization;
use crate::workflow::WorkflowClient;

#[derive(Debug, Clone, Copy)]
pub struct MonitorSettings {
    pub poll_interval: Duration,
    pub timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MonitorOutcome {
    Completed {
        duration: Duration,
        navigation_steps: u64,
        score: Option<f64>,
    },
    TimedOut {
        elapsed: Duration,
        navigation_steps: u64,
    },
    /// Cancellation was observed at the top of a tick.
    Cancelled { navigation_steps: u64 },
    /// The event log exists but could not be read.
    Failed {
        elapsed: Duration,
        navigation_steps: u64,
        error: String,
    },
}

impl MonitorOutcome {
    /// Ledger values for this outcome.
    ///
    /// A cancelled session keeps its placeholder duration of zero rather than
    /// the time it actually ran.
    pub fn finalization(&self) -> Finalization {
        match self {
            MonitorOutcome::Completed {
                duration,
                navigation_steps,
                score,
            } => Finalization {
                duration: duration.as_secs_f64(),
                reason: TerminationReason::Completed,
                navigation_steps: *navigation_steps,
                score: *score,
            },
            MonitorOutcome::TimedOut {
                elapsed,
                navigation_steps,
            } => Finalization {
                duration: elapsed.as_secs_f64(),
                reason: TerminationReason::Timeout,
                navigation_steps: *navigation_steps,
                score: None,
            },
            MonitorOutcome::Cancelled { navigation_steps } => Finalization {
                duration: 0.0,
                reason: TerminationReason::Stopped,
                navigation_steps: *navigation_steps,
                score: None,
            },
            MonitorOutcome::Failed {
                elapsed,
                navigation_steps,
                ..
            } => Finalization {
                duration: elapsed.as_secs_f64(),
                reason: TerminationReason::Error,
                navigation_steps: *navigation_steps,
                score: None,
            },
        }
    }
}

/// What one read of an event log revealed.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct LogSnapshot {
    pub navigation_steps: u64,
    pub reached_terminal: bool,
    /// `reward` of the terminal record, when present and numeric.
    pub score: Option<f64>,
}

/// Inspect event-log content: count lines and check the last one.
///
/// A last line that is not valid JSON counts as "not terminal yet"; the
/// producer may be mid-write.
pub fn inspect_log(content: &str) -> LogSnapshot {
    let lines: Vec<&str> = content.lines().collect();
    let mut snapshot = LogSnapshot {
        navigation_steps: lines.len() as u64,
        ..LogSnapshot::default()
    };
    let Some(last) = lines.last() else {
        return snapshot;
    };

    match serde_json::from_str::<serde_json::Value>(last) {
        Ok(record) => {
            if record.get("page").and_then(|v| v.as_str()) == Some(TERMINAL_PAGE) {
                snapshot.reached_terminal = true;
                snapshot.score = record.get("reward").and_then(|v| v.as_f64());
            }
        }
        Err(e) => debug!(error = %e, "last event-log line is not valid JSON"),
    }
    snapshot
}

/// Read a log file; a missing file is an empty log.
async fn read_snapshot(path: &Path) -> std::io::Result<LogSnapshot> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(inspect_log(&String::from_utf8_lossy(&bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(LogSnapshot::default()),
        Err(e) => Err(e),
    }
}

pub fn event_log_path(log_dir: &Path, session_id: &str) -> PathBuf {
    log_dir.join(format!("{session_id}.jsonl"))
}

pub struct LogMonitor {
    log_dir: PathBuf,
    settings: MonitorSettings,
    workflow: Arc<dyn WorkflowClient>,
}

impl LogMonitor {
    pub fn new(log_dir: PathBuf, settings: MonitorSettings, workflow: Arc<dyn WorkflowClient>) -> Self {
        Self {
            log_dir,
            settings,
            workflow,
        }
    }

    /// Poll the session's event log until it reaches a terminal outcome.
    ///
    /// `cancel` is only checked at the top of each tick; an in-flight sleep or
    /// remote call is never interrupted.
    pub async fn watch(
        &self,
        session_id: &str,
        remote_session_id: Option<&str>,
        cancel: &AtomicBool,
    ) -> MonitorOutcome {
        let path = event_log_path(&self.log_dir, session_id);
        let started = Instant::now();
        let mut navigation_steps = 0;

        loop {
            if cancel.load(Ordering::SeqCst) {
                info!(session_id, navigation_steps, "monitoring cancelled");
                self.stop_remote(session_id, remote_session_id).await;
                return MonitorOutcome::Cancelled { navigation_steps };
            }

            match read_snapshot(&path).await {
                Ok(snapshot) => {
                    navigation_steps = snapshot.navigation_steps;
                    if snapshot.reached_terminal {
                        let duration = started.elapsed();
                        info!(
                            session_id,
                            navigation_steps,
                            score = ?snapshot.score,
                            "session reached terminal page"
                        );
                        self.stop_remote(session_id, remote_session_id).await;
                        return MonitorOutcome::Completed {
                            duration,
                            navigation_steps,
                            score: snapshot.score,
                        };
                    }
                }
                Err(e) => {
                    let elapsed = started.elapsed();
                    error!(session_id, path = %path.display(), error = %e, "failed to read event log");
                    self.stop_remote(session_id, remote_session_id).await;
                    return MonitorOutcome::Failed {
                        elapsed,
                        navigation_steps,
                        error: e.to_string(),
                    };
                }
            }

            let elapsed = started.elapsed();
            if elapsed > self.settings.timeout {
                warn!(session_id, navigation_steps, "session timed out");
                self.stop_remote(session_id, remote_session_id).await;
                if let Ok(snapshot) = read_snapshot(&path).await {
                    navigation_steps = snapshot.navigation_steps;
                }
                return MonitorOutcome::TimedOut {
                    elapsed,
                    navigation_steps,
                };
            }

            sleep(self.settings.poll_interval).await;
        }
    }

    async fn stop_remote(&self, session_id: &str, remote_session_id: Option<&str>) {
        let Some(remote_session_id) = remote_session_id else {
            debug!(session_id, "no remote session to stop");
            return;
        };
        if !self.workflow.stop(remote_session_id).await {
            warn!(session_id, remote_session_id, "remote stop failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingClient {
        stops: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WorkflowClient for RecordingClient {
        async fn create(&self, _goal: &str) -> Option<String> {
            None
        }

        async fn run(&self, _workflow_id: &str) -> Option<String> {
            None
        }

        async fn stop(&self, remote_session_id: &str) -> bool {
            self.stops.lock().unwrap().push(remote_session_id.to_string());
            true
        }
    }

    fn fast_settings() -> MonitorSettings {
        MonitorSettings {
            poll_interval: Duration::from_millis(20),
            timeout: Duration::from_millis(200),
        }
    }

    fn monitor(dir: &Path) -> (LogMonitor, Arc<RecordingClient>) {
        let client = Arc::new(RecordingClient::default());
        let monitor = LogMonitor::new(dir.to_path_buf(), fast_settings(), client.clone());
        (monitor, client)
    }

    #[test]
    fn test_inspect_log_terminal_with_reward() {
        let snapshot = inspect_log(
            "{\"page\":\"index\"}\n{\"page\":\"done\",\"reward\":0.75}\n",
        );
        assert_eq!(snapshot.navigation_steps, 2);
        assert!(snapshot.reached_terminal);
        assert_eq!(snapshot.score, Some(0.75));
    }

    #[test]
    fn test_inspect_log_terminal_without_reward() {
        let snapshot = inspect_log("{\"page\":\"done\"}");
        assert!(snapshot.reached_terminal);
        assert_eq!(snapshot.score, None);
    }

    #[test]
    fn test_inspect_log_only_checks_last_line() {
        let snapshot = inspect_log("{\"page\":\"done\"}\n{\"page\":\"item_page\"}\n");
        assert_eq!(snapshot.navigation_steps, 2);
        assert!(!snapshot.reached_terminal);
    }

    #[test]
    fn test_inspect_log_unparsable_last_line() {
        let snapshot = inspect_log("{\"page\":\"index\"}\n{\"page\":\"do");
        assert_eq!(snapshot.navigation_steps, 2);
        assert!(!snapshot.reached_terminal);
    }

    #[test]
    fn test_inspect_empty_log() {
        assert_eq!(inspect_log(""), LogSnapshot::default());
    }

    #[test]
    fn test_cancelled_finalization_keeps_zero_duration() {
        let fin = MonitorOutcome::Cancelled {
            navigation_steps: 5,
        }
        .finalization();
        assert_eq!(fin.duration, 0.0);
        assert_eq!(fin.reason, TerminationReason::Stopped);
        assert_eq!(fin.navigation_steps, 5);
        assert_eq!(fin.score, None);
    }

    #[tokio::test]
    async fn test_watch_completes_on_terminal_page() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            event_log_path(dir.path(), "s1"),
            "{\"page\":\"index\"}\n{\"page\":\"done\",\"reward\":1.0}\n",
        )
        .unwrap();
        let (monitor, client) = monitor(dir.path());

        let outcome = monitor
            .watch("s1", Some("remote-1"), &AtomicBool::new(false))
            .await;

        match outcome {
            MonitorOutcome::Completed {
                navigation_steps,
                score,
                ..
            } => {
                assert_eq!(navigation_steps, 2);
                assert_eq!(score, Some(1.0));
            }
            other => panic!("expected completion, got {other:?}"),
        }
        assert_eq!(*client.stops.lock().unwrap(), vec!["remote-1".to_string()]);
    }

    #[tokio::test]
    async fn test_watch_picks_up_log_written_later() {
        let dir = tempfile::tempdir().unwrap();
        let path = event_log_path(dir.path(), "late");
        let (monitor, _client) = monitor(dir.path());

        let writer = tokio::spawn(async move {
            sleep(Duration::from_millis(60)).await;
            tokio::fs::write(&path, "{\"page\":\"search_results\"}\n")
                .await
                .unwrap();
            sleep(Duration::from_millis(40)).await;
            tokio::fs::write(
                &path,
                "{\"page\":\"search_results\"}\n{\"page\":\"item_page\"}\n{\"page\":\"done\",\"reward\":0.5}\n",
            )
            .await
            .unwrap();
        });

        let outcome = monitor.watch("late", None, &AtomicBool::new(false)).await;
        writer.await.unwrap();

        let fin = outcome.finalization();
        assert_eq!(fin.reason, TerminationReason::Completed);
        assert_eq!(fin.navigation_steps, 3);
        assert_eq!(fin.score, Some(0.5));
        assert!(fin.duration > 0.0);
    }

    #[tokio::test]
    async fn test_watch_times_out_without_log() {
        let dir = tempfile::tempdir().unwrap();
        let (monitor, client) = monitor(dir.path());

        let outcome = monitor
            .watch("missing", Some("remote-9"), &AtomicBool::new(false))
            .await;

        match outcome {
            MonitorOutcome::TimedOut {
                elapsed,
                navigation_steps,
            } => {
                assert!(elapsed > Duration::from_millis(200));
                assert_eq!(navigation_steps, 0);
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(client.stops.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_watch_survives_malformed_and_empty_logs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(event_log_path(dir.path(), "empty"), "").unwrap();
        std::fs::write(
            event_log_path(dir.path(), "garbled"),
            "{\"page\":\"index\"}\nnot json at all\n",
        )
        .unwrap();
        let (monitor, _client) = monitor(dir.path());

        let empty = monitor.watch("empty", None, &AtomicBool::new(false)).await;
        assert_eq!(empty.finalization().reason, TerminationReason::Timeout);
        assert_eq!(empty.finalization().navigation_steps, 0);

        let garbled = monitor.watch("garbled", None, &AtomicBool::new(false)).await;
        let fin = garbled.finalization();
        assert_eq!(fin.reason, TerminationReason::Timeout);
        assert_eq!(fin.navigation_steps, 2);
        assert_eq!(fin.score, None);
    }

    #[tokio::test]
    async fn test_watch_returns_cancelled_when_flag_set() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(event_log_path(dir.path(), "s1"), "{\"page\":\"done\"}\n").unwrap();
        let (monitor, client) = monitor(dir.path());

        let outcome = monitor.watch("s1", None, &AtomicBool::new(true)).await;

        assert_eq!(
            outcome,
            MonitorOutcome::Cancelled {
                navigation_steps: 0
            }
        );
        assert!(client.stops.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_watch_fails_when_log_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(event_log_path(dir.path(), "broken")).unwrap();
        let (monitor, client) = monitor(dir.path());

        let outcome = monitor
            .watch("broken", Some("remote-2"), &AtomicBool::new(false))
            .await;

        assert_eq!(outcome.finalization().reason, TerminationReason::Error);
        assert_eq!(*client.stops.lock().unwrap(), vec!["remote-2".to_string()]);
    }
}
