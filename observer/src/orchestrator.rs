//! OrchestratorController - owns the batch lifecycle.
//!
//! One background worker drives the session queue strictly in order. Control
//! calls (start/stop/status/clean/save) arrive concurrently from request
//! handlers and only ever touch shared state through the two mutexes below,
//! each held only briefly. Lock order is always `batch` before `ledger`.
//! A panic inside one session is contained: its record is finalized as
//! `error` and the batch moves on to the next session.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared_types::{
    SessionRecord, StartRequest, StatusResponse, TerminationCause, TerminationReason,
};
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};

use crate::archive::{self, ArchiveError};
use crate::config::session_url;
use crate::instruction::InstructionFetcher;
use crate::ledger::{Finalization, SessionLedger, LEDGER_FILE_NAME};
use crate::monitor::{LogMonitor, MonitorOutcome, MonitorSettings};
use crate::workflow::WorkflowClient;

pub const MARKER_FILE_NAME: &str = "observer_termination_cause";
pub const DEFAULT_RANGE_START: u64 = 0;
pub const DEFAULT_RANGE_END: u64 = 1000;
pub const MAX_BATCH_SIZE: u64 = 100_000;

#[derive(Debug, thiserror::Error)]
pub enum ControlError {
    #[error("already running")]
    AlreadyRunning,
    #[error("cannot {0} while the log directory is in use")]
    Busy(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("filesystem error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Archive(#[from] ArchiveError),
}

#[derive(Debug, Clone)]
pub struct ObserverSettings {
    pub log_dir: PathBuf,
    /// Base of the public display URL; a session's URL is `<base>/<id>`.
    pub display_url: String,
    /// Workflow goal template, `{url}` is replaced with the display URL.
    pub workflow_goal: String,
    pub monitor: MonitorSettings,
}

/// Expand a start request into the ordered session queue.
pub fn session_queue(req: &StartRequest) -> Result<Vec<String>, ControlError> {
    if let Some(ids) = &req.session_ids {
        if ids.is_empty() {
            return Err(ControlError::InvalidRequest("session_ids is empty".into()));
        }
        if ids.iter().any(|id| !is_safe_session_id(id)) {
            return Err(ControlError::InvalidRequest(
                "session ids must be non-empty and contain no path separators".into(),
            ));
        }
        return Ok(ids.clone());
    }

    let start = req.start.unwrap_or(DEFAULT_RANGE_START);
    let end = req.end.unwrap_or(DEFAULT_RANGE_END);
    if end < start {
        return Err(ControlError::InvalidRequest(format!(
            "end ({end}) is before start ({start})"
        )));
    }
    if end - start >= MAX_BATCH_SIZE {
        return Err(ControlError::InvalidRequest(format!(
            "batch larger than {MAX_BATCH_SIZE} sessions"
        )));
    }
    Ok((start..=end).map(|i| format!("fixed_{i}")).collect())
}

fn is_safe_session_id(id: &str) -> bool {
    !id.is_empty() && id != "." && id != ".." && !id.contains(['/', '\\'])
}

struct BatchSlot {
    running: bool,
    cancel: Arc<AtomicBool>,
    started_at: Option<DateTime<Utc>>,
}

/// Clears the maintenance flag when a clean or save finishes or is dropped.
struct MaintenanceGuard<'a>(&'a AtomicBool);

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct OrchestratorController {
    settings: ObserverSettings,
    workflow: Arc<dyn WorkflowClient>,
    instructions: Arc<dyn InstructionFetcher>,
    monitor: LogMonitor,
    ledger: Mutex<SessionLedger>,
    batch: Mutex<BatchSlot>,
    /// Mirrors `BatchSlot::running` so stop callers can wait for idle.
    running: watch::Sender<bool>,
    /// Set while clean or save is moving files in the log directory.
    maintenance: AtomicBool,
}

impl OrchestratorController {
    pub fn new(
        settings: ObserverSettings,
        workflow: Arc<dyn WorkflowClient>,
        instructions: Arc<dyn InstructionFetcher>,
    ) -> Arc<Self> {
        let monitor = LogMonitor::new(
            settings.log_dir.clone(),
            settings.monitor,
            Arc::clone(&workflow),
        );
        let (running, _) = watch::channel(false);
        Arc::new(Self {
            settings,
            workflow,
            instructions,
            monitor,
            ledger: Mutex::new(SessionLedger::new()),
            batch: Mutex::new(BatchSlot {
                running: false,
                cancel: Arc::new(AtomicBool::new(false)),
                started_at: None,
            }),
            running,
            maintenance: AtomicBool::new(false),
        })
    }

    pub fn log_dir(&self) -> &Path {
        &self.settings.log_dir
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.settings.log_dir.join(LEDGER_FILE_NAME)
    }

    pub fn marker_path(&self) -> PathBuf {
        self.settings.log_dir.join(MARKER_FILE_NAME)
    }

    /// Start a batch over `session_ids` and return immediately.
    pub async fn start(self: &Arc<Self>, session_ids: Vec<String>) -> Result<(), ControlError> {
        if session_ids.is_empty() {
            return Err(ControlError::InvalidRequest("no sessions to run".into()));
        }

        let mut batch = self.batch.lock().await;
        if batch.running {
            return Err(ControlError::AlreadyRunning);
        }
        if self.maintenance.load(Ordering::SeqCst) {
            return Err(ControlError::Busy("start"));
        }

        let log_dir = self.log_dir();
        tokio::fs::create_dir_all(log_dir)
            .await
            .map_err(|source| ControlError::Io {
                path: log_dir.to_path_buf(),
                source,
            })?;
        let marker = self.marker_path();
        match tokio::fs::remove_file(&marker).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(source) => return Err(ControlError::Io { path: marker, source }),
        }

        self.ledger.lock().await.clear();

        let cancel = Arc::new(AtomicBool::new(false));
        let count = session_ids.len();
        batch.running = true;
        batch.cancel = Arc::clone(&cancel);
        batch.started_at = Some(Utc::now());
        self.running.send_replace(true);
        tokio::spawn(Arc::clone(self).supervise_batch(session_ids, cancel));

        info!(sessions = count, "batch started");
        Ok(())
    }

    /// Flag the running batch for cancellation without waiting for it.
    pub async fn request_stop(&self) {
        let batch = self.batch.lock().await;
        batch.cancel.store(true, Ordering::SeqCst);
    }

    /// Flag cancellation and wait until the batch is idle again.
    ///
    /// Every concurrent caller waits. The worker notices at its next
    /// checkpoint, so this returns within one poll interval plus any remote
    /// call already in flight.
    pub async fn stop(&self) {
        let mut running = {
            let batch = self.batch.lock().await;
            if !batch.running {
                return;
            }
            batch.cancel.store(true, Ordering::SeqCst);
            self.running.subscribe()
        };
        info!("stop requested; waiting for batch worker");
        let idle = running.wait_for(|running| !*running).await.map(|_| ());
        if let Err(e) = idle {
            error!(error = %e, "lost track of batch state while stopping");
        }
    }

    pub async fn status(&self) -> StatusResponse {
        let (running, batch_started_at) = {
            let batch = self.batch.lock().await;
            (batch.running, batch.started_at)
        };
        let (current_session, sessions_recorded) = {
            let ledger = self.ledger.lock().await;
            (ledger.last().cloned(), ledger.len())
        };
        let termination_cause = if running {
            None
        } else {
            self.read_marker().await
        };

        StatusResponse {
            running,
            current_session,
            termination_cause,
            batch_started_at,
            sessions_recorded,
        }
    }

    pub async fn records(&self) -> Vec<SessionRecord> {
        self.ledger.lock().await.records().to_vec()
    }

    /// Delete every file in the log directory and clear the ledger.
    pub async fn clean(&self) -> Result<(), ControlError> {
        let _guard = self.begin_maintenance("clean").await?;

        let log_dir = self.log_dir();
        let io_err = |source: std::io::Error| ControlError::Io {
            path: log_dir.to_path_buf(),
            source,
        };
        let mut entries = tokio::fs::read_dir(log_dir).await.map_err(io_err)?;
        let mut removed = 0usize;
        while let Some(entry) = entries.next_entry().await.map_err(io_err)? {
            let path = entry.path();
            if entry.file_type().await.map_err(io_err)?.is_file() {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|source| ControlError::Io { path, source })?;
                removed += 1;
            }
        }

        self.ledger.lock().await.clear();
        info!(removed, dir = %log_dir.display(), "log directory cleaned");
        Ok(())
    }

    /// Move the log directory's files into the sibling directory `name`.
    pub async fn save(&self, name: &str) -> Result<PathBuf, ControlError> {
        let _guard = self.begin_maintenance("save").await?;
        Ok(archive::save_logs(self.log_dir(), name).await?)
    }

    /// Claim the log directory for clean/save. The batch lock is held only
    /// for the check, so status stays responsive during the file walk.
    async fn begin_maintenance(
        &self,
        op: &'static str,
    ) -> Result<MaintenanceGuard<'_>, ControlError> {
        let batch = self.batch.lock().await;
        if batch.running {
            return Err(ControlError::Busy(op));
        }
        if self
            .maintenance
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(ControlError::Busy(op));
        }
        drop(batch);
        Ok(MaintenanceGuard(&self.maintenance))
    }

    async fn read_marker(&self) -> Option<TerminationCause> {
        let raw = tokio::fs::read_to_string(self.marker_path()).await.ok()?;
        TerminationCause::parse(&raw)
    }

    async fn supervise_batch(self: Arc<Self>, session_ids: Vec<String>, cancel: Arc<AtomicBool>) {
        let worker = Arc::clone(&self);
        let run = tokio::spawn(async move { worker.run_batch(&session_ids, &cancel).await });

        let cause = match run.await {
            Ok(cause) => cause,
            Err(e) => {
                error!(error = %e, "batch worker panicked");
                self.fail_in_flight().await;
                TerminationCause::Stopped
            }
        };

        self.finish_batch(cause).await;
    }

    async fn run_batch(
        self: &Arc<Self>,
        session_ids: &[String],
        cancel: &Arc<AtomicBool>,
    ) -> TerminationCause {
        for session_id in session_ids {
            if cancel.load(Ordering::SeqCst) {
                info!(session_id = %session_id, "stop observed before session start");
                return TerminationCause::Stopped;
            }

            let worker = Arc::clone(self);
            let session_cancel = Arc::clone(cancel);
            let id = session_id.clone();
            let session =
                tokio::spawn(async move { worker.process_session(&id, &session_cancel).await });
            match session.await {
                Ok(MonitorOutcome::Cancelled { .. }) => return TerminationCause::Stopped,
                Ok(_) => {}
                Err(e) => {
                    error!(session_id = %session_id, error = %e, "session task panicked");
                    self.fail_in_flight().await;
                }
            }
        }
        TerminationCause::Completed
    }

    async fn process_session(&self, session_id: &str, cancel: &AtomicBool) -> MonitorOutcome {
        let url = session_url(&self.settings.display_url, session_id);
        info!(session_id, %url, "running session");

        let goal = self.settings.workflow_goal.replace("{url}", &url);
        let remote_session_id = match self.workflow.create(&goal).await {
            Some(workflow_id) => self.workflow.run(&workflow_id).await,
            None => None,
        };
        match remote_session_id.as_deref() {
            Some(remote) => info!(session_id, remote_session_id = remote, "remote session launched"),
            None => warn!(session_id, "remote session not launched; watching event log only"),
        }

        self.ledger.lock().await.append(SessionRecord::placeholder(
            session_id,
            url,
            remote_session_id.clone(),
        ));

        match self.instructions.fetch(session_id).await {
            Some(instruction) => info!(session_id, %instruction, "fetched instruction"),
            None => warn!(session_id, "failed to fetch instruction"),
        }

        let outcome = self
            .monitor
            .watch(session_id, remote_session_id.as_deref(), cancel)
            .await;
        self.record_outcome(session_id, &outcome).await;
        outcome
    }

    async fn record_outcome(&self, session_id: &str, outcome: &MonitorOutcome) {
        {
            let mut ledger = self.ledger.lock().await;
            match ledger.finalize_last(outcome.finalization()) {
                Ok(record) => info!(
                    session_id,
                    reason = %record.termination_reason,
                    duration = record.duration,
                    navigation_steps = record.navigation_steps,
                    "session finalized"
                ),
                Err(e) => error!(session_id, error = %e, "failed to finalize session"),
            };
        }
        self.flush_ledger().await;
    }

    /// Finalize a record left `in_progress` by a panicked session as `error`
    /// and stop its remote session.
    async fn fail_in_flight(&self) {
        let remote_session_id = {
            let mut ledger = self.ledger.lock().await;
            let in_flight = ledger
                .last()
                .is_some_and(|r| !r.termination_reason.is_terminal());
            if !in_flight {
                return;
            }
            let fin = Finalization {
                duration: 0.0,
                reason: TerminationReason::Error,
                navigation_steps: 0,
                score: None,
            };
            let remote = match ledger.finalize_last(fin) {
                Ok(record) => record.nfig_session_id.clone(),
                Err(e) => {
                    error!(error = %e, "failed to finalize in-flight session");
                    None
                }
            };
            remote
        };

        if let Some(remote) = remote_session_id {
            if !self.workflow.stop(&remote).await {
                warn!(remote_session_id = %remote, "failed to stop remote session");
            }
        }
        self.flush_ledger().await;
    }

    /// Write the ledger CSV off the runtime; the lock is held only to copy it.
    async fn flush_ledger(&self) {
        let snapshot = self.ledger.lock().await.clone();
        let path = self.ledger_path();
        match tokio::task::spawn_blocking(move || snapshot.flush(&path)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "failed to flush ledger"),
            Err(e) => error!(error = %e, "ledger flush task failed"),
        }
    }

    async fn finish_batch(&self, cause: TerminationCause) {
        let marker = self.marker_path();
        if let Err(e) = tokio::fs::write(&marker, cause.as_str()).await {
            error!(path = %marker.display(), error = %e, "failed to write termination marker");
        }
        self.flush_ledger().await;

        let mut batch = self.batch.lock().await;
        batch.running = false;
        self.running.send_replace(false);
        info!(%cause, "batch finished");
    }
}
