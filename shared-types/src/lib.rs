//! Shared types between the observer service and its clients
//!
//! These types describe:
//! - Per-session outcome records (the session ledger rows)
//! - Batch termination causes (the marker file value)
//! - Control API request/response bodies
//!
//! Serializable with serde for JSON over HTTP

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Session Records
// ============================================================================

/// Why a session stopped being monitored.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Placeholder value while the session is being monitored.
    InProgress,
    /// The event log reached the terminal page.
    Completed,
    /// No terminal page within the configured timeout.
    Timeout,
    /// A stop request cancelled the batch while this session was active.
    Stopped,
    /// The event log could not be read.
    Error,
}

impl TerminationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationReason::InProgress => "in_progress",
            TerminationReason::Completed => "completed",
            TerminationReason::Timeout => "timeout",
            TerminationReason::Stopped => "stopped",
            TerminationReason::Error => "error",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, TerminationReason::InProgress)
    }
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One session attempted in a batch.
///
/// Created as a placeholder when the remote session is launched and finalized
/// exactly once when monitoring reaches a terminal outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    /// Publicly reachable display URL for the session.
    pub url: String,
    /// Remote workflow session id; `None` when the remote run failed.
    pub nfig_session_id: Option<String>,
    /// Seconds spent monitoring.
    pub duration: f64,
    #[serde(rename = "session_termination_reason")]
    pub termination_reason: TerminationReason,
    /// Lines observed in the session's event log at terminal time.
    pub navigation_steps: u64,
    /// Terminal record's `reward`; only set on `completed`.
    pub session_score: Option<f64>,
}

impl SessionRecord {
    pub fn placeholder(
        session_id: impl Into<String>,
        url: impl Into<String>,
        nfig_session_id: Option<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            url: url.into(),
            nfig_session_id,
            duration: 0.0,
            termination_reason: TerminationReason::InProgress,
            navigation_steps: 0,
            session_score: None,
        }
    }
}

// ============================================================================
// Batch Lifecycle
// ============================================================================

/// Value written to the termination-cause marker file when a batch ends.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TerminationCause {
    Completed,
    Stopped,
}

impl TerminationCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            TerminationCause::Completed => "completed",
            TerminationCause::Stopped => "stopped",
        }
    }

    /// Parse a marker file body. Surrounding whitespace is ignored.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "completed" => Some(TerminationCause::Completed),
            "stopped" => Some(TerminationCause::Stopped),
            _ => None,
        }
    }
}

impl std::fmt::Display for TerminationCause {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Control API
// ============================================================================

/// Body of `POST /start`.
///
/// `session_ids` wins when present; otherwise the inclusive range
/// `start..=end` is expanded into `fixed_<i>` ids.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub session_ids: Option<Vec<String>>,
    #[serde(default)]
    pub start: Option<u64>,
    #[serde(default)]
    pub end: Option<u64>,
}

/// Body of `POST /save`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SaveRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// Query of `GET /get`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArchiveQuery {
    #[serde(default)]
    pub name: Option<String>,
}

/// `{ "status": "..." }` acknowledgement returned by control operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusMessage {
    pub status: String,
}

impl StatusMessage {
    pub fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

/// Body of `GET /status`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub running: bool,
    pub current_session: Option<SessionRecord>,
    pub termination_cause: Option<TerminationCause>,
    pub batch_started_at: Option<DateTime<Utc>>,
    pub sessions_recorded: usize,
}

pub const DEFAULT_ARCHIVE_NAME: &str = "default_name";
pub const TERMINAL_PAGE: &str = "done";

// ============================================================================
// Tests
// ============================================================================
