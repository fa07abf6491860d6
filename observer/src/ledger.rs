//! SessionLedger - ordered record of session outcomes for the current batch.
//!
//! Records are appended as `in_progress` placeholders and only the most
//! recent one may be finalized. Everything before it is frozen.

use std::path::{Path, PathBuf};

use shared_types::{SessionRecord, TerminationReason};

pub const LEDGER_FILE_NAME: &str = "session_details.csv";

pub const LEDGER_HEADER: [&str; 7] = [
    "session_id",
    "url",
    "nfig_session_id",
    "duration",
    "session_termination_reason",
    "navigation_steps",
    "session_score",
];

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("ledger has no session in progress")]
    NothingInProgress,
    #[error("cannot finalize a session as in_progress")]
    NonTerminalReason,
    #[error("failed to write ledger {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger csv error in {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

/// Terminal values written into the in-flight record.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Finalization {
    pub duration: f64,
    pub reason: TerminationReason,
    pub navigation_steps: u64,
    pub score: Option<f64>,
}

#[derive(Debug, Default, Clone)]
pub struct SessionLedger {
    records: Vec<SessionRecord>,
}

impl SessionLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn append(&mut self, record: SessionRecord) {
        self.records.push(record);
    }

    /// Finalize the most recent record. Fails if it was already finalized.
    pub fn finalize_last(&mut self, fin: Finalization) -> Result<&SessionRecord, LedgerError> {
        if !fin.reason.is_terminal() {
            return Err(LedgerError::NonTerminalReason);
        }
        let record = self
            .records
            .last_mut()
            .filter(|r| r.termination_reason == TerminationReason::InProgress)
            .ok_or(LedgerError::NothingInProgress)?;

        record.duration = fin.duration;
        record.termination_reason = fin.reason;
        record.navigation_steps = fin.navigation_steps;
        record.session_score = fin.score;
        Ok(record)
    }

    pub fn last(&self) -> Option<&SessionRecord> {
        self.records.last()
    }

    pub fn records(&self) -> &[SessionRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Overwrite `path` with every finalized record in insertion order.
    ///
    /// A record still `in_progress` is left out until it is finalized. The
    /// file is written beside `path` first and renamed into place.
    pub fn flush(&self, path: &Path) -> Result<(), LedgerError> {
        let tmp = path.with_extension("csv.tmp");
        let csv_err = |source| LedgerError::Csv {
            path: tmp.clone(),
            source,
        };

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(&tmp)
            .map_err(csv_err)?;
        writer.write_record(LEDGER_HEADER).map_err(csv_err)?;
        for record in self
            .records
            .iter()
            .filter(|r| r.termination_reason.is_terminal())
        {
            writer.serialize(record).map_err(csv_err)?;
        }
        writer.flush().map_err(|source| LedgerError::Io {
            path: tmp.clone(),
            source,
        })?;
        drop(writer);

        std::fs::rename(&tmp, path).map_err(|source| LedgerError::Io {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Parse a flushed ledger back into records.
pub fn read_ledger(path: &Path) -> Result<Vec<SessionRecord>, LedgerError> {
    let csv_err = |source| LedgerError::Csv {
        path: path.to_path_buf(),
        source,
    };
    let mut reader = csv::Reader::from_path(path).map_err(csv_err)?;
    let mut records = Vec::new();
    for row in reader.deserialize::<SessionRecord>() {
        records.push(row.map_err(csv_err)?);
    }
    Ok(records)
}
