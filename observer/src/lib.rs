//! Observer - drives remote workflow sessions one at a time, watches each
//! session's event log for its terminal page, and records per-session
//! outcomes to a CSV ledger.

pub mod api;
pub mod archive;
pub mod config;
pub mod instruction;
pub mod ledger;
pub mod monitor;
pub mod orchestrator;
pub mod state;
pub mod workflow;

pub use state::AppState;
