use chrono::NaiveDateTime;
use serde::Serialize;
use tracing::{debug, error};

use crate::error::SyncError;

/// An unrecoverable error as handed to the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorReport {
    /// Operation that failed, e.g. `resolve_attendance`.
    pub origin: String,
    pub message: String,
    pub timestamp: NaiveDateTime,
    /// Free-form identification of what was being worked on.
    pub context: String,
    pub fatal: bool,
}

impl ErrorReport {
    pub fn new(origin: &str, error: &SyncError, timestamp: NaiveDateTime, context: String) -> Self {
        Self {
            origin: origin.to_string(),
            message: error.to_string(),
            timestamp,
            context,
            fatal: error.is_fatal(),
        }
    }
}

/// Receives errors the engine could not recover from.
pub trait SessionReporter: Send + Sync {
    fn report(&self, report: ErrorReport);
}

/// Default reporter: logs and moves on.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl SessionReporter for TracingReporter {
    fn report(&self, report: ErrorReport) {
        error!(
            origin = %report.origin,
            context = %report.context,
            fatal = report.fatal,
            at = %report.timestamp,
            "{}",
            report.message
        );
    }
}

/// Decision-point trace event.
pub(crate) fn branch(branch: &str, reason: &str, key: &str) {
    debug!(branch, reason, key, "Sync decision");
}
