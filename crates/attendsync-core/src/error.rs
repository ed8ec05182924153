use thiserror::Error;

use crate::models::YearMonth;
use crate::remote::ApiError;

#[derive(Error, Debug)]
pub enum SyncError {
    /// A month after the current one was queried. Aborts the session.
    #[error("Protocol violation: month {queried} is after the current month {current}")]
    ProtocolViolation { queried: YearMonth, current: YearMonth },

    /// Local aggregates disagreed and the repair fetch failed as well.
    #[error("Local cache for {key} is corrupted and could not be repaired: {source}")]
    LocalCorruption {
        key: String,
        #[source]
        source: ApiError,
    },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Remote service error: {0}")]
    Remote(#[from] ApiError),

    #[error("Local store error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl SyncError {
    /// Fatal errors end the session; everything else is recoverable.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SyncError::ProtocolViolation { .. })
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
