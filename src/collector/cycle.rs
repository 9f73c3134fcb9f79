//! Bookkeeping for one scheduled collection cycle.

use chrono::{DateTime, Utc};
use strum_macros::{AsRefStr, Display};
use uuid::Uuid;

use crate::storage::WriteReport;

/// Final status of a collection cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum CycleStatus {
    /// Fetched and stored everything the source returned.
    Success,
    /// Stored the batch, but dropped malformed or invalid entries.
    PartialFailure,
    /// Retries exhausted or the write failed; the cursor did not move.
    Failure,
    /// Interrupted by the stop signal.
    Cancelled,
}

/// One execution of fetch, validate, persist and cursor advance.
#[derive(Debug, Clone)]
pub struct CollectionCycle {
    pub id: Uuid,
    pub started_at: DateTime<Utc>,
    pub attempts: u32,
    pub status: CycleStatus,
    pub written: usize,
    pub duplicates: usize,
    pub dropped: usize,
}

impl CollectionCycle {
    /// Start a cycle at the current wall-clock time.
    pub fn begin() -> Self {
        Self {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            attempts: 0,
            status: CycleStatus::Failure,
            written: 0,
            duplicates: 0,
            dropped: 0,
        }
    }

    pub(crate) fn record_write(&mut self, report: WriteReport) {
        self.written = report.written;
        self.duplicates = report.duplicates;
    }

    /// Emit the summary line for this cycle.
    pub fn log(&self) {
        let elapsed_ms = (Utc::now() - self.started_at).num_milliseconds();
        match self.status {
            CycleStatus::Success => tracing::info!(
                cycle_id = %self.id,
                started_at = %self.started_at,
                status = %self.status,
                attempts = self.attempts,
                written = self.written,
                duplicates = self.duplicates,
                dropped = self.dropped,
                elapsed_ms,
                "Collection cycle completed"
            ),
            CycleStatus::PartialFailure | CycleStatus::Cancelled => tracing::warn!(
                cycle_id = %self.id,
                started_at = %self.started_at,
                status = %self.status,
                attempts = self.attempts,
                written = self.written,
                duplicates = self.duplicates,
                dropped = self.dropped,
                elapsed_ms,
                "Collection cycle completed"
            ),
            CycleStatus::Failure => tracing::error!(
                cycle_id = %self.id,
                started_at = %self.started_at,
                status = %self.status,
                attempts = self.attempts,
                written = self.written,
                duplicates = self.duplicates,
                dropped = self.dropped,
                elapsed_ms,
                "Collection cycle failed"
            ),
        }
    }
}
