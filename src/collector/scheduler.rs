//! Fixed-interval collection loop.
//!
//! Runs one [`CollectionCycle`] per tick. Ticks are anchored to the first
//! deadline (`next = max(now, next + interval)`), so the schedule does not
//! drift with cycle duration, and a cycle that overruns its interval delays
//! the next one instead of overlapping it.
//!
//! Per cycle:
//! 1. Fetch from the last persisted cursor, retrying per [`BackoffPolicy`]
//! 2. Drop malformed or invalid entries (logged, counted)
//! 3. Append the rest to the dataset (duplicates skipped)
//! 4. Persist the new cursor, only after the append succeeded

use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::collector::backoff::BackoffPolicy;
use crate::collector::cycle::{CollectionCycle, CycleStatus};
use crate::collector::retry::{FetchOutcome, fetch_with_retry};
use crate::collector::signal::StopSignal;
use crate::collector::{CollectorError, LocationPage, LocationSource};
use crate::storage::{Cursor, LocationRecord, StorageHandles};

/// Totals over the lifetime of one [`Scheduler::run`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub cycles: u64,
    pub succeeded: u64,
    pub partial: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub written: u64,
    pub duplicates: u64,
}

impl RunSummary {
    fn record(&mut self, cycle: &CollectionCycle) {
        self.cycles += 1;
        match cycle.status {
            CycleStatus::Success => self.succeeded += 1,
            CycleStatus::PartialFailure => self.partial += 1,
            CycleStatus::Failure => self.failed += 1,
            CycleStatus::Cancelled => self.cancelled += 1,
        }
        self.written += cycle.written as u64;
        self.duplicates += cycle.duplicates as u64;
    }
}

/// Drives the collection loop. Sole owner of the dataset writer and cursor.
pub struct Scheduler {
    source: Arc<dyn LocationSource>,
    storage: StorageHandles,
    policy: BackoffPolicy,
    cursor: Option<Cursor>,
    run_immediately: bool,
}

impl Scheduler {
    /// Create a scheduler, resuming from the persisted cursor if one exists.
    pub fn new(source: Arc<dyn LocationSource>, storage: StorageHandles, policy: BackoffPolicy) -> Self {
        let cursor = storage.cursor_store.load();
        match &cursor {
            Some(c) => tracing::info!(source = source.name(), cursor = %c, "Scheduler starting from cursor"),
            None => tracing::info!(source = source.name(), "No persisted cursor, starting fresh"),
        }

        Self {
            source,
            storage,
            policy,
            cursor,
            run_immediately: true,
        }
    }

    /// Whether the first cycle runs at startup (default) or one interval later.
    pub fn with_run_immediately(mut self, run_immediately: bool) -> Self {
        self.run_immediately = run_immediately;
        self
    }

    /// Cursor the next cycle will fetch from.
    pub fn cursor(&self) -> Option<&Cursor> {
        self.cursor.as_ref()
    }

    pub fn storage(&self) -> &StorageHandles {
        &self.storage
    }

    /// Run cycles every `interval` until stopped.
    ///
    /// # Errors
    /// Returns `CollectorError::Fatal` when the source rejects the request in
    /// a way retries cannot fix, and `CollectorError::Config` for a zero
    /// interval. Failed cycles are logged and do not end the loop.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut stop: StopSignal,
    ) -> Result<RunSummary, CollectorError> {
        if interval.is_zero() {
            return Err(CollectorError::Config(
                "collection interval must be positive".to_string(),
            ));
        }

        let mut summary = RunSummary::default();
        let mut next = if self.run_immediately {
            Instant::now()
        } else {
            Instant::now() + interval
        };

        tracing::info!(
            source = self.source.name(),
            interval_secs = interval.as_secs(),
            run_immediately = self.run_immediately,
            "Collection loop started"
        );

        loop {
            if !stop.sleep_until(next).await {
                break;
            }

            let cycle = self.run_cycle(&mut stop).await?;
            summary.record(&cycle);
            if cycle.status == CycleStatus::Cancelled {
                break;
            }

            next += interval;
            let now = Instant::now();
            if next < now {
                tracing::warn!(
                    cycle_id = %cycle.id,
                    overrun_ms = (now - next).as_millis() as u64,
                    "Cycle overran its interval, starting next cycle immediately"
                );
                next = now;
            }
        }

        tracing::info!(
            cycles = summary.cycles,
            succeeded = summary.succeeded,
            partial = summary.partial,
            failed = summary.failed,
            written = summary.written,
            duplicates = summary.duplicates,
            "Collection loop stopped"
        );
        Ok(summary)
    }

    /// Run exactly one cycle now, for one-shot invocations.
    ///
    /// # Errors
    /// Same as [`run_cycle`](Self::run_cycle).
    pub async fn run_once(&mut self, mut stop: StopSignal) -> Result<RunSummary, CollectorError> {
        let mut summary = RunSummary::default();
        let cycle = self.run_cycle(&mut stop).await?;
        summary.record(&cycle);
        Ok(summary)
    }

    /// Execute a single collection cycle.
    ///
    /// # Errors
    /// Only a fatal fetch error is returned; every other failure is reported
    /// through the cycle status.
    pub async fn run_cycle(
        &mut self,
        stop: &mut StopSignal,
    ) -> Result<CollectionCycle, CollectorError> {
        let mut cycle = CollectionCycle::begin();
        tracing::debug!(
            cycle_id = %cycle.id,
            cursor = ?self.cursor.as_ref().map(ToString::to_string),
            "Collection cycle started"
        );

        let outcome = fetch_with_retry(
            self.source.as_ref(),
            self.cursor.as_ref(),
            &self.policy,
            stop,
        )
        .await;
        cycle.attempts = outcome.attempts();

        let page = match outcome {
            FetchOutcome::Succeeded { page, .. } => page,
            FetchOutcome::Cancelled { .. } => {
                cycle.status = CycleStatus::Cancelled;
                cycle.log();
                return Ok(cycle);
            }
            FetchOutcome::GivenUp { error, .. } => {
                cycle.status = CycleStatus::Failure;
                cycle.log();
                if error.is_fatal() {
                    return Err(CollectorError::Fatal(error));
                }
                return Ok(cycle);
            }
        };

        let LocationPage {
            records,
            rejected,
            next_cursor,
        } = page;
        let (valid, dropped) = self.screen(&cycle, records, rejected.len());
        for error in &rejected {
            tracing::warn!(
                cycle_id = %cycle.id,
                started_at = %cycle.started_at,
                attempts = cycle.attempts,
                error = %error,
                "Dropped malformed entry"
            );
        }
        cycle.dropped = dropped;

        match self.storage.dataset.append(&valid) {
            Ok(report) => cycle.record_write(report),
            Err(e) => {
                tracing::error!(
                    cycle_id = %cycle.id,
                    started_at = %cycle.started_at,
                    attempts = cycle.attempts,
                    error = %e,
                    "Dataset append failed, cursor not advanced"
                );
                cycle.status = CycleStatus::Failure;
                cycle.log();
                return Ok(cycle);
            }
        }
        cycle.status = if dropped > 0 {
            CycleStatus::PartialFailure
        } else {
            CycleStatus::Success
        };

        let advanced = next_cursor.unwrap_or(Cursor::Since {
            at: cycle.started_at,
        });
        if let Err(e) = self.storage.cursor_store.save(&advanced) {
            tracing::error!(
                cycle_id = %cycle.id,
                started_at = %cycle.started_at,
                attempts = cycle.attempts,
                written = cycle.written,
                error = %e,
                "Failed to persist cursor"
            );
            cycle.status = CycleStatus::Failure;
        }
        self.cursor = Some(advanced);

        cycle.log();
        Ok(cycle)
    }

    /// Split off records failing validation; returns the survivors in
    /// timestamp order and the total number dropped.
    fn screen(
        &self,
        cycle: &CollectionCycle,
        records: Vec<LocationRecord>,
        already_rejected: usize,
    ) -> (Vec<LocationRecord>, usize) {
        let mut dropped = already_rejected;
        let mut valid: Vec<LocationRecord> = records
            .into_iter()
            .filter(|record| match record.validate() {
                Ok(()) => true,
                Err(e) => {
                    tracing::warn!(
                        cycle_id = %cycle.id,
                        started_at = %cycle.started_at,
                        attempts = cycle.attempts,
                        error = %e,
                        "Dropped invalid record"
                    );
                    dropped += 1;
                    false
                }
            })
            .collect();
        valid.sort_by_key(LocationRecord::timestamp);
        (valid, dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::FetchError;
    use crate::collector::signal::{StopHandle, stop_channel};
    use crate::collector::testing::{LogCapture, ScriptedSource, at, sample_records};
    use crate::storage::{DataError, StorageBuilder};
    use std::fs;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    const INTERVAL: Duration = Duration::from_secs(300);

    fn storage(dir: &TempDir) -> StorageHandles {
        StorageBuilder::new(dir.path()).build().unwrap()
    }

    fn policy() -> BackoffPolicy {
        BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(4), 2)
    }

    fn stop_after(handle: StopHandle, after: Duration) {
        tokio::spawn(async move {
            tokio::time::sleep(after).await;
            handle.stop();
        });
    }

    fn page() -> Result<LocationPage, FetchError> {
        Ok(LocationPage::new(sample_records()))
    }

    /// Raises the stop signal from inside the fetch, then answers normally.
    struct StopDuringFetch {
        handle: Mutex<Option<StopHandle>>,
    }

    #[async_trait::async_trait]
    impl LocationSource for StopDuringFetch {
        fn name(&self) -> &str {
            "stop-during-fetch"
        }

        async fn fetch_locations(&self, _cursor: Option<&Cursor>) -> Result<LocationPage, FetchError> {
            if let Some(handle) = self.handle.lock().unwrap().take() {
                handle.stop();
            }
            page()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_writes_then_deduplicates() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![page(), page()]));
        let mut scheduler = Scheduler::new(source.clone(), storage(&dir), policy());
        let (_handle, mut stop) = stop_channel();

        let first = scheduler.run_cycle(&mut stop).await.unwrap();
        assert_eq!(first.status, CycleStatus::Success);
        assert_eq!((first.written, first.duplicates), (3, 0));
        let saved = scheduler.storage().cursor_store.load();
        assert!(matches!(saved, Some(Cursor::Since { .. })));
        assert_eq!(scheduler.cursor(), saved.as_ref());

        let second = scheduler.run_cycle(&mut stop).await.unwrap();
        assert_eq!(second.status, CycleStatus::Success);
        assert_eq!((second.written, second.duplicates), (0, 3));
        assert_eq!(scheduler.storage().dataset.len(), 3);

        let cursors = source.cursors();
        assert_eq!(cursors[0], None);
        assert_eq!(cursors[1], saved);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_succeeds_on_fourth_attempt() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            Err(FetchError::transient("timeout")),
            Err(FetchError::transient("502")),
            Err(FetchError::rate_limited("429", None)),
            page(),
        ]));
        let mut scheduler = Scheduler::new(source.clone(), storage(&dir), BackoffPolicy::default());
        let (_handle, mut stop) = stop_channel();

        let cycle = scheduler.run_cycle(&mut stop).await.unwrap();
        assert_eq!(cycle.status, CycleStatus::Success);
        assert_eq!(cycle.attempts, 4);
        assert_eq!(cycle.written, 3);
        assert_eq!(source.calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumes_from_persisted_cursor() {
        let dir = tempdir().unwrap();
        let cursor = Cursor::Token {
            value: "page-7".to_string(),
        };
        let handles = storage(&dir);
        handles.cursor_store.save(&cursor).unwrap();

        let source = Arc::new(ScriptedSource::new(vec![Ok(LocationPage {
            records: sample_records(),
            rejected: Vec::new(),
            next_cursor: Some(Cursor::Token {
                value: "page-8".to_string(),
            }),
        })]));
        let mut scheduler = Scheduler::new(source.clone(), handles, policy());
        let (_handle, mut stop) = stop_channel();

        scheduler.run_cycle(&mut stop).await.unwrap();
        assert_eq!(source.cursors()[0], Some(cursor));
        assert_eq!(
            scheduler.storage().cursor_store.load(),
            Some(Cursor::Token {
                value: "page-8".to_string()
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_invalid_entries_make_partial_failure() {
        let dir = tempdir().unwrap();
        let mut records = sample_records();
        records.push(LocationRecord::new("truck-9", at(8, 1, 0), 95.0, 10.0));
        let source = Arc::new(ScriptedSource::new(vec![Ok(LocationPage {
            records,
            rejected: vec![DataError::Malformed {
                reason: "missing devId".to_string(),
                payload: "{}".to_string(),
            }],
            next_cursor: None,
        })]));
        let mut scheduler = Scheduler::new(source, storage(&dir), policy());
        let (_handle, mut stop) = stop_channel();

        let cycle = scheduler.run_cycle(&mut stop).await.unwrap();
        assert_eq!(cycle.status, CycleStatus::PartialFailure);
        assert_eq!(cycle.written, 3);
        assert_eq!(cycle.dropped, 2);
        assert!(scheduler.cursor().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_warnings_carry_cycle_context() {
        let dir = tempdir().unwrap();
        let mut records = sample_records();
        records.push(LocationRecord::new("truck-9", at(8, 1, 0), 95.0, 10.0));
        let source = Arc::new(ScriptedSource::new(vec![
            Err(FetchError::transient("503")),
            Ok(LocationPage {
                records,
                rejected: vec![DataError::Malformed {
                    reason: "missing devId".to_string(),
                    payload: "{}".to_string(),
                }],
                next_cursor: None,
            }),
        ]));
        let mut scheduler = Scheduler::new(source, storage(&dir), policy());
        let (_handle, mut stop) = stop_channel();
        let (logs, _guard) = LogCapture::install();

        let cycle = scheduler.run_cycle(&mut stop).await.unwrap();
        let started_at = format!("started_at={}", cycle.started_at);

        let dropped = [
            logs.lines_with("Dropped invalid record"),
            logs.lines_with("Dropped malformed entry"),
        ]
        .concat();
        assert_eq!(dropped.len(), 2, "{}", logs.contents());
        for line in dropped {
            assert!(line.contains(&started_at), "{line}");
            assert!(line.contains("attempts=2"), "{line}");
            assert!(line.contains(&format!("cycle_id={}", cycle.id)), "{line}");
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_storage_failure_keeps_cursor() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![page(), page()]));
        let mut scheduler = Scheduler::new(source, storage(&dir), policy());
        let blocker = dir.path().join("gps_data_20240501.csv");
        fs::create_dir(&blocker).unwrap();
        let (_handle, mut stop) = stop_channel();

        let failed = scheduler.run_cycle(&mut stop).await.unwrap();
        assert_eq!(failed.status, CycleStatus::Failure);
        assert!(scheduler.cursor().is_none());
        assert!(scheduler.storage().cursor_store.load().is_none());

        fs::remove_dir(&blocker).unwrap();
        let recovered = scheduler.run_cycle(&mut stop).await.unwrap();
        assert_eq!(recovered.status, CycleStatus::Success);
        assert_eq!(recovered.written, 3);
        assert!(scheduler.cursor().is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cursor_save_failure_fails_cycle_after_write() {
        let dir = tempdir().unwrap();
        let state = dir.path().join("state");
        fs::create_dir(&state).unwrap();
        let handles = StorageBuilder::new(dir.path())
            .state_file(&state)
            .build()
            .unwrap();
        let source = Arc::new(ScriptedSource::new(vec![page(), page()]));
        let mut scheduler = Scheduler::new(source.clone(), handles, policy());
        let (_handle, mut stop) = stop_channel();

        let first = scheduler.run_cycle(&mut stop).await.unwrap();
        assert_eq!(first.status, CycleStatus::Failure);
        assert_eq!((first.written, first.duplicates), (3, 0));
        assert_eq!(scheduler.storage().dataset.len(), 3);
        assert!(scheduler.storage().cursor_store.load().is_none());
        let advanced = scheduler.cursor().cloned();
        assert!(matches!(advanced, Some(Cursor::Since { .. })));

        let second = scheduler.run_cycle(&mut stop).await.unwrap();
        assert_eq!((second.written, second.duplicates), (0, 3));
        assert_eq!(source.cursors()[1], advanced);
        assert_eq!(scheduler.storage().dataset.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_during_fetch_still_completes_write() {
        let dir = tempdir().unwrap();
        let (handle, stop) = stop_channel();
        let source = Arc::new(StopDuringFetch {
            handle: Mutex::new(Some(handle)),
        });
        let mut scheduler = Scheduler::new(source, storage(&dir), policy());

        let summary = scheduler.run(INTERVAL, stop).await.unwrap();
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.cancelled, 0);
        assert_eq!(summary.written, 3);
        assert_eq!(scheduler.storage().dataset.len(), 3);
        let persisted = scheduler.storage().cursor_store.load();
        assert!(matches!(persisted, Some(Cursor::Since { .. })));
        assert_eq!(scheduler.cursor(), persisted.as_ref());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_after_retries_ends_run() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            Err(FetchError::transient("timeout")),
            Err(FetchError::transient("503")),
            Err(FetchError::fatal("403 on token endpoint")),
            page(),
        ]));
        let mut scheduler = Scheduler::new(source.clone(), storage(&dir), policy());
        let (_handle, stop) = stop_channel();

        let err = scheduler.run(INTERVAL, stop).await.unwrap_err();
        assert!(matches!(err, CollectorError::Fatal(ref e) if e.is_fatal()), "{err}");
        assert_eq!(source.calls(), 3);
        assert_eq!(source.fetch_times().len(), 3);
        assert!(scheduler.cursor().is_none());
        assert!(scheduler.storage().dataset.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_ends_run() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![Err(FetchError::fatal(
            "401 on token endpoint",
        ))]));
        let mut scheduler = Scheduler::new(source.clone(), storage(&dir), policy());
        let (_handle, stop) = stop_channel();

        let err = scheduler.run(INTERVAL, stop).await.unwrap_err();
        assert!(matches!(err, CollectorError::Fatal(_)));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_cycle_does_not_stop_loop() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            Err(FetchError::transient("503")),
            Err(FetchError::transient("503")),
            Err(FetchError::transient("503")),
            page(),
        ]));
        let mut scheduler = Scheduler::new(source.clone(), storage(&dir), policy());
        let (handle, stop) = stop_channel();
        stop_after(handle, Duration::from_secs(350));

        let summary = scheduler.run(INTERVAL, stop).await.unwrap();
        assert_eq!(summary.cycles, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.written, 3);
        assert_eq!(source.calls(), 4);
        assert_eq!(source.cursors()[3], None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_does_not_drift() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![]).with_latency(Duration::from_secs(10)));
        let mut scheduler = Scheduler::new(source.clone(), storage(&dir), policy());
        let (handle, stop) = stop_channel();
        let start = Instant::now();
        stop_after(handle, Duration::from_secs(650));

        let summary = scheduler.run(INTERVAL, stop).await.unwrap();
        assert_eq!(summary.cycles, 3);
        let offsets: Vec<u64> = source
            .fetch_times()
            .iter()
            .map(|t| t.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 300, 600]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overrunning_cycles_never_overlap() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![]).with_latency(Duration::from_secs(450)));
        let mut scheduler = Scheduler::new(source.clone(), storage(&dir), policy());
        let (handle, stop) = stop_channel();
        let start = Instant::now();
        stop_after(handle, Duration::from_secs(1000));

        scheduler.run(INTERVAL, stop).await.unwrap();
        assert_eq!(source.max_in_flight(), 1);
        let offsets: Vec<u64> = source
            .fetch_times()
            .iter()
            .map(|t| t.duration_since(start).as_secs())
            .collect();
        assert_eq!(offsets, vec![0, 450, 900]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_before_first_tick() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![page()]));
        let mut scheduler =
            Scheduler::new(source.clone(), storage(&dir), policy()).with_run_immediately(false);
        let (handle, stop) = stop_channel();
        stop_after(handle, Duration::from_secs(10));

        let summary = scheduler.run(INTERVAL, stop).await.unwrap();
        assert_eq!(summary, RunSummary::default());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_fetch_cancels_cycle() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![page()]).with_latency(Duration::from_secs(60)));
        let mut scheduler = Scheduler::new(source, storage(&dir), policy());
        let (handle, stop) = stop_channel();
        stop_after(handle, Duration::from_secs(5));

        let summary = scheduler.run(INTERVAL, stop).await.unwrap();
        assert_eq!(summary.cancelled, 1);
        assert_eq!(summary.written, 0);
        assert!(scheduler.cursor().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_once_runs_single_cycle() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![page(), page()]));
        let mut scheduler = Scheduler::new(source.clone(), storage(&dir), policy());
        let (_handle, stop) = stop_channel();

        let summary = scheduler.run_once(stop).await.unwrap();
        assert_eq!(summary.cycles, 1);
        assert_eq!(summary.written, 3);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn test_zero_interval_rejected() {
        let dir = tempdir().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![]));
        let mut scheduler = Scheduler::new(source, storage(&dir), policy());
        let (_handle, stop) = stop_channel();

        let err = scheduler.run(Duration::ZERO, stop).await.unwrap_err();
        assert!(matches!(err, CollectorError::Config(_)));
    }
}
